//! Test suites for the gateway crate.

pub mod support;

mod resilience_scenarios;
