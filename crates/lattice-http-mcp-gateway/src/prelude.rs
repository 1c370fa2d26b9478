//! Convenience re-exports for embedding the gateway.

pub use crate::admission::{AdmissionController, AdmissionDecision};
pub use crate::config::{GatewayConfig, UnknownSessionStatus};
pub use crate::gateway::{GatewayBody, SessionGateway};
pub use crate::interceptor::ProtocolInterceptor;
pub use crate::upstream::{UpstreamError, UpstreamSessionManager};
pub use crate::{GatewayError, Result};

pub use lattice_mcp_session_store::prelude::*;
