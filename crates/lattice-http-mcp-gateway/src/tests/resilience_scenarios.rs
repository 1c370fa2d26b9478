//! Store-outage behavior at the gateway boundary.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hyper::StatusCode;

use lattice_mcp_session_store::{
    EventBody, EventRecord, ResilienceConfig, ResilientStore, SessionRecord, SessionStore,
    SharedSessionStore, StoreError, StoreResult,
};

use super::support::*;

/// A backend that is down: every call is `Unavailable`, with a counter for
/// how often it was actually touched.
#[derive(Default)]
struct DownStore {
    calls: AtomicUsize,
}

impl DownStore {
    fn fail(&self) -> StoreError {
        self.calls.fetch_add(1, Ordering::SeqCst);
        StoreError::Unavailable("backend down".to_string())
    }
}

#[async_trait]
impl SessionStore for DownStore {
    fn backend_name(&self) -> &'static str {
        "Down"
    }
    async fn get_session(&self, _id: &str) -> StoreResult<SessionRecord> {
        Err(self.fail())
    }
    async fn put_session_if_absent(&self, _record: SessionRecord) -> StoreResult<()> {
        Err(self.fail())
    }
    async fn update_session_cas(
        &self,
        _id: &str,
        _expected_version: u64,
        _record: SessionRecord,
    ) -> StoreResult<u64> {
        Err(self.fail())
    }
    async fn delete_session(&self, _id: &str) -> StoreResult<()> {
        Err(self.fail())
    }
    async fn append_event(
        &self,
        _session_id: &str,
        _stream_key: &str,
        _event: EventBody,
    ) -> StoreResult<u64> {
        Err(self.fail())
    }
    async fn read_events(
        &self,
        _session_id: &str,
        _stream_key: &str,
        _after_id: Option<u64>,
        _limit: Option<usize>,
    ) -> StoreResult<Vec<EventRecord>> {
        Err(self.fail())
    }
    async fn latest_event_id(
        &self,
        _session_id: &str,
        _stream_key: &str,
    ) -> StoreResult<Option<u64>> {
        Err(self.fail())
    }
    async fn trim_stream(
        &self,
        _session_id: &str,
        _stream_key: &str,
        _max_len: usize,
    ) -> StoreResult<()> {
        Err(self.fail())
    }
    async fn acquire_lock(
        &self,
        _name: &str,
        _holder_id: &str,
        _ttl: Duration,
    ) -> StoreResult<()> {
        Err(self.fail())
    }
    async fn release_lock(&self, _name: &str, _holder_id: &str) -> StoreResult<()> {
        Err(self.fail())
    }
    fn now_millis(&self) -> u64 {
        0
    }
    async fn is_healthy(&self) -> bool {
        false
    }
    async fn close(&self) -> StoreResult<()> {
        Ok(())
    }
}

const TOOLS_LIST: &str = r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#;

/// Store outage: admissions answer 503 with a retriable error; once the
/// breaker opens, they answer without touching the backend; after the
/// cooldown one probe goes through.
#[tokio::test]
async fn store_outage_trips_breaker_then_probes_after_cooldown() {
    let down = Arc::new(DownStore::default());
    let resilient: SharedSessionStore = Arc::new(ResilientStore::new(
        Arc::clone(&down) as SharedSessionStore,
        &ResilienceConfig {
            retry_max_attempts: 1,
            retry_base_ms: 1,
            retry_cap_ms: 1,
            op_timeout_ms: 1_000,
            breaker_failure_threshold: 5,
            breaker_cooldown_ms: 200,
        },
    ));
    let node = node_with_store(resilient, Arc::new(MockMcpServer::default()));

    // Five failing admissions open the breaker.
    for _ in 0..5 {
        let response = node
            .gateway
            .handle(post_request(Some("s-abc"), TOOLS_LIST))
            .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], -32001);
    }
    assert_eq!(down.calls.load(Ordering::SeqCst), 5);

    // Open breaker: immediate 503, no backend touch.
    let started = Instant::now();
    let response = node
        .gateway
        .handle(post_request(Some("s-abc"), TOOLS_LIST))
        .await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(started.elapsed() < Duration::from_millis(50));
    assert_eq!(down.calls.load(Ordering::SeqCst), 5);
    assert_eq!(node.upstream.handled_requests.load(Ordering::SeqCst), 0);

    // After the cooldown, exactly one probe reaches the backend.
    tokio::time::sleep(Duration::from_millis(250)).await;
    let response = node
        .gateway
        .handle(post_request(Some("s-abc"), TOOLS_LIST))
        .await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(down.calls.load(Ordering::SeqCst), 6);
}

/// Initialize is exempt from the unknown-session rejection but not from
/// store health: with the store down the admission read still fails closed.
#[tokio::test]
async fn outage_surfaces_503_not_404() {
    let down = Arc::new(DownStore::default());
    let resilient: SharedSessionStore = Arc::new(ResilientStore::new(
        Arc::clone(&down) as SharedSessionStore,
        &ResilienceConfig {
            retry_max_attempts: 1,
            retry_base_ms: 1,
            retry_cap_ms: 1,
            op_timeout_ms: 1_000,
            breaker_failure_threshold: 50,
            breaker_cooldown_ms: 10_000,
        },
    ));
    let node = node_with_store(resilient, Arc::new(MockMcpServer::default()));

    let response = node
        .gateway
        .handle(post_request(Some("s-abc"), TOOLS_LIST))
        .await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_ne!(response.status(), StatusCode::NOT_FOUND);
}
