//! Outbound calls to the external services.
//!
//! The engine never hardcodes transport details: [`OutboundClient`] is the
//! generic `call(service, request)` seam, and [`CircuitGateway`] wraps it
//! with the resilience policy (circuit breaker admission, outcome reporting,
//! health bookkeeping). Everything that leaves the process goes through the
//! gateway.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use conflux_core::{now_utc, Clock, DedupeKey, SourceService};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info_span, Instrument};

use crate::{
    circuit::CircuitRegistry,
    error::{EngineError, Result},
    health::OutcomeLog,
};

/// HTTP method for an outbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutboundMethod {
    /// HTTP GET.
    Get,
    /// HTTP POST (default).
    #[default]
    Post,
    /// HTTP PUT.
    Put,
    /// HTTP DELETE.
    Delete,
}

impl fmt::Display for OutboundMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Get => write!(f, "GET"),
            Self::Post => write!(f, "POST"),
            Self::Put => write!(f, "PUT"),
            Self::Delete => write!(f, "DELETE"),
        }
    }
}

/// A call to one of the external services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundRequest {
    /// Target service.
    pub target: SourceService,
    /// HTTP method.
    pub method: OutboundMethod,
    /// Path relative to the service base URL, e.g. `/notifications`.
    pub path: String,
    /// JSON request body.
    pub body: Value,
    /// Stable fingerprint identifying this logical request across retries.
    pub fingerprint: String,
}

impl OutboundRequest {
    /// Builds a request, deriving the fingerprint from the originating
    /// event's dedupe key and the call shape.
    ///
    /// The fingerprint identifies the logical delivery: a superseding event
    /// for the same entity produces a different key and therefore a
    /// different fingerprint, which is what retry cancellation matches on.
    pub fn new(
        origin: &DedupeKey,
        target: SourceService,
        method: OutboundMethod,
        path: impl Into<String>,
        body: Value,
    ) -> Self {
        let path = path.into();
        let mut hasher = Sha256::new();
        hasher.update(origin.to_string().as_bytes());
        hasher.update(target.as_str().as_bytes());
        hasher.update(method.to_string().as_bytes());
        hasher.update(path.as_bytes());
        let fingerprint = hex::encode(&hasher.finalize()[..16]);

        Self { target, method, path, body, fingerprint }
    }
}

/// Response from an outbound call.
#[derive(Debug, Clone)]
pub struct OutboundResponse {
    /// HTTP status code.
    pub status: u16,
    /// Parsed response body, `Null` when empty or not JSON.
    pub body: Value,
}

/// Transport seam for outbound calls.
#[async_trait]
pub trait OutboundClient: Send + Sync + 'static {
    /// Performs the call, mapping transport failures into the engine error
    /// taxonomy. Implementations must enforce an explicit timeout.
    async fn call(&self, request: &OutboundRequest) -> Result<OutboundResponse>;
}

/// Configuration for the HTTP outbound client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundConfig {
    /// Base URL per target service.
    pub base_urls: HashMap<SourceService, String>,
    /// Request timeout; a stuck call must not block the pipeline.
    pub timeout: Duration,
    /// User agent sent with every request.
    pub user_agent: String,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            base_urls: HashMap::new(),
            timeout: Duration::from_secs(30),
            user_agent: "Conflux-Integration/1.0".to_string(),
        }
    }
}

/// Production outbound client over reqwest with connection pooling.
#[derive(Debug, Clone)]
pub struct HttpOutboundClient {
    client: reqwest::Client,
    config: OutboundConfig,
}

impl HttpOutboundClient {
    /// Creates the client.
    pub fn new(config: OutboundConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| EngineError::configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, config })
    }
}

#[async_trait]
impl OutboundClient for HttpOutboundClient {
    async fn call(&self, request: &OutboundRequest) -> Result<OutboundResponse> {
        let base = self.config.base_urls.get(&request.target).ok_or_else(|| {
            EngineError::configuration(format!("no base URL configured for {}", request.target))
        })?;
        let url = format!("{base}{}", request.path);

        let span = info_span!(
            "outbound_call",
            target = %request.target,
            method = %request.method,
            path = %request.path,
            fingerprint = %request.fingerprint
        );

        async move {
            let method = match request.method {
                OutboundMethod::Get => reqwest::Method::GET,
                OutboundMethod::Post => reqwest::Method::POST,
                OutboundMethod::Put => reqwest::Method::PUT,
                OutboundMethod::Delete => reqwest::Method::DELETE,
            };

            let response = self
                .client
                .request(method, &url)
                .json(&request.body)
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        EngineError::timeout(request.target, self.config.timeout.as_secs())
                    } else if e.is_connect() {
                        EngineError::transient(request.target, format!("connection failed: {e}"))
                    } else {
                        EngineError::transient(request.target, e.to_string())
                    }
                })?;

            let status = response.status().as_u16();
            let body = response.json::<Value>().await.unwrap_or(Value::Null);
            debug!(status, "outbound call completed");

            match status {
                200..=299 => Ok(OutboundResponse { status, body }),
                429 => Err(EngineError::transient(request.target, "rate limited (HTTP 429)")),
                500..=599 => Err(EngineError::transient(
                    request.target,
                    format!("server error (HTTP {status})"),
                )),
                _ => Err(EngineError::permanent(format!(
                    "{} rejected request with HTTP {status}",
                    request.target
                ))),
            }
        }
        .instrument(span)
        .await
    }
}

/// Circuit-breaker-wrapped entry point for all outbound calls.
///
/// Admission, outcome reporting, and the health outcome log live here so no
/// caller can reach an external service without the breaker seeing it.
pub struct CircuitGateway {
    client: Arc<dyn OutboundClient>,
    circuits: Arc<CircuitRegistry>,
    outcomes: Arc<OutcomeLog>,
    clock: Arc<dyn Clock>,
}

impl CircuitGateway {
    /// Creates a gateway around the given transport.
    pub fn new(
        client: Arc<dyn OutboundClient>,
        circuits: Arc<CircuitRegistry>,
        outcomes: Arc<OutcomeLog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { client, circuits, outcomes, clock }
    }

    /// Shared circuit registry, for deferral decisions and health views.
    pub fn circuits(&self) -> Arc<CircuitRegistry> {
        self.circuits.clone()
    }

    /// Calls a service through its circuit breaker.
    ///
    /// An open circuit rejects the call without touching the network and
    /// without recording a breaker outcome (no call happened). Transient
    /// failures and timeouts count against the breaker; a 4xx response does
    /// not, since it proves the remote service is reachable.
    pub async fn call(&self, request: &OutboundRequest) -> Result<OutboundResponse> {
        self.circuits.try_acquire(request.target).await?;

        let now = now_utc(self.clock.as_ref());
        match self.client.call(request).await {
            Ok(response) => {
                self.circuits.record_success(request.target).await;
                self.outcomes.record(request.target, true, now).await;
                Ok(response)
            },
            Err(error) => {
                if error.counts_as_circuit_failure() {
                    self.circuits.record_failure(request.target).await;
                } else {
                    self.circuits.record_success(request.target).await;
                }
                self.outcomes.record(request.target, false, now).await;
                Err(error)
            },
        }
    }
}

pub mod mock {
    //! Scripted outbound client for tests.

    use std::collections::VecDeque;

    use tokio::sync::Mutex;

    use super::{
        async_trait, EngineError, HashMap, OutboundClient, OutboundRequest, OutboundResponse,
        Result, SourceService, Value,
    };

    /// In-memory [`OutboundClient`] returning scripted outcomes per service.
    ///
    /// An empty script answers HTTP 200 with an empty body. Every request is
    /// recorded for verification.
    #[derive(Debug, Default)]
    pub struct MockOutboundClient {
        scripts: Mutex<HashMap<SourceService, VecDeque<Result<OutboundResponse>>>>,
        requests: Mutex<Vec<OutboundRequest>>,
    }

    impl MockOutboundClient {
        /// Creates a client that succeeds by default.
        pub fn new() -> Self {
            Self::default()
        }

        /// Queues an outcome for the next call to `service`.
        pub async fn script(&self, service: SourceService, outcome: Result<OutboundResponse>) {
            self.scripts.lock().await.entry(service).or_default().push_back(outcome);
        }

        /// Queues `count` copies of a transient failure for `service`.
        pub async fn script_failures(&self, service: SourceService, count: usize) {
            for _ in 0..count {
                self.script(service, Err(EngineError::transient(service, "connection refused")))
                    .await;
            }
        }

        /// Requests made so far, in order.
        pub async fn requests(&self) -> Vec<OutboundRequest> {
            self.requests.lock().await.clone()
        }

        /// Number of calls made to one service.
        pub async fn call_count(&self, service: SourceService) -> usize {
            self.requests.lock().await.iter().filter(|r| r.target == service).count()
        }
    }

    #[async_trait]
    impl OutboundClient for MockOutboundClient {
        async fn call(&self, request: &OutboundRequest) -> Result<OutboundResponse> {
            self.requests.lock().await.push(request.clone());

            let scripted = self
                .scripts
                .lock()
                .await
                .get_mut(&request.target)
                .and_then(VecDeque::pop_front);

            scripted.unwrap_or_else(|| Ok(OutboundResponse { status: 200, body: Value::Null }))
        }
    }
}

#[cfg(test)]
mod tests {
    use conflux_core::TestClock;

    use super::{mock::MockOutboundClient, *};
    use crate::circuit::{CircuitConfig, CircuitState};

    fn sample_request() -> OutboundRequest {
        let key = DedupeKey::new(SourceService::Payment, "evt_1");
        OutboundRequest::new(
            &key,
            SourceService::Communication,
            OutboundMethod::Post,
            "/emails",
            serde_json::json!({"template": "payment_failed"}),
        )
    }

    fn gateway_parts() -> (CircuitGateway, Arc<MockOutboundClient>, Arc<CircuitRegistry>) {
        let clock = Arc::new(TestClock::new());
        let client = Arc::new(MockOutboundClient::new());
        let circuits = Arc::new(CircuitRegistry::new(CircuitConfig::default(), clock.clone()));
        let outcomes = Arc::new(OutcomeLog::default());
        let gateway =
            CircuitGateway::new(client.clone(), circuits.clone(), outcomes, clock);
        (gateway, client, circuits)
    }

    #[test]
    fn fingerprint_is_stable_per_origin_and_shape() {
        let key = DedupeKey::new(SourceService::Payment, "evt_1");
        let first = OutboundRequest::new(
            &key,
            SourceService::Communication,
            OutboundMethod::Post,
            "/emails",
            serde_json::json!({}),
        );
        let second = OutboundRequest::new(
            &key,
            SourceService::Communication,
            OutboundMethod::Post,
            "/emails",
            serde_json::json!({}),
        );
        assert_eq!(first.fingerprint, second.fingerprint);

        let other_key = DedupeKey::new(SourceService::Payment, "evt_2");
        let third = OutboundRequest::new(
            &other_key,
            SourceService::Communication,
            OutboundMethod::Post,
            "/emails",
            serde_json::json!({}),
        );
        assert_ne!(first.fingerprint, third.fingerprint);
    }

    #[tokio::test]
    async fn gateway_records_success() {
        let (gateway, client, circuits) = gateway_parts();
        let request = sample_request();

        let response = gateway.call(&request).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(client.call_count(SourceService::Communication).await, 1);

        let snapshot = circuits.snapshot(SourceService::Communication).await;
        assert_eq!(snapshot.window_requests, 1);
        assert_eq!(snapshot.window_failures, 0);
    }

    #[tokio::test]
    async fn failures_open_the_circuit_and_block_calls() {
        let (gateway, client, circuits) = gateway_parts();
        let request = sample_request();

        // Default breaker threshold is 5 consecutive failures.
        client.script_failures(SourceService::Communication, 5).await;
        for _ in 0..5 {
            assert!(gateway.call(&request).await.is_err());
        }
        assert_eq!(circuits.state(SourceService::Communication).await, CircuitState::Open);

        // Sixth call is rejected without reaching the transport.
        let err = gateway.call(&request).await.unwrap_err();
        assert!(matches!(err, EngineError::CircuitOpen { .. }));
        assert_eq!(client.call_count(SourceService::Communication).await, 5);
    }

    #[tokio::test]
    async fn permanent_rejection_does_not_trip_breaker() {
        let (gateway, client, circuits) = gateway_parts();
        let request = sample_request();

        for _ in 0..6 {
            client
                .script(
                    SourceService::Communication,
                    Err(EngineError::permanent("HTTP 404 from communication-service")),
                )
                .await;
        }
        for _ in 0..6 {
            assert!(gateway.call(&request).await.is_err());
        }

        assert_eq!(circuits.state(SourceService::Communication).await, CircuitState::Closed);
        assert_eq!(client.call_count(SourceService::Communication).await, 6);
    }
}
