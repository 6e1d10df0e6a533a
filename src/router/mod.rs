//! Request Router (C3): tool-aware backend selection with health
//! awareness, circuit breaking, retries, and failover.

pub mod circuit;
pub mod health;
pub mod policy;

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::Rng;
use serde_json::Value;

use futures_util::StreamExt;

use crate::drain::{ConnectionGuard, DrainCoordinator};
use crate::error::{RouterError, TransportError};
use crate::registry::{AtomicRegistry, BackendId, Generation, HealthRecord, HealthStatus, RegistrySnapshot};
use crate::transport::manager::TransportManager;
use crate::transport::ChunkStream;
use circuit::CircuitBreaker;
use policy::RoutingPolicy;

/// One inbound JSON-RPC request, carried end-to-end from ingress through
/// routing and back (§3's `RequestEnvelope`).
#[derive(Debug, Clone)]
pub struct RequestEnvelope {
    pub id: Value,
    pub method: String,
    pub params: Value,
    /// Extracted per method: tool name for `tools/call`, URI for
    /// `resources/read`, etc. `None` for methods with no routable target.
    pub tool_name: Option<String>,
    pub session_id: Option<String>,
    pub arrival_time: Instant,
    /// Generation pinned at routing time; filled in by [`Router::route`].
    pub generation: Generation,
    pub trace_id: Option<String>,
}

impl RequestEnvelope {
    pub fn new(id: Value, method: impl Into<String>, params: Value) -> Self {
        let method = method.into();
        let tool_name = extract_routing_key(&method, &params);
        Self {
            id,
            method,
            params,
            tool_name,
            session_id: None,
            arrival_time: Instant::now(),
            generation: 0,
            trace_id: None,
        }
    }
}

/// Extract the routing key per §4.3 step 1: the tool name for `tools/call`,
/// the URI scheme+authority for `resources/read`, or `None` when the method
/// carries no routable target.
pub fn extract_routing_key(method: &str, params: &Value) -> Option<String> {
    match method {
        "tools/call" => params.get("name").and_then(|v| v.as_str()).map(str::to_string),
        "resources/read" => params
            .get("uri")
            .and_then(|v| v.as_str())
            .and_then(|uri| url::Url::parse(uri).ok())
            .map(|u| format!("{}://{}", u.scheme(), u.host_str().unwrap_or(""))),
        "prompts/get" => params.get("name").and_then(|v| v.as_str()).map(str::to_string),
        _ => None,
    }
}

/// Outcome of one successfully-routed call: the backend that served it plus
/// its response body, for callers that need to report which backend
/// answered (aggregation, metrics, tests).
pub struct RoutedResponse {
    pub backend_id: BackendId,
    pub body: Value,
    pub attempts: u32,
}

/// Outcome of a streamed route (§4.3's "Response streaming"): the backend
/// that accepted the request plus its chunk stream. Unlike [`Router::route`],
/// opening the stream is a single attempt with no failover — once a backend
/// has started emitting chunks there is no way to splice in a retry without
/// either buffering the whole response (defeating the point of streaming) or
/// risking a client seeing a duplicated prefix.
pub struct RoutedStream {
    pub backend_id: BackendId,
    pub is_streaming: bool,
    pub stream: ChunkStream,
}

/// Ties the registry, drain coordinator, transport manager, and per-backend
/// circuit/health state together into the selection + retry + failover
/// algorithm described in §4.3.
pub struct Router {
    registry: Arc<AtomicRegistry>,
    drain: DrainCoordinator,
    transports: TransportManager,
    circuits: DashMap<BackendId, std::sync::Mutex<CircuitBreaker>>,
    health: DashMap<BackendId, HealthRecord>,
    policy: RoutingPolicy,
    failure_threshold: u32,
    success_threshold: u32,
    circuit_open_timeout: Duration,
}

impl Router {
    pub fn new(
        registry: Arc<AtomicRegistry>,
        drain: DrainCoordinator,
        transports: TransportManager,
        policy: RoutingPolicy,
        failure_threshold: u32,
        success_threshold: u32,
        circuit_open_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            drain,
            transports,
            circuits: DashMap::new(),
            health: DashMap::new(),
            policy,
            failure_threshold,
            success_threshold,
            circuit_open_timeout,
        }
    }

    pub fn health_table(&self) -> &DashMap<BackendId, HealthRecord> {
        &self.health
    }

    fn health_status(&self, backend_id: &str) -> HealthStatus {
        self.health
            .get(backend_id)
            .map(|h| h.status)
            .unwrap_or(HealthStatus::Unknown)
    }

    /// Filter a tool index's candidate list down to backends that are
    /// routable right now: healthy-or-degraded, circuit closed/half-open,
    /// not draining.
    fn filter_candidates(&self, snapshot: &RegistrySnapshot, candidates: &[BackendId]) -> Vec<BackendId> {
        candidates
            .iter()
            .filter(|id| !snapshot.draining.contains(id.as_str()))
            .filter(|id| self.health_status(id).is_routable() || !self.health.contains_key(id.as_str()))
            .filter(|id| {
                self.circuits
                    .entry((*id).clone())
                    .or_insert_with(|| {
                        std::sync::Mutex::new(CircuitBreaker::new(
                            self.failure_threshold,
                            self.success_threshold,
                            self.circuit_open_timeout,
                        ))
                    })
                    .lock()
                    .unwrap()
                    .try_admit()
            })
            .cloned()
            .collect()
    }

    fn record_success(&self, backend_id: &str, latency: Duration) {
        if let Some(cb) = self.circuits.get(backend_id) {
            let mut cb = cb.lock().unwrap();
            cb.record_success();
            crate::metrics::set_circuit_state(backend_id, cb.state());
        }
        self.health
            .entry(backend_id.to_string())
            .or_default()
            .record_success(latency);
    }

    fn record_failure(&self, backend_id: &str) {
        if let Some(cb) = self.circuits.get(backend_id) {
            let mut cb = cb.lock().unwrap();
            cb.record_failure();
            crate::metrics::set_circuit_state(backend_id, cb.state());
        }
        self.health.entry(backend_id.to_string()).or_default().record_failure();
    }

    /// Resolve a request's routing key and the candidate backends routable
    /// for it right now (§4.3 steps 1-2), shared by [`Router::route`] and
    /// [`Router::route_stream`].
    fn resolve_candidates(
        &self,
        envelope: &RequestEnvelope,
    ) -> Result<(RegistrySnapshot, String, Vec<BackendId>), RouterError> {
        let snapshot = self.registry.current_snapshot();

        let routing_key = match &envelope.tool_name {
            Some(key) => key.clone(),
            None => return Err(RouterError::NoRoutingKey(envelope.method.clone())),
        };

        // Namespaced `<backendId>.<suffix>` pins the backend directly.
        let candidates = snapshot
            .tool_index
            .get(&routing_key)
            .cloned()
            .ok_or_else(|| RouterError::NoBackendForTool(routing_key.clone()))?;

        let mut filtered = self.filter_candidates(&snapshot, &candidates);
        if filtered.is_empty() {
            // One refresh against the latest snapshot before giving up, in
            // case a concurrent update just healed things.
            let latest = self.registry.current_snapshot();
            if latest.generation != snapshot.generation
                && let Some(retry_candidates) = latest.tool_index.get(&routing_key)
            {
                filtered = self.filter_candidates(&latest, retry_candidates);
            }
        }
        if filtered.is_empty() {
            return Err(RouterError::AllBackendsUnavailable);
        }

        Ok((snapshot, routing_key, filtered))
    }

    /// Route and execute one request per §4.3's selection algorithm plus
    /// §4.3's retry/failover policy.
    pub async fn route(&self, mut envelope: RequestEnvelope) -> Result<RoutedResponse, RouterError> {
        let (snapshot, routing_key, filtered) = self.resolve_candidates(&envelope)?;
        envelope.generation = snapshot.generation;

        let weights: DashMap<BackendId, u32> = snapshot
            .descriptors
            .iter()
            .map(|(id, d)| (id.clone(), d.weight))
            .collect();
        let connection_counts: DashMap<String, std::sync::atomic::AtomicUsize> = filtered
            .iter()
            .map(|id| (id.clone(), std::sync::atomic::AtomicUsize::new(self.drain.active_count(id).max(0) as usize)))
            .collect();

        let mut last_error = None;
        let mut admission_refused: Option<BackendId> = None;
        let mut excluded: Vec<BackendId> = Vec::new();
        let mut attempts = 0u32;
        // Fixed once the first candidate is actually selected, from that
        // backend's own retry policy rather than an arbitrary entry out of
        // the descriptor map.
        let mut retry_budget: Option<u32> = None;

        for attempt in 0.. {
            if let Some(max_retries) = retry_budget
                && attempt > max_retries
            {
                break;
            }

            let remaining: Vec<BackendId> =
                filtered.iter().filter(|id| !excluded.contains(id)).cloned().collect();
            if remaining.is_empty() {
                break;
            }

            let Some(backend_id) = policy::select(
                self.policy,
                &routing_key,
                &remaining,
                &snapshot.hash_ring,
                &connection_counts,
                &weights,
            ) else {
                break;
            };

            let Some(descriptor) = snapshot.descriptors.get(&backend_id) else {
                excluded.push(backend_id);
                continue;
            };
            let max_retries = *retry_budget.get_or_insert(descriptor.retry.max_retries);

            let guard = match self.drain.try_admit(&backend_id) {
                Some(guard) => guard,
                None => {
                    admission_refused = Some(backend_id.clone());
                    excluded.push(backend_id);
                    continue;
                }
            };

            let Some(transport) = self.transports.get(&backend_id) else {
                excluded.push(backend_id.clone());
                guard.release();
                continue;
            };

            admission_refused = None;
            attempts += 1;
            let request_body = serde_json::json!({
                "jsonrpc": "2.0",
                "id": envelope.id,
                "method": envelope.method,
                "params": envelope.params,
            });

            let started = Instant::now();
            let outcome = transport.call(request_body, descriptor.timeout).await;
            guard.release();

            match outcome {
                Ok(body) => {
                    let elapsed = started.elapsed();
                    self.record_success(&backend_id, elapsed);
                    crate::metrics::record_request(&backend_id, &envelope.method, "success", elapsed);
                    return Ok(RoutedResponse { backend_id, body, attempts });
                }
                Err(err) => {
                    self.record_failure(&backend_id);
                    crate::metrics::record_request(&backend_id, &envelope.method, "error", started.elapsed());
                    let retryable = err.is_retryable();
                    last_error = Some((backend_id.clone(), err));
                    excluded.push(backend_id);
                    if !retryable {
                        break;
                    }
                    if attempt < max_retries {
                        backoff_sleep(attempt).await;
                    }
                }
            }
        }

        match last_error {
            Some((backend_id, source)) => Err(RouterError::RetriesExhausted { backend: backend_id, source }),
            None => match admission_refused {
                Some(backend_id) => Err(RouterError::AdmissionRefused(backend_id)),
                None => Err(RouterError::AllBackendsUnavailable),
            },
        }
    }

    /// Route one request to a single backend and open it as a chunk stream
    /// rather than awaiting a materialized response (§4.3's "Response
    /// streaming"). Candidate selection and admission follow exactly
    /// [`Router::route`]'s algorithm; only the retry/failover loop is
    /// dropped, since a mid-stream backend failure can't be transparently
    /// retried without either buffering or risking a duplicated prefix.
    pub async fn route_stream(&self, mut envelope: RequestEnvelope) -> Result<RoutedStream, RouterError> {
        let (snapshot, routing_key, filtered) = self.resolve_candidates(&envelope)?;
        envelope.generation = snapshot.generation;

        let weights: DashMap<BackendId, u32> = snapshot
            .descriptors
            .iter()
            .map(|(id, d)| (id.clone(), d.weight))
            .collect();
        let connection_counts: DashMap<String, std::sync::atomic::AtomicUsize> = filtered
            .iter()
            .map(|id| (id.clone(), std::sync::atomic::AtomicUsize::new(self.drain.active_count(id).max(0) as usize)))
            .collect();

        let backend_id = policy::select(
            self.policy,
            &routing_key,
            &filtered,
            &snapshot.hash_ring,
            &connection_counts,
            &weights,
        )
        .ok_or(RouterError::AllBackendsUnavailable)?;

        let descriptor = snapshot
            .descriptors
            .get(&backend_id)
            .ok_or(RouterError::AllBackendsUnavailable)?;

        let guard = self.drain.try_admit(&backend_id).ok_or(RouterError::AllBackendsUnavailable)?;

        let transport = self.transports.get(&backend_id).ok_or(RouterError::AllBackendsUnavailable)?;

        let is_streaming = transport.is_streaming();
        let request_body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": envelope.id,
            "method": envelope.method,
            "params": envelope.params,
        });

        let started = Instant::now();
        let result = transport.open_stream(request_body, descriptor.timeout).await;

        match result {
            Ok(stream) => {
                self.record_success(&backend_id, started.elapsed());
                crate::metrics::record_request(&backend_id, &envelope.method, "success", started.elapsed());
                // Per the streaming admission rule, the guard is held for the
                // stream's whole lifetime and released only on its terminal
                // chunk (normal end) or an early drop (cancellation) — not
                // here, before a single chunk has even arrived.
                Ok(RoutedStream { backend_id, is_streaming, stream: guard_stream(guard, stream) })
            }
            Err(err) => {
                guard.release();
                self.record_failure(&backend_id);
                crate::metrics::record_request(&backend_id, &envelope.method, "error", started.elapsed());
                Err(RouterError::RetriesExhausted { backend: backend_id, source: err })
            }
        }
    }
}

/// Ties a streamed call's [`ConnectionGuard`] to the chunk stream's own
/// lifetime: the guard is dropped (releasing the admission slot) exactly
/// when the stream is exhausted or when the caller drops it early, rather
/// than as soon as the stream was opened.
fn guard_stream(guard: ConnectionGuard, inner: ChunkStream) -> ChunkStream {
    Box::pin(futures_util::stream::unfold((guard, inner), |(guard, mut inner)| async move {
        inner.next().await.map(|item| (item, (guard, inner)))
    }))
}

/// Exponential backoff with jitter per §4.3: 100ms initial, x2 multiplier,
/// capped at 5s, +/-15% jitter.
async fn backoff_sleep(attempt: u32) {
    let base_ms = 100f64 * 2f64.powi(attempt as i32);
    let capped_ms = base_ms.min(5_000.0);
    let jitter_frac = rand::thread_rng().gen_range(-0.15..=0.15);
    let jittered_ms = (capped_ms * (1.0 + jitter_frac)).max(0.0);
    tokio::time::sleep(Duration::from_millis(jittered_ms as u64)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{BackendDescriptor, RetryPolicy, TransportSpec, UpdateOptions};
    use std::collections::HashMap;

    fn descriptor(id: &str, priority: i32, tools: &[&str]) -> BackendDescriptor {
        BackendDescriptor {
            id: id.to_string(),
            display_name: id.to_string(),
            transport: TransportSpec::Stdio {
                command: "cat".to_string(),
                args: vec![],
                env: HashMap::new(),
                cwd: None,
                resource_limits: Default::default(),
            },
            tool_names: tools.iter().map(|s| s.to_string()).collect(),
            priority,
            weight: 100,
            timeout: Duration::from_secs(2),
            retry: RetryPolicy { max_retries: 2, ..RetryPolicy::default() },
            auth_ref: None,
        }
    }

    #[test]
    fn extracts_tool_name_for_tools_call() {
        let params = serde_json::json!({"name": "echo", "arguments": {}});
        assert_eq!(extract_routing_key("tools/call", &params), Some("echo".to_string()));
    }

    #[test]
    fn extracts_scheme_authority_for_resources_read() {
        let params = serde_json::json!({"uri": "file://backend-a/some/path"});
        assert_eq!(
            extract_routing_key("resources/read", &params),
            Some("file://backend-a".to_string())
        );
    }

    #[test]
    fn no_routing_key_for_unrouted_methods() {
        assert_eq!(extract_routing_key("initialize", &serde_json::json!({})), None);
    }

    async fn build_router(descriptors: Vec<BackendDescriptor>) -> (Router, Arc<AtomicRegistry>) {
        let registry = Arc::new(AtomicRegistry::new(150));
        registry.apply_update(descriptors, UpdateOptions::default()).await.unwrap();
        let drain = DrainCoordinator::new();
        let transports = TransportManager::default();
        let snapshot = registry.current_snapshot();
        transports.reconcile(&snapshot).await;
        let router = Router::new(
            Arc::clone(&registry),
            drain,
            transports,
            RoutingPolicy::RoundRobin,
            5,
            2,
            Duration::from_secs(30),
        );
        (router, registry)
    }

    #[tokio::test]
    async fn no_backend_for_unknown_tool_fails_with_specific_error() {
        let (router, _registry) = build_router(vec![descriptor("a", 0, &["echo"])]).await;
        let envelope = RequestEnvelope::new(
            Value::from(1),
            "tools/call",
            serde_json::json!({"name": "nonexistent"}),
        );
        let err = router.route(envelope).await.unwrap_err();
        assert!(matches!(err, RouterError::NoBackendForTool(_)));
    }

    #[tokio::test]
    async fn empty_registry_yields_no_backend_available_shape() {
        let (router, _registry) = build_router(vec![]).await;
        let envelope =
            RequestEnvelope::new(Value::from(1), "tools/call", serde_json::json!({"name": "echo"}));
        let err = router.route(envelope).await.unwrap_err();
        assert!(matches!(err, RouterError::NoBackendForTool(_)));
    }
}
