//! Full-stack scenario tests driving registry + router + drain + ingress
//! together against a fake in-process backend, rather than each subsystem
//! in isolation. Mirrors SPEC_FULL §13's scenario-to-test mapping for the
//! scenarios that need more than one subsystem wired together (A, C, D, E);
//! id preservation, name collision, circuit convergence, drain-completeness,
//! and consistent-hash stability each already have focused unit tests beside
//! the code they cover and are not repeated here.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};

use crate::drain::DrainCoordinator;
use crate::error::TransportError;
use crate::ingress::Ingress;
use crate::registry::{
    AtomicRegistry, BackendDescriptor, HealthStatus, ResourceLimits, RetryPolicy, TransportSpec,
    UpdateOptions,
};
use crate::ingress::HttpOutcome;
use crate::router::{RequestEnvelope, Router};
use crate::router::policy::RoutingPolicy;
use crate::secrets::SecretResolver;
use crate::transport::{ChunkStream, Transport};
use crate::transport::manager::TransportManager;

/// A scriptable stand-in for a real backend connection: every `call` is
/// answered by the configured behavior instead of talking to a process or
/// socket, so router/ingress integration tests don't need a real child
/// process (SPEC_FULL §10.4's `testutil` fake backend).
pub struct FakeTransport {
    behavior: Behavior,
    calls: AtomicU32,
    delay: Option<Duration>,
}

enum Behavior {
    /// Always answers `tools/call` with `{"content":[{"type":"text","text":
    /// <echo of the "text" argument>}],"isError":false}` and `tools/list`
    /// with a single tool named `echo`.
    Echo,
    /// Always fails with the given (retryable) transport error.
    AlwaysFails(fn() -> TransportError),
    /// A streamable-HTTP-style backend: `open_stream` yields each of these
    /// values in order instead of a single materialized response.
    Stream(Vec<Value>),
}

impl FakeTransport {
    pub fn echo() -> Self {
        Self { behavior: Behavior::Echo, calls: AtomicU32::new(0), delay: None }
    }

    pub fn always_fails() -> Self {
        Self {
            behavior: Behavior::AlwaysFails(|| TransportError::Io("simulated failure".into())),
            calls: AtomicU32::new(0),
            delay: None,
        }
    }

    /// A backend whose `tools/call` answer arrives as a sequence of chunks
    /// (e.g. incremental tokens) rather than one final JSON object.
    pub fn streaming(chunks: Vec<Value>) -> Self {
        Self { behavior: Behavior::Stream(chunks), calls: AtomicU32::new(0), delay: None }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn call(&self, request: Value, _timeout: Duration) -> Result<Value, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let id = request.get("id").cloned().unwrap_or(Value::Null);
        let method = request.get("method").and_then(|m| m.as_str()).unwrap_or("");

        match &self.behavior {
            Behavior::Echo => Ok(echo_response(id, method, &request)),
            Behavior::AlwaysFails(make_err) => Err(make_err()),
            Behavior::Stream(chunks) => Ok(chunks.last().cloned().unwrap_or(Value::Null)),
        }
    }

    async fn probe(&self) -> bool {
        !matches!(self.behavior, Behavior::AlwaysFails(_))
    }

    async fn close(&self) {}

    fn is_streaming(&self) -> bool {
        matches!(self.behavior, Behavior::Stream(_))
    }

    async fn open_stream(&self, request: Value, timeout: Duration) -> Result<ChunkStream, TransportError> {
        let Behavior::Stream(chunks) = &self.behavior else {
            return self.call(request, timeout).await.map(|v| {
                Box::pin(futures_util::stream::once(async move { Ok(v) })) as ChunkStream
            });
        };
        self.calls.fetch_add(1, Ordering::SeqCst);
        let items: Vec<Result<Value, TransportError>> = chunks.iter().cloned().map(Ok).collect();
        Ok(Box::pin(futures_util::stream::iter(items)))
    }
}

fn echo_response(id: Value, method: &str, request: &Value) -> Value {
    match method {
        "tools/list" => json!({
            "jsonrpc": "2.0", "id": id,
            "result": { "tools": [{"name": "echo", "description": "echoes input"}] },
        }),
        "tools/call" => {
            let text = request
                .get("params")
                .and_then(|p| p.get("arguments"))
                .and_then(|a| a.get("text"))
                .and_then(|t| t.as_str())
                .unwrap_or("");
            json!({
                "jsonrpc": "2.0", "id": id,
                "result": { "content": [{"type": "text", "text": text}], "isError": false },
            })
        }
        _ => json!({"jsonrpc": "2.0", "id": id, "result": {}}),
    }
}

fn descriptor(id: &str, priority: i32, tools: &[&str]) -> BackendDescriptor {
    BackendDescriptor {
        id: id.to_string(),
        display_name: id.to_string(),
        transport: TransportSpec::Stdio {
            command: "/bin/true".to_string(),
            args: vec![],
            env: HashMap::new(),
            cwd: None,
            resource_limits: ResourceLimits::default(),
        },
        tool_names: tools.iter().map(|s| s.to_string()).collect(),
        priority,
        weight: 100,
        timeout: Duration::from_secs(5),
        retry: RetryPolicy { max_retries: 3, initial_backoff: Duration::from_millis(1), ..RetryPolicy::default() },
        auth_ref: None,
    }
}

struct Harness {
    registry: Arc<AtomicRegistry>,
    router: Arc<Router>,
    ingress: Ingress,
    transports: TransportManager,
    drain: DrainCoordinator,
}

async fn build_harness(descriptors: Vec<BackendDescriptor>) -> Harness {
    let registry = Arc::new(AtomicRegistry::new(150));
    registry.apply_update(descriptors, UpdateOptions::default()).await.unwrap();
    let drain = DrainCoordinator::new();
    let transports = TransportManager::new(Arc::new(SecretResolver::with_defaults(false)));
    let router = Arc::new(Router::new(
        Arc::clone(&registry),
        drain.clone(),
        transports.clone(),
        RoutingPolicy::RoundRobin,
        5,
        2,
        Duration::from_secs(30),
    ));
    let ingress = Ingress::new(Arc::clone(&registry), Arc::clone(&router), transports.clone(), None);
    Harness { registry, router, ingress, transports, drain }
}

/// Scenario A — single backend, `tools/list` then `tools/call`.
#[tokio::test]
async fn scenario_a_single_backend_list_then_call() {
    let harness = build_harness(vec![descriptor("a", 100, &["echo"])]).await;
    harness.transports.insert_for_test("a", Arc::new(FakeTransport::echo()));

    let init = harness
        .ingress
        .handle_message(json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {"protocolVersion": "2025-06-18"}}))
        .await
        .unwrap();
    assert_eq!(init["result"]["serverInfo"]["name"], "only1mcp");
    assert_eq!(init["result"]["protocolVersion"], "2025-06-18");

    let list = harness
        .ingress
        .handle_message(json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}))
        .await
        .unwrap();
    assert_eq!(list["result"]["tools"][0]["name"], "echo");

    let call = harness
        .ingress
        .handle_message(json!({
            "jsonrpc": "2.0", "id": 3, "method": "tools/call",
            "params": {"name": "echo", "arguments": {"text": "hi"}},
        }))
        .await
        .unwrap();
    assert_eq!(call["result"]["content"][0]["text"], "hi");
    assert_eq!(call["result"]["isError"], false);
}

/// Scenario B — two backends advertising the same tool; the aggregated
/// listing namespaces the lower-priority duplicate deterministically.
#[tokio::test]
async fn scenario_b_colliding_tool_name_is_namespaced() {
    let harness =
        build_harness(vec![descriptor("A", 100, &["search"]), descriptor("B", 50, &["search"])]).await;
    harness.transports.insert_for_test("A", Arc::new(FakeTransport::echo()));
    harness.transports.insert_for_test("B", Arc::new(FakeTransport::echo()));

    let list = harness
        .ingress
        .handle_message(json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}))
        .await
        .unwrap();
    let names: Vec<String> = list["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap().to_string())
        .collect();
    assert!(names.contains(&"search".to_string()));
    assert!(names.contains(&"B.search".to_string()));
    assert!(!names.contains(&"A.search".to_string()));

    // Deterministic across repeated calls on the same generation (cache hit).
    let list_again = harness
        .ingress
        .handle_message(json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}))
        .await
        .unwrap();
    assert_eq!(list["result"], list_again["result"]);
}

/// Scenario D — one backend fails every call; after `failure_threshold`
/// consecutive failures its circuit opens and a healthy sibling keeps
/// serving every request for the shared tool.
#[tokio::test]
async fn scenario_d_failover_and_circuit_open() {
    let harness =
        build_harness(vec![descriptor("X", 100, &["t"]), descriptor("Y", 50, &["t"])]).await;
    let failing = Arc::new(FakeTransport::always_fails());
    harness.transports.insert_for_test("X", Arc::clone(&failing) as Arc<dyn Transport>);
    harness.transports.insert_for_test("Y", Arc::new(FakeTransport::echo()));

    for _ in 0..10 {
        let envelope = RequestEnvelope::new(
            Value::from(1),
            "tools/call",
            json!({"name": "t", "arguments": {"text": "ok"}}),
        );
        let routed = harness.router.route(envelope).await.unwrap();
        assert_eq!(routed.backend_id, "Y");
    }

    // X's circuit must have opened: it should no longer be selected even
    // though it's still a tool-index candidate.
    let health = harness.router.health_table();
    assert_eq!(health.get("X").unwrap().status, HealthStatus::Unhealthy);
    assert!(failing.call_count() > 0, "X must have been attempted at least once before its circuit opened");
}

/// Scenario E — a backend with in-flight work only finishes draining once
/// every admitted request completes; new admissions are refused meanwhile,
/// and other backends are unaffected.
#[tokio::test]
async fn scenario_e_drain_waits_for_in_flight_then_blocks_new_admissions() {
    let harness = build_harness(vec![descriptor("slow", 100, &["work"]), descriptor("other", 50, &["ping"])])
        .await;
    let slow = Arc::new(FakeTransport::echo().with_delay(Duration::from_millis(200)));
    harness.transports.insert_for_test("slow", Arc::clone(&slow) as Arc<dyn Transport>);
    harness.transports.insert_for_test("other", Arc::new(FakeTransport::echo()));

    let mut in_flight = Vec::new();
    for _ in 0..5 {
        let router = Arc::clone(&harness.router);
        in_flight.push(tokio::spawn(async move {
            let envelope = RequestEnvelope::new(
                Value::from(1),
                "tools/call",
                json!({"name": "work", "arguments": {"text": "x"}}),
            );
            router.route(envelope).await
        }));
    }
    // Give the requests a moment to be admitted before draining starts.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(harness.drain.active_count("slow") > 0);

    let stats = harness.drain.drain_backend("slow", crate::drain::DrainStrategy::Graceful, Duration::from_secs(5)).await;
    assert!(!stats.timed_out);
    assert_eq!(harness.drain.active_count("slow"), 0);
    assert!(harness.drain.try_admit("slow").is_none());

    for handle in in_flight {
        assert!(handle.await.unwrap().is_ok());
    }

    // Unaffected sibling backend still serves.
    let envelope = RequestEnvelope::new(Value::from(2), "tools/call", json!({"name": "ping", "arguments": {}}));
    assert!(harness.router.route(envelope).await.is_ok());
}

/// Scenario F — a streamable-HTTP backend answers in chunks; routing a
/// request through `route_stream` forwards them in arrival order instead of
/// collapsing them into one materialized response, and the HTTP ingress's
/// `handle_http` surfaces that as a `Stream` outcome rather than `Json`.
#[tokio::test]
async fn scenario_f_streaming_response_forwards_chunks_in_order() {
    let harness = build_harness(vec![descriptor("s", 100, &["gen"])]).await;
    let chunks = vec![json!({"delta": "a"}), json!({"delta": "b"}), json!({"delta": "c"})];
    harness.transports.insert_for_test("s", Arc::new(FakeTransport::streaming(chunks.clone())));

    let envelope =
        RequestEnvelope::new(Value::from(7), "tools/call", json!({"name": "gen", "arguments": {}}));
    let routed = harness.router.route_stream(envelope).await.unwrap();
    assert_eq!(routed.backend_id, "s");
    assert!(routed.is_streaming);
    let collected: Vec<Value> = routed.stream.map(|r| r.unwrap()).collect().await;
    assert_eq!(collected, chunks);

    let outcome = harness
        .ingress
        .handle_http(json!({
            "jsonrpc": "2.0", "id": 8, "method": "tools/call",
            "params": {"name": "gen", "arguments": {}},
        }))
        .await
        .unwrap();
    match outcome {
        HttpOutcome::Stream { backend_id, stream, .. } => {
            assert_eq!(backend_id, "s");
            let collected: Vec<Value> = stream.map(|r| r.unwrap()).collect().await;
            assert_eq!(collected, chunks);
        }
        HttpOutcome::Json(_) => panic!("expected a streamed outcome for a streaming backend"),
    }
}

/// Retry budget is taken from the backend actually selected for the
/// request, not an arbitrary entry out of the full descriptor map: a
/// backend with a large `max_retries` that doesn't even serve the routed
/// tool must not lend its budget to the one that does.
#[tokio::test]
async fn retry_budget_follows_the_selected_backend_not_an_unrelated_one() {
    let mut descriptors = vec![descriptor("limited", 100, &["only"])];
    descriptors[0].retry = RetryPolicy { max_retries: 0, ..RetryPolicy::default() };
    for i in 0..5 {
        let mut other = descriptor(&format!("o{i}"), 50, &["other"]);
        other.retry = RetryPolicy { max_retries: 5, ..RetryPolicy::default() };
        descriptors.push(other);
    }
    let harness = build_harness(descriptors).await;
    let failing = Arc::new(FakeTransport::always_fails());
    harness.transports.insert_for_test("limited", Arc::clone(&failing) as Arc<dyn Transport>);
    for i in 0..5 {
        harness.transports.insert_for_test(format!("o{i}"), Arc::new(FakeTransport::echo()));
    }

    let envelope = RequestEnvelope::new(Value::from(1), "tools/call", json!({"name": "only", "arguments": {}}));
    let err = harness.router.route(envelope).await.unwrap_err();
    assert!(matches!(err, crate::error::RouterError::RetriesExhausted { .. }));
    assert_eq!(failing.call_count(), 1, "max_retries: 0 on the selected backend means exactly one attempt, no retries");
}

/// A backend drained at the connection-admission layer (independent of the
/// registry marking it draining) refuses new admissions; once every
/// candidate for a tool is in that state the router surfaces
/// `AdmissionRefused` naming the backend, not a generic unavailability.
#[tokio::test]
async fn admission_refused_surfaces_when_the_only_candidate_is_draining() {
    let harness = build_harness(vec![descriptor("d", 100, &["ping"])]).await;
    harness.transports.insert_for_test("d", Arc::new(FakeTransport::echo()));

    let stats = harness.drain.drain_backend("d", crate::drain::DrainStrategy::Immediate, Duration::from_secs(1)).await;
    assert!(!stats.timed_out);
    assert!(harness.drain.try_admit("d").is_none());

    let envelope = RequestEnvelope::new(Value::from(1), "tools/call", json!({"name": "ping", "arguments": {}}));
    let err = harness.router.route(envelope).await.unwrap_err();
    match err {
        crate::error::RouterError::AdmissionRefused(backend) => assert_eq!(backend, "d"),
        other => panic!("expected AdmissionRefused, got {other:?}"),
    }
}

/// Scenario C (abbreviated) — a hot-swap that adds a backend mid-traffic
/// never drops a concurrently in-flight request, and callers observe a
/// higher generation afterward.
#[tokio::test]
async fn scenario_c_hot_swap_adds_backend_without_dropping_requests() {
    let harness = build_harness(vec![descriptor("one", 100, &["ping"])]).await;
    harness.transports.insert_for_test("one", Arc::new(FakeTransport::echo()));
    let gen_before = harness.registry.generation();

    let mut handles = Vec::new();
    for _ in 0..20 {
        let router = Arc::clone(&harness.router);
        handles.push(tokio::spawn(async move {
            let envelope =
                RequestEnvelope::new(Value::from(1), "tools/call", json!({"name": "ping", "arguments": {}}));
            router.route(envelope).await
        }));
    }

    harness
        .registry
        .apply_update(
            vec![descriptor("one", 100, &["ping"]), descriptor("two", 90, &["ping"])],
            UpdateOptions::default(),
        )
        .await
        .unwrap();
    harness.transports.insert_for_test("two", Arc::new(FakeTransport::echo()));

    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }
    assert!(harness.registry.generation() > gen_before);
}
