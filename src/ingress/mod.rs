//! Ingress / Protocol Adapter (C1): accepts JSON-RPC 2.0 requests (single or
//! batch) over whichever client-facing transport is in use, handles methods
//! addressed at Only1MCP itself locally, and dispatches everything else to
//! the [`Router`]. Framing (HTTP body shape, STDIO line discipline) lives in
//! the `http` and `stdio` submodules; this module holds the protocol logic
//! shared by both.

pub mod http;
pub mod stdio;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{Map, Value, json};
use tokio::sync::{RwLock, broadcast};
use tracing::warn;

use futures::StreamExt;

use crate::error::{JsonRpcError, RouterError};
use crate::registry::{AtomicRegistry, BackendId, Generation, RegistryEvent, disambiguate_tool_names};
use crate::router::{RequestEnvelope, Router};
use crate::transport::ChunkStream;
use crate::transport::manager::TransportManager;

const SERVER_NAME: &str = "only1mcp";
const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");
/// Fallback protocol version advertised when a client's `initialize` omits
/// `protocolVersion` (or it isn't a string). When present, the client's own
/// requested version is echoed back verbatim instead (§8 Scenario A).
const PROTOCOL_VERSION: &str = "2024-11-05";

/// A previously-computed aggregate list response, valid as long as the
/// registry generation it was built from is still current (§4.1's
/// "cache the aggregated result keyed by generation" rule).
#[derive(Clone)]
struct AggregateCache {
    generation: Generation,
    value: Value,
}

/// Outcome of handling one HTTP request via [`Ingress::handle_http`]: either
/// a materialized JSON-RPC payload (the ordinary case, identical to what
/// [`Ingress::handle_payload`] would produce) or a still-open chunk stream
/// the caller should forward incrementally as `text/event-stream`.
pub enum HttpOutcome {
    Json(Value),
    Stream { backend_id: BackendId, stream: ChunkStream },
}

/// Outcome of dispatching one JSON-RPC method.
enum Answer {
    /// A locally-computed result, to be wrapped in `{"result": ...}`.
    Result(Value),
    /// A complete JSON-RPC response object received verbatim from a
    /// backend (already carries the right `id`); forwarded as-is.
    Raw(Value),
    Error(JsonRpcError),
    /// Nothing to send back (used for notifications handled locally).
    None,
}

pub struct Ingress {
    registry: Arc<AtomicRegistry>,
    router: Arc<Router>,
    transports: TransportManager,
    tools_cache: RwLock<Option<AggregateCache>>,
    resources_cache: RwLock<Option<AggregateCache>>,
    prompts_cache: RwLock<Option<AggregateCache>>,
    cached_tool_lists: DashMap<BackendId, Vec<Value>>,
    tool_cache_path: Option<PathBuf>,
    /// Broadcasts `notifications/tools/listChanged` (and, in principle, any
    /// other server-initiated notification) to every connected client front.
    pub change_notifications: broadcast::Sender<Value>,
}

impl Ingress {
    pub fn new(
        registry: Arc<AtomicRegistry>,
        router: Arc<Router>,
        transports: TransportManager,
        tool_cache_path: Option<PathBuf>,
    ) -> Self {
        let (tx, _rx) = broadcast::channel(64);
        Self {
            registry,
            router,
            transports,
            tools_cache: RwLock::new(None),
            resources_cache: RwLock::new(None),
            prompts_cache: RwLock::new(None),
            cached_tool_lists: DashMap::new(),
            tool_cache_path,
            change_notifications: tx,
        }
    }

    /// Load the on-disk tool list cache (SPEC_FULL §11) so `tools/list` has
    /// content before every backend finishes its handshake.
    pub async fn preload_tool_cache(&self) {
        let Some(path) = &self.tool_cache_path else { return };
        let known: Vec<String> = self.registry.current_snapshot().descriptors.keys().cloned().collect();
        let loaded = crate::cache::load(path, &known).await;
        for (backend_id, tools) in loaded {
            self.cached_tool_lists.insert(backend_id, tools);
        }
    }

    /// Subscribes to registry events and reacts to `NotifyToolsListChanged`
    /// by invalidating the aggregate caches and broadcasting the MCP
    /// notification to every connected client front. Runs until the
    /// registry's event channel closes (process shutdown).
    pub async fn run_change_listener(self: Arc<Self>) {
        let mut events = self.registry.subscribe_events();
        loop {
            match events.recv().await {
                Ok(RegistryEvent::NotifyToolsListChanged) => {
                    *self.tools_cache.write().await = None;
                    *self.resources_cache.write().await = None;
                    *self.prompts_cache.write().await = None;
                    let notification = json!({
                        "jsonrpc": "2.0",
                        "method": "notifications/tools/listChanged",
                    });
                    let _ = self.change_notifications.send(notification);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    /// Handle one JSON-RPC payload: a single request object or a batch
    /// array. Returns `None` when nothing should be written back (a lone
    /// notification, or a batch consisting entirely of notifications).
    pub async fn handle_payload(&self, payload: Value) -> Option<Value> {
        match payload {
            Value::Array(messages) => {
                if messages.is_empty() {
                    return Some(error_response(Value::Null, JsonRpcError::invalid_request()));
                }
                let futures = messages.into_iter().map(|m| self.handle_message(m));
                let responses: Vec<Value> = futures::future::join_all(futures).await.into_iter().flatten().collect();
                if responses.is_empty() { None } else { Some(Value::Array(responses)) }
            }
            other => self.handle_message(other).await,
        }
    }

    /// Handle exactly one JSON-RPC request or notification object.
    pub async fn handle_message(&self, msg: Value) -> Option<Value> {
        let Some(obj) = msg.as_object() else {
            return Some(error_response(Value::Null, JsonRpcError::parse_error()));
        };

        let id = obj.get("id").cloned();
        let is_notification = id.is_none();

        let method = match obj.get("method").and_then(|m| m.as_str()) {
            Some(m) => m.to_string(),
            None => {
                return if is_notification {
                    None
                } else {
                    Some(error_response(id.unwrap_or(Value::Null), JsonRpcError::invalid_request()))
                };
            }
        };
        let params = obj.get("params").cloned().unwrap_or(Value::Null);

        let answer = self.dispatch(&method, params, id.clone()).await;
        if is_notification {
            return None;
        }
        let id = id.unwrap();
        Some(match answer {
            Answer::Result(v) => json!({"jsonrpc": "2.0", "id": id, "result": v}),
            Answer::Raw(full) => full,
            Answer::Error(e) => error_response(id, e),
            Answer::None => json!({"jsonrpc": "2.0", "id": id, "result": Value::Null}),
        })
    }

    /// Like [`Ingress::handle_payload`], but lets a single (non-batch)
    /// backend-dispatched request ride a streamable-HTTP transport's chunk
    /// stream instead of waiting for it to be fully materialized (§4.1's
    /// `text/event-stream` mode, §4.3's "Response streaming"). Batches,
    /// locally-handled methods (`initialize`, `tools/list`, ...), and
    /// backends whose transport isn't actually streaming all fall back to
    /// the ordinary materialized path unchanged.
    pub async fn handle_http(&self, payload: Value) -> Option<HttpOutcome> {
        let Value::Object(ref obj) = payload else {
            return self.handle_payload(payload).await.map(HttpOutcome::Json);
        };
        let id = obj.get("id").cloned();
        let method = obj.get("method").and_then(|m| m.as_str()).map(str::to_string);
        let params = obj.get("params").cloned().unwrap_or(Value::Null);

        let (Some(id), Some(method)) = (id, method) else {
            return self.handle_payload(payload).await.map(HttpOutcome::Json);
        };
        if !is_backend_dispatched(&method) {
            return self.handle_payload(payload).await.map(HttpOutcome::Json);
        }

        let envelope = RequestEnvelope::new(id.clone(), method.clone(), params);
        match self.router.route_stream(envelope).await {
            Ok(routed) if routed.is_streaming => {
                Some(HttpOutcome::Stream { backend_id: routed.backend_id, stream: routed.stream })
            }
            Ok(routed) => {
                // Not actually a streaming transport: the stream has exactly
                // one item (see `Transport::open_stream`'s default), so
                // materialize it and answer exactly as `handle_payload` would.
                let mut stream = routed.stream;
                let body = match stream.next().await {
                    Some(Ok(v)) => v,
                    Some(Err(e)) => {
                        let err = RouterError::RetriesExhausted { backend: routed.backend_id, source: e };
                        return Some(HttpOutcome::Json(error_response(id, JsonRpcError::from(&err))));
                    }
                    None => return Some(HttpOutcome::Json(error_response(id, JsonRpcError::no_backend_available(&method)))),
                };
                Some(HttpOutcome::Json(body))
            }
            Err(err) => Some(HttpOutcome::Json(error_response(id, JsonRpcError::from(&err)))),
        }
    }

    async fn dispatch(&self, method: &str, params: Value, id: Option<Value>) -> Answer {
        match method {
            "initialize" => Answer::Result(self.initialize_result(&params)),
            "notifications/initialized" => Answer::None,
            "tools/list" => match self.aggregate_tools().await {
                Ok(v) => Answer::Result(v),
                Err(e) => Answer::Error(e),
            },
            "resources/list" => match self.aggregate_list("resources/list", "resources", resource_key).await {
                Ok(v) => Answer::Result(v),
                Err(e) => Answer::Error(e),
            },
            "prompts/list" => match self.aggregate_list("prompts/list", "prompts", prompt_key).await {
                Ok(v) => Answer::Result(v),
                Err(e) => Answer::Error(e),
            },
            "logging/setLevel" => Answer::Result(json!({})),
            _ => {
                let Some(id) = id else { return Answer::None };
                let envelope = RequestEnvelope::new(id, method.to_string(), params);
                match self.router.route(envelope).await {
                    Ok(routed) => Answer::Raw(routed.body),
                    Err(err) => Answer::Error(JsonRpcError::from(&err)),
                }
            }
        }
    }

    /// Echoes the client's requested `protocolVersion` back verbatim, per
    /// §8 Scenario A; falls back to [`PROTOCOL_VERSION`] when the client
    /// omits it (or sends something other than a string).
    fn initialize_result(&self, params: &Value) -> Value {
        let protocol_version =
            params.get("protocolVersion").and_then(Value::as_str).unwrap_or(PROTOCOL_VERSION);
        json!({
            "protocolVersion": protocol_version,
            "capabilities": {
                "tools": { "listChanged": true },
                "resources": { "listChanged": true },
                "prompts": { "listChanged": true },
            },
            "serverInfo": { "name": SERVER_NAME, "version": SERVER_VERSION },
        })
    }

    /// Aggregated `tools/list`: fan out to every non-draining backend in
    /// parallel, combine by concatenation, dedupe and disambiguate per
    /// §4.1's name-collision policy, and cache the result keyed by
    /// generation. A backend that fails to respond falls back to its last
    /// successfully cached tool list (if any) rather than dropping out of
    /// the aggregate entirely.
    async fn aggregate_tools(&self) -> Result<Value, JsonRpcError> {
        let snapshot = self.registry.current_snapshot();

        if let Some(cache) = self.tools_cache.read().await.as_ref()
            && cache.generation == snapshot.generation
        {
            crate::metrics::record_cache_hit();
            return Ok(cache.value.clone());
        }
        crate::metrics::record_cache_miss();

        let routable: Vec<BackendId> = snapshot
            .descriptors
            .keys()
            .filter(|id| !snapshot.draining.contains(id.as_str()))
            .cloned()
            .collect();

        let fetches = routable.iter().map(|id| {
            let id = id.clone();
            async move {
                let Some(transport) = self.transports.get(&id) else { return (id, None) };
                let timeout = snapshot.descriptors.get(&id).map(|d| d.timeout).unwrap_or(Duration::from_secs(10));
                let request = json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list", "params": {}});
                match transport.call(request, timeout).await {
                    Ok(body) => {
                        let tools = body
                            .get("result")
                            .and_then(|r| r.get("tools"))
                            .and_then(|t| t.as_array())
                            .cloned()
                            .unwrap_or_default();
                        (id, Some(tools))
                    }
                    Err(e) => {
                        warn!(backend = %id, error = %e, "tools/list fetch failed, using cache if available");
                        (id, None)
                    }
                }
            }
        });
        let results = futures::future::join_all(fetches).await;

        let mut warnings = Vec::new();
        let mut any_fresh = false;
        for (id, tools) in results {
            match tools {
                Some(t) => {
                    any_fresh = true;
                    self.cached_tool_lists.insert(id, t);
                }
                None => {
                    if !self.cached_tool_lists.contains_key(&id) {
                        warnings.push(json!({"backend": id, "reason": "unreachable, no cached tool list"}));
                    } else {
                        warnings.push(json!({"backend": id, "reason": "unreachable, serving cached tool list"}));
                    }
                }
            }
        }

        let mut out_tools = Vec::new();
        for (exposed_name, backend_id, original_name) in disambiguate_tool_names(&snapshot.descriptors) {
            if let Some(tools) = self.cached_tool_lists.get(&backend_id)
                && let Some(mut entry) = tools
                    .iter()
                    .find(|t| t.get("name").and_then(|n| n.as_str()) == Some(original_name.as_str()))
                    .cloned()
                && let Value::Object(ref mut map) = entry
            {
                map.insert("name".to_string(), Value::String(exposed_name));
                out_tools.push(entry);
            }
        }

        if out_tools.is_empty() && !routable.is_empty() {
            return Err(JsonRpcError::no_backend_available("tools/list"));
        }

        let mut result_map = Map::new();
        result_map.insert("tools".to_string(), Value::Array(out_tools));
        result_map.insert("warnings".to_string(), Value::Array(warnings));
        let value = Value::Object(result_map);

        *self.tools_cache.write().await =
            Some(AggregateCache { generation: snapshot.generation, value: value.clone() });

        if any_fresh && let Some(path) = self.tool_cache_path.clone() {
            let snapshot_map: HashMap<String, Vec<Value>> =
                self.cached_tool_lists.iter().map(|e| (e.key().clone(), e.value().clone())).collect();
            tokio::spawn(async move {
                crate::cache::save(&path, &snapshot_map).await;
            });
        }

        Ok(value)
    }

    /// Shared aggregation path for `resources/list` and `prompts/list`:
    /// same fan-out/combine/dedupe shape as `tools/list` but without disk
    /// persistence (SPEC_FULL §11 scopes cache persistence to tools only).
    async fn aggregate_list(
        &self,
        method: &'static str,
        array_key: &'static str,
        natural_key: fn(&Value) -> Option<String>,
    ) -> Result<Value, JsonRpcError> {
        let snapshot = self.registry.current_snapshot();
        let cache_slot = match array_key {
            "resources" => &self.resources_cache,
            _ => &self.prompts_cache,
        };

        if let Some(cache) = cache_slot.read().await.as_ref()
            && cache.generation == snapshot.generation
        {
            crate::metrics::record_cache_hit();
            return Ok(cache.value.clone());
        }
        crate::metrics::record_cache_miss();

        let routable: Vec<(BackendId, Duration)> = snapshot
            .descriptors
            .values()
            .filter(|d| !snapshot.draining.contains(&d.id))
            .map(|d| (d.id.clone(), d.timeout))
            .collect();

        let fetches = routable.iter().map(|(id, timeout)| {
            let id = id.clone();
            let timeout = *timeout;
            async move {
                let Some(transport) = self.transports.get(&id) else { return (id, None) };
                let request = json!({"jsonrpc": "2.0", "id": 1, "method": method, "params": {}});
                match transport.call(request, timeout).await {
                    Ok(body) => {
                        let items = body
                            .get("result")
                            .and_then(|r| r.get(array_key))
                            .and_then(|v| v.as_array())
                            .cloned()
                            .unwrap_or_default();
                        (id, Some(items))
                    }
                    Err(e) => {
                        warn!(backend = %id, error = %e, method, "aggregate list fetch failed");
                        (id, None)
                    }
                }
            }
        });
        let results = futures::future::join_all(fetches).await;

        let mut warnings = Vec::new();
        let mut any_success = false;
        let mut by_key: HashMap<String, Vec<(BackendId, Value)>> = HashMap::new();
        for (id, items) in results {
            match items {
                Some(items) => {
                    any_success = true;
                    for item in items {
                        if let Some(key) = natural_key(&item) {
                            by_key.entry(key).or_default().push((id.clone(), item));
                        }
                    }
                }
                None => warnings.push(json!({"backend": id, "reason": "unreachable"})),
            }
        }

        if !any_success && !routable.is_empty() {
            return Err(JsonRpcError::no_backend_available(method));
        }

        let mut out = Vec::new();
        for mut owners in by_key.into_values() {
            owners.sort_by(|a, b| {
                let pa = snapshot.descriptors.get(&a.0).map(|d| d.priority).unwrap_or(0);
                let pb = snapshot.descriptors.get(&b.0).map(|d| d.priority).unwrap_or(0);
                pb.cmp(&pa).then_with(|| a.0.cmp(&b.0))
            });
            for (idx, (backend_id, mut item)) in owners.into_iter().enumerate() {
                if idx > 0
                    && let Value::Object(ref mut map) = item
                    && let Some(name) = map.get("name").and_then(|n| n.as_str()).map(str::to_string)
                {
                    map.insert("name".to_string(), Value::String(format!("{backend_id}.{name}")));
                }
                out.push(item);
            }
        }

        let mut result_map = Map::new();
        result_map.insert(array_key.to_string(), Value::Array(out));
        result_map.insert("warnings".to_string(), Value::Array(warnings));
        let value = Value::Object(result_map);

        *cache_slot.write().await = Some(AggregateCache { generation: snapshot.generation, value: value.clone() });
        Ok(value)
    }
}

/// Methods this module's `dispatch` handles locally rather than routing to
/// a backend; kept in sync with the match arms in [`Ingress::dispatch`].
fn is_backend_dispatched(method: &str) -> bool {
    !matches!(
        method,
        "initialize" | "notifications/initialized" | "tools/list" | "resources/list" | "prompts/list" | "logging/setLevel"
    )
}

fn resource_key(v: &Value) -> Option<String> {
    v.get("uri").and_then(|u| u.as_str()).map(str::to_string)
}

fn prompt_key(v: &Value) -> Option<String> {
    v.get("name").and_then(|n| n.as_str()).map(str::to_string)
}

fn error_response(id: Value, err: JsonRpcError) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "error": err})
}
