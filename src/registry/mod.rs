//! Backend Registry & Hot-Swap Engine (C2).
//!
//! The live [`RegistrySnapshot`] is an immutable value published by atomic
//! pointer swap; readers never take a lock. Updates are serialized through a
//! single writer mutex, validated, probed, and published in one linearizing
//! swap — a reader either sees the entire old snapshot or the entire new
//! one, never a hybrid.

pub mod hash_ring;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast};

use crate::error::RegistryError;
use hash_ring::HashRing;

/// Opaque, stable backend identifier. Assigned when a backend enters the
/// registry (here: its config key); survives restarts if the config
/// provider persists it.
pub type BackendId = String;

/// A monotonically increasing generation counter. Every successful registry
/// mutation yields a new generation.
pub type Generation = u64;

/// Resource caps applied to a STDIO child before exec, on platforms that
/// support it (§3's "resource caps (CPU seconds, memory bytes, wall-clock
/// per request)" — wall-clock is covered separately by the descriptor's
/// `timeout` field).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceLimits {
    pub cpu_seconds: Option<u64>,
    pub memory_bytes: Option<u64>,
}

/// Tagged transport specification for one backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TransportSpec {
    Stdio {
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
        cwd: Option<String>,
        #[serde(default)]
        resource_limits: ResourceLimits,
    },
    Http {
        url: String,
        headers: HashMap<String, String>,
        /// Expect an event-stream response rather than single JSON.
        event_stream: bool,
    },
    LegacySse {
        control_url: String,
        event_url: String,
    },
}

impl TransportSpec {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            TransportSpec::Stdio { command, .. } if command.trim().is_empty() => {
                Err("empty executable path".to_string())
            }
            TransportSpec::Http { url, .. } if url::Url::parse(url).is_err() => {
                Err(format!("malformed URL: {url}"))
            }
            TransportSpec::LegacySse { control_url, event_url, .. }
                if url::Url::parse(control_url).is_err() || url::Url::parse(event_url).is_err() =>
            {
                Err("malformed control/event URL".to_string())
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(5),
            jitter: 0.15,
        }
    }
}

/// Immutable-per-generation record describing one backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendDescriptor {
    pub id: BackendId,
    pub display_name: String,
    pub transport: TransportSpec,
    /// Tool names this backend advertises; populated after discovery and
    /// folded back into the registry via a follow-up update.
    pub tool_names: Vec<String>,
    pub priority: i32,
    pub weight: u32,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    /// Name resolved externally by the secret resolver; never a secret
    /// in-band.
    pub auth_ref: Option<String>,
}

/// Health status as observed by the (external) health monitor collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    pub fn is_routable(self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }
}

/// Per-backend health record, owned by the health monitor, read by the router.
#[derive(Debug, Clone)]
pub struct HealthRecord {
    pub status: HealthStatus,
    pub last_success: Option<std::time::Instant>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u64,
    pub ewma_latency_ms: f64,
}

impl Default for HealthRecord {
    fn default() -> Self {
        Self {
            status: HealthStatus::Unknown,
            last_success: None,
            consecutive_failures: 0,
            consecutive_successes: 0,
            ewma_latency_ms: 0.0,
        }
    }
}

impl HealthRecord {
    const EWMA_ALPHA: f64 = 0.2;

    pub fn record_success(&mut self, latency: Duration) {
        self.status = HealthStatus::Healthy;
        self.last_success = Some(std::time::Instant::now());
        self.consecutive_failures = 0;
        self.consecutive_successes += 1;
        let sample = latency.as_secs_f64() * 1000.0;
        self.ewma_latency_ms = if self.ewma_latency_ms == 0.0 {
            sample
        } else {
            Self::EWMA_ALPHA * sample + (1.0 - Self::EWMA_ALPHA) * self.ewma_latency_ms
        };
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
        self.status = if self.consecutive_failures >= 3 {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Degraded
        };
    }
}

/// One immutable snapshot of the registry at a given generation.
#[derive(Clone)]
pub struct RegistrySnapshot {
    pub generation: Generation,
    pub descriptors: Arc<HashMap<BackendId, BackendDescriptor>>,
    /// tool name -> ordered candidate list (priority desc, then id asc).
    pub tool_index: Arc<HashMap<String, Vec<BackendId>>>,
    pub hash_ring: Arc<HashRing>,
    pub draining: Arc<std::collections::HashSet<BackendId>>,
}

impl RegistrySnapshot {
    fn empty() -> Self {
        Self {
            generation: 0,
            descriptors: Arc::new(HashMap::new()),
            tool_index: Arc::new(HashMap::new()),
            hash_ring: Arc::new(HashRing::new(160)),
            draining: Arc::new(std::collections::HashSet::new()),
        }
    }
}

/// Events emitted on every successful mutation, for admin UI / client
/// notifications (`subscribe_events`).
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    BackendAdded(BackendId),
    BackendRemoved(BackendId),
    BackendModified(BackendId),
    HealthChanged(BackendId, HealthStatus),
    GenerationAdvanced(Generation),
    NotifyToolsListChanged,
}

/// Update mode, controlling how the new descriptor set replaces backends
/// already present in the registry (§4.2).
#[derive(Debug, Clone, Default)]
pub enum UpdateMode {
    #[default]
    Instant,
    BlueGreen {
        overlap: Duration,
    },
    Canary {
        stages: Vec<u32>,
    },
}

#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    pub mode: UpdateMode,
    pub probe_timeout: Option<Duration>,
}

/// A connectivity probe for a proposed backend. Pluggable so tests can
/// substitute a fake that never touches a real process or socket.
#[async_trait::async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn probe(&self, descriptor: &BackendDescriptor) -> bool;
}

/// Default probe: structural validation only (no live connection). Real
/// deployments wire the transport layer's `probe()` capability here instead.
pub struct NullProbe;

#[async_trait::async_trait]
impl ConnectivityProbe for NullProbe {
    async fn probe(&self, _descriptor: &BackendDescriptor) -> bool {
        true
    }
}

/// Thread-safe backend registry with atomic generational updates.
pub struct AtomicRegistry {
    inner: ArcSwap<RegistrySnapshot>,
    generation: AtomicU64,
    writer_lock: Mutex<()>,
    virtual_nodes: usize,
    events: broadcast::Sender<RegistryEvent>,
    probe: Arc<dyn ConnectivityProbe>,
}

impl AtomicRegistry {
    pub fn new(virtual_nodes: usize) -> Self {
        Self::with_probe(virtual_nodes, Arc::new(NullProbe))
    }

    pub fn with_probe(virtual_nodes: usize, probe: Arc<dyn ConnectivityProbe>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: ArcSwap::from_pointee(RegistrySnapshot::empty()),
            generation: AtomicU64::new(0),
            writer_lock: Mutex::new(()),
            virtual_nodes,
            events,
            probe,
        }
    }

    /// Wait-free read of the current snapshot.
    pub fn current_snapshot(&self) -> Arc<RegistrySnapshot> {
        self.inner.load_full()
    }

    pub fn generation(&self) -> Generation {
        self.generation.load(Ordering::Acquire)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Validate, probe, build, and atomically publish a new snapshot.
    ///
    /// `proposed` is the complete desired descriptor set (not a delta): any
    /// backend id present in the current snapshot but absent here is
    /// removed (and marked Draining so C5 can wind it down).
    pub async fn apply_update(
        &self,
        proposed: Vec<BackendDescriptor>,
        options: UpdateOptions,
    ) -> Result<Generation, RegistryError> {
        let _guard = self.writer_lock.lock().await;

        // 1. Validate.
        let mut seen = std::collections::HashSet::new();
        for d in &proposed {
            if !seen.insert(d.id.clone()) {
                return Err(RegistryError::DuplicateBackendId(d.id.clone()));
            }
            if let Err(reason) = d.transport.validate() {
                return Err(RegistryError::InvalidTransport(d.id.clone(), reason));
            }
        }

        // 2. Probe connectivity for added/modified backends in parallel.
        let current = self.current_snapshot();
        let to_probe: Vec<&BackendDescriptor> = proposed
            .iter()
            .filter(|d| {
                current
                    .descriptors
                    .get(&d.id)
                    .map(|existing| existing != *d)
                    .unwrap_or(true)
            })
            .collect();

        let probe_timeout = options.probe_timeout.unwrap_or(Duration::from_secs(5));
        let mut failed = 0usize;
        for d in &to_probe {
            let ok = tokio::time::timeout(probe_timeout, self.probe.probe(d))
                .await
                .unwrap_or(false);
            if !ok {
                failed += 1;
                tracing::warn!(backend = %d.id, "connectivity probe failed, adopting as Unknown");
            }
        }

        // 3. Acceptance gate.
        if !to_probe.is_empty() && failed * 2 > to_probe.len() {
            return Err(RegistryError::TooManyFailures { probed: to_probe.len(), failed });
        }

        // 4. Build new snapshot.
        let mut descriptors = HashMap::new();
        let mut draining = std::collections::HashSet::new();
        for (id, existing) in current.descriptors.iter() {
            if !proposed.iter().any(|d| &d.id == id) {
                draining.insert(id.clone());
            }
            let _ = existing;
        }
        for d in &proposed {
            descriptors.insert(d.id.clone(), d.clone());
        }

        let tool_index = build_tool_index(&descriptors);
        let hash_ring = HashRing::build(self.virtual_nodes, descriptors.keys().cloned());

        let new_generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let new_snapshot = RegistrySnapshot {
            generation: new_generation,
            descriptors: Arc::new(descriptors),
            tool_index: Arc::new(tool_index),
            hash_ring: Arc::new(hash_ring),
            draining: Arc::new(draining.clone()),
        };

        // 5/6. Publish: the linearization point. Readers from this instant
        // observe either the entire old snapshot or the entire new one.
        self.inner.store(Arc::new(new_snapshot));

        // 7. Emit events; actual draining is coordinated by C5 out-of-band.
        for id in &draining {
            let _ = self.events.send(RegistryEvent::BackendRemoved(id.clone()));
        }
        for d in &proposed {
            let event = if current.descriptors.contains_key(&d.id) {
                RegistryEvent::BackendModified(d.id.clone())
            } else {
                RegistryEvent::BackendAdded(d.id.clone())
            };
            let _ = self.events.send(event);
        }
        let _ = self.events.send(RegistryEvent::GenerationAdvanced(new_generation));
        let _ = self.events.send(RegistryEvent::NotifyToolsListChanged);

        match options.mode {
            UpdateMode::Instant => {}
            UpdateMode::BlueGreen { .. } | UpdateMode::Canary { .. } => {
                // Stage/overlap management is driven by the caller issuing
                // follow-up `apply_update` calls with adjusted weights; the
                // registry only guarantees each such call is linearized.
            }
        }

        Ok(new_generation)
    }

    /// Mark a single backend Draining without otherwise changing the
    /// descriptor set (used by an explicit `drain_backend` control call).
    pub async fn mark_draining(&self, id: &BackendId) -> Result<Generation, RegistryError> {
        let _guard = self.writer_lock.lock().await;
        let current = self.current_snapshot();
        if !current.descriptors.contains_key(id) {
            return Err(RegistryError::NotFound(id.clone()));
        }
        let mut draining = (*current.draining).clone();
        draining.insert(id.clone());
        let new_generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let new_snapshot = RegistrySnapshot {
            generation: new_generation,
            descriptors: current.descriptors.clone(),
            tool_index: current.tool_index.clone(),
            hash_ring: current.hash_ring.clone(),
            draining: Arc::new(draining),
        };
        self.inner.store(Arc::new(new_snapshot));
        let _ = self.events.send(RegistryEvent::GenerationAdvanced(new_generation));
        Ok(new_generation)
    }

    /// Re-publish a previously observed snapshot's descriptor set as a new
    /// generation, used by the drain coordinator's auto-rollback hook.
    pub async fn rollback_to(
        &self,
        snapshot: Arc<RegistrySnapshot>,
    ) -> Result<Generation, RegistryError> {
        let descriptors: Vec<BackendDescriptor> = snapshot.descriptors.values().cloned().collect();
        self.apply_update(descriptors, UpdateOptions::default()).await
    }

    pub fn list_backends(&self) -> Vec<BackendDescriptor> {
        self.current_snapshot().descriptors.values().cloned().collect()
    }
}

/// Build the tool-name -> ordered-candidate index plus the name-collision
/// disambiguation: the highest-priority backend keeps the unqualified name,
/// every other backend advertising the same tool is additionally reachable
/// as `<backendId>.<name>`.
fn build_tool_index(
    descriptors: &HashMap<BackendId, BackendDescriptor>,
) -> HashMap<String, Vec<BackendId>> {
    let mut by_tool: HashMap<String, Vec<BackendId>> = HashMap::new();
    for d in descriptors.values() {
        for tool in &d.tool_names {
            by_tool.entry(tool.clone()).or_default().push(d.id.clone());
        }
    }
    for candidates in by_tool.values_mut() {
        candidates.sort_by(|a, b| {
            let pa = descriptors.get(a).map(|d| d.priority).unwrap_or(0);
            let pb = descriptors.get(b).map(|d| d.priority).unwrap_or(0);
            pb.cmp(&pa).then_with(|| a.cmp(b))
        });
    }

    let mut index = HashMap::new();
    for (tool, candidates) in by_tool {
        // Unqualified name routes to the full, priority-ordered candidate list.
        index.insert(tool.clone(), candidates.clone());
        // Every non-primary owner is additionally reachable namespaced.
        for backend_id in candidates.iter().skip(1) {
            index.insert(format!("{backend_id}.{tool}"), vec![backend_id.clone()]);
        }
    }
    index
}

/// Deterministic, per-generation name-collision resolution for the
/// aggregated `tools/list` response: returns `(exposed_name, backend_id)`
/// pairs, the unqualified name for the highest-priority owner and
/// `<backendId>.<name>` for the rest.
pub fn disambiguate_tool_names(
    descriptors: &HashMap<BackendId, BackendDescriptor>,
) -> Vec<(String, BackendId, String)> {
    let mut by_tool: HashMap<String, Vec<BackendId>> = HashMap::new();
    for d in descriptors.values() {
        for tool in &d.tool_names {
            by_tool.entry(tool.clone()).or_default().push(d.id.clone());
        }
    }
    let mut out = Vec::new();
    for (tool, mut owners) in by_tool {
        owners.sort_by(|a, b| {
            let pa = descriptors.get(a).map(|d| d.priority).unwrap_or(0);
            let pb = descriptors.get(b).map(|d| d.priority).unwrap_or(0);
            pb.cmp(&pa).then_with(|| a.cmp(b))
        });
        for (idx, backend_id) in owners.iter().enumerate() {
            let exposed = if idx == 0 {
                tool.clone()
            } else {
                format!("{backend_id}.{tool}")
            };
            out.push((exposed, backend_id.clone(), tool.clone()));
        }
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    out
}
