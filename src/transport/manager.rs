//! Keeps one live [`Transport`] per backend in sync with the registry's
//! published generations: connects new/modified backends, tears down
//! removed ones once the drain coordinator reports them drained.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Notify, broadcast};

use crate::drain::{DrainCoordinator, DrainStrategy};
use crate::error::TransportError;
use crate::registry::{AtomicRegistry, BackendDescriptor, BackendId, RegistryEvent, RegistrySnapshot};
use crate::secrets::SecretResolver;
use crate::transport::{self, Transport};

/// Connection-pool analogue for the whole proxy: a keyed map of live
/// transports, reconciled against each new snapshot rather than mutated
/// in place by callers.
#[derive(Clone)]
pub struct TransportManager {
    live: Arc<DashMap<BackendId, Arc<dyn Transport>>>,
    resolver: Arc<SecretResolver>,
}

impl Default for TransportManager {
    fn default() -> Self {
        Self::new(Arc::new(SecretResolver::with_defaults(false)))
    }
}

impl TransportManager {
    pub fn new(resolver: Arc<SecretResolver>) -> Self {
        Self { live: Arc::new(DashMap::new()), resolver }
    }

    pub fn get(&self, backend_id: &str) -> Option<Arc<dyn Transport>> {
        self.live.get(backend_id).map(|e| e.value().clone())
    }

    /// Connect (or reconnect) one backend and register it, replacing and
    /// closing any prior transport under the same id.
    pub async fn connect(&self, descriptor: &BackendDescriptor) -> Result<(), TransportError> {
        let transport: Arc<dyn Transport> = Arc::from(transport::connect(descriptor, &self.resolver).await?);
        if let Some((_, old)) = self.live.remove(&descriptor.id) {
            old.close().await;
        }
        self.live.insert(descriptor.id.clone(), transport);
        Ok(())
    }

    /// Reconcile live transports against a freshly published snapshot:
    /// connect anything new, leave unchanged backends alone, and close
    /// transports for backends no longer present at all (draining
    /// backends are closed later, once C5 reports them fully drained, via
    /// [`TransportManager::retire`]).
    pub async fn reconcile(&self, snapshot: &RegistrySnapshot) {
        for descriptor in snapshot.descriptors.values() {
            if self.live.contains_key(&descriptor.id) {
                continue;
            }
            if let Err(e) = self.connect(descriptor).await {
                tracing::warn!(backend = %descriptor.id, error = %e, "failed to connect transport for new backend");
            }
        }
    }

    /// Close and drop the transport for a backend once its drain has
    /// completed (or timed out and been force-closed).
    pub async fn retire(&self, backend_id: &str) {
        if let Some((_, transport)) = self.live.remove(backend_id) {
            transport.close().await;
        }
    }

    pub fn is_connected(&self, backend_id: &str) -> bool {
        self.live.contains_key(backend_id)
    }

    /// Register a pre-built transport directly, bypassing `connect()`'s
    /// descriptor-driven dispatch. Used by in-crate integration tests to
    /// wire a fake in-process backend without spawning a real process or
    /// socket (SPEC_FULL §10.4's `testutil` fixture).
    #[cfg(test)]
    pub(crate) fn insert_for_test(&self, backend_id: impl Into<BackendId>, transport: Arc<dyn Transport>) {
        self.live.insert(backend_id.into(), transport);
    }
}

/// Keeps live transports in sync with every hot-swap after boot: the
/// one-time [`TransportManager::reconcile`] call covers the backends
/// present in the initial snapshot, but a config reload or admin-triggered
/// `apply_update` after that only touches the registry's descriptors/tool
/// index/hash ring. Without this listener a newly added backend never gets
/// a transport, a modified one keeps its stale transport, and a removed
/// one's transport leaks until the process exits.
pub async fn run_reconciler(
    registry: Arc<AtomicRegistry>,
    transports: TransportManager,
    drain: DrainCoordinator,
    drain_timeout: Duration,
    shutdown: Arc<Notify>,
) {
    let mut events = registry.subscribe_events();
    loop {
        tokio::select! {
            _ = shutdown.notified() => return,
            event = events.recv() => {
                match event {
                    Ok(RegistryEvent::BackendAdded(id)) | Ok(RegistryEvent::BackendModified(id)) => {
                        let descriptor = registry.current_snapshot().descriptors.get(&id).cloned();
                        let Some(descriptor) = descriptor else { continue };
                        if let Err(e) = transports.connect(&descriptor).await {
                            tracing::warn!(backend = %id, error = %e, "failed to connect transport after hot-swap");
                        }
                    }
                    Ok(RegistryEvent::BackendRemoved(id)) => {
                        let transports = transports.clone();
                        let drain = drain.clone();
                        tokio::spawn(async move {
                            let stats = drain.drain_backend(&id, DrainStrategy::Graceful, drain_timeout).await;
                            tracing::info!(
                                backend = %id,
                                connections_drained = stats.connections_drained,
                                timed_out = stats.timed_out,
                                "drained removed backend, retiring transport"
                            );
                            transports.retire(&id).await;
                        });
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{RetryPolicy, TransportSpec};
    use std::collections::HashMap;
    use std::time::Duration;

    fn descriptor(id: &str) -> BackendDescriptor {
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
            tool_names: vec![],
            priority: 0,
            weight: 100,
            timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            auth_ref: None,
        }
    }

    #[tokio::test]
    async fn connect_then_retire_round_trips() {
        let manager = TransportManager::default();
        manager.connect(&descriptor("a")).await.unwrap();
        assert!(manager.is_connected("a"));
        manager.retire("a").await;
        assert!(!manager.is_connected("a"));
    }

    #[tokio::test]
    async fn reconciler_connects_added_and_retires_removed_backends() {
        let registry = Arc::new(crate::registry::AtomicRegistry::new(10));
        registry.apply_update(vec![], crate::registry::UpdateOptions::default()).await.unwrap();

        let manager = TransportManager::default();
        let drain = DrainCoordinator::new();
        let shutdown = Arc::new(Notify::new());

        let task = {
            let registry = Arc::clone(&registry);
            let manager = manager.clone();
            let drain = drain.clone();
            let shutdown = Arc::clone(&shutdown);
            tokio::spawn(async move {
                run_reconciler(registry, manager, drain, Duration::from_millis(50), shutdown).await;
            })
        };

        registry.apply_update(vec![descriptor("hot")], crate::registry::UpdateOptions::default()).await.unwrap();
        wait_until(|| manager.is_connected("hot")).await;

        registry.apply_update(vec![], crate::registry::UpdateOptions::default()).await.unwrap();
        wait_until(|| !manager.is_connected("hot")).await;

        shutdown.notify_waiters();
        task.await.unwrap();
    }

    async fn wait_until(mut predicate: impl FnMut() -> bool) {
        for _ in 0..50 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn reconciling_an_empty_snapshot_connects_nothing() {
        let manager = TransportManager::default();
        let snapshot = RegistrySnapshot {
            generation: 1,
            descriptors: Arc::new(HashMap::new()),
            tool_index: Arc::new(HashMap::new()),
            hash_ring: Arc::new(crate::registry::hash_ring::HashRing::new(10)),
            draining: Arc::new(std::collections::HashSet::new()),
        };
        manager.reconcile(&snapshot).await;
        assert!(manager.get("a").is_none());
    }
}
