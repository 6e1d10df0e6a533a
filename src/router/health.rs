//! Health monitor: the external collaborator referenced by §6, owning
//! periodic liveness probing and STDIO restart supervision. Feeds
//! [`HealthRecord`](crate::registry::HealthRecord) updates that the router
//! reads when filtering candidates; the core router performs no probing of
//! its own beyond the registry's on-change connectivity probe (§4.2 step 3).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::config::HealthConfig;
use crate::drain::DrainCoordinator;
use crate::registry::{AtomicRegistry, BackendId, TransportSpec};
use crate::transport::manager::TransportManager;

use super::Router;

/// Per-backend restart bookkeeping for STDIO backends whose child process
/// has exited (detected via a failed `probe()`).
struct RestartState {
    restart_count: u32,
    window_start: Option<Instant>,
    last_attempt: Option<Instant>,
}

impl RestartState {
    fn new() -> Self {
        Self { restart_count: 0, window_start: None, last_attempt: None }
    }

    fn backoff(&self, config: &HealthConfig) -> Duration {
        let multiplier = 2u64.saturating_pow(self.restart_count.min(6));
        (config.restart_initial_backoff * multiplier as u32).min(config.restart_max_backoff)
    }

    fn should_attempt(&self, config: &HealthConfig) -> bool {
        if let Some(start) = self.window_start
            && start.elapsed() > config.restart_window
        {
            return true;
        }
        self.restart_count < config.max_restarts
    }

    fn record_attempt(&mut self, config: &HealthConfig) {
        if self.window_start.map(|s| s.elapsed() > config.restart_window).unwrap_or(true) {
            self.window_start = Some(Instant::now());
            self.restart_count = 0;
        }
        self.restart_count += 1;
        self.last_attempt = Some(Instant::now());
    }
}

/// Periodically probes every backend in the live snapshot, updates the
/// router's health table, and attempts bounded-backoff restarts for STDIO
/// backends whose process has exited. Runs until `shutdown` is notified.
pub async fn run(
    router: Arc<Router>,
    registry: Arc<AtomicRegistry>,
    transports: TransportManager,
    drain: DrainCoordinator,
    config: HealthConfig,
    shutdown: Arc<Notify>,
) {
    let mut restart_state: HashMap<BackendId, RestartState> = HashMap::new();

    loop {
        tokio::select! {
            _ = tokio::time::sleep(config.interval) => {}
            _ = shutdown.notified() => {
                tracing::info!("health monitor shutting down");
                return;
            }
        }

        let snapshot = registry.current_snapshot();
        crate::metrics::set_generation(snapshot.generation);
        for (id, count) in drain.snapshot() {
            crate::metrics::set_active_connections(&id, count);
        }
        for (id, descriptor) in snapshot.descriptors.iter() {
            if snapshot.draining.contains(id) {
                continue;
            }
            let Some(transport) = transports.get(id) else { continue };
            let alive = tokio::time::timeout(Duration::from_secs(5), transport.probe())
                .await
                .unwrap_or(false);

            if alive {
                router
                    .health_table()
                    .entry(id.clone())
                    .or_default()
                    .record_success(Duration::ZERO);
                crate::metrics::set_backend_health(id, router.health_table().get(id).unwrap().status);
                restart_state.remove(id);
                continue;
            }

            router.health_table().entry(id.clone()).or_default().record_failure();
            crate::metrics::set_backend_health(id, router.health_table().get(id).unwrap().status);
            tracing::warn!(backend = %id, "health probe failed");

            if !matches!(descriptor.transport, TransportSpec::Stdio { .. }) {
                continue;
            }

            let state = restart_state.entry(id.clone()).or_insert_with(RestartState::new);
            if !state.should_attempt(&config) {
                tracing::warn!(backend = %id, "restart budget exhausted, leaving backend unhealthy");
                continue;
            }
            if let Some(last) = state.last_attempt
                && last.elapsed() < state.backoff(&config)
            {
                continue;
            }

            state.record_attempt(&config);
            tracing::info!(backend = %id, attempt = state.restart_count, "restarting stdio backend");
            if let Err(e) = transports.connect(descriptor).await {
                tracing::error!(backend = %id, error = %e, "stdio backend restart failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_state_resets_after_window_expires() {
        let config = HealthConfig {
            interval: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(60),
            failure_threshold: 3,
            restart_initial_backoff: Duration::from_millis(1),
            restart_max_backoff: Duration::from_millis(10),
            max_restarts: 1,
            restart_window: Duration::from_millis(1),
        };
        let mut state = RestartState::new();
        state.record_attempt(&config);
        assert_eq!(state.restart_count, 1);
        std::thread::sleep(Duration::from_millis(5));
        assert!(state.should_attempt(&config));
    }

    #[test]
    fn restart_budget_exhausts_within_window() {
        let config = HealthConfig {
            interval: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(60),
            failure_threshold: 3,
            restart_initial_backoff: Duration::from_millis(1),
            restart_max_backoff: Duration::from_millis(10),
            max_restarts: 2,
            restart_window: Duration::from_secs(600),
        };
        let mut state = RestartState::new();
        assert!(state.should_attempt(&config));
        state.record_attempt(&config);
        assert!(state.should_attempt(&config));
        state.record_attempt(&config);
        assert!(!state.should_attempt(&config));
    }
}
