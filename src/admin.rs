//! Optional admin HTTP surface (§6's control surface), feature-gated behind
//! the `admin` cargo feature and off by default in config. Exposes
//! `list_backends`, `apply_update`, and `drain_backend`; full admin UI
//! schema design is explicitly out of scope.

#[cfg(feature = "admin")]
pub mod api {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::extract::{Path, State};
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde::{Deserialize, Serialize};
    use tokio::net::TcpListener;
    use tokio::sync::Notify;
    use tracing::info;

    use crate::drain::{DrainCoordinator, DrainStrategy};
    use crate::registry::{AtomicRegistry, BackendDescriptor, UpdateOptions};

    #[derive(Clone)]
    pub struct AdminState {
        pub registry: Arc<AtomicRegistry>,
        pub drain: DrainCoordinator,
    }

    pub async fn start(state: AdminState, listen: &str, shutdown: Arc<Notify>) -> anyhow::Result<()> {
        let app = Router::new()
            .route("/api/health", get(health))
            .route("/api/backends", get(backends))
            .route("/api/backends/apply", post(apply_update))
            .route("/api/backends/{id}/drain", post(drain_backend))
            .route("/metrics", get(metrics))
            .with_state(state);

        let listener = TcpListener::bind(listen).await?;
        info!(listen = %listen, "admin API started");
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.notified().await })
            .await?;
        info!("admin API stopped");
        Ok(())
    }

    #[derive(Serialize)]
    struct HealthResponse {
        status: &'static str,
        generation: u64,
        total_backends: usize,
        draining: usize,
    }

    async fn health(State(state): State<AdminState>) -> Json<HealthResponse> {
        let snapshot = state.registry.current_snapshot();
        Json(HealthResponse {
            status: "healthy",
            generation: snapshot.generation,
            total_backends: snapshot.descriptors.len(),
            draining: snapshot.draining.len(),
        })
    }

    #[derive(Serialize)]
    struct BackendSummary {
        id: String,
        display_name: String,
        priority: i32,
        weight: u32,
        active_connections: i64,
        draining: bool,
    }

    async fn backends(State(state): State<AdminState>) -> Json<Vec<BackendSummary>> {
        let snapshot = state.registry.current_snapshot();
        let summaries = snapshot
            .descriptors
            .values()
            .map(|d| BackendSummary {
                id: d.id.clone(),
                display_name: d.display_name.clone(),
                priority: d.priority,
                weight: d.weight,
                active_connections: state.drain.active_count(&d.id),
                draining: snapshot.draining.contains(&d.id),
            })
            .collect();
        Json(summaries)
    }

    #[derive(Deserialize)]
    struct ApplyUpdateRequest {
        backends: Vec<BackendDescriptor>,
    }

    #[derive(Serialize)]
    struct ApplyUpdateResponse {
        generation: u64,
    }

    async fn apply_update(
        State(state): State<AdminState>,
        Json(req): Json<ApplyUpdateRequest>,
    ) -> Result<Json<ApplyUpdateResponse>, (StatusCode, String)> {
        let generation = state
            .registry
            .apply_update(req.backends, UpdateOptions::default())
            .await
            .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
        Ok(Json(ApplyUpdateResponse { generation }))
    }

    #[derive(Deserialize)]
    struct DrainRequest {
        #[serde(default = "default_strategy")]
        strategy: String,
        #[serde(default = "default_drain_timeout_secs")]
        timeout_secs: u64,
    }

    fn default_strategy() -> String {
        "graceful".to_string()
    }

    fn default_drain_timeout_secs() -> u64 {
        30
    }

    #[derive(Serialize)]
    struct DrainResponse {
        connections_drained: u64,
        timed_out: bool,
    }

    async fn drain_backend(
        State(state): State<AdminState>,
        Path(id): Path<String>,
        Json(req): Json<DrainRequest>,
    ) -> Result<Json<DrainResponse>, (StatusCode, String)> {
        let strategy = match req.strategy.as_str() {
            "immediate" => DrainStrategy::Immediate,
            "graceful" => DrainStrategy::Graceful,
            "progressive" => DrainStrategy::Progressive,
            other => return Err((StatusCode::BAD_REQUEST, format!("unknown drain strategy: {other}"))),
        };
        // Mark the backend draining in the registry first so aggregated
        // tool/resource/prompt lists and new routing decisions stop
        // considering it immediately, not only once the coordinator drain
        // below (which can take up to `timeout_secs`) finishes.
        state.registry.mark_draining(&id).await.map_err(|e| (StatusCode::NOT_FOUND, e.to_string()))?;
        let stats = state
            .drain
            .drain_backend(&id, strategy, Duration::from_secs(req.timeout_secs))
            .await;
        Ok(Json(DrainResponse {
            connections_drained: stats.connections_drained,
            timed_out: stats.timed_out,
        }))
    }

    async fn metrics() -> Result<(StatusCode, [(&'static str, &'static str); 1], Vec<u8>), StatusCode> {
        let body = crate::metrics::gather().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        Ok((StatusCode::OK, [("Content-Type", "text/plain; version=0.0.4")], body))
    }
}
