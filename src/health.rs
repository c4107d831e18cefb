//! Liveness, readiness and status endpoints
//!
//! `/health/live` answers as long as the process runs; `/health/ready`
//! reflects whether the service's dependencies are up (broker connected,
//! DB reachable); `/status` returns a JSON aggregate of component stats
//! supplied by the binary at wiring time.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Closure producing the `/status` document
pub type StatusFn = Arc<dyn Fn() -> serde_json::Value + Send + Sync>;

#[derive(Clone)]
pub struct HealthState {
    ready: Arc<AtomicBool>,
    status: StatusFn,
}

/// Shared readiness flag flipped by the owning service
#[derive(Clone, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    pub fn set(&self, ready: bool) {
        self.0.store(ready, Ordering::Relaxed);
    }

    pub fn get(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

pub struct HealthServer {
    port: u16,
    state: HealthState,
}

impl HealthServer {
    pub fn new(port: u16, readiness: Readiness, status: StatusFn) -> Self {
        Self {
            port,
            state: HealthState {
                ready: readiness.0,
                status,
            },
        }
    }

    pub async fn serve(self) -> anyhow::Result<()> {
        let app = Router::new()
            .route("/health/live", get(live_handler))
            .route("/health/ready", get(ready_handler))
            .route("/status", get(status_handler))
            .with_state(self.state);
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(port = self.port, "Health server listening");
        axum::serve(listener, app).await?;
        Ok(())
    }
}

async fn live_handler() -> &'static str {
    "ok"
}

async fn ready_handler(State(state): State<HealthState>) -> impl IntoResponse {
    if state.ready.load(Ordering::Relaxed) {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

async fn status_handler(State(state): State<HealthState>) -> Json<serde_json::Value> {
    Json((state.status)())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ready_flag_controls_response() {
        let readiness = Readiness::default();
        let state = HealthState {
            ready: readiness.0.clone(),
            status: Arc::new(|| serde_json::json!({})),
        };

        let response = ready_handler(State(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        readiness.set(true);
        let response = ready_handler(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_status_returns_supplied_document() {
        let state = HealthState {
            ready: Arc::new(AtomicBool::new(true)),
            status: Arc::new(|| serde_json::json!({"devices": 3})),
        };
        let Json(body) = status_handler(State(state)).await;
        assert_eq!(body["devices"], 3);
    }
}
