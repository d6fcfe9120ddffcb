//! HTTP surface: `POST /webhooks/{route}` and `GET /health`.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::{WebhookRegistry, WebhookResponse};
use crate::health::{HealthRegistry, TriggerReport};
use crate::shutdown::ShutdownSignal;

#[derive(Clone)]
struct AppState {
    registry: Arc<WebhookRegistry>,
    health: HealthRegistry,
}

#[derive(Debug, Serialize)]
struct HealthBody {
    ready: bool,
    accepting_webhooks: bool,
    loops: Vec<TriggerReport>,
}

impl IntoResponse for WebhookResponse {
    fn into_response(self) -> Response {
        (
            self.status,
            [(header::CONTENT_TYPE, self.content_type)],
            self.body,
        )
            .into_response()
    }
}

/// Builds the router for webhook deliveries and health checks.
pub fn router(registry: Arc<WebhookRegistry>, health: HealthRegistry) -> Router {
    Router::new()
        .route("/webhooks/{route}", post(deliver))
        .route("/health", get(health_check))
        .with_state(AppState { registry, health })
        .layer(TraceLayer::new_for_http())
}

/// Serves `router` on `listener` until `shutdown` fires, then lets open
/// requests finish.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: ShutdownSignal,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "webhook server listening");
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn deliver(
    State(state): State<AppState>,
    Path(route): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> WebhookResponse {
    state.registry.handle(&route, &headers, &body).await
}

async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthBody>) {
    let loops = state.health.snapshot();
    let ready = loops.iter().all(|report| report.status.is_ready());
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthBody {
            ready,
            accepting_webhooks: state.registry.is_accepting(),
            loops,
        }),
    )
}
