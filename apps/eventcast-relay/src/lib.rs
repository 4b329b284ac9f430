//! Signaling relay for Eventcast.
//!
//! Browsers watching an event open a WebSocket to `/ws`, receive their
//! connection id in a `welcome` frame, and then exchange WebRTC offers,
//! answers and ICE candidates with other viewers by addressing them with
//! `socketId`. Media never passes through the relay.

pub mod auth;
pub mod config;
pub mod coordinator;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod state;
pub mod telemetry;
pub mod websocket;

use std::future::Future;
use std::net::SocketAddr;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use crate::state::{RelaySettings, SignalingState};

#[derive(Clone)]
struct HttpState {
    signaling: SignalingState,
    metrics: Option<PrometheusHandle>,
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    active_connections: usize,
    tracked_sessions: usize,
}

/// Build the HTTP surface: health, stats, metrics and the signaling socket.
pub fn app(signaling: SignalingState, metrics: Option<PrometheusHandle>) -> Router {
    let http_routes = Router::new()
        .route("/health", get(health_check))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(HttpState {
            signaling: signaling.clone(),
            metrics,
        });

    let ws_routes = Router::new()
        .route("/ws", get(websocket::websocket_handler))
        .with_state(signaling);

    Router::new()
        .merge(http_routes)
        .merge(ws_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Serve `router` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, router: Router, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<HttpState>) -> impl IntoResponse {
    Json(StatsResponse {
        active_connections: state.signaling.registry().len(),
        tracked_sessions: state.signaling.coordinator().tracked(),
    })
}

async fn metrics_handler(State(state): State<HttpState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
