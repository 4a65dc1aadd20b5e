// src/server.rs
// Router assembly and listeners. The public router carries the edge filter
// and the tarpit mount; the internal router carries the escalation and
// enforcement endpoints plus metrics. Unexpected panics in handlers are
// caught by the outermost layer and become plain 500s.

use std::sync::Arc;

use axum::extract::State;
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tracing::info;

use crate::edge;
use crate::enforcement;
use crate::error::{Error, Result};
use crate::escalation;
use crate::runtime::Runtime;
use crate::tarpit;

/// Public-facing router: health, the tarpit mount, and a pass-through
/// placeholder for everything else. Deployments chain the real origin
/// behind the filter; the placeholder stands in for it here.
pub fn public_router(rt: Arc<Runtime>) -> Router {
    let tarpit_routes = Router::new()
        .route("/", get(tarpit::handle))
        .route("/*rest", get(tarpit::handle))
        .with_state(rt.clone());

    Router::new()
        .route("/health", get(health))
        .nest(rt.config.tarpit_mount(), tarpit_routes)
        .fallback(passthrough)
        .layer(middleware::from_fn_with_state(rt, edge::filter_request))
}

/// Internal router: escalation, enforcement, health, metrics. Bound to a
/// loopback or otherwise non-public address.
pub fn internal_router(rt: Arc<Runtime>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_snapshot))
        .route("/escalate", post(escalation::handle_escalate))
        .route("/analyze", post(enforcement::handle_analyze))
        .with_state(rt)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "healthy" }))
}

async fn metrics_snapshot(State(rt): State<Arc<Runtime>>) -> impl IntoResponse {
    Json(rt.metrics.snapshot())
}

async fn passthrough() -> impl IntoResponse {
    "OK (passed edge filter)"
}

/// Binds both listeners and serves until interrupted. Connect info is
/// required on the public listener so the edge filter can see the
/// transport remote address.
pub async fn serve(rt: Arc<Runtime>) -> Result<()> {
    let public_addr = rt.config.public_listen_addr;
    let internal_addr = rt.config.internal_listen_addr;

    let public_listener = TcpListener::bind(public_addr)
        .await
        .map_err(|e| Error::Config(format!("cannot bind public listener {}: {}", public_addr, e)))?;
    let internal_listener = TcpListener::bind(internal_addr).await.map_err(|e| {
        Error::Config(format!(
            "cannot bind internal listener {}: {}",
            internal_addr, e
        ))
    })?;

    info!(public = %public_addr, internal = %internal_addr, "listeners bound");

    let public = axum::serve(
        public_listener,
        public_router(rt.clone()).into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal());
    let internal = axum::serve(
        internal_listener,
        internal_router(rt).into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal());

    let (public_result, internal_result) = tokio::join!(public, internal);
    public_result.map_err(|e| Error::Upstream(format!("public listener failed: {}", e)))?;
    internal_result.map_err(|e| Error::Upstream(format!("internal listener failed: {}", e)))?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
