//! HTTP server assembly.
//!
//! One axum router serves both protocol surfaces of an isolate:
//!
//! ```text
//! /
//! ├── /signals/{*signal}   - directed signal receiver (POST)
//! └── {registry_path}/*    - read-only multicast registry (GET)
//! ```
//!
//! Both sub-routers are built here so the full surface is registered in one
//! place; the listener is bound by the caller so tests can use ephemeral
//! ports.

use std::sync::Arc;

use anyhow::Context;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::broadcast::RemoteServiceBroadcaster;
use crate::multicast::registry_router;
use crate::repository::RemoteServiceRepository;
use crate::signals::SignalEnvelope;

/// Builds the complete router for one isolate.
pub fn build_router(
    broadcaster: Arc<RemoteServiceBroadcaster>,
    repository: Arc<RemoteServiceRepository>,
    registry_path: &str,
) -> Router {
    Router::new()
        .nest(registry_path, registry_router(repository))
        .merge(signal_router(broadcaster))
}

/// Signal receiver routes.
///
/// Signal names are slash-separated and arrive as the wildcard remainder;
/// the leading slash is restored before dispatch.
fn signal_router(broadcaster: Arc<RemoteServiceBroadcaster>) -> Router {
    Router::new()
        .route("/signals/{*signal}", post(receive_signal))
        .with_state(broadcaster)
}

async fn receive_signal(
    State(broadcaster): State<Arc<RemoteServiceBroadcaster>>,
    Path(signal): Path<String>,
    Json(envelope): Json<SignalEnvelope>,
) -> Response {
    let signal = format!("/{signal}");
    match broadcaster
        .dispatch_signal(&envelope.sender, &signal, envelope.payload)
        .await
    {
        Some(reply) => Json(reply).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

/// Serves the router until the token is cancelled.
pub async fn serve(
    listener: tokio::net::TcpListener,
    router: Router,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let addr = listener.local_addr().context("listener has no address")?;
    info!(%addr, "http listener ready");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("http listener failed")
}
