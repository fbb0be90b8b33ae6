//! Inbound HTTP handler.

use super::TransportError;
use crate::bus::CloudBus;
use crate::error::BusError;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::future::Future;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Routes of the bus endpoint: `POST <context>/cloudbus` and `GET /health`.
pub fn router(bus: CloudBus) -> Router {
    let path = bus.config().route_path();
    Router::new()
        .route(&path, post(handle_message))
        .route("/health", get(health))
        .with_state(bus)
}

/// Serves the bus endpoint on `listener` until `shutdown` resolves.
pub async fn serve<F>(bus: CloudBus, listener: TcpListener, shutdown: F) -> Result<(), TransportError>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, path = %bus.config().route_path(), "cloud bus http endpoint listening");
    }
    axum::serve(listener, router(bus))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn handle_message(State(bus): State<CloudBus>, body: Bytes) -> Response {
    match bus.accept_wire(&body) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => {
            warn!(error = %e, "rejected inbound message");
            let status = match e {
                BusError::Serialization(_) => StatusCode::BAD_REQUEST,
                BusError::NotRunning => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, e.to_string()).into_response()
        }
    }
}

async fn health(State(bus): State<CloudBus>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": if bus.is_running() { "ok" } else { "stopped" },
        "node_id": bus.node_id(),
    }))
}
