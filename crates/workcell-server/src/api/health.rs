//! Health check endpoint for the Workcell server
//!
//! This module contains the health check handler.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use std::sync::Arc;
use tracing::info;

use workcell_devices::ConnectionState;

use crate::server::WorkcellServer;

/// Health check handler
///
/// Reports the server version and the state of the two outbound
/// dependencies: the signal controller link and the dosing platform.
/// The signal link is read from the gateway cache; only the dosing
/// check goes over the wire.
pub async fn health_check(State(server): State<Arc<WorkcellServer>>) -> impl IntoResponse {
    info!("Health check requested");

    let mut response = json!({
        "status": "UP",
        "version": env!("CARGO_PKG_VERSION"),
        "dependencies": {},
    });

    // Signal controller: Error means the reconnect task is on it.
    let plc_status = match server.plc_state() {
        ConnectionState::Connected => "UP",
        ConnectionState::Connecting | ConnectionState::Error => "DEGRADED",
        ConnectionState::Disconnected => "DOWN",
    };
    response["dependencies"]["signalController"] = json!({
        "status": plc_status,
    });

    let dosing_status = match server.check_dosing_health().await {
        Ok(true) => "UP",
        Ok(false) => "DEGRADED",
        Err(_) => "DOWN",
    };
    response["dependencies"]["dosingPlatform"] = json!({
        "status": dosing_status,
    });

    let overall_status = if plc_status == "DOWN" || dosing_status == "DOWN" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (overall_status, Json(response))
}

/// Aggregate status handler
pub async fn status_handler(State(server): State<Arc<WorkcellServer>>) -> impl IntoResponse {
    (StatusCode::OK, Json(json!(server.aggregate_snapshot())))
}
