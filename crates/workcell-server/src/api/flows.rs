//! Transfer flow endpoints
//!
//! Starting a flow claims its devices and returns as soon as the first
//! step is underway; progress is read back through the snapshot
//! endpoints. Lifecycle operations return the refreshed snapshot so a
//! console can render the outcome without a second round trip.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::str::FromStr;
use std::sync::Arc;

use workcell_core::{FlowId, FlowParams, RecoveryMode};

use crate::server::WorkcellServer;

use super::errors;

/// Request to start a shelf-to-furnace transfer
#[derive(Debug, Deserialize)]
pub struct InputFlowRequest {
    /// Shelf station to fetch from
    pub shelf: u16,
    /// Destination chamber (1-24)
    pub chamber: u8,
    /// Pieces on the tray
    pub quantity: u16,
    /// Park at a checkpoint before the first step
    #[serde(default)]
    pub confirm_first: bool,
}

/// Request to start a furnace-to-shelf transfer via the centrifuge
#[derive(Debug, Deserialize)]
pub struct OutputFlowRequest {
    /// Source chamber (1-24)
    pub chamber: u8,
    /// Centrifuge slot to use
    pub slot: u16,
    /// Shelf station to return to
    pub shelf: u16,
    /// Park at a checkpoint before the first step
    #[serde(default)]
    pub confirm_first: bool,
}

/// Request to resume a suspended flow
#[derive(Debug, Deserialize)]
pub struct ResumeRequest {
    /// One of the recovery mode names, e.g. `resume_in_place`
    pub recovery_mode: String,
}

/// Handler for starting an input transfer
pub async fn start_input_handler(
    State(server): State<Arc<WorkcellServer>>,
    Json(request): Json<InputFlowRequest>,
) -> impl IntoResponse {
    let params = FlowParams::Input {
        shelf: request.shelf,
        chamber: request.chamber,
        quantity: request.quantity,
        confirm_first: request.confirm_first,
    };
    match server.start_flow(params).await {
        Ok(flow_id) => (StatusCode::ACCEPTED, Json(json!({ "flow_id": flow_id }))).into_response(),
        Err(err) => errors::api_error_response(&err),
    }
}

/// Handler for starting an output transfer
pub async fn start_output_handler(
    State(server): State<Arc<WorkcellServer>>,
    Json(request): Json<OutputFlowRequest>,
) -> impl IntoResponse {
    let params = FlowParams::Output {
        chamber: request.chamber,
        slot: request.slot,
        shelf: request.shelf,
        confirm_first: request.confirm_first,
    };
    match server.start_flow(params).await {
        Ok(flow_id) => (StatusCode::ACCEPTED, Json(json!({ "flow_id": flow_id }))).into_response(),
        Err(err) => errors::api_error_response(&err),
    }
}

/// Handler for confirming a checkpoint
pub async fn confirm_flow_handler(
    State(server): State<Arc<WorkcellServer>>,
    Path(flow_id): Path<String>,
) -> impl IntoResponse {
    let flow_id = FlowId(flow_id);
    match server.confirm_flow(&flow_id).await {
        Ok(()) => flow_snapshot_response(&server, &flow_id),
        Err(err) => errors::api_error_response(&err),
    }
}

/// Handler for pausing a flow
pub async fn pause_flow_handler(
    State(server): State<Arc<WorkcellServer>>,
    Path(flow_id): Path<String>,
) -> impl IntoResponse {
    let flow_id = FlowId(flow_id);
    match server.pause_flow(&flow_id).await {
        Ok(()) => flow_snapshot_response(&server, &flow_id),
        Err(err) => errors::api_error_response(&err),
    }
}

/// Handler for resuming a suspended flow
pub async fn resume_flow_handler(
    State(server): State<Arc<WorkcellServer>>,
    Path(flow_id): Path<String>,
    Json(request): Json<ResumeRequest>,
) -> impl IntoResponse {
    let mode = match RecoveryMode::from_str(&request.recovery_mode) {
        Ok(mode) => mode,
        Err(err) => return errors::api_error_response(&err.into()),
    };
    let flow_id = FlowId(flow_id);
    match server.resume_flow(&flow_id, mode).await {
        Ok(()) => flow_snapshot_response(&server, &flow_id),
        Err(err) => errors::api_error_response(&err),
    }
}

/// Handler for cancelling a flow
pub async fn cancel_flow_handler(
    State(server): State<Arc<WorkcellServer>>,
    Path(flow_id): Path<String>,
) -> impl IntoResponse {
    let flow_id = FlowId(flow_id);
    match server.cancel_flow(&flow_id).await {
        Ok(()) => flow_snapshot_response(&server, &flow_id),
        Err(err) => errors::api_error_response(&err),
    }
}

/// Handler for reading one flow
pub async fn get_flow_handler(
    State(server): State<Arc<WorkcellServer>>,
    Path(flow_id): Path<String>,
) -> impl IntoResponse {
    flow_snapshot_response(&server, &FlowId(flow_id))
}

/// Handler for listing every known flow
pub async fn list_flows_handler(State(server): State<Arc<WorkcellServer>>) -> impl IntoResponse {
    let mut flows = server.list_flows();
    flows.sort_by_key(|snapshot| snapshot.updated_at);
    (StatusCode::OK, Json(json!({ "flows": flows }))).into_response()
}

fn flow_snapshot_response(server: &WorkcellServer, flow_id: &FlowId) -> axum::response::Response {
    match server.get_flow(flow_id) {
        Ok(snapshot) => (StatusCode::OK, Json(json!(snapshot))).into_response(),
        Err(err) => errors::api_error_response(&err),
    }
}
