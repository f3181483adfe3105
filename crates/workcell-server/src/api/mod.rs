//! API module for the Workcell server
//!
//! This module contains the API routes and handlers for the Workcell
//! server. All control endpoints live under `/api/v1`; the health check
//! is additionally mounted at the root for probes that expect it there.

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

pub mod devices;
pub mod errors;
pub mod flows;
pub mod health;
pub mod tasks;

use crate::server::WorkcellServer;

/// Build the router for API endpoints
pub fn build_router(server: Arc<WorkcellServer>) -> Router {
    Router::new()
        // Device status and manual commands
        .route(
            "/api/v1/devices/:device/status",
            get(devices::device_status_handler),
        )
        .route(
            "/api/v1/devices/:device/:unit/status",
            get(devices::unit_status_handler),
        )
        .route(
            "/api/v1/devices/:device/command",
            post(devices::device_command_handler),
        )
        .route(
            "/api/v1/devices/:device/:unit/command",
            post(devices::unit_command_handler),
        )
        // Transfer flows
        .route("/api/v1/flows/input", post(flows::start_input_handler))
        .route("/api/v1/flows/output", post(flows::start_output_handler))
        .route("/api/v1/flows", get(flows::list_flows_handler))
        .route("/api/v1/flows/:flow_id", get(flows::get_flow_handler))
        .route(
            "/api/v1/flows/:flow_id/confirm",
            post(flows::confirm_flow_handler),
        )
        .route(
            "/api/v1/flows/:flow_id/pause",
            post(flows::pause_flow_handler),
        )
        .route(
            "/api/v1/flows/:flow_id/resume",
            post(flows::resume_flow_handler),
        )
        .route(
            "/api/v1/flows/:flow_id/cancel",
            post(flows::cancel_flow_handler),
        )
        // Experiment tasks
        .route(
            "/api/v1/tasks",
            post(tasks::upload_task_handler).get(tasks::list_tasks_handler),
        )
        .route("/api/v1/tasks/:task_id", get(tasks::get_task_handler))
        .route(
            "/api/v1/tasks/:task_id/start",
            post(tasks::start_task_handler),
        )
        .route(
            "/api/v1/tasks/:task_id/stop",
            post(tasks::stop_task_handler),
        )
        .route(
            "/api/v1/tasks/:task_id/cancel",
            post(tasks::cancel_task_handler),
        )
        // Aggregate status
        .route("/api/v1/status", get(health::status_handler))
        // Health check
        .route("/api/v1/health", get(health::health_check))
        .route("/health", get(health::health_check))
        // Shared state
        .with_state(server)
}

// Re-export all modules for easier imports
pub use devices::*;
pub use errors::*;
pub use flows::*;
pub use health::*;
pub use tasks::*;
