//! Experiment task endpoints
//!
//! Uploads take a parsed experiment definition; the dosing layout inside
//! it is forwarded to the platform verbatim. Start accepts an optional
//! body so a console can just POST to restart with the defaults.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::str::FromStr;
use std::sync::Arc;

use workcell_core::{ExperimentDefinition, RecoveryMode, TaskId};

use crate::dosing::StartOptions;
use crate::error::ServerError;
use crate::server::WorkcellServer;

use super::errors;

/// Options for starting or restarting a task
#[derive(Debug, Deserialize)]
pub struct StartTaskRequest {
    /// One of the recovery mode names, e.g. `resume_in_place`
    #[serde(default = "default_recovery_mode")]
    pub recovery_mode: String,
    /// Process one tube at a time on the platform
    #[serde(default)]
    pub run_by_single_tube: bool,
    /// Use the platform's quick-cap handling
    #[serde(default = "default_quick_cap")]
    pub quick_cap: bool,
    /// Tip type override, omitted when absent
    pub use_tip_type: Option<String>,
}

fn default_recovery_mode() -> String {
    "resume_in_place".to_string()
}

fn default_quick_cap() -> bool {
    true
}

impl Default for StartTaskRequest {
    fn default() -> Self {
        StartTaskRequest {
            recovery_mode: default_recovery_mode(),
            run_by_single_tube: false,
            quick_cap: default_quick_cap(),
            use_tip_type: None,
        }
    }
}

fn to_options(request: StartTaskRequest) -> Result<StartOptions, ServerError> {
    let recovery = RecoveryMode::from_str(&request.recovery_mode).map_err(ServerError::from)?;
    Ok(StartOptions {
        recovery,
        run_by_single_tube: request.run_by_single_tube,
        quick_cap: request.quick_cap,
        use_tip_type: request.use_tip_type,
    })
}

/// Handler for uploading an experiment
pub async fn upload_task_handler(
    State(server): State<Arc<WorkcellServer>>,
    Json(definition): Json<ExperimentDefinition>,
) -> impl IntoResponse {
    match server.upload_task(definition).await {
        Ok(task) => (StatusCode::CREATED, Json(json!(task))).into_response(),
        Err(err) => errors::api_error_response(&err),
    }
}

/// Handler for starting or restarting a task
pub async fn start_task_handler(
    State(server): State<Arc<WorkcellServer>>,
    Path(task_id): Path<String>,
    request: Option<Json<StartTaskRequest>>,
) -> impl IntoResponse {
    let request = request.map(|Json(body)| body).unwrap_or_default();
    let options = match to_options(request) {
        Ok(options) => options,
        Err(err) => return errors::api_error_response(&err),
    };
    match server.start_task(&TaskId(task_id), options).await {
        Ok(task) => (StatusCode::OK, Json(json!(task))).into_response(),
        Err(err) => errors::api_error_response(&err),
    }
}

/// Handler for stopping a running task
pub async fn stop_task_handler(
    State(server): State<Arc<WorkcellServer>>,
    Path(task_id): Path<String>,
) -> impl IntoResponse {
    match server.stop_task(&TaskId(task_id)).await {
        Ok(task) => (StatusCode::OK, Json(json!(task))).into_response(),
        Err(err) => errors::api_error_response(&err),
    }
}

/// Handler for cancelling a task
pub async fn cancel_task_handler(
    State(server): State<Arc<WorkcellServer>>,
    Path(task_id): Path<String>,
) -> impl IntoResponse {
    match server.cancel_task(&TaskId(task_id)).await {
        Ok(task) => (StatusCode::OK, Json(json!(task))).into_response(),
        Err(err) => errors::api_error_response(&err),
    }
}

/// Handler for reading one task with its flows
pub async fn get_task_handler(
    State(server): State<Arc<WorkcellServer>>,
    Path(task_id): Path<String>,
) -> impl IntoResponse {
    match server.task_view(&TaskId(task_id)) {
        Ok(view) => (StatusCode::OK, Json(json!(view))).into_response(),
        Err(err) => errors::api_error_response(&err),
    }
}

/// Handler for listing every known task
pub async fn list_tasks_handler(State(server): State<Arc<WorkcellServer>>) -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "tasks": server.list_tasks() }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_defaults_match_the_platform_expectations() {
        let options = to_options(StartTaskRequest::default()).unwrap();
        assert_eq!(options.recovery, RecoveryMode::ResumeInPlace);
        assert!(!options.run_by_single_tube);
        assert!(options.quick_cap);
        assert!(options.use_tip_type.is_none());
    }

    #[test]
    fn test_unknown_recovery_mode_is_a_validation_failure() {
        let request = StartTaskRequest {
            recovery_mode: "rewind".to_string(),
            ..StartTaskRequest::default()
        };
        let err = to_options(request).unwrap_err();
        assert!(matches!(
            err,
            ServerError::Core(workcell_core::CoreError::InvalidRecoveryMode(_))
        ));
    }
}
