//! Error handling for the Workcell server API
//!
//! This module contains standardized error handling for the API.

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use workcell_core::CoreError;

use crate::error::ServerError;

/// General error response handler for API errors
///
/// Converts a server error into the standardized API error response.
/// Interlock denials and occupancy conflicts map to 409 so a caller can
/// tell "refused for a reason" from "broken"; link problems map to 503
/// and command timeouts to 504.
pub fn api_error_response(err: &ServerError) -> axum::response::Response {
    let err_debug = format!("{:?}", err);

    let (status_code, error_code, error_message) = match err {
        ServerError::Core(core) => match core {
            CoreError::InterlockDenied(reason) => (
                StatusCode::CONFLICT,
                "ERR_INTERLOCK_DENIED",
                format!("Interlock denied: {}", reason),
            ),
            CoreError::DeviceBusy(reason) => (
                StatusCode::CONFLICT,
                "ERR_DEVICE_BUSY",
                format!("Device busy: {}", reason),
            ),
            CoreError::Busy(reason) => {
                (StatusCode::CONFLICT, "ERR_BUSY", format!("Busy: {}", reason))
            }
            CoreError::InvalidTransition(msg) => {
                (StatusCode::CONFLICT, "ERR_INVALID_TRANSITION", msg.clone())
            }
            CoreError::ConfirmationRequired(msg) => (
                StatusCode::CONFLICT,
                "ERR_CONFIRMATION_REQUIRED",
                msg.clone(),
            ),
            CoreError::NotConnected(what) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "ERR_NOT_CONNECTED",
                format!("Not connected: {}", what),
            ),
            CoreError::Timeout(what) => (
                StatusCode::GATEWAY_TIMEOUT,
                "ERR_TIMEOUT",
                format!("Timeout: {}", what),
            ),
            CoreError::RemoteTaskError(code) => (
                StatusCode::BAD_GATEWAY,
                "ERR_REMOTE_TASK_ERROR",
                format!("Dosing platform returned code {}", code),
            ),
            CoreError::FlowNotFound(flow_id) => (
                StatusCode::NOT_FOUND,
                "ERR_NOT_FOUND",
                format!("Flow {} not found", flow_id),
            ),
            CoreError::ValidationError(msg) => {
                (StatusCode::BAD_REQUEST, "ERR_VALIDATION_ERROR", msg.clone())
            }
            CoreError::InvalidRecoveryMode(msg) => (
                StatusCode::BAD_REQUEST,
                "ERR_INVALID_RECOVERY_MODE",
                msg.clone(),
            ),
            other => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "ERR_INTERNAL_SERVER_ERROR",
                format!("{}", other),
            ),
        },
        ServerError::NotFound(_) => (
            StatusCode::NOT_FOUND,
            "ERR_NOT_FOUND",
            format!("{}", err),
        ),
        ServerError::ValidationError(msg) => {
            (StatusCode::BAD_REQUEST, "ERR_VALIDATION_ERROR", msg.clone())
        }
        ServerError::ConfigurationError(msg) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "ERR_CONFIGURATION_ERROR",
            msg.clone(),
        ),
        ServerError::InternalError(msg) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "ERR_INTERNAL_SERVER_ERROR",
            msg.clone(),
        ),
    };

    let error_response = json!({
        "error": error_message,
        "errorDetails": {
            "errorCode": error_code,
            "errorMessage": error_message,
            "details": {
                "debug": err_debug
            }
        }
    });

    (status_code, Json(error_response)).into_response()
}
