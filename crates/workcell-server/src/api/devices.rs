//! Device status and manual command endpoints
//!
//! Manual commands go through the same controllers as flow steps, so the
//! interlock policy applies to an operator exactly as it does to the
//! engine. Status reads come from the board cache and never touch the
//! hardware.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::str::FromStr;
use std::sync::Arc;

use workcell_core::domain::device::{
    CentrifugeAction, DoorAction, LidAction, Permit, ProgramAction, RobotAction, RobotJob,
};
use workcell_core::{DeviceCommand, DeviceKind, UnitId};

use crate::error::ServerError;
use crate::server::WorkcellServer;

use super::errors;

/// Manual command body: an action name plus its parameters.
///
/// Which parameters matter depends on the action; unused ones are
/// ignored so a console can send a uniform shape.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandRequest {
    /// Device specific action name
    pub action: String,
    /// Target speed for `set_speed`
    pub rpm: Option<u16>,
    /// Run time for `set_run_time`
    pub seconds: Option<u16>,
    /// Robot job type code for `dispatch`
    pub task_code: Option<u16>,
    /// Robot station parameter for `dispatch`
    pub station: Option<u16>,
    /// Robot piece count for `dispatch`
    pub quantity: Option<u16>,
    /// Permits for `assert_permits` and `clear_permits`
    pub permits: Option<Vec<Permit>>,
}

/// Handler for a whole-device status read
pub async fn device_status_handler(
    State(server): State<Arc<WorkcellServer>>,
    Path(device): Path<String>,
) -> impl IntoResponse {
    let kind = match parse_kind(&device) {
        Ok(kind) => kind,
        Err(err) => return errors::api_error_response(&err),
    };
    let snapshot = server.cell_snapshot();
    let body = match kind {
        DeviceKind::Door => {
            let mut doors: Vec<_> = snapshot.doors().collect();
            doors.sort_by_key(|door| door.unit);
            json!({ "doors": doors })
        }
        DeviceKind::Furnace => {
            let mut chambers: Vec<_> = snapshot.chambers().collect();
            chambers.sort_by_key(|chamber| chamber.chamber);
            json!({ "chambers": chambers })
        }
        DeviceKind::Centrifuge => json!({ "centrifuge": snapshot.centrifuge() }),
        DeviceKind::Robot => json!({ "robot": snapshot.robot() }),
        DeviceKind::Plc => json!({ "plc": server.plc_state() }),
    };
    (StatusCode::OK, Json(body)).into_response()
}

/// Handler for a single-unit status read
pub async fn unit_status_handler(
    State(server): State<Arc<WorkcellServer>>,
    Path((device, unit)): Path<(String, u8)>,
) -> impl IntoResponse {
    let kind = match parse_kind(&device) {
        Ok(kind) => kind,
        Err(err) => return errors::api_error_response(&err),
    };
    let snapshot = server.cell_snapshot();
    match kind {
        DeviceKind::Door => match snapshot.door(UnitId(unit)) {
            Some(status) => (StatusCode::OK, Json(json!(status))).into_response(),
            None => errors::api_error_response(&ServerError::NotFound(format!("door {}", unit))),
        },
        DeviceKind::Furnace => match snapshot.chamber(UnitId(unit)) {
            Some(status) => (StatusCode::OK, Json(json!(status))).into_response(),
            None => {
                errors::api_error_response(&ServerError::NotFound(format!("chamber {}", unit)))
            }
        },
        other => errors::api_error_response(&ServerError::ValidationError(format!(
            "device {} has no units",
            other
        ))),
    }
}

/// Handler for a command addressed to one unit
pub async fn unit_command_handler(
    State(server): State<Arc<WorkcellServer>>,
    Path((device, unit)): Path<(String, u8)>,
    Json(request): Json<CommandRequest>,
) -> impl IntoResponse {
    dispatch_command(&server, &device, Some(unit), &request).await
}

/// Handler for a command addressed to a unit-less device
pub async fn device_command_handler(
    State(server): State<Arc<WorkcellServer>>,
    Path(device): Path<String>,
    Json(request): Json<CommandRequest>,
) -> impl IntoResponse {
    dispatch_command(&server, &device, None, &request).await
}

async fn dispatch_command(
    server: &WorkcellServer,
    device: &str,
    unit: Option<u8>,
    request: &CommandRequest,
) -> axum::response::Response {
    let command = match parse_kind(device).and_then(|kind| to_command(kind, unit, request)) {
        Ok(command) => command,
        Err(err) => return errors::api_error_response(&err),
    };
    match server.execute_device_command(command).await {
        Ok(ack) => (StatusCode::ACCEPTED, Json(json!({ "accepted": ack }))).into_response(),
        Err(err) => errors::api_error_response(&err),
    }
}

fn parse_kind(device: &str) -> Result<DeviceKind, ServerError> {
    DeviceKind::from_str(device).map_err(ServerError::from)
}

/// Translate an action name plus parameters into a concrete command
fn to_command(
    kind: DeviceKind,
    unit: Option<u8>,
    request: &CommandRequest,
) -> Result<DeviceCommand, ServerError> {
    let command = match kind {
        DeviceKind::Door => {
            let unit = UnitId(require_unit(kind, unit)?);
            let action = match request.action.as_str() {
                "open" => DoorAction::Open,
                "close" => DoorAction::Close,
                other => return Err(unknown_action(kind, other)),
            };
            DeviceCommand::Door { unit, action }
        }
        DeviceKind::Furnace => {
            let chamber = UnitId(require_unit(kind, unit)?);
            match request.action.as_str() {
                "open_lid" => DeviceCommand::Lid {
                    chamber,
                    action: LidAction::Open,
                },
                "close_lid" => DeviceCommand::Lid {
                    chamber,
                    action: LidAction::Close,
                },
                "start" => DeviceCommand::Program {
                    chamber,
                    action: ProgramAction::Start,
                },
                "stop" => DeviceCommand::Program {
                    chamber,
                    action: ProgramAction::Stop,
                },
                "pause" => DeviceCommand::Program {
                    chamber,
                    action: ProgramAction::Pause,
                },
                other => return Err(unknown_action(kind, other)),
            }
        }
        DeviceKind::Centrifuge => {
            let action = match request.action.as_str() {
                "start" => CentrifugeAction::Start,
                "stop" => CentrifugeAction::Stop,
                "open_door" => CentrifugeAction::OpenDoor,
                "close_door" => CentrifugeAction::CloseDoor,
                "set_speed" => CentrifugeAction::SetSpeed(require_field(request.rpm, "rpm")?),
                "set_run_time" => {
                    CentrifugeAction::SetRunTime(require_field(request.seconds, "seconds")?)
                }
                other => return Err(unknown_action(kind, other)),
            };
            DeviceCommand::Centrifuge(action)
        }
        DeviceKind::Robot => {
            let action = match request.action.as_str() {
                "reset" => RobotAction::Reset,
                "toggle_run" => RobotAction::ToggleRun,
                "halt" => RobotAction::Halt,
                "clear_task" => RobotAction::ClearTask,
                "dispatch" => RobotAction::Dispatch(RobotJob {
                    task_code: require_field(request.task_code, "task_code")?,
                    station: require_field(request.station, "station")?,
                    quantity: request.quantity.unwrap_or(0),
                    require_home: true,
                }),
                "assert_permits" => {
                    RobotAction::AssertPermits(require_field(request.permits.clone(), "permits")?)
                }
                "clear_permits" => {
                    RobotAction::ClearPermits(require_field(request.permits.clone(), "permits")?)
                }
                other => return Err(unknown_action(kind, other)),
            };
            DeviceCommand::Robot(action)
        }
        DeviceKind::Plc => {
            return Err(ServerError::ValidationError(
                "the signal controller takes no manual commands".to_string(),
            ));
        }
    };
    Ok(command)
}

fn require_unit(kind: DeviceKind, unit: Option<u8>) -> Result<u8, ServerError> {
    unit.ok_or_else(|| ServerError::ValidationError(format!("{} commands need a unit", kind)))
}

fn require_field<T>(value: Option<T>, name: &str) -> Result<T, ServerError> {
    value.ok_or_else(|| ServerError::ValidationError(format!("missing field: {}", name)))
}

fn unknown_action(kind: DeviceKind, action: &str) -> ServerError {
    ServerError::ValidationError(format!("unknown {} action: {}", kind, action))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(action: &str) -> CommandRequest {
        CommandRequest {
            action: action.to_string(),
            rpm: None,
            seconds: None,
            task_code: None,
            station: None,
            quantity: None,
            permits: None,
        }
    }

    #[test]
    fn test_door_actions_map_to_commands() {
        let command = to_command(DeviceKind::Door, Some(3), &request("open")).unwrap();
        assert_eq!(
            command,
            DeviceCommand::Door {
                unit: UnitId(3),
                action: DoorAction::Open
            }
        );
    }

    #[test]
    fn test_door_command_without_unit_is_rejected() {
        let err = to_command(DeviceKind::Door, None, &request("open")).unwrap_err();
        assert!(matches!(err, ServerError::ValidationError(_)));
    }

    #[test]
    fn test_set_speed_requires_rpm() {
        let err = to_command(DeviceKind::Centrifuge, None, &request("set_speed")).unwrap_err();
        assert!(matches!(err, ServerError::ValidationError(_)));

        let mut with_rpm = request("set_speed");
        with_rpm.rpm = Some(4500);
        let command = to_command(DeviceKind::Centrifuge, None, &with_rpm).unwrap();
        assert_eq!(
            command,
            DeviceCommand::Centrifuge(CentrifugeAction::SetSpeed(4500))
        );
    }

    #[test]
    fn test_dispatch_builds_a_home_bound_job() {
        let mut dispatch = request("dispatch");
        dispatch.task_code = Some(1);
        dispatch.station = Some(3);
        dispatch.quantity = Some(4);
        let command = to_command(DeviceKind::Robot, None, &dispatch).unwrap();
        match command {
            DeviceCommand::Robot(RobotAction::Dispatch(job)) => {
                assert_eq!(job.task_code, 1);
                assert_eq!(job.station, 3);
                assert_eq!(job.quantity, 4);
                assert!(job.require_home);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_action_is_rejected() {
        let err = to_command(DeviceKind::Robot, None, &request("levitate")).unwrap_err();
        assert!(matches!(err, ServerError::ValidationError(_)));
    }
}
