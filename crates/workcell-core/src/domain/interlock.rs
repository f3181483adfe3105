//! Safety interlocks across the cell.
//!
//! A single pure function over a coherent [`CellSnapshot`] decides whether a
//! command may go on the wire. The policy is stateless: drivers re-evaluate
//! it against a fresh snapshot immediately before issuing, never reusing an
//! earlier decision.

use crate::domain::device::{
    envelope_door, paired_door, CentrifugeAction, DeviceCommand, DoorAction, JobTarget, LidAction,
    ProgramAction, RobotAction, RobotJob, SlotState,
};
use crate::domain::status::CellSnapshot;
use crate::error::CoreError;
use crate::types::UnitId;

use super::device::DOOR_COUNT;

/// Outcome of one policy evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The command may be issued
    Permitted,
    /// The command must not be issued, with the reason
    Denied(String),
}

impl Decision {
    fn deny(reason: impl Into<String>) -> Decision {
        Decision::Denied(reason.into())
    }

    /// True when the command may be issued
    pub fn is_permitted(&self) -> bool {
        matches!(self, Decision::Permitted)
    }

    /// Convert into a driver-layer result
    pub fn into_result(self) -> Result<(), CoreError> {
        match self {
            Decision::Permitted => Ok(()),
            Decision::Denied(reason) => Err(CoreError::InterlockDenied(reason)),
        }
    }
}

/// Evaluate the rule table for one command against one snapshot
pub fn evaluate(snapshot: &CellSnapshot, command: &DeviceCommand) -> Decision {
    match command {
        DeviceCommand::Door { unit, action } => evaluate_door(snapshot, *unit, *action),
        DeviceCommand::Lid { chamber, action } => evaluate_lid(snapshot, *chamber, *action),
        DeviceCommand::Program { chamber, action } => evaluate_program(snapshot, *chamber, *action),
        DeviceCommand::Centrifuge(action) => evaluate_centrifuge(snapshot, *action),
        DeviceCommand::Robot(action) => evaluate_robot(snapshot, action),
    }
}

/// A glass door may not open while its pair partner is not fully closed.
///
/// Unknown partner state counts as not closed: the rule needs the partner
/// verified shut, not merely not-yet-reported.
fn evaluate_door(snapshot: &CellSnapshot, unit: UnitId, action: DoorAction) -> Decision {
    if action == DoorAction::Close {
        return Decision::Permitted;
    }
    let partner = match paired_door(unit) {
        Some(partner) => partner,
        None => return Decision::deny(format!("no such door {}", unit)),
    };
    match snapshot.door(partner) {
        Some(status) if status.state == SlotState::Closed => Decision::Permitted,
        Some(_) => Decision::deny(format!("paired door {} open", partner)),
        None => Decision::deny(format!("paired door {} state unknown", partner)),
    }
}

/// A chamber lid may not open while that chamber's programme is running
fn evaluate_lid(snapshot: &CellSnapshot, chamber: UnitId, action: LidAction) -> Decision {
    if action == LidAction::Close {
        return Decision::Permitted;
    }
    match snapshot.chamber(chamber) {
        Some(status) if status.program_running => {
            Decision::deny(format!("chamber {} programme running", chamber))
        }
        Some(_) => Decision::Permitted,
        None => Decision::deny(format!("chamber {} state unknown", chamber)),
    }
}

/// A chamber programme may not start while the lid is not fully closed
fn evaluate_program(snapshot: &CellSnapshot, chamber: UnitId, action: ProgramAction) -> Decision {
    if action != ProgramAction::Start {
        return Decision::Permitted;
    }
    match snapshot.chamber(chamber) {
        Some(status) if status.lid == SlotState::Closed => Decision::Permitted,
        Some(_) => Decision::deny("lid open"),
        None => Decision::deny(format!("chamber {} state unknown", chamber)),
    }
}

fn evaluate_centrifuge(snapshot: &CellSnapshot, action: CentrifugeAction) -> Decision {
    let status = match snapshot.centrifuge() {
        Some(status) => status,
        None => return Decision::deny("centrifuge state unknown"),
    };
    match action {
        // Start needs the vessel sealed and no latched fault.
        CentrifugeAction::Start => {
            if status.door != SlotState::Closed || status.lid != SlotState::Closed {
                Decision::deny("door open")
            } else if status.fault.is_faulted() {
                Decision::deny(format!("fault latched: {}", status.fault))
            } else {
                Decision::Permitted
            }
        }
        CentrifugeAction::OpenDoor => {
            if status.rotor_stationary() {
                Decision::Permitted
            } else {
                Decision::deny("rotor not stopped")
            }
        }
        // Stopping, closing and parameter writes are always safe.
        CentrifugeAction::Stop
        | CentrifugeAction::CloseDoor
        | CentrifugeAction::SetSpeed(_)
        | CentrifugeAction::SetRunTime(_) => Decision::Permitted,
    }
}

fn evaluate_robot(snapshot: &CellSnapshot, action: &RobotAction) -> Decision {
    match action {
        // Halting is the one action that must never be blocked.
        RobotAction::Halt => Decision::Permitted,
        RobotAction::ClearTask => Decision::Permitted,
        // Permits mark a passage that is deliberately open; gating them on
        // closed doors would contradict the transfer choreography.
        RobotAction::AssertPermits(_) | RobotAction::ClearPermits(_) => Decision::Permitted,
        RobotAction::Reset | RobotAction::ToggleRun => work_envelope_clear(snapshot),
        RobotAction::Dispatch(job) => evaluate_dispatch(snapshot, job),
    }
}

/// Motion-enable actions require every glass door verified shut
fn work_envelope_clear(snapshot: &CellSnapshot) -> Decision {
    for door in 1..=DOOR_COUNT {
        match snapshot.door(UnitId(door)) {
            Some(status) if status.state == SlotState::Closed => {}
            Some(_) => return Decision::deny(format!("door {} not closed", door)),
            None => return Decision::deny(format!("door {} state unknown", door)),
        }
    }
    Decision::Permitted
}

/// Dispatch needs the robot idle plus the target passage already open
fn evaluate_dispatch(snapshot: &CellSnapshot, job: &RobotJob) -> Decision {
    let robot = match snapshot.robot() {
        Some(robot) => robot,
        None => return Decision::deny("robot state unknown"),
    };
    if !robot.connection.is_online() {
        return Decision::deny("robot offline");
    }
    if !robot.ready_for_job() {
        return Decision::deny(format!("robot not idle ({})", robot.system));
    }
    match job.target() {
        None => Decision::deny(format!("unknown task code {}", job.task_code)),
        Some(JobTarget::Shelf) => Decision::Permitted,
        Some(JobTarget::Furnace(chamber)) => {
            let status = match snapshot.chamber(chamber) {
                Some(status) => status,
                None => return Decision::deny(format!("chamber {} state unknown", chamber)),
            };
            if status.lid != SlotState::Open {
                return Decision::deny(format!("chamber {} lid not open", chamber));
            }
            let door = match envelope_door(chamber) {
                Some(door) => door,
                None => return Decision::deny(format!("no door serves chamber {}", chamber)),
            };
            match snapshot.door(door) {
                Some(status) if status.state == SlotState::Open => Decision::Permitted,
                Some(_) => Decision::deny(format!("door {} not open", door)),
                None => Decision::deny(format!("door {} state unknown", door)),
            }
        }
        Some(JobTarget::Centrifuge) => {
            let status = match snapshot.centrifuge() {
                Some(status) => status,
                None => return Decision::deny("centrifuge state unknown"),
            };
            if !status.rotor_stationary() {
                Decision::deny("rotor not stopped")
            } else if status.door != SlotState::Open {
                Decision::deny("centrifuge door not open")
            } else {
                Decision::Permitted
            }
        }
    }
}
