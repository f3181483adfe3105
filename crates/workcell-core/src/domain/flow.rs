//! Transfer flows and their state machines.
//!
//! A flow is an ordered step sequence derived from its parameters at
//! construction time. The [`FlowInstance`] entity owns the lifecycle state
//! and guards every transition; executing the steps against hardware is the
//! flow engine's job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::domain::device::{
    envelope_door, task_codes, DeviceCommand, DoorAction, LidAction, Permit, RobotAction, RobotJob,
    CHAMBER_COUNT,
};
use crate::domain::device::CentrifugeAction;
use crate::error::CoreError;
use crate::types::{DeviceKey, FlowId, UnitId};

/// The two transfer choreographies the cell runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowKind {
    /// Shelf to furnace chamber
    Input,
    /// Furnace chamber through the centrifuge back to a shelf
    Output,
}

impl fmt::Display for FlowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowKind::Input => write!(f, "input"),
            FlowKind::Output => write!(f, "output"),
        }
    }
}

/// Lifecycle state of a flow instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    /// Created, not yet started
    Idle,
    /// Parked at a confirmation checkpoint
    AwaitingConfirmation,
    /// Executing steps
    Running,
    /// Suspended by the operator or a restart
    Paused,
    /// All steps done
    Completed,
    /// Cancelled by the operator; terminal
    Cancelled,
    /// A step failed; held for operator recovery
    Error,
}

impl FlowState {
    /// True for states that can never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(self, FlowState::Completed | FlowState::Cancelled)
    }

    /// True while the flow still holds its device claims
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FlowState::Idle => "idle",
            FlowState::AwaitingConfirmation => "awaiting_confirmation",
            FlowState::Running => "running",
            FlowState::Paused => "paused",
            FlowState::Completed => "completed",
            FlowState::Cancelled => "cancelled",
            FlowState::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// How to pick up a paused or errored flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryMode {
    /// Wait out the current operation without re-issuing it
    ResumeInPlace,
    /// Re-issue the current operation from the top
    RerunCurrentOperation,
    /// Skip the current operation and continue with the next
    SkipCurrentOperation,
    /// Go back to the first operation of the current unit
    RerunCurrentUnit,
    /// Skip everything left in the current unit
    SkipCurrentUnit,
}

impl RecoveryMode {
    /// The dosing platform's `skip_curr_taskunit` code for this mode
    pub fn remote_code(&self) -> u8 {
        match self {
            RecoveryMode::ResumeInPlace => 0,
            RecoveryMode::RerunCurrentOperation => 1,
            RecoveryMode::SkipCurrentOperation => 2,
            RecoveryMode::RerunCurrentUnit => 3,
            RecoveryMode::SkipCurrentUnit => 4,
        }
    }
}

impl FromStr for RecoveryMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "resume_in_place" => Ok(RecoveryMode::ResumeInPlace),
            "rerun_current_operation" => Ok(RecoveryMode::RerunCurrentOperation),
            "skip_current_operation" => Ok(RecoveryMode::SkipCurrentOperation),
            "rerun_current_unit" => Ok(RecoveryMode::RerunCurrentUnit),
            "skip_current_unit" => Ok(RecoveryMode::SkipCurrentUnit),
            other => Err(CoreError::InvalidRecoveryMode(format!(
                "unknown recovery mode: {}",
                other
            ))),
        }
    }
}

/// One physical operation within a flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    /// Open a chamber lid
    OpenLid(UnitId),
    /// Close a chamber lid
    CloseLid(UnitId),
    /// Open a glass door
    OpenDoor(UnitId),
    /// Close a glass door
    CloseDoor(UnitId),
    /// Open the centrifuge door window
    OpenCentrifugeDoor,
    /// Close the centrifuge door window
    CloseCentrifugeDoor,
    /// Raise robot permits for an open passage
    AssertPermits(Vec<Permit>),
    /// Drop robot permits
    ClearPermits(Vec<Permit>),
    /// Dispatch a robot transfer and wait it out
    Transfer(RobotJob),
}

impl StepAction {
    /// The concrete device command this step issues
    pub fn to_command(&self) -> DeviceCommand {
        match self {
            StepAction::OpenLid(chamber) => DeviceCommand::Lid {
                chamber: *chamber,
                action: LidAction::Open,
            },
            StepAction::CloseLid(chamber) => DeviceCommand::Lid {
                chamber: *chamber,
                action: LidAction::Close,
            },
            StepAction::OpenDoor(unit) => DeviceCommand::Door {
                unit: *unit,
                action: DoorAction::Open,
            },
            StepAction::CloseDoor(unit) => DeviceCommand::Door {
                unit: *unit,
                action: DoorAction::Close,
            },
            StepAction::OpenCentrifugeDoor => {
                DeviceCommand::Centrifuge(CentrifugeAction::OpenDoor)
            }
            StepAction::CloseCentrifugeDoor => {
                DeviceCommand::Centrifuge(CentrifugeAction::CloseDoor)
            }
            StepAction::AssertPermits(permits) => {
                DeviceCommand::Robot(RobotAction::AssertPermits(permits.clone()))
            }
            StepAction::ClearPermits(permits) => {
                DeviceCommand::Robot(RobotAction::ClearPermits(permits.clone()))
            }
            StepAction::Transfer(job) => DeviceCommand::Robot(RobotAction::Dispatch(*job)),
        }
    }

    /// The device this step touches
    pub fn device_key(&self) -> DeviceKey {
        self.to_command().key()
    }
}

/// One step of a flow's sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowStep {
    /// Position in the sequence
    pub index: usize,
    /// Unit ordinal for unit-level recovery
    pub unit: u8,
    /// Short operator-facing description
    pub label: &'static str,
    /// What the step does
    pub action: StepAction,
    /// Operator must confirm before this step executes
    pub confirm: bool,
}

/// Parameters a flow was started with.
///
/// The tagged form carries the flow kind, so the durable record stays
/// self-describing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FlowParams {
    /// Shelf to furnace chamber
    Input {
        /// Shelf station to fetch from
        shelf: u16,
        /// Destination chamber (1-24)
        chamber: u8,
        /// Pieces on the tray
        quantity: u16,
        /// Require an operator confirmation before the first step
        #[serde(default)]
        confirm_first: bool,
    },
    /// Furnace chamber through the centrifuge back to a shelf
    Output {
        /// Source chamber (1-24)
        chamber: u8,
        /// Centrifuge slot to use
        slot: u16,
        /// Shelf station to return to
        shelf: u16,
        /// Require an operator confirmation before the first step
        #[serde(default)]
        confirm_first: bool,
    },
}

impl FlowParams {
    /// The flow kind these parameters describe
    pub fn kind(&self) -> FlowKind {
        match self {
            FlowParams::Input { .. } => FlowKind::Input,
            FlowParams::Output { .. } => FlowKind::Output,
        }
    }

    /// Validate ranges against the cell topology
    pub fn validate(&self) -> Result<(), CoreError> {
        let (chamber, extra, extra_name) = match self {
            FlowParams::Input {
                shelf,
                chamber,
                quantity,
                ..
            } => {
                if *shelf == 0 {
                    return Err(CoreError::ValidationError("shelf must be >= 1".to_string()));
                }
                (*chamber, *quantity, "quantity")
            }
            FlowParams::Output {
                chamber,
                slot,
                shelf,
                ..
            } => {
                if *shelf == 0 {
                    return Err(CoreError::ValidationError("shelf must be >= 1".to_string()));
                }
                (*chamber, *slot, "slot")
            }
        };
        if chamber == 0 || chamber > CHAMBER_COUNT {
            return Err(CoreError::ValidationError(format!(
                "chamber must be 1..={}, got {}",
                CHAMBER_COUNT, chamber
            )));
        }
        if extra == 0 {
            return Err(CoreError::ValidationError(format!(
                "{} must be >= 1",
                extra_name
            )));
        }
        Ok(())
    }

    /// Build the step sequence for these parameters
    pub fn build_steps(&self) -> Result<Vec<FlowStep>, CoreError> {
        self.validate()?;
        let steps = match self {
            FlowParams::Input {
                shelf,
                chamber,
                quantity,
                confirm_first,
            } => input_steps(*shelf, UnitId(*chamber), *quantity, *confirm_first)?,
            FlowParams::Output {
                chamber,
                slot,
                shelf,
                confirm_first,
            } => output_steps(UnitId(*chamber), *slot, *shelf, *confirm_first)?,
        };
        Ok(steps)
    }
}

struct StepBuilder {
    steps: Vec<FlowStep>,
}

impl StepBuilder {
    fn new() -> Self {
        StepBuilder { steps: Vec::new() }
    }

    fn push(&mut self, unit: u8, label: &'static str, action: StepAction, confirm: bool) {
        let index = self.steps.len();
        self.steps.push(FlowStep {
            index,
            unit,
            label,
            action,
            confirm,
        });
    }
}

fn door_for(chamber: UnitId) -> Result<UnitId, CoreError> {
    envelope_door(chamber)
        .ok_or_else(|| CoreError::ValidationError(format!("no door serves chamber {}", chamber)))
}

/// Shelf to furnace: fetch the tray, then open the passage, place under
/// permits with a home check, and seal everything back up.
fn input_steps(
    shelf: u16,
    chamber: UnitId,
    quantity: u16,
    confirm_first: bool,
) -> Result<Vec<FlowStep>, CoreError> {
    let door = door_for(chamber)?;
    let mut b = StepBuilder::new();

    b.push(
        0,
        "fetch tray from shelf",
        StepAction::Transfer(RobotJob {
            task_code: task_codes::SHELF_FETCH,
            station: shelf,
            quantity,
            require_home: false,
        }),
        confirm_first,
    );

    b.push(1, "open chamber lid", StepAction::OpenLid(chamber), false);
    b.push(1, "open glass door", StepAction::OpenDoor(door), false);
    b.push(
        1,
        "raise robot permits",
        StepAction::AssertPermits(vec![Permit::GlassDoor, Permit::Furnace]),
        true,
    );
    b.push(
        1,
        "place tray into chamber",
        StepAction::Transfer(RobotJob {
            task_code: task_codes::FURNACE_PLACE,
            station: chamber.0 as u16,
            quantity,
            require_home: true,
        }),
        false,
    );
    b.push(
        1,
        "drop robot permits",
        StepAction::ClearPermits(vec![Permit::GlassDoor, Permit::Furnace]),
        false,
    );
    b.push(1, "close chamber lid", StepAction::CloseLid(chamber), false);
    b.push(1, "close glass door", StepAction::CloseDoor(door), false);

    Ok(b.steps)
}

/// Furnace to centrifuge to shelf: every passage is opened, worked under
/// permits, and sealed again before the next unit starts. The second
/// centrifuge unit re-opens the door because the operator may have closed
/// it for a spin in between.
fn output_steps(
    chamber: UnitId,
    slot: u16,
    shelf: u16,
    confirm_first: bool,
) -> Result<Vec<FlowStep>, CoreError> {
    let door = door_for(chamber)?;
    let mut b = StepBuilder::new();

    b.push(0, "open chamber lid", StepAction::OpenLid(chamber), confirm_first);
    b.push(0, "open glass door", StepAction::OpenDoor(door), false);
    b.push(
        0,
        "raise robot permits",
        StepAction::AssertPermits(vec![Permit::GlassDoor, Permit::Furnace]),
        true,
    );
    b.push(
        0,
        "fetch tray from chamber",
        StepAction::Transfer(RobotJob {
            task_code: task_codes::FURNACE_FETCH,
            station: chamber.0 as u16,
            quantity: slot,
            require_home: true,
        }),
        false,
    );
    b.push(
        0,
        "drop robot permits",
        StepAction::ClearPermits(vec![Permit::GlassDoor, Permit::Furnace]),
        false,
    );
    b.push(0, "close chamber lid", StepAction::CloseLid(chamber), false);
    b.push(0, "close glass door", StepAction::CloseDoor(door), false);

    b.push(1, "open centrifuge door", StepAction::OpenCentrifugeDoor, false);
    b.push(
        1,
        "raise robot permits",
        StepAction::AssertPermits(vec![Permit::Centrifuge]),
        true,
    );
    b.push(
        1,
        "place tray into centrifuge",
        StepAction::Transfer(RobotJob {
            task_code: task_codes::CENTRIFUGE_PLACE,
            station: slot,
            quantity: 1,
            require_home: false,
        }),
        false,
    );
    b.push(
        1,
        "drop robot permits",
        StepAction::ClearPermits(vec![Permit::Centrifuge]),
        false,
    );

    b.push(2, "open centrifuge door", StepAction::OpenCentrifugeDoor, false);
    b.push(
        2,
        "raise robot permits",
        StepAction::AssertPermits(vec![Permit::Centrifuge]),
        true,
    );
    b.push(
        2,
        "fetch tray from centrifuge",
        StepAction::Transfer(RobotJob {
            task_code: task_codes::CENTRIFUGE_FETCH,
            station: slot,
            quantity: 1,
            require_home: false,
        }),
        false,
    );
    b.push(
        2,
        "drop robot permits",
        StepAction::ClearPermits(vec![Permit::Centrifuge]),
        false,
    );
    b.push(2, "close centrifuge door", StepAction::CloseCentrifugeDoor, false);

    b.push(
        3,
        "place tray onto shelf",
        StepAction::Transfer(RobotJob {
            task_code: task_codes::SHELF_PLACE,
            station: shelf,
            quantity: 1,
            require_home: true,
        }),
        false,
    );

    Ok(b.steps)
}

/// The durable record persisted per active flow, enough to rebuild the
/// instance after a restart
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowRecord {
    /// Flow instance id
    pub flow_id: FlowId,
    /// Index of the step the flow was on
    pub current_step: usize,
    /// State at the time of the last save
    pub state: FlowState,
    /// Parameters the flow was started with (carry the kind tag)
    pub params: FlowParams,
}

impl FlowRecord {
    /// The flow kind of this record
    pub fn kind(&self) -> FlowKind {
        self.params.kind()
    }
}

/// Entity: one flow from creation to a terminal state
#[derive(Debug, Clone, PartialEq)]
pub struct FlowInstance {
    /// Flow instance id
    pub flow_id: FlowId,
    /// Parameters the flow was started with
    pub params: FlowParams,
    /// The full step sequence, fixed at construction
    pub steps: Vec<FlowStep>,
    /// Index of the step currently executing or pending
    pub current_step: usize,
    /// Lifecycle state
    pub state: FlowState,
    /// Failure message while in `Error`
    pub error: Option<String>,
    /// When the instance was created
    pub created_at: DateTime<Utc>,
    /// When the instance last changed
    pub updated_at: DateTime<Utc>,
    /// Current step's checkpoint already confirmed
    checkpoint_passed: bool,
}

impl FlowInstance {
    /// Create a new instance in `Idle` with a fresh id
    pub fn new(params: FlowParams) -> Result<Self, CoreError> {
        let steps = params.build_steps()?;
        let now = Utc::now();
        Ok(FlowInstance {
            flow_id: FlowId::new(),
            params,
            steps,
            current_step: 0,
            state: FlowState::Idle,
            error: None,
            created_at: now,
            updated_at: now,
            checkpoint_passed: false,
        })
    }

    /// Rebuild an instance from its durable record.
    ///
    /// Flows that were not already held (`Paused`/`Error`) when the process
    /// died come back `Paused`; nothing resumes without an operator.
    pub fn from_record(record: FlowRecord) -> Result<Self, CoreError> {
        let steps = record.params.build_steps()?;
        if record.current_step > steps.len() {
            return Err(CoreError::ValidationError(format!(
                "flow {} record step {} out of range",
                record.flow_id, record.current_step
            )));
        }
        let state = match record.state {
            FlowState::Idle | FlowState::Running | FlowState::AwaitingConfirmation => {
                FlowState::Paused
            }
            other => other,
        };
        let now = Utc::now();
        Ok(FlowInstance {
            flow_id: record.flow_id,
            params: record.params,
            steps,
            current_step: record.current_step,
            state,
            error: None,
            created_at: now,
            updated_at: now,
            checkpoint_passed: false,
        })
    }

    /// The durable record for this instance
    pub fn record(&self) -> FlowRecord {
        FlowRecord {
            flow_id: self.flow_id.clone(),
            current_step: self.current_step,
            state: self.state,
            params: self.params.clone(),
        }
    }

    /// The flow kind
    pub fn kind(&self) -> FlowKind {
        self.params.kind()
    }

    /// The step currently executing or pending, `None` once past the end
    pub fn current(&self) -> Option<&FlowStep> {
        self.steps.get(self.current_step)
    }

    /// True while parked at a confirmation checkpoint
    pub fn pending_confirmation(&self) -> bool {
        self.state == FlowState::AwaitingConfirmation
    }

    /// Every device this flow will touch, deduplicated
    pub fn device_keys(&self) -> Vec<DeviceKey> {
        let mut keys = Vec::new();
        for step in &self.steps {
            let key = step.action.device_key();
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Set the run state for the current step: `AwaitingConfirmation` if its
    /// checkpoint has not passed, `Completed` past the end, else `Running`.
    fn enter_current_step(&mut self) {
        self.touch();
        match self.steps.get(self.current_step) {
            None => self.state = FlowState::Completed,
            Some(step) if step.confirm && !self.checkpoint_passed => {
                self.state = FlowState::AwaitingConfirmation;
            }
            Some(_) => self.state = FlowState::Running,
        }
    }

    /// Start the flow: `Idle` to `Running`, or `AwaitingConfirmation` when
    /// step 0 carries a checkpoint
    pub fn begin(&mut self) -> Result<(), CoreError> {
        if self.state != FlowState::Idle {
            return Err(CoreError::InvalidTransition(format!(
                "cannot begin flow {} in state {}",
                self.flow_id, self.state
            )));
        }
        self.enter_current_step();
        Ok(())
    }

    /// Pass the pending checkpoint: `AwaitingConfirmation` to `Running`
    pub fn confirm(&mut self) -> Result<(), CoreError> {
        if self.state != FlowState::AwaitingConfirmation {
            return Err(CoreError::InvalidTransition(format!(
                "flow {} is not awaiting confirmation (state {})",
                self.flow_id, self.state
            )));
        }
        self.checkpoint_passed = true;
        self.state = FlowState::Running;
        self.touch();
        Ok(())
    }

    /// Mark the current step done and move to the next
    pub fn complete_step(&mut self) -> Result<(), CoreError> {
        if self.state != FlowState::Running {
            return Err(CoreError::InvalidTransition(format!(
                "cannot complete a step of flow {} in state {}",
                self.flow_id, self.state
            )));
        }
        self.current_step += 1;
        self.checkpoint_passed = false;
        self.enter_current_step();
        Ok(())
    }

    /// Suspend a live flow
    pub fn pause(&mut self) -> Result<(), CoreError> {
        match self.state {
            FlowState::Running | FlowState::AwaitingConfirmation => {
                self.state = FlowState::Paused;
                self.touch();
                Ok(())
            }
            other => Err(CoreError::InvalidTransition(format!(
                "cannot pause flow {} in state {}",
                self.flow_id, other
            ))),
        }
    }

    /// Record a step failure; the flow holds in `Error` for the operator
    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), CoreError> {
        match self.state {
            FlowState::Running | FlowState::AwaitingConfirmation => {
                self.error = Some(message.into());
                self.state = FlowState::Error;
                self.touch();
                Ok(())
            }
            other => Err(CoreError::InvalidTransition(format!(
                "cannot fail flow {} in state {}",
                self.flow_id, other
            ))),
        }
    }

    /// Pick up a `Paused` or `Error` flow with an explicit recovery mode.
    ///
    /// Skip and rerun modes are the only transitions allowed to move
    /// `current_step` backward or jump it forward; the remainder of the
    /// sequence is always preserved.
    pub fn resume(&mut self, mode: RecoveryMode) -> Result<(), CoreError> {
        match self.state {
            FlowState::Paused | FlowState::Error => {}
            other => {
                return Err(CoreError::InvalidTransition(format!(
                    "cannot resume flow {} in state {}",
                    self.flow_id, other
                )))
            }
        }
        self.error = None;
        let current_unit = self.current().map(|step| step.unit);
        match mode {
            RecoveryMode::ResumeInPlace | RecoveryMode::RerunCurrentOperation => {}
            RecoveryMode::SkipCurrentOperation => {
                self.current_step += 1;
                self.checkpoint_passed = false;
            }
            RecoveryMode::RerunCurrentUnit => {
                if let Some(unit) = current_unit {
                    if let Some(first) = self.steps.iter().position(|s| s.unit == unit) {
                        self.current_step = first;
                    }
                    self.checkpoint_passed = false;
                }
            }
            RecoveryMode::SkipCurrentUnit => {
                match current_unit {
                    Some(unit) => {
                        self.current_step = self
                            .steps
                            .iter()
                            .position(|s| s.unit > unit)
                            .unwrap_or(self.steps.len());
                    }
                    None => self.current_step = self.steps.len(),
                }
                self.checkpoint_passed = false;
            }
        }
        self.enter_current_step();
        Ok(())
    }

    /// Cancel the flow. Returns true when this call performed the
    /// transition, so the caller runs the reset sequence exactly once.
    pub fn cancel(&mut self) -> bool {
        match self.state {
            FlowState::Cancelled | FlowState::Completed => false,
            _ => {
                self.state = FlowState::Cancelled;
                self.touch();
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeviceKind;

    fn input_params() -> FlowParams {
        FlowParams::Input {
            shelf: 2,
            chamber: 7,
            quantity: 4,
            confirm_first: false,
        }
    }

    fn output_params() -> FlowParams {
        FlowParams::Output {
            chamber: 12,
            slot: 1,
            shelf: 5,
            confirm_first: false,
        }
    }

    fn running_input() -> FlowInstance {
        let mut flow = FlowInstance::new(input_params()).unwrap();
        flow.begin().unwrap();
        flow
    }

    #[test]
    fn test_input_sequence_shape() {
        let flow = FlowInstance::new(input_params()).unwrap();
        assert_eq!(flow.steps.len(), 8);
        assert_eq!(flow.steps[0].unit, 0);
        assert!(flow.steps[1..].iter().all(|s| s.unit == 1));
        let confirms: Vec<usize> = flow
            .steps
            .iter()
            .filter(|s| s.confirm)
            .map(|s| s.index)
            .collect();
        assert_eq!(confirms, vec![3]);
        assert!(matches!(
            flow.steps[0].action,
            StepAction::Transfer(RobotJob {
                task_code: task_codes::SHELF_FETCH,
                ..
            })
        ));
        // Chamber 7 is served by door 2.
        assert_eq!(flow.steps[2].action, StepAction::OpenDoor(UnitId(2)));
        assert_eq!(flow.steps[7].action, StepAction::CloseDoor(UnitId(2)));

        let keys = flow.device_keys();
        assert!(keys.contains(&DeviceKey::unit(DeviceKind::Furnace, 7)));
        assert!(keys.contains(&DeviceKey::unit(DeviceKind::Door, 2)));
        assert!(keys.contains(&DeviceKey::of(DeviceKind::Robot)));
    }

    #[test]
    fn test_output_sequence_shape() {
        let flow = FlowInstance::new(output_params()).unwrap();
        assert_eq!(flow.steps.len(), 17);
        let units: Vec<u8> = flow.steps.iter().map(|s| s.unit).collect();
        assert_eq!(
            units,
            vec![0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2, 2, 3]
        );
        let confirms: Vec<usize> = flow
            .steps
            .iter()
            .filter(|s| s.confirm)
            .map(|s| s.index)
            .collect();
        assert_eq!(confirms, vec![2, 8, 12]);
        // The second centrifuge unit re-opens the door.
        assert_eq!(flow.steps[11].action, StepAction::OpenCentrifugeDoor);
        assert_eq!(flow.steps[15].action, StepAction::CloseCentrifugeDoor);
        assert!(matches!(
            flow.steps[16].action,
            StepAction::Transfer(RobotJob {
                task_code: task_codes::SHELF_PLACE,
                require_home: true,
                ..
            })
        ));
    }

    #[test]
    fn test_begin_runs_directly_without_step_zero_checkpoint() {
        let mut flow = FlowInstance::new(input_params()).unwrap();
        assert_eq!(flow.state, FlowState::Idle);
        flow.begin().unwrap();
        assert_eq!(flow.state, FlowState::Running);
        assert_eq!(flow.current_step, 0);
    }

    #[test]
    fn test_begin_awaits_confirmation_when_step_zero_requires_it() {
        let mut flow = FlowInstance::new(FlowParams::Input {
            shelf: 1,
            chamber: 3,
            quantity: 1,
            confirm_first: true,
        })
        .unwrap();
        flow.begin().unwrap();
        assert_eq!(flow.state, FlowState::AwaitingConfirmation);
        assert!(flow.pending_confirmation());

        flow.confirm().unwrap();
        assert_eq!(flow.state, FlowState::Running);
        assert_eq!(flow.current_step, 0);
    }

    #[test]
    fn test_begin_twice_is_invalid() {
        let mut flow = running_input();
        let err = flow.begin().unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition(_)));
    }

    #[test]
    fn test_steps_advance_and_park_at_checkpoint() {
        let mut flow = running_input();
        for expected in 1..=3 {
            flow.complete_step().unwrap();
            assert_eq!(flow.current_step, expected);
        }
        // Step 3 is the permit checkpoint.
        assert_eq!(flow.state, FlowState::AwaitingConfirmation);
        let err = flow.complete_step().unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition(_)));

        flow.confirm().unwrap();
        assert_eq!(flow.state, FlowState::Running);
        for expected in 4..=7 {
            assert_eq!(flow.current_step, expected);
            flow.complete_step().unwrap();
        }
        assert_eq!(flow.state, FlowState::Completed);
        assert!(flow.current().is_none());
    }

    #[test]
    fn test_pause_resume_in_place_keeps_step() {
        let mut flow = running_input();
        flow.complete_step().unwrap();
        flow.pause().unwrap();
        assert_eq!(flow.state, FlowState::Paused);

        flow.resume(RecoveryMode::ResumeInPlace).unwrap();
        assert_eq!(flow.state, FlowState::Running);
        assert_eq!(flow.current_step, 1);
    }

    #[test]
    fn test_resume_returns_to_checkpoint_when_not_confirmed() {
        let mut flow = running_input();
        for _ in 0..3 {
            flow.complete_step().unwrap();
        }
        assert_eq!(flow.state, FlowState::AwaitingConfirmation);
        flow.pause().unwrap();

        flow.resume(RecoveryMode::ResumeInPlace).unwrap();
        assert_eq!(flow.state, FlowState::AwaitingConfirmation);
        assert_eq!(flow.current_step, 3);
    }

    #[test]
    fn test_rerun_current_unit_moves_back_to_unit_start() {
        let mut flow = running_input();
        for _ in 0..3 {
            flow.complete_step().unwrap();
        }
        flow.confirm().unwrap();
        flow.complete_step().unwrap();
        assert_eq!(flow.current_step, 4);
        flow.pause().unwrap();

        flow.resume(RecoveryMode::RerunCurrentUnit).unwrap();
        // Unit 1 starts at step 1; its checkpoint must be re-confirmed on
        // the way through.
        assert_eq!(flow.current_step, 1);
        assert_eq!(flow.state, FlowState::Running);
    }

    #[test]
    fn test_skip_current_unit_jumps_past_the_unit() {
        let mut output = FlowInstance::new(output_params()).unwrap();
        output.begin().unwrap();
        output.complete_step().unwrap();
        assert_eq!(output.current_step, 1);
        output.pause().unwrap();

        output.resume(RecoveryMode::SkipCurrentUnit).unwrap();
        assert_eq!(output.current_step, 7);
        assert_eq!(output.state, FlowState::Running);

        // Skipping the last unit completes the flow.
        let mut input = running_input();
        input.complete_step().unwrap();
        input.pause().unwrap();
        input.resume(RecoveryMode::SkipCurrentUnit).unwrap();
        assert_eq!(input.state, FlowState::Completed);
    }

    #[test]
    fn test_skip_current_operation_advances_one_step() {
        let mut flow = running_input();
        flow.pause().unwrap();
        flow.resume(RecoveryMode::SkipCurrentOperation).unwrap();
        assert_eq!(flow.current_step, 1);
        assert_eq!(flow.state, FlowState::Running);
    }

    #[test]
    fn test_fail_holds_error_until_recovery() {
        let mut flow = running_input();
        flow.fail("robot reported fault").unwrap();
        assert_eq!(flow.state, FlowState::Error);
        assert_eq!(flow.error.as_deref(), Some("robot reported fault"));

        flow.resume(RecoveryMode::RerunCurrentOperation).unwrap();
        assert_eq!(flow.state, FlowState::Running);
        assert_eq!(flow.current_step, 0);
        assert!(flow.error.is_none());
    }

    #[test]
    fn test_resume_requires_paused_or_error() {
        let mut flow = running_input();
        let err = flow.resume(RecoveryMode::ResumeInPlace).unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition(_)));
    }

    #[test]
    fn test_cancel_reports_first_transition_only() {
        let mut flow = running_input();
        assert!(flow.cancel());
        assert_eq!(flow.state, FlowState::Cancelled);
        assert!(!flow.cancel());

        let mut done = running_input();
        while done.state == FlowState::Running || done.state == FlowState::AwaitingConfirmation {
            if done.state == FlowState::AwaitingConfirmation {
                done.confirm().unwrap();
            } else {
                done.complete_step().unwrap();
            }
        }
        assert_eq!(done.state, FlowState::Completed);
        assert!(!done.cancel());
        assert_eq!(done.state, FlowState::Completed);
    }

    #[test]
    fn test_record_restores_live_flows_as_paused() {
        let mut flow = running_input();
        flow.complete_step().unwrap();
        flow.complete_step().unwrap();
        let record = flow.record();
        assert_eq!(record.state, FlowState::Running);
        assert_eq!(record.kind(), FlowKind::Input);

        let restored = FlowInstance::from_record(record).unwrap();
        assert_eq!(restored.state, FlowState::Paused);
        assert_eq!(restored.current_step, 2);
        assert_eq!(restored.steps.len(), 8);
        assert_eq!(restored.flow_id, flow.flow_id);
    }

    #[test]
    fn test_record_serde_roundtrip() {
        let flow = FlowInstance::new(output_params()).unwrap();
        let record = flow.record();
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"kind\":\"output\""));
        let back: FlowRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_record_with_out_of_range_step_is_rejected() {
        let record = FlowRecord {
            flow_id: FlowId::new(),
            current_step: 99,
            state: FlowState::Running,
            params: input_params(),
        };
        let err = FlowInstance::from_record(record).unwrap_err();
        assert!(matches!(err, CoreError::ValidationError(_)));
    }

    #[test]
    fn test_params_validation() {
        let bad_chamber = FlowParams::Input {
            shelf: 1,
            chamber: 25,
            quantity: 1,
            confirm_first: false,
        };
        assert!(matches!(
            bad_chamber.validate(),
            Err(CoreError::ValidationError(_))
        ));

        let zero_quantity = FlowParams::Input {
            shelf: 1,
            chamber: 1,
            quantity: 0,
            confirm_first: false,
        };
        assert!(zero_quantity.validate().is_err());

        let zero_slot = FlowParams::Output {
            chamber: 1,
            slot: 0,
            shelf: 1,
            confirm_first: false,
        };
        assert!(zero_slot.validate().is_err());
    }

    #[test]
    fn test_recovery_mode_remote_codes() {
        assert_eq!(RecoveryMode::ResumeInPlace.remote_code(), 0);
        assert_eq!(RecoveryMode::RerunCurrentOperation.remote_code(), 1);
        assert_eq!(RecoveryMode::SkipCurrentOperation.remote_code(), 2);
        assert_eq!(RecoveryMode::RerunCurrentUnit.remote_code(), 3);
        assert_eq!(RecoveryMode::SkipCurrentUnit.remote_code(), 4);
    }

    #[test]
    fn test_recovery_mode_parse() {
        assert_eq!(
            "skip_current_unit".parse::<RecoveryMode>().unwrap(),
            RecoveryMode::SkipCurrentUnit
        );
        let err = "sideways".parse::<RecoveryMode>().unwrap_err();
        assert!(matches!(err, CoreError::InvalidRecoveryMode(_)));
    }
}
