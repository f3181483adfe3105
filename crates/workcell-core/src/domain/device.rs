use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{DeviceKey, DeviceKind, UnitId};

/// Number of glass doors in the enclosure
pub const DOOR_COUNT: u8 = 6;

/// Number of furnace chambers in the bank
pub const CHAMBER_COUNT: u8 = 24;

/// The pair partner of a glass door.
///
/// Doors are mounted in mutually exclusive pairs (1-2, 3-4, 5-6); only one
/// of a pair may be open at a time.
pub fn paired_door(door: UnitId) -> Option<UnitId> {
    if door.0 < 1 || door.0 > DOOR_COUNT {
        return None;
    }
    if door.0 % 2 == 1 {
        Some(UnitId(door.0 + 1))
    } else {
        Some(UnitId(door.0 - 1))
    }
}

/// The glass door guarding a furnace chamber's bay.
///
/// The robot reaches a chamber through exactly one door; the mapping is
/// fixed by the cell's mechanical layout.
pub fn envelope_door(chamber: UnitId) -> Option<UnitId> {
    let door = match chamber.0 {
        1 | 2 | 7 | 8 => 2,
        3..=6 => 1,
        9 | 10 | 15 | 16 => 4,
        11..=14 => 3,
        17 | 18 | 23 | 24 => 6,
        19..=22 => 5,
        _ => return None,
    };
    Some(UnitId(door))
}

/// Motion state of a door, furnace lid, or centrifuge door
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    /// Fully closed
    Closed,
    /// Commanded open, motion in progress
    Opening,
    /// Fully open
    Open,
    /// Commanded closed, motion in progress
    Closing,
    /// Stuck or reported faulted
    Fault,
}

impl SlotState {
    /// True when the slot is at rest in a commanded position
    pub fn is_settled(&self) -> bool {
        matches!(self, SlotState::Closed | SlotState::Open)
    }

    /// True when a motion is in progress
    pub fn is_moving(&self) -> bool {
        matches!(self, SlotState::Opening | SlotState::Closing)
    }
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SlotState::Closed => "closed",
            SlotState::Opening => "opening",
            SlotState::Open => "open",
            SlotState::Closing => "closing",
            SlotState::Fault => "fault",
        };
        write!(f, "{}", s)
    }
}

/// Centrifuge run register decode (0 unknown, 1 stopped, 2 running)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CentrifugeRun {
    /// State not reported
    Unknown,
    /// Rotor commanded stopped
    Stopped,
    /// Spin in progress
    Running,
}

impl CentrifugeRun {
    /// Decode the run register
    pub fn from_register(value: u16) -> Self {
        match value {
            1 => CentrifugeRun::Stopped,
            2 => CentrifugeRun::Running,
            _ => CentrifugeRun::Unknown,
        }
    }
}

/// Centrifuge rotor register decode
/// (0 indeterminate, 1 accelerating, 2 at speed, 3 decelerating, 4 positioning)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotorState {
    /// Not reported
    Indeterminate,
    /// Spinning up
    Accelerating,
    /// Holding set speed
    AtSpeed,
    /// Spinning down
    Decelerating,
    /// Indexing to the load position
    Positioning,
}

impl RotorState {
    /// Decode the rotor register
    pub fn from_register(value: u16) -> Self {
        match value {
            1 => RotorState::Accelerating,
            2 => RotorState::AtSpeed,
            3 => RotorState::Decelerating,
            4 => RotorState::Positioning,
            _ => RotorState::Indeterminate,
        }
    }

    /// True when the rotor is not turning.
    ///
    /// Only `Indeterminate` with run state stopped qualifies; treat every
    /// reported motion phase as turning.
    pub fn is_stationary(&self) -> bool {
        matches!(self, RotorState::Indeterminate)
    }
}

impl fmt::Display for RotorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RotorState::Indeterminate => "indeterminate",
            RotorState::Accelerating => "accelerating",
            RotorState::AtSpeed => "at speed",
            RotorState::Decelerating => "decelerating",
            RotorState::Positioning => "positioning",
        };
        write!(f, "{}", s)
    }
}

/// Centrifuge fault register decode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CentrifugeFault {
    /// System normal
    None,
    /// Rotor imbalance detected
    RotorImbalance,
    /// Servo controller fault
    ServoFault,
    /// Door not closed at spin start
    DoorNotClosed,
    /// Unmapped fault code
    Other(u16),
}

impl CentrifugeFault {
    /// Decode the fault register
    pub fn from_register(value: u16) -> Self {
        match value {
            0 => CentrifugeFault::None,
            1 => CentrifugeFault::RotorImbalance,
            4 => CentrifugeFault::ServoFault,
            5 => CentrifugeFault::DoorNotClosed,
            other => CentrifugeFault::Other(other),
        }
    }

    /// True when a fault is latched
    pub fn is_faulted(&self) -> bool {
        !matches!(self, CentrifugeFault::None)
    }
}

impl fmt::Display for CentrifugeFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CentrifugeFault::None => write!(f, "none"),
            CentrifugeFault::RotorImbalance => write!(f, "rotor imbalance"),
            CentrifugeFault::ServoFault => write!(f, "servo fault"),
            CentrifugeFault::DoorNotClosed => write!(f, "door not closed"),
            CentrifugeFault::Other(code) => write!(f, "fault code {}", code),
        }
    }
}

/// Robot system state word decode
/// (0 offline, 1 idle, 2 busy, 3 done, 4 fault)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RobotSystemState {
    /// Controller reports the robot link down
    Offline,
    /// Ready for a job
    Idle,
    /// Executing a job
    Busy,
    /// Job finished, not yet back to idle
    Done,
    /// Faulted; needs a reset
    Fault,
    /// Unmapped state word
    Other(u16),
}

impl RobotSystemState {
    /// Decode the system state word
    pub fn from_word(value: u16) -> Self {
        match value {
            0 => RobotSystemState::Offline,
            1 => RobotSystemState::Idle,
            2 => RobotSystemState::Busy,
            3 => RobotSystemState::Done,
            4 => RobotSystemState::Fault,
            other => RobotSystemState::Other(other),
        }
    }
}

impl fmt::Display for RobotSystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RobotSystemState::Offline => write!(f, "offline"),
            RobotSystemState::Idle => write!(f, "idle"),
            RobotSystemState::Busy => write!(f, "busy"),
            RobotSystemState::Done => write!(f, "done"),
            RobotSystemState::Fault => write!(f, "fault"),
            RobotSystemState::Other(word) => write!(f, "state {}", word),
        }
    }
}

/// Door commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoorAction {
    /// Open the door
    Open,
    /// Close the door
    Close,
}

/// Furnace lid commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LidAction {
    /// Open the lid
    Open,
    /// Close the lid
    Close,
}

/// Furnace heating programme commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramAction {
    /// Start the loaded programme
    Start,
    /// Stop the programme
    Stop,
    /// Pause the programme
    Pause,
}

/// Centrifuge commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CentrifugeAction {
    /// Start a spin
    Start,
    /// Stop the spin
    Stop,
    /// Open the door window
    OpenDoor,
    /// Close the door window
    CloseDoor,
    /// Set target speed in rpm
    SetSpeed(u16),
    /// Set run time in seconds
    SetRunTime(u16),
}

/// Job targets the robot can be dispatched to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobTarget {
    /// Shelf rack station
    Shelf,
    /// A furnace chamber
    Furnace(UnitId),
    /// The centrifuge
    Centrifuge,
}

/// Robot job type codes as the controller understands them
pub mod task_codes {
    /// Fetch a tray from a shelf station
    pub const SHELF_FETCH: u16 = 1;
    /// Place a tray onto a shelf station
    pub const SHELF_PLACE: u16 = 2;
    /// Place into the centrifuge
    pub const CENTRIFUGE_PLACE: u16 = 3;
    /// Fetch from the centrifuge
    pub const CENTRIFUGE_FETCH: u16 = 4;
    /// Place into a furnace chamber
    pub const FURNACE_PLACE: u16 = 5;
    /// Fetch from a furnace chamber
    pub const FURNACE_FETCH: u16 = 6;
}

/// One transfer job for the robot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RobotJob {
    /// Job type code (see [`task_codes`])
    pub task_code: u16,
    /// Station parameter (shelf slot, chamber index, centrifuge slot)
    pub station: u16,
    /// Piece count parameter
    pub quantity: u16,
    /// Completion additionally requires the robot back at home
    pub require_home: bool,
}

impl RobotJob {
    /// Where this job sends the robot, derived from the task code
    pub fn target(&self) -> Option<JobTarget> {
        match self.task_code {
            task_codes::SHELF_FETCH | task_codes::SHELF_PLACE => Some(JobTarget::Shelf),
            task_codes::CENTRIFUGE_PLACE | task_codes::CENTRIFUGE_FETCH => {
                Some(JobTarget::Centrifuge)
            }
            task_codes::FURNACE_PLACE | task_codes::FURNACE_FETCH => {
                Some(JobTarget::Furnace(UnitId(self.station as u8)))
            }
            _ => None,
        }
    }
}

/// Robot-side permits raised while a passage is held open for it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permit {
    /// A glass door is open for the robot
    GlassDoor,
    /// A furnace lid is open for the robot
    Furnace,
    /// The centrifuge door is open for the robot
    Centrifuge,
}

impl Permit {
    /// The controller signal carrying this permit
    pub fn signal_name(&self) -> &'static str {
        use crate::domain::signal::signals;
        match self {
            Permit::GlassDoor => signals::PERMIT_GLASS_DOOR,
            Permit::Furnace => signals::PERMIT_FURNACE,
            Permit::Centrifuge => signals::PERMIT_CENTRIFUGE,
        }
    }
}

/// Robot commands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RobotAction {
    /// Momentary reset, clears robot alarms
    Reset,
    /// Flip the run/pause bit
    ToggleRun,
    /// Raise the stop signal
    Halt,
    /// Write the task block and dispatch a job
    Dispatch(RobotJob),
    /// Clear any pending task
    ClearTask,
    /// Raise permit signals
    AssertPermits(Vec<Permit>),
    /// Drop permit signals
    ClearPermits(Vec<Permit>),
}

/// A concrete command addressed to one device or unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceCommand {
    /// Glass door command
    Door {
        /// Door index (1-6)
        unit: UnitId,
        /// Open or close
        action: DoorAction,
    },
    /// Furnace lid command
    Lid {
        /// Chamber index (1-24)
        chamber: UnitId,
        /// Open or close
        action: LidAction,
    },
    /// Furnace heating programme command
    Program {
        /// Chamber index (1-24)
        chamber: UnitId,
        /// Start, stop or pause
        action: ProgramAction,
    },
    /// Centrifuge command
    Centrifuge(CentrifugeAction),
    /// Robot command
    Robot(RobotAction),
}

impl DeviceCommand {
    /// The device key this command addresses
    pub fn key(&self) -> DeviceKey {
        match self {
            DeviceCommand::Door { unit, .. } => DeviceKey::unit(DeviceKind::Door, unit.0),
            DeviceCommand::Lid { chamber, .. } | DeviceCommand::Program { chamber, .. } => {
                DeviceKey::unit(DeviceKind::Furnace, chamber.0)
            }
            DeviceCommand::Centrifuge(_) => DeviceKey::of(DeviceKind::Centrifuge),
            DeviceCommand::Robot(_) => DeviceKey::of(DeviceKind::Robot),
        }
    }

    /// Short human-readable description for logs and acknowledgments
    pub fn describe(&self) -> String {
        match self {
            DeviceCommand::Door { unit, action } => format!("door {} {:?}", unit, action),
            DeviceCommand::Lid { chamber, action } => format!("lid {} {:?}", chamber, action),
            DeviceCommand::Program { chamber, action } => {
                format!("chamber {} programme {:?}", chamber, action)
            }
            DeviceCommand::Centrifuge(action) => format!("centrifuge {:?}", action),
            DeviceCommand::Robot(action) => match action {
                RobotAction::Dispatch(job) => format!(
                    "robot dispatch code {} station {} qty {}",
                    job.task_code, job.station, job.quantity
                ),
                other => format!("robot {:?}", other),
            },
        }
    }
}

/// Acknowledgment returned once a command is validated and framed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandAck {
    /// Device the command went to
    pub device: DeviceKey,
    /// Description of the accepted command
    pub action: String,
    /// When it was put on the wire
    pub issued_at: chrono::DateTime<chrono::Utc>,
}

impl CommandAck {
    /// Acknowledge a command now
    pub fn now(command: &DeviceCommand) -> Self {
        CommandAck {
            device: command.key(),
            action: command.describe(),
            issued_at: chrono::Utc::now(),
        }
    }
}
