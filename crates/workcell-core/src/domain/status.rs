use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::device::{
    CentrifugeFault, CentrifugeRun, RobotSystemState, RotorState, SlotState,
};
use crate::types::{DeviceKey, DeviceKind, UnitId};

/// Link state between a driver and its device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Connection {
    /// Transport up, polls succeeding
    Online,
    /// Transport down or polls failing
    Offline,
}

impl Connection {
    /// True when the link is up
    pub fn is_online(&self) -> bool {
        matches!(self, Connection::Online)
    }
}

/// Snapshot of one glass door
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoorStatus {
    /// Door index (1-6)
    pub unit: UnitId,
    /// Link state of the door bus
    pub connection: Connection,
    /// Current position
    pub state: SlotState,
    /// Last command issued to this door, if any
    pub last_command: Option<String>,
    /// When this snapshot was taken
    pub updated_at: DateTime<Utc>,
}

impl DoorStatus {
    /// Snapshot for a door whose bus is down
    pub fn offline(unit: UnitId) -> Self {
        DoorStatus {
            unit,
            connection: Connection::Offline,
            state: SlotState::Fault,
            last_command: None,
            updated_at: Utc::now(),
        }
    }
}

/// Snapshot of one furnace chamber
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChamberStatus {
    /// Chamber index (1-24)
    pub chamber: UnitId,
    /// Link state of the furnace bus
    pub connection: Connection,
    /// Lid position
    pub lid: SlotState,
    /// Heating programme running
    pub program_running: bool,
    /// Programme step number
    pub step: u16,
    /// Process temperature in degrees C
    pub temperature: f64,
    /// Setpoint temperature in degrees C
    pub setpoint: f64,
    /// Programme runtime in minutes
    pub runtime_minutes: u16,
    /// Last command issued to this chamber, if any
    pub last_command: Option<String>,
    /// When this snapshot was taken
    pub updated_at: DateTime<Utc>,
}

impl ChamberStatus {
    /// Snapshot for a chamber whose bus is down
    pub fn offline(chamber: UnitId) -> Self {
        ChamberStatus {
            chamber,
            connection: Connection::Offline,
            lid: SlotState::Fault,
            program_running: false,
            step: 0,
            temperature: 0.0,
            setpoint: 0.0,
            runtime_minutes: 0,
            last_command: None,
            updated_at: Utc::now(),
        }
    }
}

/// Snapshot of the centrifuge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CentrifugeStatus {
    /// Link state of the serial bridge
    pub connection: Connection,
    /// Run register decode
    pub run: CentrifugeRun,
    /// Rotor register decode
    pub rotor: RotorState,
    /// Fault register decode
    pub fault: CentrifugeFault,
    /// Door window position
    pub door: SlotState,
    /// Lid position
    pub lid: SlotState,
    /// Measured speed in rpm
    pub actual_rpm: u16,
    /// Target speed in rpm
    pub set_rpm: u16,
    /// Seconds left in the current spin
    pub remaining_seconds: u16,
    /// Seconds the current spin has run
    pub elapsed_seconds: u16,
    /// Configured spin time in seconds
    pub set_seconds: u16,
    /// Relative centrifugal force at the measured speed
    pub rcf: u16,
    /// Last command issued to the centrifuge, if any
    pub last_command: Option<String>,
    /// When this snapshot was taken
    pub updated_at: DateTime<Utc>,
}

impl CentrifugeStatus {
    /// Snapshot for a centrifuge whose bridge is down
    pub fn offline() -> Self {
        CentrifugeStatus {
            connection: Connection::Offline,
            run: CentrifugeRun::Unknown,
            rotor: RotorState::Indeterminate,
            fault: CentrifugeFault::None,
            door: SlotState::Fault,
            lid: SlotState::Fault,
            actual_rpm: 0,
            set_rpm: 0,
            remaining_seconds: 0,
            elapsed_seconds: 0,
            set_seconds: 0,
            rcf: 0,
            last_command: None,
            updated_at: Utc::now(),
        }
    }

    /// True when the rotor is safely at rest
    pub fn rotor_stationary(&self) -> bool {
        self.run != CentrifugeRun::Running && self.rotor.is_stationary() && self.actual_rpm == 0
    }
}

/// Snapshot of the transfer robot, read through the controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RobotStatus {
    /// Link state of the controller gateway
    pub connection: Connection,
    /// System state word decode
    pub system: RobotSystemState,
    /// Robot is at its home position
    pub at_home: bool,
    /// Gripper is open
    pub gripper_open: bool,
    /// A task block is loaded on the controller
    pub task_present: bool,
    /// Last command issued to the robot, if any
    pub last_command: Option<String>,
    /// When this snapshot was taken
    pub updated_at: DateTime<Utc>,
}

impl RobotStatus {
    /// Snapshot for a robot whose controller gateway is down
    pub fn offline() -> Self {
        RobotStatus {
            connection: Connection::Offline,
            system: RobotSystemState::Offline,
            at_home: false,
            gripper_open: false,
            task_present: false,
            last_command: None,
            updated_at: Utc::now(),
        }
    }

    /// True when the robot can accept a dispatch
    pub fn ready_for_job(&self) -> bool {
        self.connection.is_online() && self.system == RobotSystemState::Idle
    }
}

/// Snapshot of one device, tagged by kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceStatus {
    /// Glass door
    Door(DoorStatus),
    /// Furnace chamber
    Furnace(ChamberStatus),
    /// Centrifuge
    Centrifuge(CentrifugeStatus),
    /// Transfer robot
    Robot(RobotStatus),
}

impl DeviceStatus {
    /// The key of the device this snapshot describes
    pub fn key(&self) -> DeviceKey {
        match self {
            DeviceStatus::Door(s) => DeviceKey::unit(DeviceKind::Door, s.unit.0),
            DeviceStatus::Furnace(s) => DeviceKey::unit(DeviceKind::Furnace, s.chamber.0),
            DeviceStatus::Centrifuge(_) => DeviceKey::of(DeviceKind::Centrifuge),
            DeviceStatus::Robot(_) => DeviceKey::of(DeviceKind::Robot),
        }
    }

    /// Link state of the device
    pub fn connection(&self) -> Connection {
        match self {
            DeviceStatus::Door(s) => s.connection,
            DeviceStatus::Furnace(s) => s.connection,
            DeviceStatus::Centrifuge(s) => s.connection,
            DeviceStatus::Robot(s) => s.connection,
        }
    }

    /// When this snapshot was taken
    pub fn updated_at(&self) -> DateTime<Utc> {
        match self {
            DeviceStatus::Door(s) => s.updated_at,
            DeviceStatus::Furnace(s) => s.updated_at,
            DeviceStatus::Centrifuge(s) => s.updated_at,
            DeviceStatus::Robot(s) => s.updated_at,
        }
    }
}

/// A coherent view across every device in the cell.
///
/// Interlock evaluation reads one of these so every rule in a single
/// decision sees the same instant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CellSnapshot {
    /// Latest snapshot per device key
    pub devices: HashMap<DeviceKey, DeviceStatus>,
}

impl CellSnapshot {
    /// Empty snapshot
    pub fn new() -> Self {
        CellSnapshot {
            devices: HashMap::new(),
        }
    }

    /// Insert or replace one device snapshot
    pub fn put(&mut self, status: DeviceStatus) {
        self.devices.insert(status.key(), status);
    }

    /// Door snapshot, if one has been published
    pub fn door(&self, unit: UnitId) -> Option<&DoorStatus> {
        match self.devices.get(&DeviceKey::unit(DeviceKind::Door, unit.0)) {
            Some(DeviceStatus::Door(s)) => Some(s),
            _ => None,
        }
    }

    /// Chamber snapshot, if one has been published
    pub fn chamber(&self, chamber: UnitId) -> Option<&ChamberStatus> {
        match self
            .devices
            .get(&DeviceKey::unit(DeviceKind::Furnace, chamber.0))
        {
            Some(DeviceStatus::Furnace(s)) => Some(s),
            _ => None,
        }
    }

    /// Centrifuge snapshot, if one has been published
    pub fn centrifuge(&self) -> Option<&CentrifugeStatus> {
        match self.devices.get(&DeviceKey::of(DeviceKind::Centrifuge)) {
            Some(DeviceStatus::Centrifuge(s)) => Some(s),
            _ => None,
        }
    }

    /// Robot snapshot, if one has been published
    pub fn robot(&self) -> Option<&RobotStatus> {
        match self.devices.get(&DeviceKey::of(DeviceKind::Robot)) {
            Some(DeviceStatus::Robot(s)) => Some(s),
            _ => None,
        }
    }

    /// Iterate every door snapshot present
    pub fn doors(&self) -> impl Iterator<Item = &DoorStatus> {
        self.devices.values().filter_map(|s| match s {
            DeviceStatus::Door(d) => Some(d),
            _ => None,
        })
    }

    /// Iterate every chamber snapshot present
    pub fn chambers(&self) -> impl Iterator<Item = &ChamberStatus> {
        self.devices.values().filter_map(|s| match s {
            DeviceStatus::Furnace(c) => Some(c),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_door(unit: u8, state: SlotState) -> DoorStatus {
        DoorStatus {
            unit: UnitId(unit),
            connection: Connection::Online,
            state,
            last_command: None,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_snapshot_accessors() {
        let mut snapshot = CellSnapshot::new();
        snapshot.put(DeviceStatus::Door(sample_door(1, SlotState::Open)));
        snapshot.put(DeviceStatus::Door(sample_door(2, SlotState::Closed)));
        snapshot.put(DeviceStatus::Robot(RobotStatus::offline()));

        assert_eq!(snapshot.door(UnitId(1)).map(|d| d.state), Some(SlotState::Open));
        assert_eq!(snapshot.door(UnitId(2)).map(|d| d.state), Some(SlotState::Closed));
        assert!(snapshot.door(UnitId(3)).is_none());
        assert!(snapshot.chamber(UnitId(1)).is_none());
        assert!(snapshot.centrifuge().is_none());
        assert_eq!(
            snapshot.robot().map(|r| r.connection),
            Some(Connection::Offline)
        );
        assert_eq!(snapshot.doors().count(), 2);
    }

    #[test]
    fn test_put_replaces_by_key() {
        let mut snapshot = CellSnapshot::new();
        snapshot.put(DeviceStatus::Door(sample_door(1, SlotState::Closed)));
        snapshot.put(DeviceStatus::Door(sample_door(1, SlotState::Open)));

        assert_eq!(snapshot.devices.len(), 1);
        assert_eq!(snapshot.door(UnitId(1)).map(|d| d.state), Some(SlotState::Open));
    }

    #[test]
    fn test_rotor_stationary_requires_rest() {
        let mut status = CentrifugeStatus::offline();
        status.connection = Connection::Online;
        status.run = CentrifugeRun::Stopped;
        status.rotor = RotorState::Indeterminate;
        status.actual_rpm = 0;
        assert!(status.rotor_stationary());

        status.actual_rpm = 120;
        assert!(!status.rotor_stationary());

        status.actual_rpm = 0;
        status.rotor = RotorState::Decelerating;
        assert!(!status.rotor_stationary());

        status.rotor = RotorState::Indeterminate;
        status.run = CentrifugeRun::Running;
        assert!(!status.rotor_stationary());
    }

    #[test]
    fn test_robot_ready_for_job() {
        let mut robot = RobotStatus::offline();
        assert!(!robot.ready_for_job());

        robot.connection = Connection::Online;
        robot.system = RobotSystemState::Idle;
        assert!(robot.ready_for_job());

        robot.system = RobotSystemState::Busy;
        assert!(!robot.ready_for_job());
    }

    #[test]
    fn test_device_status_key_and_serde() {
        let status = DeviceStatus::Door(sample_door(4, SlotState::Open));
        assert_eq!(status.key(), DeviceKey::unit(DeviceKind::Door, 4));

        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"kind\":\"door\""));
        let back: DeviceStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, status);
    }
}
