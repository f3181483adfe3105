use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// Value object: Flow instance ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowId(pub String);

impl FlowId {
    /// Create a fresh random flow ID
    pub fn new() -> Self {
        FlowId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for FlowId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for FlowId {
    fn from(s: &str) -> Self {
        FlowId(s.to_string())
    }
}

/// Value object: Task ID (local coordinator task, not the remote dosing task)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    /// Create a fresh random task ID
    pub fn new() -> Self {
        TaskId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        TaskId(s.to_string())
    }
}

/// Value object: 1-based index of a door, furnace chamber or similar slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitId(pub u8);

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u8> for UnitId {
    fn from(n: u8) -> Self {
        UnitId(n)
    }
}

/// The kinds of physical devices the cell coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// The signal controller itself
    Plc,
    /// The transfer robot (controller-attached)
    Robot,
    /// The centrifuge
    Centrifuge,
    /// The furnace chamber bank
    Furnace,
    /// The glass enclosure doors
    Door,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceKind::Plc => "plc",
            DeviceKind::Robot => "robot",
            DeviceKind::Centrifuge => "centrifuge",
            DeviceKind::Furnace => "furnace",
            DeviceKind::Door => "door",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for DeviceKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plc" => Ok(DeviceKind::Plc),
            "robot" => Ok(DeviceKind::Robot),
            "centrifuge" => Ok(DeviceKind::Centrifuge),
            "furnace" => Ok(DeviceKind::Furnace),
            "door" => Ok(DeviceKind::Door),
            other => Err(CoreError::ValidationError(format!(
                "unknown device kind: {}",
                other
            ))),
        }
    }
}

/// Addresses one device, or one unit of a multi-unit device.
///
/// Serializes as its display form ("centrifuge", "door/3") so it can key
/// JSON maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceKey {
    /// Device kind
    pub kind: DeviceKind,
    /// Unit index for multi-unit devices (doors, chambers)
    pub unit: Option<UnitId>,
}

impl DeviceKey {
    /// Key for a single-instance device
    pub fn of(kind: DeviceKind) -> Self {
        DeviceKey { kind, unit: None }
    }

    /// Key for one unit of a multi-unit device
    pub fn unit(kind: DeviceKind, unit: u8) -> Self {
        DeviceKey {
            kind,
            unit: Some(UnitId(unit)),
        }
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.unit {
            Some(unit) => write!(f, "{}/{}", self.kind, unit),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl FromStr for DeviceKey {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((kind, unit)) => {
                let kind = kind.parse::<DeviceKind>()?;
                let unit = unit.parse::<u8>().map_err(|_| {
                    CoreError::ValidationError(format!("invalid unit in device key: {}", s))
                })?;
                Ok(DeviceKey::unit(kind, unit))
            }
            None => Ok(DeviceKey::of(s.parse::<DeviceKind>()?)),
        }
    }
}

impl Serialize for DeviceKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DeviceKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
