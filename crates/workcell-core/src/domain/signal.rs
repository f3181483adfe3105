use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::CoreError;

/// Memory area on the signal controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryArea {
    /// Marker (flag) memory
    Merker,
    /// Numbered data block
    DataBlock(u16),
}

/// Address of one discrete signal on the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignalAddress {
    /// Memory area
    pub area: MemoryArea,
    /// Byte offset within the area
    pub byte: u16,
    /// Bit index for bit signals; `None` for word signals
    pub bit: Option<u8>,
}

impl SignalAddress {
    /// Bit address in marker memory
    pub const fn merker_bit(byte: u16, bit: u8) -> Self {
        SignalAddress {
            area: MemoryArea::Merker,
            byte,
            bit: Some(bit),
        }
    }

    /// Bit address in a data block
    pub const fn db_bit(db: u16, byte: u16, bit: u8) -> Self {
        SignalAddress {
            area: MemoryArea::DataBlock(db),
            byte,
            bit: Some(bit),
        }
    }

    /// Word address in a data block
    pub const fn db_word(db: u16, byte: u16) -> Self {
        SignalAddress {
            area: MemoryArea::DataBlock(db),
            byte,
            bit: None,
        }
    }
}

impl fmt::Display for SignalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let area = match self.area {
            MemoryArea::Merker => "M".to_string(),
            MemoryArea::DataBlock(db) => format!("DB{}.", db),
        };
        match self.bit {
            Some(bit) => write!(f, "{}{}.{}", area, self.byte, bit),
            None => write!(f, "{}{}", area, self.byte),
        }
    }
}

/// Whether the orchestrator may write a signal or only observe it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalDirection {
    /// Written by the controller/robot side only
    ReadOnly,
    /// Writable from the orchestrator
    ReadWrite,
}

/// One catalog entry: a semantic name bound to a controller address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalSpec {
    /// Semantic signal name, e.g. `robot/dispatch`
    pub name: String,
    /// Controller address
    pub address: SignalAddress,
    /// Access direction
    pub direction: SignalDirection,
}

/// Well-known signal names
pub mod signals {
    /// Task dispatch toggle to the robot
    pub const ROBOT_DISPATCH: &str = "robot/dispatch";
    /// Task clear toggle
    pub const ROBOT_CLEAR: &str = "robot/clear";
    /// Glass-door-open permit to the robot
    pub const PERMIT_GLASS_DOOR: &str = "permit/glass-door";
    /// Furnace-lid-open permit
    pub const PERMIT_FURNACE: &str = "permit/furnace";
    /// Centrifuge-door-open permit
    pub const PERMIT_CENTRIFUGE: &str = "permit/centrifuge";
    /// Robot stop
    pub const ROBOT_HALT: &str = "robot/halt";
    /// Robot is at its home position
    pub const ROBOT_AT_HOME: &str = "robot/at-home";
    /// Gripper open
    pub const ROBOT_GRIPPER_OPEN: &str = "robot/gripper-open";
    /// Robot system state word (0 offline, 1 idle, 2 busy, 3 done, 4 fault)
    pub const ROBOT_SYSTEM_STATE: &str = "robot/system-state";
    /// Momentary robot reset
    pub const ROBOT_RESET: &str = "robot/reset";
    /// Robot run/pause toggle bit
    pub const ROBOT_RUN: &str = "robot/run";
    /// Task present word (0 none, 1 present)
    pub const ROBOT_TASK_PRESENT: &str = "robot/task-present";
}

/// Well-known block names
pub mod blocks {
    /// Task parameter block written before a dispatch
    pub const TASK_PARAMS: &str = "task-params";
}

/// Address of a multi-byte block on the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockAddress {
    /// Data block number
    pub db: u16,
    /// Start byte
    pub start: u16,
    /// Length in bytes
    pub len: u16,
}

/// Task parameters handed to the robot through the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskBlock {
    /// Job type code
    pub task_code: u16,
    /// Station number (shelf slot, chamber index, centrifuge slot)
    pub station: u16,
    /// Piece count
    pub quantity: u16,
}

impl TaskBlock {
    /// Encoded length in bytes
    pub const LEN: usize = 6;

    /// Encode as three big-endian words
    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0..2].copy_from_slice(&self.task_code.to_be_bytes());
        out[2..4].copy_from_slice(&self.station.to_be_bytes());
        out[4..6].copy_from_slice(&self.quantity.to_be_bytes());
        out
    }

    /// Decode from three big-endian words
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CoreError> {
        if bytes.len() < Self::LEN {
            return Err(CoreError::ValidationError(format!(
                "task block needs {} bytes, got {}",
                Self::LEN,
                bytes.len()
            )));
        }
        Ok(TaskBlock {
            task_code: u16::from_be_bytes([bytes[0], bytes[1]]),
            station: u16::from_be_bytes([bytes[2], bytes[3]]),
            quantity: u16::from_be_bytes([bytes[4], bytes[5]]),
        })
    }
}

/// The signal catalog: semantic names to controller addresses.
///
/// Drivers refer to signals by name only; the catalog is the single place
/// that knows raw addresses.
#[derive(Debug, Clone)]
pub struct SignalCatalog {
    bits: HashMap<String, SignalSpec>,
    words: HashMap<String, SignalSpec>,
    blocks: HashMap<String, BlockAddress>,
}

impl SignalCatalog {
    /// Empty catalog
    pub fn new() -> Self {
        SignalCatalog {
            bits: HashMap::new(),
            words: HashMap::new(),
            blocks: HashMap::new(),
        }
    }

    /// The cell's standard signal map
    pub fn standard() -> Self {
        let mut catalog = Self::new();
        use SignalDirection::{ReadOnly, ReadWrite};

        catalog.add_bit(signals::ROBOT_DISPATCH, SignalAddress::merker_bit(10, 0), ReadWrite);
        catalog.add_bit(signals::ROBOT_CLEAR, SignalAddress::merker_bit(10, 1), ReadWrite);
        catalog.add_bit(signals::PERMIT_GLASS_DOOR, SignalAddress::merker_bit(10, 2), ReadWrite);
        catalog.add_bit(signals::PERMIT_FURNACE, SignalAddress::merker_bit(10, 3), ReadWrite);
        catalog.add_bit(signals::PERMIT_CENTRIFUGE, SignalAddress::merker_bit(10, 4), ReadWrite);
        catalog.add_bit(signals::ROBOT_HALT, SignalAddress::merker_bit(10, 5), ReadWrite);
        catalog.add_bit(signals::ROBOT_AT_HOME, SignalAddress::db_bit(1, 218, 0), ReadOnly);
        catalog.add_bit(signals::ROBOT_GRIPPER_OPEN, SignalAddress::db_bit(1, 218, 1), ReadOnly);
        catalog.add_word(signals::ROBOT_SYSTEM_STATE, SignalAddress::db_word(1, 242), ReadOnly);
        catalog.add_bit(signals::ROBOT_RESET, SignalAddress::db_bit(2, 18, 0), ReadWrite);
        catalog.add_bit(signals::ROBOT_RUN, SignalAddress::db_bit(2, 18, 4), ReadWrite);
        catalog.add_word(signals::ROBOT_TASK_PRESENT, SignalAddress::db_word(2, 40), ReadOnly);
        catalog.add_block(blocks::TASK_PARAMS, BlockAddress { db: 3, start: 0, len: TaskBlock::LEN as u16 });

        catalog
    }

    /// Register a bit signal
    pub fn add_bit(&mut self, name: &str, address: SignalAddress, direction: SignalDirection) {
        self.bits.insert(
            name.to_string(),
            SignalSpec {
                name: name.to_string(),
                address,
                direction,
            },
        );
    }

    /// Register a word signal
    pub fn add_word(&mut self, name: &str, address: SignalAddress, direction: SignalDirection) {
        self.words.insert(
            name.to_string(),
            SignalSpec {
                name: name.to_string(),
                address,
                direction,
            },
        );
    }

    /// Register a block
    pub fn add_block(&mut self, name: &str, address: BlockAddress) {
        self.blocks.insert(name.to_string(), address);
    }

    /// Look up a bit signal by name
    pub fn bit(&self, name: &str) -> Result<&SignalSpec, CoreError> {
        self.bits
            .get(name)
            .ok_or_else(|| CoreError::UnknownSignal(name.to_string()))
    }

    /// Look up a word signal by name
    pub fn word(&self, name: &str) -> Result<&SignalSpec, CoreError> {
        self.words
            .get(name)
            .ok_or_else(|| CoreError::UnknownSignal(name.to_string()))
    }

    /// Look up a block by name
    pub fn block(&self, name: &str) -> Result<&BlockAddress, CoreError> {
        self.blocks
            .get(name)
            .ok_or_else(|| CoreError::UnknownSignal(name.to_string()))
    }

    /// Require that a signal is writable from the orchestrator
    pub fn writable_bit(&self, name: &str) -> Result<&SignalSpec, CoreError> {
        let spec = self.bit(name)?;
        if spec.direction != SignalDirection::ReadWrite {
            return Err(CoreError::ValidationError(format!(
                "signal {} is read-only",
                name
            )));
        }
        Ok(spec)
    }
}

impl Default for SignalCatalog {
    fn default() -> Self {
        Self::standard()
    }
}
