//!
//! Workcell Devices - hardware drivers for the workcell runtime
//!
//! One driver per device kind, each implementing the core
//! `DeviceController` trait over its own channel: the signal controller
//! gateway for the robot, and request/reply bridges for the doors, the
//! furnace bank, and the centrifuge. The sim module carries in-memory
//! stand-ins for all of them.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Centrifuge driver (Modbus RTU over TCP)
pub mod centrifuge;

/// Glass door driver (paired doors behind one serial bridge)
pub mod door;

/// Furnace bank driver (lids, programmes, telemetry)
pub mod furnace;

/// Signal controller gateway with verified writes
pub mod plc;

/// Background status polling
pub mod poller;

/// Robot driver over the signal controller
pub mod robot;

/// In-memory hardware stand-ins for tests
pub mod sim;

/// Transport traits and TCP implementations
pub mod transport;

// Re-export the drivers and their plumbing
pub use centrifuge::{CentrifugeController, CentrifugeRegisters};
pub use door::DoorController;
pub use furnace::FurnaceController;
pub use plc::{ConnectionState, PlcGateway};
pub use poller::{spawn_poller, spawn_pollers, DEFAULT_POLL_INTERVAL};
pub use robot::RobotController;
pub use sim::{
    SimBusHandle, SimCentrifuge, SimDoorBank, SimFrameBus, SimFurnaceBank, SimPlc, SimPlcHandle,
};
pub use transport::{FrameTransport, PlcTransport, TcpFrameTransport, TcpPlcTransport};
