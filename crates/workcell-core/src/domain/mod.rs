//! Domain model of the work cell.
//!
//! Everything here is hardware-free: signal addresses, device state
//! vocabulary, the safety policy, flow and task entities, and the
//! persistence boundary. Drivers and transports live in the devices crate.

/// Device vocabulary: states, actions, commands, cell geometry
pub mod device;

/// Transfer flows and their state machines
pub mod flow;

/// Safety interlock policy
pub mod interlock;

/// Repository interfaces
pub mod repository;

/// Signal catalog for the robot cell controller
pub mod signal;

/// Last-known device status model
pub mod status;

/// Experiment tasks tying dosing jobs to transfer flows
pub mod task;
