//!
//! Workcell Core - domain model and flow engine for the workcell runtime
//!
//! This crate defines the device model, interlock policy, transfer flow
//! state machines, and the engine that drives flows against device
//! controllers. Device drivers and the HTTP surface live in their own
//! crates and depend on this one.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Domain layer - devices, signals, interlocks, flows, tasks
pub mod domain;

/// Application services - controller registry, status board, flow engine
pub mod application;

/// Core identifier types
pub mod types;

/// Error types
pub mod error;

// Re-export key types
pub use error::CoreError;
pub use types::{DeviceKey, DeviceKind, FlowId, TaskId, UnitId};

pub use application::controller::{DeviceController, DeviceRegistry};
pub use application::engine::{EngineConfig, FlowEngine, FlowSnapshot};
pub use application::status_board::{InterlockGate, StatusBoard};

pub use domain::device::{CommandAck, DeviceCommand};
pub use domain::flow::{FlowKind, FlowParams, FlowState, RecoveryMode};
pub use domain::repository::FlowStore;
pub use domain::status::{CellSnapshot, DeviceStatus};
pub use domain::task::{ExperimentDefinition, Task, TaskState};
