//! Dosing platform integration
//!
//! This module contains the dosing platform client and related
//! functionality. The platform owns sample preparation; the server only
//! drives its task lifecycle and moves the prepared material.

use async_trait::async_trait;
use serde_json::Value;
use std::fmt::Debug;

use workcell_core::domain::task::ExperimentDefinition;
use workcell_core::{CoreError, RecoveryMode};

/// Interface for dosing platform operations
#[async_trait]
pub trait DosingPlatform: Send + Sync + Debug {
    /// Register a task on the platform; `remote_id` 0 creates a new one
    async fn add_task(
        &self,
        remote_id: i64,
        definition: &ExperimentDefinition,
    ) -> Result<TaskSubmission, CoreError>;

    /// Start or resume a registered task
    async fn start_task(&self, remote_id: i64, options: &StartOptions) -> Result<(), CoreError>;

    /// Pause a running task
    async fn stop_task(&self, remote_id: i64) -> Result<(), CoreError>;

    /// Cancel a task
    async fn cancel_task(&self, remote_id: i64) -> Result<(), CoreError>;

    /// Detail for one task, or for the platform's current task
    async fn task_info(&self, remote_id: Option<i64>) -> Result<Value, CoreError>;

    /// Reachability of the platform
    async fn health_check(&self) -> Result<bool, CoreError>;
}

/// What the platform assigned when a task was registered
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSubmission {
    /// Platform-side task id
    pub task_id: i64,
    /// Workflow the platform attached the task to, when it reports one
    pub workflow_id: Option<i64>,
    /// Materials the platform flagged as short
    pub shortage: Vec<Value>,
}

/// Options for starting or resuming a task
#[derive(Debug, Clone, PartialEq)]
pub struct StartOptions {
    /// How to treat the unit that was interrupted
    pub recovery: RecoveryMode,
    /// Process one tube at a time
    pub run_by_single_tube: bool,
    /// Cap tubes as soon as they are filled
    pub quick_cap: bool,
    /// Tip type override, platform default when absent
    pub use_tip_type: Option<String>,
}

impl Default for StartOptions {
    fn default() -> Self {
        StartOptions {
            recovery: RecoveryMode::ResumeInPlace,
            run_by_single_tube: false,
            quick_cap: true,
            use_tip_type: None,
        }
    }
}

/// Re-export specific implementations
pub mod http;
