//! Tasks pair a remote dosing job with the local transfer flows that move
//! material for it. The dosing platform owns its own task bookkeeping; this
//! module only models the contract the coordinator drives.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::flow::FlowParams;
use crate::error::CoreError;
use crate::types::{FlowId, TaskId};

/// An uploaded experiment, already parsed by the caller.
///
/// The layout entries are forwarded verbatim to the dosing platform; their
/// schema belongs to that equipment, not to us.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentDefinition {
    /// Name shown on both sides
    pub task_name: String,
    /// Dosing layout entries for the platform's `AddTask`
    #[serde(default)]
    pub layout: Vec<serde_json::Value>,
    /// Task template ids on the platform
    #[serde(default)]
    pub template_ids: Vec<i64>,
    /// Physical transfers the cell runs alongside the dosing work
    #[serde(default)]
    pub transfers: Vec<FlowParams>,
}

impl ExperimentDefinition {
    /// Validate the definition before any remote call is made
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.task_name.trim().is_empty() {
            return Err(CoreError::ValidationError(
                "task_name must not be empty".to_string(),
            ));
        }
        if self.layout.is_empty() && self.transfers.is_empty() {
            return Err(CoreError::ValidationError(
                "experiment has neither dosing layout nor transfers".to_string(),
            ));
        }
        for transfer in &self.transfers {
            transfer.validate()?;
        }
        Ok(())
    }
}

/// Lifecycle state of a coordinated task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Accepted locally, nothing submitted yet
    Created,
    /// Registered on the dosing platform
    Submitted,
    /// Remote task started, flows may be live
    Running,
    /// Stopped on the platform, resumable
    Paused,
    /// Both sides finished
    Completed,
    /// Either side reported failure
    Failed,
    /// Cancelled; terminal
    Cancelled,
}

impl TaskState {
    /// True for states that can never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Cancelled)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Created => "created",
            TaskState::Submitted => "submitted",
            TaskState::Running => "running",
            TaskState::Paused => "paused",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Entity: one coordinated task, local id plus remote linkage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Local task id
    pub task_id: TaskId,
    /// Display name (mirrors the remote task name)
    pub name: String,
    /// Lifecycle state
    pub state: TaskState,
    /// Id assigned by the dosing platform after `AddTask`
    pub remote_task_id: Option<i64>,
    /// Workflow id reported by the platform
    pub workflow_id: Option<i64>,
    /// Material shortages reported at submission, forwarded verbatim
    #[serde(default)]
    pub shortage: Vec<serde_json::Value>,
    /// Flows started for this task, in order
    #[serde(default)]
    pub flow_ids: Vec<FlowId>,
    /// Failure message while in `Failed`
    pub error: Option<String>,
    /// When the task was accepted
    pub created_at: DateTime<Utc>,
    /// When the task last changed
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Accept a validated experiment as a new local task
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Task {
            task_id: TaskId::new(),
            name: name.into(),
            state: TaskState::Created,
            remote_task_id: None,
            workflow_id: None,
            shortage: Vec::new(),
            flow_ids: Vec::new(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Record the platform's response to `AddTask`
    pub fn submitted(
        &mut self,
        remote_task_id: i64,
        workflow_id: Option<i64>,
        shortage: Vec<serde_json::Value>,
    ) -> Result<(), CoreError> {
        if self.state != TaskState::Created {
            return Err(CoreError::InvalidTransition(format!(
                "cannot submit task {} in state {}",
                self.task_id, self.state
            )));
        }
        self.remote_task_id = Some(remote_task_id);
        self.workflow_id = workflow_id;
        self.shortage = shortage;
        self.state = TaskState::Submitted;
        self.touch();
        Ok(())
    }

    /// Remote `StartTask` succeeded; also the path for resume-with-recovery
    pub fn started(&mut self) -> Result<(), CoreError> {
        match self.state {
            TaskState::Submitted | TaskState::Paused | TaskState::Failed => {
                self.error = None;
                self.state = TaskState::Running;
                self.touch();
                Ok(())
            }
            other => Err(CoreError::InvalidTransition(format!(
                "cannot start task {} in state {}",
                self.task_id, other
            ))),
        }
    }

    /// Remote `StopTask` succeeded
    pub fn paused(&mut self) -> Result<(), CoreError> {
        if self.state != TaskState::Running {
            return Err(CoreError::InvalidTransition(format!(
                "cannot pause task {} in state {}",
                self.task_id, self.state
            )));
        }
        self.state = TaskState::Paused;
        self.touch();
        Ok(())
    }

    /// Attach a flow started on behalf of this task
    pub fn link_flow(&mut self, flow_id: FlowId) {
        if !self.flow_ids.contains(&flow_id) {
            self.flow_ids.push(flow_id);
            self.touch();
        }
    }

    /// Both sides are done
    pub fn completed(&mut self) -> Result<(), CoreError> {
        if self.state != TaskState::Running {
            return Err(CoreError::InvalidTransition(format!(
                "cannot complete task {} in state {}",
                self.task_id, self.state
            )));
        }
        self.state = TaskState::Completed;
        self.touch();
        Ok(())
    }

    /// Either side reported failure. The task holds in `Failed`; completed
    /// local steps are not rolled back.
    pub fn failed(&mut self, message: impl Into<String>) {
        if self.state.is_terminal() {
            return;
        }
        self.error = Some(message.into());
        self.state = TaskState::Failed;
        self.touch();
    }

    /// Cancel the task. Returns true when this call performed the
    /// transition, so the remote cancel is issued exactly once.
    pub fn cancel(&mut self) -> bool {
        match self.state {
            TaskState::Cancelled | TaskState::Completed => false,
            _ => {
                self.state = TaskState::Cancelled;
                self.touch();
                true
            }
        }
    }
}
