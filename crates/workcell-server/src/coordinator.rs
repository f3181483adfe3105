//! Experiment task coordination
//!
//! A task couples a dosing platform job with the robot transfers that move
//! its material through the cell. The coordinator owns that mapping: it
//! registers experiments remotely, starts and stops both sides together,
//! and walks each task's transfers one at a time. Transfers share the
//! robot, so they never overlap; the next one starts only after the
//! previous flow has completed.

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use workcell_core::{
    CoreError, ExperimentDefinition, FlowEngine, FlowSnapshot, FlowState, Task, TaskId, TaskState,
};

use crate::dosing::{DosingPlatform, StartOptions};
use crate::error::{ServerError, ServerResult};

/// How often a task driver re-examines its flows
const DRIVE_INTERVAL: Duration = Duration::from_millis(500);

/// One task with everything an operator needs to judge it
#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    /// The task itself
    #[serde(flatten)]
    pub task: Task,
    /// Snapshots of the transfers started for it, in order
    pub flows: Vec<FlowSnapshot>,
    /// The platform's last reported detail, when one was fetched
    pub remote: Option<Value>,
}

/// Coordinates experiment tasks across the dosing platform and the cell
#[derive(Clone)]
pub struct TaskCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    dosing: Arc<dyn DosingPlatform>,
    engine: Arc<FlowEngine>,
    tasks: DashMap<TaskId, Task>,
    definitions: DashMap<TaskId, ExperimentDefinition>,
    remote_detail: DashMap<TaskId, Value>,
}

impl TaskCoordinator {
    /// Coordinator over the given platform client and flow engine
    pub fn new(dosing: Arc<dyn DosingPlatform>, engine: Arc<FlowEngine>) -> Self {
        TaskCoordinator {
            inner: Arc::new(Inner {
                dosing,
                engine,
                tasks: DashMap::new(),
                definitions: DashMap::new(),
                remote_detail: DashMap::new(),
            }),
        }
    }

    /// Validate a definition and register it, remotely first.
    ///
    /// When the platform refuses the task nothing is recorded locally, so
    /// a failed upload leaves no trace to clean up.
    pub async fn upload(&self, definition: ExperimentDefinition) -> ServerResult<Task> {
        definition.validate()?;
        let submission = self.inner.dosing.add_task(0, &definition).await?;

        let mut task = Task::new(&definition.task_name);
        task.submitted(
            submission.task_id,
            submission.workflow_id,
            submission.shortage,
        )?;
        info!(
            task_id = %task.task_id,
            remote_task_id = submission.task_id,
            transfers = definition.transfers.len(),
            "experiment registered"
        );
        self.inner
            .definitions
            .insert(task.task_id.clone(), definition);
        self.inner.tasks.insert(task.task_id.clone(), task.clone());
        Ok(task)
    }

    /// Start or resume a task on both sides.
    ///
    /// The platform hears `StartTask` with the chosen recovery code, then
    /// suspended transfers pick the same mode back up, and only then does
    /// the task itself go `Running` so its driver acts on a settled cell.
    pub async fn start(&self, task_id: &TaskId, options: StartOptions) -> ServerResult<Task> {
        let (remote_id, first_start, flow_ids) = {
            let task = self.get_task(task_id)?;
            match task.state {
                TaskState::Submitted | TaskState::Paused | TaskState::Failed => {}
                other => {
                    return Err(CoreError::InvalidTransition(format!(
                        "cannot start task {} in state {}",
                        task_id, other
                    ))
                    .into());
                }
            }
            let remote_id = task.remote_task_id.ok_or_else(|| {
                ServerError::InternalError(format!("task {} has no remote id", task_id))
            })?;
            (
                remote_id,
                task.state == TaskState::Submitted,
                task.flow_ids.clone(),
            )
        };

        self.inner.dosing.start_task(remote_id, &options).await?;

        for flow_id in &flow_ids {
            let suspended = matches!(
                self.inner.engine.get(flow_id).map(|s| s.state),
                Ok(FlowState::Paused) | Ok(FlowState::Error)
            );
            if suspended {
                self.inner.engine.resume(flow_id, options.recovery).await?;
            }
        }

        {
            let mut task = self
                .inner
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| ServerError::NotFound(format!("task {}", task_id)))?;
            task.started()?;
        }

        if first_start {
            self.spawn_driver(task_id.clone());
        }
        info!(task_id = %task_id, remote_task_id = remote_id, "task started");
        self.get_task(task_id)
    }

    /// Pause a running task on both sides
    pub async fn stop(&self, task_id: &TaskId) -> ServerResult<Task> {
        let (remote_id, flow_ids) = {
            let task = self.get_task(task_id)?;
            if task.state != TaskState::Running {
                return Err(CoreError::InvalidTransition(format!(
                    "cannot stop task {} in state {}",
                    task_id, task.state
                ))
                .into());
            }
            let remote_id = task.remote_task_id.ok_or_else(|| {
                ServerError::InternalError(format!("task {} has no remote id", task_id))
            })?;
            (remote_id, task.flow_ids.clone())
        };

        self.inner.dosing.stop_task(remote_id).await?;

        {
            let mut task = self
                .inner
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| ServerError::NotFound(format!("task {}", task_id)))?;
            task.paused()?;
        }

        for flow_id in &flow_ids {
            match self.inner.engine.pause(flow_id).await {
                Ok(()) => {}
                // Settled or already-suspended flows have nothing to pause.
                Err(CoreError::InvalidTransition(_)) | Err(CoreError::FlowNotFound(_)) => {}
                Err(err) => {
                    warn!(task_id = %task_id, flow = %flow_id, error = %err, "pause after stop failed");
                }
            }
        }
        info!(task_id = %task_id, "task stopped");
        self.get_task(task_id)
    }

    /// Cancel a task. Safe to repeat: the remote cancel and the flow
    /// resets are only issued by the call that performs the transition.
    pub async fn cancel(&self, task_id: &TaskId) -> ServerResult<Task> {
        let (remote_id, settled) = {
            let task = self.get_task(task_id)?;
            (task.remote_task_id, task.state.is_terminal())
        };
        if settled {
            return self.get_task(task_id);
        }

        if let Some(remote_id) = remote_id {
            self.inner.dosing.cancel_task(remote_id).await?;
        }

        let flow_ids = {
            let mut task = self
                .inner
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| ServerError::NotFound(format!("task {}", task_id)))?;
            if !task.cancel() {
                debug!(task_id = %task_id, "task settled while cancelling");
                return Ok(task.clone());
            }
            task.flow_ids.clone()
        };

        for flow_id in &flow_ids {
            if let Err(err) = self.inner.engine.cancel(flow_id).await {
                warn!(task_id = %task_id, flow = %flow_id, error = %err, "flow cancel failed");
            }
        }
        info!(task_id = %task_id, "task cancelled");
        self.get_task(task_id)
    }

    /// One task with its flows and the platform's last detail
    pub fn view(&self, task_id: &TaskId) -> ServerResult<TaskView> {
        let task = self.get_task(task_id)?;
        let flows = task
            .flow_ids
            .iter()
            .filter_map(|flow_id| self.inner.engine.get(flow_id).ok())
            .collect();
        let remote = self
            .inner
            .remote_detail
            .get(task_id)
            .map(|detail| detail.clone());
        Ok(TaskView { task, flows, remote })
    }

    /// Every known task, oldest first
    pub fn list(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .inner
            .tasks
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        tasks.sort_by_key(|task| task.created_at);
        tasks
    }

    fn get_task(&self, task_id: &TaskId) -> ServerResult<Task> {
        self.inner
            .tasks
            .get(task_id)
            .map(|task| task.clone())
            .ok_or_else(|| ServerError::NotFound(format!("task {}", task_id)))
    }

    fn spawn_driver(&self, task_id: TaskId) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            coordinator.drive(task_id).await;
        });
    }

    /// Walk one task through its transfers until it settles.
    ///
    /// The driver only acts while the task is `Running`; a stop or a
    /// failure parks it until the operator starts the task again.
    async fn drive(self, task_id: TaskId) {
        debug!(task_id = %task_id, "task driver started");
        loop {
            sleep(DRIVE_INTERVAL).await;
            let task = match self.inner.tasks.get(&task_id) {
                Some(task) => task.clone(),
                None => break,
            };
            if task.state.is_terminal() {
                break;
            }
            if task.state != TaskState::Running {
                continue;
            }
            self.advance(&task).await;
        }
        debug!(task_id = %task_id, "task driver finished");
    }

    /// One reconciliation pass for a running task
    async fn advance(&self, task: &Task) {
        // The newest transfer dictates what happens next.
        if let Some(flow_id) = task.flow_ids.last() {
            match self.inner.engine.get(flow_id) {
                Ok(snapshot) => match snapshot.state {
                    FlowState::Completed => {}
                    FlowState::Cancelled => {
                        self.fail_task(
                            &task.task_id,
                            format!("transfer {} cancelled by operator", flow_id),
                        );
                        return;
                    }
                    FlowState::Error => {
                        let reason = snapshot
                            .error
                            .unwrap_or_else(|| "transfer failed".to_string());
                        self.fail_task(
                            &task.task_id,
                            format!("transfer {}: {}", flow_id, reason),
                        );
                        return;
                    }
                    // Still moving, or waiting on the operator.
                    _ => return,
                },
                Err(_) => {
                    self.fail_task(&task.task_id, format!("transfer {} disappeared", flow_id));
                    return;
                }
            }
        }

        let transfers = self
            .inner
            .definitions
            .get(&task.task_id)
            .map(|definition| definition.transfers.clone())
            .unwrap_or_default();

        if task.flow_ids.len() < transfers.len() {
            let params = transfers[task.flow_ids.len()].clone();
            match self.inner.engine.start(params).await {
                Ok(flow_id) => {
                    info!(task_id = %task.task_id, flow = %flow_id, "transfer started");
                    if let Some(mut task) = self.inner.tasks.get_mut(&task.task_id) {
                        task.link_flow(flow_id);
                    }
                }
                Err(CoreError::DeviceBusy(reason)) => {
                    // Another flow holds the robot; try again next pass.
                    debug!(task_id = %task.task_id, %reason, "transfer waiting for devices");
                }
                Err(err) => {
                    self.fail_task(&task.task_id, format!("transfer refused: {}", err));
                }
            }
            return;
        }

        // Every transfer is done; settle against the platform.
        match self.inner.dosing.task_info(task.remote_task_id).await {
            Ok(detail) => {
                self.inner
                    .remote_detail
                    .insert(task.task_id.clone(), detail);
                if let Some(mut task) = self.inner.tasks.get_mut(&task.task_id) {
                    if task.completed().is_ok() {
                        info!(task_id = %task.task_id, "task completed");
                    }
                }
            }
            Err(CoreError::RemoteTaskError(code)) => {
                self.fail_task(
                    &task.task_id,
                    format!("dosing platform reported code {}", code),
                );
            }
            Err(err) => {
                // An unreachable platform is transient; keep probing.
                warn!(task_id = %task.task_id, error = %err, "dosing platform probe failed");
            }
        }
    }

    fn fail_task(&self, task_id: &TaskId, message: String) {
        error!(task_id = %task_id, %message, "task failed");
        if let Some(mut task) = self.inner.tasks.get_mut(task_id) {
            task.failed(message);
        }
    }
}
