//! Robot driver.
//!
//! The robot has no bus of its own: every control and feedback signal
//! lives in signal controller memory behind the [`PlcGateway`]. Job
//! dispatch and task clear are edge signals the robot side detects as a
//! level change, so they go out as verified toggles. The stop flag and
//! the passage permits are levels and are always written absolutely,
//! never toggled, so re-issuing them cannot flip the meaning.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use workcell_core::domain::device::{CommandAck, DeviceCommand, RobotAction, RobotSystemState};
use workcell_core::domain::signal::{blocks, signals, TaskBlock};
use workcell_core::domain::status::{Connection, DeviceStatus, RobotStatus};
use workcell_core::{CoreError, DeviceController, DeviceKey, DeviceKind, InterlockGate, StatusBoard};

use crate::plc::PlcGateway;

/// Width of the reset pulse
const RESET_PULSE: Duration = Duration::from_millis(500);

/// Pause between writing the task block and raising the dispatch edge
const DISPATCH_SETTLE: Duration = Duration::from_millis(500);

/// Driver for the transfer robot
pub struct RobotController {
    gateway: Arc<PlcGateway>,
    board: Arc<StatusBoard>,
    gate: InterlockGate,
    last_command: Mutex<Option<String>>,
}

impl RobotController {
    /// Driver over the shared controller gateway
    pub fn new(gateway: Arc<PlcGateway>, board: Arc<StatusBoard>, gate: InterlockGate) -> Self {
        RobotController {
            gateway,
            board,
            gate,
            last_command: Mutex::new(None),
        }
    }

    fn check_dispatch(&self) -> Result<(), CoreError> {
        let status = match self.board.get(&DeviceKey::of(DeviceKind::Robot)) {
            Some(DeviceStatus::Robot(status)) => status,
            _ => return Ok(()),
        };
        if !status.connection.is_online() {
            return Err(CoreError::NotConnected("robot".to_string()));
        }
        if status.system != RobotSystemState::Idle {
            return Err(CoreError::Busy(format!("robot {}", status.system)));
        }
        Ok(())
    }

    async fn read_status(&self) -> Result<RobotStatus, CoreError> {
        let at_home = self.gateway.read_bit(signals::ROBOT_AT_HOME).await?;
        let gripper_open = self.gateway.read_bit(signals::ROBOT_GRIPPER_OPEN).await?;
        let system = self.gateway.read_word(signals::ROBOT_SYSTEM_STATE).await?;
        let task_present = self.gateway.read_word(signals::ROBOT_TASK_PRESENT).await?;
        Ok(RobotStatus {
            connection: Connection::Online,
            system: RobotSystemState::from_word(system),
            at_home,
            gripper_open,
            task_present: task_present != 0,
            last_command: None,
            updated_at: chrono::Utc::now(),
        })
    }
}

#[async_trait]
impl DeviceController for RobotController {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Robot
    }

    async fn execute(&self, command: DeviceCommand) -> Result<CommandAck, CoreError> {
        let action = match &command {
            DeviceCommand::Robot(action) => action,
            other => {
                return Err(CoreError::ValidationError(format!(
                    "robot driver cannot execute {}",
                    other.describe()
                )))
            }
        };
        if let RobotAction::Dispatch(job) = action {
            if job.target().is_none() {
                return Err(CoreError::ValidationError(format!(
                    "unknown task code {}",
                    job.task_code
                )));
            }
            self.check_dispatch()?;
        }
        self.gate.check(&command)?;

        match action {
            RobotAction::Reset => {
                // The controller refuses to clear alarms while the stop
                // flag is up.
                self.gateway.write_bit(signals::ROBOT_HALT, false).await?;
                self.gateway.pulse_bit(signals::ROBOT_RESET, RESET_PULSE).await?;
            }
            RobotAction::ToggleRun => {
                self.gateway.toggle_bit(signals::ROBOT_RUN).await?;
            }
            RobotAction::Halt => {
                self.gateway.write_bit(signals::ROBOT_HALT, true).await?;
            }
            RobotAction::Dispatch(job) => {
                let block = TaskBlock {
                    task_code: job.task_code,
                    station: job.station,
                    quantity: job.quantity,
                };
                self.gateway
                    .write_block(blocks::TASK_PARAMS, &block.to_bytes())
                    .await?;
                // Let the controller latch the parameters for a scan
                // cycle before it sees the dispatch edge.
                tokio::time::sleep(DISPATCH_SETTLE).await;
                self.gateway.toggle_bit(signals::ROBOT_DISPATCH).await?;
            }
            RobotAction::ClearTask => {
                self.gateway.toggle_bit(signals::ROBOT_CLEAR).await?;
            }
            RobotAction::AssertPermits(permits) => {
                for permit in permits {
                    self.gateway.write_bit(permit.signal_name(), true).await?;
                }
            }
            RobotAction::ClearPermits(permits) => {
                for permit in permits {
                    self.gateway.write_bit(permit.signal_name(), false).await?;
                }
            }
        }

        {
            let mut last = self.last_command.lock().await;
            *last = Some(command.describe());
        }
        debug!(action = %command.describe(), "robot command issued");

        let ack = CommandAck::now(&command);
        if let Err(err) = self.refresh().await {
            warn!(error = %err, "post-command robot refresh failed");
        }
        Ok(ack)
    }

    async fn refresh(&self) -> Result<(), CoreError> {
        let last_command = self.last_command.lock().await.clone();
        match self.read_status().await {
            Ok(mut status) => {
                status.last_command = last_command;
                self.board.publish(DeviceStatus::Robot(status));
                Ok(())
            }
            Err(err) => {
                let mut status = RobotStatus::offline();
                status.last_command = last_command;
                self.board.publish(DeviceStatus::Robot(status));
                Err(err)
            }
        }
    }
}
