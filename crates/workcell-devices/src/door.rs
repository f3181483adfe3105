//! Glass door driver.
//!
//! Six doors share one serial bridge. Each bridge slave answers for an
//! odd/even door pair, so one status poll covers two doors. The bus only
//! reports settled open/closed positions; the driver overlays the motion
//! it commanded to expose opening/closing in between, and writes a
//! motion off when the sensors never reach the target.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use workcell_core::domain::device::{CommandAck, DeviceCommand, DoorAction, SlotState, DOOR_COUNT};
use workcell_core::domain::status::{Connection, DeviceStatus, DoorStatus};
use workcell_core::{CoreError, DeviceController, DeviceKey, DeviceKind, InterlockGate, StatusBoard, UnitId};

use crate::transport::FrameTransport;

pub(crate) const OP_COMMAND: u8 = 0x01;
pub(crate) const OP_STATUS: u8 = 0x02;
pub(crate) const CMD_OPEN: u8 = 1;
pub(crate) const CMD_CLOSE: u8 = 2;

/// How long a commanded motion may go unconfirmed by the sensors before
/// the driver abandons it and reports the settled reading again
const MOTION_GIVE_UP: Duration = Duration::from_secs(30);

/// Bridge slave serving a door; doors 1-2 share slave 1 and so on
pub(crate) fn bus_slave(unit: UnitId) -> u8 {
    (unit.0 + 1) / 2
}

/// Channel of a door on its slave; 0 for the odd door, 1 for the even
pub(crate) fn bus_channel(unit: UnitId) -> u8 {
    (unit.0 + 1) % 2
}

pub(crate) fn command_frame(unit: UnitId, action: DoorAction) -> [u8; 5] {
    let value = match action {
        DoorAction::Open => CMD_OPEN,
        DoorAction::Close => CMD_CLOSE,
    };
    [OP_COMMAND, bus_slave(unit), bus_channel(unit), 0, value]
}

pub(crate) fn status_frame(slave: u8) -> [u8; 5] {
    [OP_STATUS, slave, 0, 0, 0]
}

pub(crate) fn reply_ok(reply: &[u8]) -> bool {
    reply.starts_with(b"True")
}

/// A commanded motion the sensors have not confirmed yet
#[derive(Debug, Clone, Copy)]
pub(crate) struct PendingMotion {
    pub(crate) target: SlotState,
    pub(crate) since: tokio::time::Instant,
}

impl PendingMotion {
    pub(crate) fn towards(target: SlotState) -> Self {
        PendingMotion {
            target,
            since: tokio::time::Instant::now(),
        }
    }
}

/// Overlay a commanded motion on a settled sensor reading.
///
/// Returns the state to report and `true` when the pending motion is
/// finished with, either because the sensors reached the target or
/// because the motion outlived its give-up window.
pub(crate) fn overlay_motion(pending: Option<&PendingMotion>, raw: SlotState) -> (SlotState, bool) {
    match pending {
        None => (raw, false),
        Some(motion) if raw == motion.target => (raw, true),
        Some(motion) if motion.since.elapsed() >= MOTION_GIVE_UP => (raw, true),
        Some(motion) => {
            let moving = if motion.target == SlotState::Open {
                SlotState::Opening
            } else {
                SlotState::Closing
            };
            (moving, false)
        }
    }
}

struct DoorBus {
    transport: Box<dyn FrameTransport>,
    pending: HashMap<UnitId, PendingMotion>,
    last_commands: HashMap<UnitId, String>,
}

/// Driver for the six glass doors
pub struct DoorController {
    bus: Mutex<DoorBus>,
    board: Arc<StatusBoard>,
    gate: InterlockGate,
}

impl DoorController {
    /// Driver over a bridge transport
    pub fn new(
        transport: Box<dyn FrameTransport>,
        board: Arc<StatusBoard>,
        gate: InterlockGate,
    ) -> Self {
        DoorController {
            bus: Mutex::new(DoorBus {
                transport,
                pending: HashMap::new(),
                last_commands: HashMap::new(),
            }),
            board,
            gate,
        }
    }

    /// Refuse commands the door cannot take from its current state
    fn check_transition(&self, unit: UnitId, action: DoorAction) -> Result<(), CoreError> {
        let status = match self.board.get(&DeviceKey::unit(DeviceKind::Door, unit.0)) {
            Some(DeviceStatus::Door(status)) => status,
            _ => return Ok(()),
        };
        if !status.connection.is_online() {
            return Err(CoreError::NotConnected(format!("door {}", unit)));
        }
        match (status.state, action) {
            (SlotState::Opening, _) | (SlotState::Closing, _) => {
                Err(CoreError::Busy(format!("door {} {}", unit, status.state)))
            }
            (SlotState::Open, DoorAction::Open) => Err(CoreError::InvalidTransition(format!(
                "door {} already open",
                unit
            ))),
            (SlotState::Closed, DoorAction::Close) => Err(CoreError::InvalidTransition(format!(
                "door {} already closed",
                unit
            ))),
            _ => Ok(()),
        }
    }

    async fn refresh_locked(&self, bus: &mut DoorBus) -> Result<(), CoreError> {
        for slave in 1..=DOOR_COUNT / 2 {
            let reply = match bus.transport.exchange(&status_frame(slave), 2).await {
                Ok(reply) => reply,
                Err(err) => {
                    self.mark_bank_offline(bus);
                    return Err(err);
                }
            };
            for (channel, unit) in [(0u8, UnitId(2 * slave - 1)), (1u8, UnitId(2 * slave))] {
                let raw = if reply[channel as usize] & 0x01 == 1 {
                    SlotState::Open
                } else {
                    SlotState::Closed
                };
                let (state, finished) = overlay_motion(bus.pending.get(&unit), raw);
                if finished {
                    if let Some(motion) = bus.pending.remove(&unit) {
                        if raw != motion.target {
                            warn!(
                                door = unit.0,
                                target = %motion.target,
                                "door never reached its commanded state"
                            );
                        }
                    }
                }
                self.board.publish(DeviceStatus::Door(DoorStatus {
                    unit,
                    connection: Connection::Online,
                    state,
                    last_command: bus.last_commands.get(&unit).cloned(),
                    updated_at: chrono::Utc::now(),
                }));
            }
        }
        Ok(())
    }

    fn mark_bank_offline(&self, bus: &DoorBus) {
        for unit in 1..=DOOR_COUNT {
            let unit = UnitId(unit);
            let mut status = DoorStatus::offline(unit);
            status.last_command = bus.last_commands.get(&unit).cloned();
            self.board.publish(DeviceStatus::Door(status));
        }
    }
}

#[async_trait]
impl DeviceController for DoorController {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Door
    }

    async fn execute(&self, command: DeviceCommand) -> Result<CommandAck, CoreError> {
        let (unit, action) = match &command {
            DeviceCommand::Door { unit, action } => (*unit, *action),
            other => {
                return Err(CoreError::ValidationError(format!(
                    "door driver cannot execute {}",
                    other.describe()
                )))
            }
        };
        if unit.0 < 1 || unit.0 > DOOR_COUNT {
            return Err(CoreError::ValidationError(format!("no such door {}", unit)));
        }
        self.check_transition(unit, action)?;
        self.gate.check(&command)?;

        let mut bus = self.bus.lock().await;
        let reply = bus.transport.exchange(&command_frame(unit, action), 4).await?;
        if !reply_ok(&reply) {
            return Err(CoreError::Other(format!(
                "door {} bridge refused {:?}",
                unit, action
            )));
        }

        let target = match action {
            DoorAction::Open => SlotState::Open,
            DoorAction::Close => SlotState::Closed,
        };
        bus.pending.insert(unit, PendingMotion::towards(target));
        bus.last_commands.insert(unit, command.describe());

        // Show the motion right away; the next poll keeps it honest.
        let moving = if target == SlotState::Open {
            SlotState::Opening
        } else {
            SlotState::Closing
        };
        self.board.publish(DeviceStatus::Door(DoorStatus {
            unit,
            connection: Connection::Online,
            state: moving,
            last_command: Some(command.describe()),
            updated_at: chrono::Utc::now(),
        }));
        debug!(door = unit.0, action = ?action, "door command accepted");

        let ack = CommandAck::now(&command);
        if let Err(err) = self.refresh_locked(&mut bus).await {
            warn!(error = %err, "post-command door refresh failed");
        }
        Ok(ack)
    }

    async fn refresh(&self) -> Result<(), CoreError> {
        let mut bus = self.bus.lock().await;
        self.refresh_locked(&mut bus).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimBusHandle, SimDoorBank, SimFrameBus};
    use workcell_core::domain::device::CentrifugeAction;

    fn controller(bank: &SimDoorBank) -> (DoorController, SimBusHandle, Arc<StatusBoard>) {
        let (bus, handle) = SimFrameBus::new(bank.responder());
        let board = Arc::new(StatusBoard::new());
        let gate = InterlockGate::new(board.clone());
        let driver = DoorController::new(Box::new(bus), board.clone(), gate);
        (driver, handle, board)
    }

    fn open(unit: u8) -> DeviceCommand {
        DeviceCommand::Door {
            unit: UnitId(unit),
            action: DoorAction::Open,
        }
    }

    fn door_state(board: &StatusBoard, unit: u8) -> SlotState {
        match board.get(&DeviceKey::unit(DeviceKind::Door, unit)) {
            Some(DeviceStatus::Door(status)) => status.state,
            other => panic!("no door status: {:?}", other),
        }
    }

    #[test]
    fn test_bus_addressing() {
        assert_eq!((bus_slave(UnitId(1)), bus_channel(UnitId(1))), (1, 0));
        assert_eq!((bus_slave(UnitId(2)), bus_channel(UnitId(2))), (1, 1));
        assert_eq!((bus_slave(UnitId(3)), bus_channel(UnitId(3))), (2, 0));
        assert_eq!((bus_slave(UnitId(6)), bus_channel(UnitId(6))), (3, 1));
    }

    #[tokio::test]
    async fn test_open_frames_the_bus_command() {
        let bank = SimDoorBank::new();
        let (driver, handle, board) = controller(&bank);
        driver.refresh().await.unwrap();
        handle.clear_requests();

        let ack = driver.execute(open(3)).await.unwrap();
        assert_eq!(ack.action, "door 3 Open");

        let requests = handle.requests();
        assert_eq!(requests[0], vec![0x01, 2, 0, 0, 1]);
        assert!(bank.is_open(3));
        assert_eq!(door_state(&board, 3), SlotState::Open);
    }

    #[tokio::test]
    async fn test_interlock_denial_keeps_the_bus_quiet() {
        let bank = SimDoorBank::new();
        let (driver, handle, board) = controller(&bank);
        board.publish(DeviceStatus::Door(DoorStatus {
            unit: UnitId(4),
            connection: Connection::Online,
            state: SlotState::Open,
            last_command: None,
            updated_at: chrono::Utc::now(),
        }));

        let err = driver.execute(open(3)).await.unwrap_err();
        assert_eq!(
            err,
            CoreError::InterlockDenied("paired door 4 open".to_string())
        );
        assert!(handle.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_moving_door_reports_busy() {
        let bank = SimDoorBank::new();
        bank.set_move_delay(Duration::from_secs(5));
        let (driver, _handle, board) = controller(&bank);
        driver.refresh().await.unwrap();

        driver.execute(open(3)).await.unwrap();
        assert_eq!(door_state(&board, 3), SlotState::Opening);

        let err = driver.execute(open(3)).await.unwrap_err();
        assert!(matches!(err, CoreError::Busy(_)), "got {:?}", err);

        // The sensors catch up and the next poll settles the door.
        tokio::time::sleep(Duration::from_secs(6)).await;
        driver.refresh().await.unwrap();
        assert_eq!(door_state(&board, 3), SlotState::Open);
    }

    #[tokio::test]
    async fn test_open_while_open_is_invalid() {
        let bank = SimDoorBank::new();
        bank.set_open(3, true);
        let (driver, _handle, board) = controller(&bank);
        driver.refresh().await.unwrap();
        assert_eq!(door_state(&board, 3), SlotState::Open);

        let err = driver.execute(open(3)).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_unknown_door_is_rejected() {
        let bank = SimDoorBank::new();
        let (driver, handle, _board) = controller(&bank);

        let err = driver.execute(open(7)).await.unwrap_err();
        assert!(matches!(err, CoreError::ValidationError(_)), "got {:?}", err);
        assert!(handle.requests().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_command_kind_is_rejected() {
        let bank = SimDoorBank::new();
        let (driver, _handle, _board) = controller(&bank);
        assert_eq!(driver.kind(), DeviceKind::Door);

        let err = driver
            .execute(DeviceCommand::Centrifuge(CentrifugeAction::Stop))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ValidationError(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_bridge_refusal_surfaces_as_error() {
        let bank = SimDoorBank::new();
        let (driver, _handle, _board) = controller(&bank);
        driver.refresh().await.unwrap();

        bank.refuse_next_command();
        let err = driver.execute(open(2)).await.unwrap_err();
        assert!(matches!(err, CoreError::Other(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_bus_failure_marks_every_door_offline() {
        let bank = SimDoorBank::new();
        let (driver, handle, board) = controller(&bank);
        driver.refresh().await.unwrap();

        handle.set_connected(false);
        let err = driver.refresh().await.unwrap_err();
        assert!(matches!(err, CoreError::NotConnected(_)), "got {:?}", err);

        for unit in 1..=DOOR_COUNT {
            match board.get(&DeviceKey::unit(DeviceKind::Door, unit)) {
                Some(DeviceStatus::Door(status)) => {
                    assert_eq!(status.connection, Connection::Offline)
                }
                other => panic!("no door status: {:?}", other),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_motion_that_never_settles_is_written_off() {
        let bank = SimDoorBank::new();
        bank.set_move_delay(Duration::from_secs(3600));
        let (driver, _handle, board) = controller(&bank);
        driver.refresh().await.unwrap();

        driver.execute(open(1)).await.unwrap();
        assert_eq!(door_state(&board, 1), SlotState::Opening);

        tokio::time::sleep(Duration::from_secs(31)).await;
        driver.refresh().await.unwrap();
        // Sensors still read closed; the commanded motion is abandoned.
        assert_eq!(door_state(&board, 1), SlotState::Closed);
    }
}
