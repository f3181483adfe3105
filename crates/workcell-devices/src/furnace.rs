//! Furnace bank driver.
//!
//! Twenty-four chambers sit behind one bridge. Lid and programme
//! commands are string-acknowledged; telemetry is polled per chamber and
//! decoded from a fixed nine-byte frame. The reply conventions differ
//! between the two command families and are kept as the bridge defines
//! them: a lid command failed only on an explicit `False`, a programme
//! command succeeded only on an explicit `True`.
//!
//! The lids have no position sensors. The driver holds the last
//! commanded lid state per chamber (closed until told otherwise) and the
//! bridge acknowledges a lid command once the motion is complete, so the
//! tracked state is settled, never in between.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use workcell_core::domain::device::{
    CommandAck, DeviceCommand, LidAction, ProgramAction, SlotState, CHAMBER_COUNT,
};
use workcell_core::domain::status::{ChamberStatus, Connection, DeviceStatus};
use workcell_core::{CoreError, DeviceController, DeviceKey, DeviceKind, InterlockGate, StatusBoard, UnitId};

use crate::transport::FrameTransport;

pub(crate) const OP_PROGRAM: u8 = 0x01;
pub(crate) const OP_TELEMETRY: u8 = 0x02;
pub(crate) const OP_LID: u8 = 0x03;
pub(crate) const LID_PARAM: u8 = 250;
pub(crate) const PROGRAM_PARAM: u8 = 27;
pub(crate) const TELEMETRY_LEN: usize = 9;

/// Telemetry status byte for a stopped programme
const STATUS_STOPPED: u8 = 1;

pub(crate) fn lid_frame(chamber: UnitId, action: LidAction) -> [u8; 5] {
    let code = match action {
        LidAction::Open => 1,
        LidAction::Close => 2,
    };
    [OP_LID, chamber.0, LID_PARAM, 0, code]
}

pub(crate) fn program_frame(chamber: UnitId, action: ProgramAction) -> [u8; 5] {
    let code = match action {
        ProgramAction::Start => 0,
        ProgramAction::Stop => 1,
        ProgramAction::Pause => 2,
    };
    [OP_PROGRAM, chamber.0, PROGRAM_PARAM, 0, code]
}

pub(crate) fn telemetry_frame(chamber: UnitId) -> [u8; 5] {
    [OP_TELEMETRY, chamber.0, 0, 0, 0]
}

pub(crate) fn lid_reply_ok(reply: &[u8]) -> bool {
    !reply.starts_with(b"False")
}

pub(crate) fn program_reply_ok(reply: &[u8]) -> bool {
    reply.starts_with(b"True")
}

/// One decoded telemetry frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Telemetry {
    pub(crate) status: u8,
    pub(crate) step: u8,
    pub(crate) temperature: f64,
    pub(crate) setpoint: f64,
    pub(crate) runtime_minutes: u16,
}

/// Decode a chamber telemetry frame; temperatures come scaled by ten
pub(crate) fn decode_telemetry(chamber: UnitId, frame: &[u8]) -> Result<Telemetry, CoreError> {
    if frame.len() < TELEMETRY_LEN {
        return Err(CoreError::Other(format!(
            "telemetry frame too short: {} bytes",
            frame.len()
        )));
    }
    if frame[0] != chamber.0 {
        return Err(CoreError::Other(format!(
            "chamber {} answered a poll of chamber {}",
            frame[0], chamber
        )));
    }
    Ok(Telemetry {
        status: frame[1],
        step: frame[2],
        temperature: u16::from_be_bytes([frame[3], frame[4]]) as f64 / 10.0,
        setpoint: u16::from_be_bytes([frame[5], frame[6]]) as f64 / 10.0,
        runtime_minutes: u16::from_be_bytes([frame[7], frame[8]]),
    })
}

fn check_chamber(chamber: UnitId) -> Result<(), CoreError> {
    if chamber.0 < 1 || chamber.0 > CHAMBER_COUNT {
        return Err(CoreError::ValidationError(format!(
            "no such chamber {}",
            chamber
        )));
    }
    Ok(())
}

struct FurnaceBus {
    transport: Box<dyn FrameTransport>,
    lids: HashMap<UnitId, SlotState>,
    last_commands: HashMap<UnitId, String>,
}

impl FurnaceBus {
    fn lid(&self, chamber: UnitId) -> SlotState {
        self.lids.get(&chamber).copied().unwrap_or(SlotState::Closed)
    }
}

/// Driver for the furnace bank
pub struct FurnaceController {
    bus: Mutex<FurnaceBus>,
    board: Arc<StatusBoard>,
    gate: InterlockGate,
}

impl FurnaceController {
    /// Driver over a bridge transport
    pub fn new(
        transport: Box<dyn FrameTransport>,
        board: Arc<StatusBoard>,
        gate: InterlockGate,
    ) -> Self {
        FurnaceController {
            bus: Mutex::new(FurnaceBus {
                transport,
                lids: HashMap::new(),
                last_commands: HashMap::new(),
            }),
            board,
            gate,
        }
    }

    async fn execute_lid(&self, chamber: UnitId, action: LidAction) -> Result<CommandAck, CoreError> {
        check_chamber(chamber)?;
        let command = DeviceCommand::Lid { chamber, action };
        let target = match action {
            LidAction::Open => SlotState::Open,
            LidAction::Close => SlotState::Closed,
        };

        let mut bus = self.bus.lock().await;
        let current = bus.lid(chamber);
        if current == target {
            return Err(CoreError::InvalidTransition(format!(
                "chamber {} lid already {}",
                chamber, current
            )));
        }
        self.gate.check(&command)?;

        let reply = bus.transport.exchange(&lid_frame(chamber, action), 4).await?;
        if !lid_reply_ok(&reply) {
            return Err(CoreError::Other(format!(
                "chamber {} lid bridge refused {:?}",
                chamber, action
            )));
        }
        bus.lids.insert(chamber, target);
        bus.last_commands.insert(chamber, command.describe());
        debug!(chamber = chamber.0, action = ?action, "lid command completed");

        let ack = CommandAck::now(&command);
        if let Err(err) = self.refresh_chamber(&mut bus, chamber).await {
            warn!(error = %err, "post-command chamber refresh failed");
        }
        Ok(ack)
    }

    async fn execute_program(
        &self,
        chamber: UnitId,
        action: ProgramAction,
    ) -> Result<CommandAck, CoreError> {
        check_chamber(chamber)?;
        let command = DeviceCommand::Program { chamber, action };

        if action == ProgramAction::Start {
            if let Some(DeviceStatus::Furnace(status)) =
                self.board.get(&DeviceKey::unit(DeviceKind::Furnace, chamber.0))
            {
                if !status.connection.is_online() {
                    return Err(CoreError::NotConnected(format!("chamber {}", chamber)));
                }
                if status.program_running {
                    return Err(CoreError::InvalidTransition(format!(
                        "chamber {} programme already running",
                        chamber
                    )));
                }
            }
        }
        self.gate.check(&command)?;

        let mut bus = self.bus.lock().await;
        let reply = bus
            .transport
            .exchange(&program_frame(chamber, action), 4)
            .await?;
        if !program_reply_ok(&reply) {
            return Err(CoreError::Other(format!(
                "chamber {} programme bridge refused {:?}",
                chamber, action
            )));
        }
        bus.last_commands.insert(chamber, command.describe());
        debug!(chamber = chamber.0, action = ?action, "programme command accepted");

        let ack = CommandAck::now(&command);
        if let Err(err) = self.refresh_chamber(&mut bus, chamber).await {
            warn!(error = %err, "post-command chamber refresh failed");
        }
        Ok(ack)
    }

    async fn refresh_chamber(&self, bus: &mut FurnaceBus, chamber: UnitId) -> Result<(), CoreError> {
        let reply = bus
            .transport
            .exchange(&telemetry_frame(chamber), TELEMETRY_LEN)
            .await?;
        let telemetry = decode_telemetry(chamber, &reply)?;
        self.publish_chamber(bus, chamber, &telemetry);
        Ok(())
    }

    fn publish_chamber(&self, bus: &FurnaceBus, chamber: UnitId, telemetry: &Telemetry) {
        self.board.publish(DeviceStatus::Furnace(ChamberStatus {
            chamber,
            connection: Connection::Online,
            lid: bus.lid(chamber),
            program_running: telemetry.status != STATUS_STOPPED,
            step: telemetry.step as u16,
            temperature: telemetry.temperature,
            setpoint: telemetry.setpoint,
            runtime_minutes: telemetry.runtime_minutes,
            last_command: bus.last_commands.get(&chamber).cloned(),
            updated_at: chrono::Utc::now(),
        }));
    }

    fn mark_bank_offline(&self, bus: &FurnaceBus) {
        for index in 1..=CHAMBER_COUNT {
            let chamber = UnitId(index);
            let mut status = ChamberStatus::offline(chamber);
            status.last_command = bus.last_commands.get(&chamber).cloned();
            self.board.publish(DeviceStatus::Furnace(status));
        }
    }
}

#[async_trait]
impl DeviceController for FurnaceController {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Furnace
    }

    async fn execute(&self, command: DeviceCommand) -> Result<CommandAck, CoreError> {
        match command {
            DeviceCommand::Lid { chamber, action } => self.execute_lid(chamber, action).await,
            DeviceCommand::Program { chamber, action } => {
                self.execute_program(chamber, action).await
            }
            other => Err(CoreError::ValidationError(format!(
                "furnace driver cannot execute {}",
                other.describe()
            ))),
        }
    }

    async fn refresh(&self) -> Result<(), CoreError> {
        let mut bus = self.bus.lock().await;
        for index in 1..=CHAMBER_COUNT {
            let chamber = UnitId(index);
            let reply = match bus
                .transport
                .exchange(&telemetry_frame(chamber), TELEMETRY_LEN)
                .await
            {
                Ok(reply) => reply,
                Err(err) => {
                    self.mark_bank_offline(&bus);
                    return Err(err);
                }
            };
            match decode_telemetry(chamber, &reply) {
                Ok(telemetry) => self.publish_chamber(&bus, chamber, &telemetry),
                Err(err) => {
                    warn!(chamber = index, error = %err, "undecodable chamber telemetry");
                    let mut status = ChamberStatus::offline(chamber);
                    status.last_command = bus.last_commands.get(&chamber).cloned();
                    self.board.publish(DeviceStatus::Furnace(status));
                }
            }
        }
        Ok(())
    }
}
