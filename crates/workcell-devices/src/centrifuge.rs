//! Centrifuge driver.
//!
//! The machine speaks Modbus RTU framed over TCP: single-register writes
//! (function 0x06) that the slave acknowledges by echoing the request,
//! and a fourteen-register block read (function 0x03) for the full
//! status. Replies can arrive with leading noise, so the status decoder
//! realigns on the reply header and checks the CRC before trusting a
//! frame.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use workcell_core::domain::device::{
    CentrifugeAction, CentrifugeFault, CentrifugeRun, CommandAck, DeviceCommand, RotorState,
    SlotState,
};
use workcell_core::domain::status::{CentrifugeStatus, Connection, DeviceStatus};
use workcell_core::{CoreError, DeviceController, DeviceKey, DeviceKind, InterlockGate, StatusBoard};

use crate::door::{overlay_motion, PendingMotion};
use crate::transport::FrameTransport;

pub(crate) const SLAVE: u8 = 0x01;
pub(crate) const FN_WRITE: u8 = 0x06;
pub(crate) const FN_READ: u8 = 0x03;
pub(crate) const REG_RUN: u16 = 0x2000;
pub(crate) const REG_DOOR: u16 = 0x2001;
pub(crate) const REG_SPEED: u16 = 0x2002;
pub(crate) const REG_TIME: u16 = 0x2003;
pub(crate) const REG_STATUS: u16 = 0x2200;
pub(crate) const RUN_START: u16 = 1;
pub(crate) const RUN_STOP: u16 = 2;
pub(crate) const DOOR_OPEN: u16 = 1;
pub(crate) const DOOR_CLOSE: u16 = 2;

const WRITE_REPLY_LEN: usize = 8;
const STATUS_REPLY_LEN: usize = 33;
const STATUS_HEADER: [u8; 3] = [SLAVE, FN_READ, (CentrifugeRegisters::BYTES) as u8];

/// Modbus CRC16 (poly 0xA001, init 0xFFFF), low byte first
pub(crate) fn crc16(data: &[u8]) -> [u8; 2] {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc.to_le_bytes()
}

/// Function 0x06 single-register write frame
pub(crate) fn write_frame(register: u16, value: u16) -> [u8; 8] {
    let mut frame = [0u8; 8];
    frame[0] = SLAVE;
    frame[1] = FN_WRITE;
    frame[2..4].copy_from_slice(&register.to_be_bytes());
    frame[4..6].copy_from_slice(&value.to_be_bytes());
    let crc = crc16(&frame[..6]);
    frame[6..8].copy_from_slice(&crc);
    frame
}

/// Function 0x03 read of the whole status block
pub(crate) fn read_status_request() -> [u8; 8] {
    let mut frame = [0u8; 8];
    frame[0] = SLAVE;
    frame[1] = FN_READ;
    frame[2..4].copy_from_slice(&REG_STATUS.to_be_bytes());
    frame[4..6].copy_from_slice(&(CentrifugeRegisters::WORDS as u16).to_be_bytes());
    let crc = crc16(&frame[..6]);
    frame[6..8].copy_from_slice(&crc);
    frame
}

/// Find the status frame in a reply, realigning past leading noise,
/// and return its 28 data bytes after checking the CRC
pub(crate) fn extract_status_frame(reply: &[u8]) -> Result<&[u8], CoreError> {
    let start = reply
        .windows(STATUS_HEADER.len())
        .position(|window| window == STATUS_HEADER)
        .ok_or_else(|| CoreError::Other("no status header in centrifuge reply".to_string()))?;
    let frame = reply
        .get(start..start + STATUS_REPLY_LEN)
        .ok_or_else(|| CoreError::Other("truncated centrifuge status frame".to_string()))?;
    let crc = crc16(&frame[..STATUS_REPLY_LEN - 2]);
    if frame[STATUS_REPLY_LEN - 2..] != crc {
        return Err(CoreError::Other(
            "bad checksum on centrifuge status frame".to_string(),
        ));
    }
    Ok(&frame[STATUS_HEADER.len()..STATUS_REPLY_LEN - 2])
}

/// The raw status block, one word per register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CentrifugeRegisters {
    /// Run state (1 stopped, 2 running)
    pub run: u16,
    /// Rotor phase (0 at rest through 4 positioning)
    pub rotor: u16,
    /// Latched fault code
    pub fault: u16,
    /// Door position (1 open, 2 closed)
    pub door: u16,
    /// Lid position (1 open, 2 closed)
    pub lid: u16,
    /// Measured speed in rpm
    pub actual_rpm: u16,
    /// Programmed speed in rpm
    pub set_rpm: u16,
    /// Seconds left in the current spin
    pub remaining_seconds: u16,
    /// Seconds elapsed in the current spin
    pub elapsed_seconds: u16,
    /// Programmed spin time in seconds
    pub set_seconds: u16,
    /// Relative centrifugal force readout
    pub rcf: u16,
}

impl CentrifugeRegisters {
    /// Registers in the status block, reserved tail included
    pub const WORDS: usize = 14;

    /// Status block size in bytes
    pub const BYTES: usize = 28;

    /// A machine at rest with the vessel sealed
    pub fn at_rest() -> Self {
        CentrifugeRegisters {
            run: RUN_START,
            rotor: 0,
            fault: 0,
            door: DOOR_CLOSE,
            lid: DOOR_CLOSE,
            actual_rpm: 0,
            set_rpm: 0,
            remaining_seconds: 0,
            elapsed_seconds: 0,
            set_seconds: 0,
            rcf: 0,
        }
    }

    /// Decode the 28-byte status block (big-endian words)
    pub fn decode(data: &[u8]) -> Result<Self, CoreError> {
        if data.len() < Self::BYTES {
            return Err(CoreError::Other(format!(
                "centrifuge status needs {} bytes, got {}",
                Self::BYTES,
                data.len()
            )));
        }
        let word = |index: usize| u16::from_be_bytes([data[2 * index], data[2 * index + 1]]);
        Ok(CentrifugeRegisters {
            run: word(0),
            rotor: word(1),
            fault: word(2),
            door: word(3),
            lid: word(4),
            actual_rpm: word(5),
            set_rpm: word(6),
            remaining_seconds: word(7),
            elapsed_seconds: word(8),
            set_seconds: word(9),
            rcf: word(10),
        })
    }

    /// Encode as the 28-byte status block, reserved words zeroed
    pub fn encode(&self) -> [u8; Self::BYTES] {
        let mut out = [0u8; Self::BYTES];
        let words = [
            self.run,
            self.rotor,
            self.fault,
            self.door,
            self.lid,
            self.actual_rpm,
            self.set_rpm,
            self.remaining_seconds,
            self.elapsed_seconds,
            self.set_seconds,
            self.rcf,
        ];
        for (index, value) in words.into_iter().enumerate() {
            out[2 * index..2 * index + 2].copy_from_slice(&value.to_be_bytes());
        }
        out
    }
}

fn slot_from_register(value: u16) -> SlotState {
    match value {
        1 => SlotState::Open,
        2 => SlotState::Closed,
        _ => SlotState::Fault,
    }
}

struct CentrifugeBus {
    transport: Box<dyn FrameTransport>,
    door_pending: Option<PendingMotion>,
    last_command: Option<String>,
}

/// Driver for the centrifuge
pub struct CentrifugeController {
    bus: Mutex<CentrifugeBus>,
    board: Arc<StatusBoard>,
    gate: InterlockGate,
}

impl CentrifugeController {
    /// Driver over a bridge transport
    pub fn new(
        transport: Box<dyn FrameTransport>,
        board: Arc<StatusBoard>,
        gate: InterlockGate,
    ) -> Self {
        CentrifugeController {
            bus: Mutex::new(CentrifugeBus {
                transport,
                door_pending: None,
                last_command: None,
            }),
            board,
            gate,
        }
    }

    /// Refuse commands the machine cannot take from its current state
    fn check_transition(&self, action: CentrifugeAction) -> Result<(), CoreError> {
        let status = match self.board.get(&DeviceKey::of(DeviceKind::Centrifuge)) {
            Some(DeviceStatus::Centrifuge(status)) => status,
            _ => return Ok(()),
        };
        if !status.connection.is_online() {
            return Err(CoreError::NotConnected("centrifuge".to_string()));
        }
        match action {
            CentrifugeAction::Start => {
                if status.run == CentrifugeRun::Running {
                    return Err(CoreError::InvalidTransition(
                        "centrifuge already running".to_string(),
                    ));
                }
                if !status.rotor.is_stationary() {
                    return Err(CoreError::Busy(format!(
                        "centrifuge rotor {}",
                        status.rotor
                    )));
                }
                Ok(())
            }
            CentrifugeAction::OpenDoor => match status.door {
                SlotState::Opening | SlotState::Closing => {
                    Err(CoreError::Busy(format!("centrifuge door {}", status.door)))
                }
                SlotState::Open => Err(CoreError::InvalidTransition(
                    "centrifuge door already open".to_string(),
                )),
                _ => Ok(()),
            },
            CentrifugeAction::CloseDoor => match status.door {
                SlotState::Opening | SlotState::Closing => {
                    Err(CoreError::Busy(format!("centrifuge door {}", status.door)))
                }
                SlotState::Closed => Err(CoreError::InvalidTransition(
                    "centrifuge door already closed".to_string(),
                )),
                _ => Ok(()),
            },
            CentrifugeAction::Stop
            | CentrifugeAction::SetSpeed(_)
            | CentrifugeAction::SetRunTime(_) => Ok(()),
        }
    }

    async fn refresh_locked(&self, bus: &mut CentrifugeBus) -> Result<(), CoreError> {
        let reply = match bus
            .transport
            .exchange(&read_status_request(), STATUS_REPLY_LEN)
            .await
        {
            Ok(reply) => reply,
            Err(err) => {
                self.publish_offline(bus);
                return Err(err);
            }
        };
        let registers = match extract_status_frame(&reply).and_then(CentrifugeRegisters::decode) {
            Ok(registers) => registers,
            Err(err) => {
                self.publish_offline(bus);
                return Err(err);
            }
        };

        let raw_door = slot_from_register(registers.door);
        let (door, finished) = overlay_motion(bus.door_pending.as_ref(), raw_door);
        if finished {
            if let Some(motion) = bus.door_pending.take() {
                if raw_door != motion.target {
                    warn!(
                        target = %motion.target,
                        "centrifuge door never reached its commanded state"
                    );
                }
            }
        }

        self.board.publish(DeviceStatus::Centrifuge(CentrifugeStatus {
            connection: Connection::Online,
            run: CentrifugeRun::from_register(registers.run),
            rotor: RotorState::from_register(registers.rotor),
            fault: CentrifugeFault::from_register(registers.fault),
            door,
            lid: slot_from_register(registers.lid),
            actual_rpm: registers.actual_rpm,
            set_rpm: registers.set_rpm,
            remaining_seconds: registers.remaining_seconds,
            elapsed_seconds: registers.elapsed_seconds,
            set_seconds: registers.set_seconds,
            rcf: registers.rcf,
            last_command: bus.last_command.clone(),
            updated_at: chrono::Utc::now(),
        }));
        Ok(())
    }

    fn publish_offline(&self, bus: &CentrifugeBus) {
        let mut status = CentrifugeStatus::offline();
        status.last_command = bus.last_command.clone();
        self.board.publish(DeviceStatus::Centrifuge(status));
    }
}

#[async_trait]
impl DeviceController for CentrifugeController {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Centrifuge
    }

    async fn execute(&self, command: DeviceCommand) -> Result<CommandAck, CoreError> {
        let action = match &command {
            DeviceCommand::Centrifuge(action) => *action,
            other => {
                return Err(CoreError::ValidationError(format!(
                    "centrifuge driver cannot execute {}",
                    other.describe()
                )))
            }
        };
        self.check_transition(action)?;
        self.gate.check(&command)?;

        let (register, value) = match action {
            CentrifugeAction::Start => (REG_RUN, RUN_START),
            CentrifugeAction::Stop => (REG_RUN, RUN_STOP),
            CentrifugeAction::OpenDoor => (REG_DOOR, DOOR_OPEN),
            CentrifugeAction::CloseDoor => (REG_DOOR, DOOR_CLOSE),
            CentrifugeAction::SetSpeed(rpm) => (REG_SPEED, rpm),
            CentrifugeAction::SetRunTime(seconds) => (REG_TIME, seconds),
        };

        let mut bus = self.bus.lock().await;
        let request = write_frame(register, value);
        let reply = bus.transport.exchange(&request, WRITE_REPLY_LEN).await?;
        if reply[..WRITE_REPLY_LEN] != request {
            return Err(CoreError::Other(format!(
                "centrifuge did not echo the write to register {:#06x}",
                register
            )));
        }

        match action {
            CentrifugeAction::OpenDoor => {
                bus.door_pending = Some(PendingMotion::towards(SlotState::Open));
            }
            CentrifugeAction::CloseDoor => {
                bus.door_pending = Some(PendingMotion::towards(SlotState::Closed));
            }
            _ => {}
        }
        bus.last_command = Some(command.describe());
        debug!(action = ?action, "centrifuge command accepted");

        let ack = CommandAck::now(&command);
        if let Err(err) = self.refresh_locked(&mut bus).await {
            warn!(error = %err, "post-command centrifuge refresh failed");
        }
        Ok(ack)
    }

    async fn refresh(&self) -> Result<(), CoreError> {
        let mut bus = self.bus.lock().await;
        self.refresh_locked(&mut bus).await
    }
}
