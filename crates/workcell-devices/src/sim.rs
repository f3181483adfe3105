//! In-memory stand-ins for the plant hardware.
//!
//! Each sim pairs a transport end for the driver under test with a
//! handle the test keeps, so the test can steer the plant and inspect
//! what the driver put on the wire. [`SimPlc`] implements
//! [`PlcTransport`] directly; the bridge devices plug a responder
//! closure into [`SimFrameBus`], which implements [`FrameTransport`]
//! and records every request.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use workcell_core::domain::signal::MemoryArea;
use workcell_core::CoreError;

use crate::centrifuge::{self, CentrifugeRegisters};
use crate::door;
use crate::furnace;
use crate::transport::{FrameTransport, PlcTransport};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct PlcState {
    connected: bool,
    allow_connect: bool,
    corrupt_next_write: bool,
    writes: u32,
    merker: Vec<u8>,
    data_blocks: HashMap<u16, Vec<u8>>,
}

impl PlcState {
    fn area(&mut self, area: MemoryArea) -> &mut Vec<u8> {
        match area {
            MemoryArea::Merker => &mut self.merker,
            MemoryArea::DataBlock(db) => {
                self.data_blocks.entry(db).or_insert_with(|| vec![0; 256])
            }
        }
    }

    fn area_slice(&mut self, area: MemoryArea, start: u16, len: usize) -> &mut [u8] {
        let bytes = self.area(area);
        let start = start as usize;
        if start + len > bytes.len() {
            bytes.resize(start + len, 0);
        }
        &mut bytes[start..start + len]
    }
}

/// Simulated signal controller memory behind the bridge protocol
pub struct SimPlc {
    state: Arc<Mutex<PlcState>>,
}

/// Test-side handle on a [`SimPlc`]
#[derive(Clone)]
pub struct SimPlcHandle {
    state: Arc<Mutex<PlcState>>,
}

impl SimPlc {
    /// A controller with zeroed memory and the link down
    pub fn new() -> (SimPlc, SimPlcHandle) {
        let state = Arc::new(Mutex::new(PlcState {
            connected: false,
            allow_connect: true,
            corrupt_next_write: false,
            writes: 0,
            merker: vec![0; 256],
            data_blocks: HashMap::new(),
        }));
        (
            SimPlc {
                state: state.clone(),
            },
            SimPlcHandle { state },
        )
    }
}

#[async_trait]
impl PlcTransport for SimPlc {
    async fn connect(&mut self) -> Result<(), CoreError> {
        let mut state = lock(&self.state);
        if !state.allow_connect {
            return Err(CoreError::NotConnected(
                "simulated controller refused the connection".to_string(),
            ));
        }
        state.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) {
        lock(&self.state).connected = false;
    }

    fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    async fn read_area(
        &mut self,
        area: MemoryArea,
        start: u16,
        len: u16,
    ) -> Result<Vec<u8>, CoreError> {
        let mut state = lock(&self.state);
        if !state.connected {
            return Err(CoreError::NotConnected(
                "simulated controller link down".to_string(),
            ));
        }
        Ok(state.area_slice(area, start, len as usize).to_vec())
    }

    async fn write_area(
        &mut self,
        area: MemoryArea,
        start: u16,
        bytes: &[u8],
    ) -> Result<(), CoreError> {
        let mut state = lock(&self.state);
        if !state.connected {
            return Err(CoreError::NotConnected(
                "simulated controller link down".to_string(),
            ));
        }
        state.writes += 1;
        if state.corrupt_next_write {
            // Accept the write but leave memory alone, so read-back
            // verification sees the mismatch.
            state.corrupt_next_write = false;
            return Ok(());
        }
        state
            .area_slice(area, start, bytes.len())
            .copy_from_slice(bytes);
        Ok(())
    }
}

impl SimPlcHandle {
    /// Force the link state without going through the transport
    pub fn set_connected(&self, connected: bool) {
        lock(&self.state).connected = connected;
    }

    /// Make future connection attempts succeed or fail
    pub fn set_allow_connect(&self, allow: bool) {
        lock(&self.state).allow_connect = allow;
    }

    /// Swallow the next write so verification fails
    pub fn corrupt_next_write(&self) {
        lock(&self.state).corrupt_next_write = true;
    }

    /// Writes the controller has accepted
    pub fn write_count(&self) -> u32 {
        lock(&self.state).writes
    }

    /// One bit of marker memory
    pub fn merker_bit(&self, byte: u16, bit: u8) -> bool {
        let mut state = lock(&self.state);
        state.area_slice(MemoryArea::Merker, byte, 1)[0] & (1 << bit) != 0
    }

    /// One bit of a data block
    pub fn db_bit(&self, db: u16, byte: u16, bit: u8) -> bool {
        let mut state = lock(&self.state);
        state.area_slice(MemoryArea::DataBlock(db), byte, 1)[0] & (1 << bit) != 0
    }

    /// One big-endian word of a data block
    pub fn db_word(&self, db: u16, byte: u16) -> u16 {
        let mut state = lock(&self.state);
        let bytes = state.area_slice(MemoryArea::DataBlock(db), byte, 2);
        u16::from_be_bytes([bytes[0], bytes[1]])
    }

    /// A byte range of a data block
    pub fn db_bytes(&self, db: u16, start: u16, len: usize) -> Vec<u8> {
        let mut state = lock(&self.state);
        state.area_slice(MemoryArea::DataBlock(db), start, len).to_vec()
    }

    /// Set one big-endian word of a data block
    pub fn set_db_word(&self, db: u16, byte: u16, value: u16) {
        let mut state = lock(&self.state);
        state
            .area_slice(MemoryArea::DataBlock(db), byte, 2)
            .copy_from_slice(&value.to_be_bytes());
    }

    /// Set one bit of a data block
    pub fn set_db_bit(&self, db: u16, byte: u16, bit: u8, value: bool) {
        let mut state = lock(&self.state);
        let slot = &mut state.area_slice(MemoryArea::DataBlock(db), byte, 1)[0];
        if value {
            *slot |= 1 << bit;
        } else {
            *slot &= !(1 << bit);
        }
    }
}

type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send + Sync>;

struct BusState {
    connected: bool,
    requests: Vec<Vec<u8>>,
}

/// Request/reply bus that hands each request to a responder closure
pub struct SimFrameBus {
    responder: Responder,
    state: Arc<Mutex<BusState>>,
}

/// Test-side handle on a [`SimFrameBus`]
#[derive(Clone)]
pub struct SimBusHandle {
    state: Arc<Mutex<BusState>>,
}

impl SimFrameBus {
    /// A connected bus answering with `responder`
    pub fn new(
        responder: impl FnMut(&[u8]) -> Vec<u8> + Send + Sync + 'static,
    ) -> (SimFrameBus, SimBusHandle) {
        let state = Arc::new(Mutex::new(BusState {
            connected: true,
            requests: Vec::new(),
        }));
        (
            SimFrameBus {
                responder: Box::new(responder),
                state: state.clone(),
            },
            SimBusHandle { state },
        )
    }
}

#[async_trait]
impl FrameTransport for SimFrameBus {
    async fn connect(&mut self) -> Result<(), CoreError> {
        lock(&self.state).connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    async fn exchange(&mut self, request: &[u8], min_reply: usize) -> Result<Vec<u8>, CoreError> {
        {
            let mut state = lock(&self.state);
            if !state.connected {
                return Err(CoreError::NotConnected("simulated bus down".to_string()));
            }
            state.requests.push(request.to_vec());
        }
        let reply = (self.responder)(request);
        if reply.len() < min_reply {
            return Err(CoreError::Timeout(format!(
                "simulated bus returned {} of {} bytes",
                reply.len(),
                min_reply
            )));
        }
        Ok(reply)
    }
}

impl SimBusHandle {
    /// Force the link state
    pub fn set_connected(&self, connected: bool) {
        lock(&self.state).connected = connected;
    }

    /// Every request seen so far, oldest first
    pub fn requests(&self) -> Vec<Vec<u8>> {
        lock(&self.state).requests.clone()
    }

    /// Forget recorded requests
    pub fn clear_requests(&self) {
        lock(&self.state).requests.clear();
    }
}

struct DoorMove {
    open: bool,
    due: tokio::time::Instant,
}

struct DoorBankState {
    open: [bool; 6],
    moves: HashMap<usize, DoorMove>,
    move_delay: Duration,
    refuse_next: bool,
}

impl DoorBankState {
    fn settle_due_moves(&mut self) {
        let now = tokio::time::Instant::now();
        let DoorBankState { open, moves, .. } = self;
        moves.retain(|&index, motion| {
            if motion.due <= now {
                open[index] = motion.open;
                false
            } else {
                true
            }
        });
    }
}

/// Simulated door bridge: six doors, two per slave
pub struct SimDoorBank {
    state: Arc<Mutex<DoorBankState>>,
}

impl SimDoorBank {
    /// All doors closed and settling instantly
    pub fn new() -> Self {
        SimDoorBank {
            state: Arc::new(Mutex::new(DoorBankState {
                open: [false; 6],
                moves: HashMap::new(),
                move_delay: Duration::ZERO,
                refuse_next: false,
            })),
        }
    }

    /// Responder to plug into a [`SimFrameBus`]
    pub fn responder(&self) -> impl FnMut(&[u8]) -> Vec<u8> + Send + 'static {
        let state = self.state.clone();
        move |request: &[u8]| {
            let mut state = lock(&state);
            match request[0] {
                door::OP_COMMAND => {
                    if state.refuse_next {
                        state.refuse_next = false;
                        return b"False".to_vec();
                    }
                    let index = ((request[1] - 1) * 2 + request[2]) as usize;
                    let open = request[4] == door::CMD_OPEN;
                    if state.move_delay.is_zero() {
                        state.open[index] = open;
                    } else {
                        let due = tokio::time::Instant::now() + state.move_delay;
                        state.moves.insert(index, DoorMove { open, due });
                    }
                    b"True".to_vec()
                }
                door::OP_STATUS => {
                    state.settle_due_moves();
                    let pair = (request[1] as usize - 1) * 2;
                    vec![state.open[pair] as u8, state.open[pair + 1] as u8]
                }
                _ => Vec::new(),
            }
        }
    }

    /// Settled position of a door
    pub fn is_open(&self, unit: u8) -> bool {
        let mut state = lock(&self.state);
        state.settle_due_moves();
        state.open[unit as usize - 1]
    }

    /// Place a door without a motion
    pub fn set_open(&self, unit: u8, open: bool) {
        lock(&self.state).open[unit as usize - 1] = open;
    }

    /// How long commanded motions take to settle on the sensors
    pub fn set_move_delay(&self, delay: Duration) {
        lock(&self.state).move_delay = delay;
    }

    /// Refuse the next door command
    pub fn refuse_next_command(&self) {
        lock(&self.state).refuse_next = true;
    }
}

#[derive(Clone, Copy)]
struct SimChamber {
    lid_open: bool,
    running: bool,
    step: u8,
    temperature: f64,
    setpoint: f64,
    runtime_minutes: u16,
}

struct FurnaceBankState {
    chambers: [SimChamber; 24],
    lid_commands: Vec<(u8, u8)>,
    fail_next_lid: bool,
    garble_next_reply: bool,
    misaddress_next_telemetry: bool,
}

/// Simulated furnace bridge: twenty-four chambers
pub struct SimFurnaceBank {
    state: Arc<Mutex<FurnaceBankState>>,
}

impl SimFurnaceBank {
    /// All chambers idle at room temperature with lids closed
    pub fn new() -> Self {
        let chamber = SimChamber {
            lid_open: false,
            running: false,
            step: 0,
            temperature: 25.0,
            setpoint: 25.0,
            runtime_minutes: 0,
        };
        SimFurnaceBank {
            state: Arc::new(Mutex::new(FurnaceBankState {
                chambers: [chamber; 24],
                lid_commands: Vec::new(),
                fail_next_lid: false,
                garble_next_reply: false,
                misaddress_next_telemetry: false,
            })),
        }
    }

    /// Responder to plug into a [`SimFrameBus`]
    pub fn responder(&self) -> impl FnMut(&[u8]) -> Vec<u8> + Send + 'static {
        let state = self.state.clone();
        move |request: &[u8]| {
            let mut state = lock(&state);
            let chamber = request[1];
            match request[0] {
                furnace::OP_LID => {
                    state.lid_commands.push((chamber, request[4]));
                    if state.fail_next_lid {
                        state.fail_next_lid = false;
                        return b"False".to_vec();
                    }
                    state.chambers[chamber as usize - 1].lid_open = request[4] == 1;
                    if state.garble_next_reply {
                        state.garble_next_reply = false;
                        return b"Okay!".to_vec();
                    }
                    b"True".to_vec()
                }
                furnace::OP_PROGRAM => {
                    state.chambers[chamber as usize - 1].running = request[4] == 0;
                    if state.garble_next_reply {
                        state.garble_next_reply = false;
                        return b"Okay!".to_vec();
                    }
                    b"True".to_vec()
                }
                furnace::OP_TELEMETRY => {
                    let data = state.chambers[chamber as usize - 1];
                    let answered_as = if state.misaddress_next_telemetry {
                        state.misaddress_next_telemetry = false;
                        chamber + 1
                    } else {
                        chamber
                    };
                    let mut reply = vec![
                        answered_as,
                        if data.running { 2 } else { 1 },
                        data.step,
                    ];
                    reply.extend_from_slice(&((data.temperature * 10.0) as u16).to_be_bytes());
                    reply.extend_from_slice(&((data.setpoint * 10.0) as u16).to_be_bytes());
                    reply.extend_from_slice(&data.runtime_minutes.to_be_bytes());
                    reply
                }
                _ => Vec::new(),
            }
        }
    }

    /// Tracked lid position of a chamber
    pub fn lid_open(&self, chamber: u8) -> bool {
        lock(&self.state).chambers[chamber as usize - 1].lid_open
    }

    /// Start or stop a chamber programme directly
    pub fn set_running(&self, chamber: u8, running: bool) {
        lock(&self.state).chambers[chamber as usize - 1].running = running;
    }

    /// Set the programme step a chamber reports
    pub fn set_step(&self, chamber: u8, step: u8) {
        lock(&self.state).chambers[chamber as usize - 1].step = step;
    }

    /// Set the temperatures a chamber reports
    pub fn set_temperature(&self, chamber: u8, temperature: f64, setpoint: f64) {
        let mut state = lock(&self.state);
        state.chambers[chamber as usize - 1].temperature = temperature;
        state.chambers[chamber as usize - 1].setpoint = setpoint;
    }

    /// Set the programme runtime a chamber reports
    pub fn set_runtime(&self, chamber: u8, minutes: u16) {
        lock(&self.state).chambers[chamber as usize - 1].runtime_minutes = minutes;
    }

    /// Refuse the next lid command
    pub fn fail_next_lid(&self) {
        lock(&self.state).fail_next_lid = true;
    }

    /// Answer the next lid or programme command with junk
    pub fn garble_next_reply(&self) {
        lock(&self.state).garble_next_reply = true;
    }

    /// Stamp the next telemetry reply with the wrong chamber number
    pub fn misaddress_next_telemetry(&self) {
        lock(&self.state).misaddress_next_telemetry = true;
    }

    /// Every lid command frame the bridge has seen, as (chamber, code)
    pub fn lid_commands(&self) -> Vec<(u8, u8)> {
        lock(&self.state).lid_commands.clone()
    }
}

struct SimCentrifugeState {
    registers: CentrifugeRegisters,
    corrupt_next_echo: bool,
    prepend_garbage: bool,
}

/// Simulated centrifuge slave
pub struct SimCentrifuge {
    state: Arc<Mutex<SimCentrifugeState>>,
}

impl SimCentrifuge {
    /// A machine at rest with the vessel sealed
    pub fn new() -> Self {
        SimCentrifuge {
            state: Arc::new(Mutex::new(SimCentrifugeState {
                registers: CentrifugeRegisters::at_rest(),
                corrupt_next_echo: false,
                prepend_garbage: false,
            })),
        }
    }

    /// Responder to plug into a [`SimFrameBus`]
    pub fn responder(&self) -> impl FnMut(&[u8]) -> Vec<u8> + Send + 'static {
        let state = self.state.clone();
        move |request: &[u8]| {
            let mut state = lock(&state);
            if request.len() < 8 || request[6..8] != centrifuge::crc16(&request[..6]) {
                return Vec::new();
            }
            match request[1] {
                centrifuge::FN_WRITE => {
                    let register = u16::from_be_bytes([request[2], request[3]]);
                    let value = u16::from_be_bytes([request[4], request[5]]);
                    apply_register_write(&mut state.registers, register, value);
                    let mut echo = request.to_vec();
                    if state.corrupt_next_echo {
                        state.corrupt_next_echo = false;
                        echo[5] ^= 0xFF;
                    }
                    echo
                }
                centrifuge::FN_READ => {
                    let mut frame = vec![
                        centrifuge::SLAVE,
                        centrifuge::FN_READ,
                        CentrifugeRegisters::BYTES as u8,
                    ];
                    frame.extend_from_slice(&state.registers.encode());
                    let crc = centrifuge::crc16(&frame);
                    frame.extend_from_slice(&crc);
                    if state.prepend_garbage {
                        state.prepend_garbage = false;
                        let mut noisy = vec![0xFF, 0x00, 0x7A];
                        noisy.extend_from_slice(&frame);
                        return noisy;
                    }
                    frame
                }
                _ => Vec::new(),
            }
        }
    }

    /// The current register block
    pub fn registers(&self) -> CentrifugeRegisters {
        lock(&self.state).registers
    }

    /// Set the raw run register
    pub fn set_run(&self, value: u16) {
        lock(&self.state).registers.run = value;
    }

    /// Set the raw rotor register
    pub fn set_rotor(&self, value: u16) {
        lock(&self.state).registers.rotor = value;
    }

    /// Set the raw door and lid registers together
    pub fn set_door(&self, value: u16) {
        let mut state = lock(&self.state);
        state.registers.door = value;
        state.registers.lid = value;
    }

    /// Set the measured speed
    pub fn set_actual_rpm(&self, value: u16) {
        lock(&self.state).registers.actual_rpm = value;
    }

    /// Corrupt the next write echo
    pub fn corrupt_next_echo(&self) {
        lock(&self.state).corrupt_next_echo = true;
    }

    /// Prefix the next status reply with line noise
    pub fn prepend_garbage_once(&self) {
        lock(&self.state).prepend_garbage = true;
    }
}

fn apply_register_write(registers: &mut CentrifugeRegisters, register: u16, value: u16) {
    match register {
        centrifuge::REG_RUN if value == centrifuge::RUN_START => {
            registers.run = 2;
            registers.rotor = 2;
            registers.actual_rpm = registers.set_rpm;
        }
        centrifuge::REG_RUN => {
            registers.run = 1;
            registers.rotor = 0;
            registers.actual_rpm = 0;
        }
        centrifuge::REG_DOOR => {
            registers.door = value;
            registers.lid = value;
        }
        centrifuge::REG_SPEED => registers.set_rpm = value,
        centrifuge::REG_TIME => registers.set_seconds = value,
        _ => {}
    }
}
