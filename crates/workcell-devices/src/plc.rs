//! Gateway to the cell's signal controller.
//!
//! Every controller access in the process funnels through one
//! [`PlcGateway`]: a named-signal facade over the raw transport with a
//! single operation in flight at a time, read-back verification on every
//! write and a reconnect task that picks the link back up with capped
//! exponential backoff. Control bits left set by an interrupted pulse
//! are cleared on reconnect before anything else touches the controller.

use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use workcell_core::domain::signal::{BlockAddress, MemoryArea, SignalAddress, SignalCatalog};
use workcell_core::CoreError;

use crate::transport::PlcTransport;

/// First retry delay after a failed connect
const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Ceiling for the reconnect backoff
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Link state of the signal controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No link and nobody trying
    Disconnected,
    /// A connect attempt is in progress
    Connecting,
    /// Link is up
    Connected,
    /// Link dropped; the reconnect task is on it
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Shared gateway to the signal controller.
///
/// Commands fail fast with [`CoreError::NotConnected`] while the link is
/// down; nothing is queued. Writes read the signal back and fail with
/// [`CoreError::SignalWriteVerificationFailed`] on a mismatch.
pub struct PlcGateway {
    catalog: SignalCatalog,
    transport: Mutex<Box<dyn PlcTransport>>,
    state: watch::Sender<ConnectionState>,
    stuck_bits: StdMutex<Vec<SignalAddress>>,
}

impl PlcGateway {
    /// Gateway over a transport, using the given signal catalog
    pub fn new(catalog: SignalCatalog, transport: Box<dyn PlcTransport>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        PlcGateway {
            catalog,
            transport: Mutex::new(transport),
            state,
            stuck_bits: StdMutex::new(Vec::new()),
        }
    }

    /// Current link state
    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch the link state
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Connect now, releasing any bits a past pulse left set
    pub async fn connect(&self) -> Result<(), CoreError> {
        self.state.send_replace(ConnectionState::Connecting);
        let mut transport = self.transport.lock().await;
        if let Err(err) = transport.connect().await {
            self.state.send_replace(ConnectionState::Error);
            return Err(err);
        }
        self.state.send_replace(ConnectionState::Connected);
        info!("signal controller connected");
        self.release_stuck_bits(&mut **transport).await;
        Ok(())
    }

    /// Drop the link deliberately
    pub async fn disconnect(&self) {
        let mut transport = self.transport.lock().await;
        transport.disconnect().await;
        self.state.send_replace(ConnectionState::Disconnected);
    }

    /// Background task that re-establishes the link whenever it drops
    pub fn spawn_reconnect(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut states = self.state.subscribe();
            let mut backoff = BACKOFF_BASE;
            loop {
                if *states.borrow_and_update() == ConnectionState::Connected {
                    backoff = BACKOFF_BASE;
                    if states.changed().await.is_err() {
                        return;
                    }
                    continue;
                }
                match self.connect().await {
                    Ok(()) => {
                        backoff = BACKOFF_BASE;
                    }
                    Err(err) => {
                        debug!(
                            error = %err,
                            "signal controller reconnect failed; next attempt in {:?}",
                            backoff
                        );
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(BACKOFF_CAP);
                    }
                }
            }
        })
    }

    /// Read a named bit signal
    pub async fn read_bit(&self, name: &str) -> Result<bool, CoreError> {
        let address = self.catalog.bit(name)?.address;
        self.ensure_connected()?;
        let mut transport = self.transport.lock().await;
        let result = read_bit_at(&mut **transport, address).await;
        self.note_result(&result);
        result
    }

    /// Read a named word signal (big-endian)
    pub async fn read_word(&self, name: &str) -> Result<u16, CoreError> {
        let address = self.catalog.word(name)?.address;
        self.ensure_connected()?;
        let mut transport = self.transport.lock().await;
        let result = read_word_at(&mut **transport, address).await;
        self.note_result(&result);
        result
    }

    /// Write a named bit signal and verify it by reading it back
    pub async fn write_bit(&self, name: &str, value: bool) -> Result<(), CoreError> {
        let address = self.catalog.writable_bit(name)?.address;
        self.ensure_connected()?;
        let mut transport = self.transport.lock().await;
        let result = write_verified(&mut **transport, name, address, value).await;
        self.note_result(&result);
        if result.is_ok() {
            debug!(signal = name, value, "signal written");
        }
        result
    }

    /// Flip a named bit signal; returns the new value
    pub async fn toggle_bit(&self, name: &str) -> Result<bool, CoreError> {
        let address = self.catalog.writable_bit(name)?.address;
        self.ensure_connected()?;
        let mut transport = self.transport.lock().await;
        let result = toggle_at(&mut **transport, name, address).await;
        self.note_result(&result);
        if let Ok(value) = &result {
            debug!(signal = name, value, "signal toggled");
        }
        result
    }

    /// Raise a bit, hold it for `width`, then release it.
    ///
    /// If the release fails the bit is remembered and written low after
    /// the next successful connect.
    pub async fn pulse_bit(&self, name: &str, width: Duration) -> Result<(), CoreError> {
        let address = self.catalog.writable_bit(name)?.address;
        self.ensure_connected()?;
        let mut transport = self.transport.lock().await;

        let set = write_verified(&mut **transport, name, address, true).await;
        self.note_result(&set);
        set?;

        // Hold the bus for the whole pulse so nothing writes between the edges.
        tokio::time::sleep(width).await;

        let reset = write_verified(&mut **transport, name, address, false).await;
        self.note_result(&reset);
        if let Err(err) = reset {
            self.remember_stuck(address);
            warn!(
                signal = name,
                error = %err,
                "pulse left its bit set; will clear it after reconnect"
            );
            return Err(CoreError::Timeout(format!(
                "pulse on {} interrupted: {}",
                name, err
            )));
        }
        debug!(signal = name, width_ms = width.as_millis() as u64, "signal pulsed");
        Ok(())
    }

    /// Write a named block and verify it by reading it back
    pub async fn write_block(&self, name: &str, bytes: &[u8]) -> Result<(), CoreError> {
        let block = *self.catalog.block(name)?;
        if bytes.len() != block.len as usize {
            return Err(CoreError::ValidationError(format!(
                "block {} is {} bytes, got {}",
                name,
                block.len,
                bytes.len()
            )));
        }
        self.ensure_connected()?;
        let mut transport = self.transport.lock().await;
        let result = write_block_at(&mut **transport, name, block, bytes).await;
        self.note_result(&result);
        result
    }

    /// Read a named block
    pub async fn read_block(&self, name: &str) -> Result<Vec<u8>, CoreError> {
        let block = *self.catalog.block(name)?;
        self.ensure_connected()?;
        let mut transport = self.transport.lock().await;
        let result = transport
            .read_area(MemoryArea::DataBlock(block.db), block.start, block.len)
            .await;
        self.note_result(&result);
        result
    }

    fn ensure_connected(&self) -> Result<(), CoreError> {
        if *self.state.borrow() != ConnectionState::Connected {
            return Err(CoreError::NotConnected("signal controller".to_string()));
        }
        Ok(())
    }

    /// Flip to `Error` when a result shows the link is gone, which wakes
    /// the reconnect task.
    fn note_result<T>(&self, result: &Result<T, CoreError>) {
        if let Err(err) = result {
            if matches!(
                err,
                CoreError::NotConnected(_) | CoreError::Timeout(_) | CoreError::IOError(_)
            ) {
                self.state.send_replace(ConnectionState::Error);
            }
        }
    }

    fn remember_stuck(&self, address: SignalAddress) {
        let mut stuck = self
            .stuck_bits
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !stuck.contains(&address) {
            stuck.push(address);
        }
    }

    async fn release_stuck_bits(&self, transport: &mut dyn PlcTransport) {
        let stuck: Vec<SignalAddress> = {
            let mut guard = self
                .stuck_bits
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *guard)
        };
        for address in stuck {
            match write_bit_at(transport, address, false).await {
                Ok(()) => {
                    info!(%address, "cleared control bit left set by an interrupted pulse")
                }
                Err(err) => {
                    warn!(%address, error = %err, "could not clear stuck control bit");
                    self.remember_stuck(address);
                }
            }
        }
    }
}

async fn read_byte_at(
    transport: &mut dyn PlcTransport,
    area: MemoryArea,
    byte: u16,
) -> Result<u8, CoreError> {
    let bytes = transport.read_area(area, byte, 1).await?;
    bytes
        .first()
        .copied()
        .ok_or_else(|| CoreError::Other("controller returned an empty read".to_string()))
}

async fn read_bit_at(
    transport: &mut dyn PlcTransport,
    address: SignalAddress,
) -> Result<bool, CoreError> {
    let bit = bit_index(address)?;
    let byte = read_byte_at(transport, address.area, address.byte).await?;
    Ok(byte & (1 << bit) != 0)
}

/// Read-modify-write of one bit, leaving its byte's other bits alone
async fn write_bit_at(
    transport: &mut dyn PlcTransport,
    address: SignalAddress,
    value: bool,
) -> Result<(), CoreError> {
    let bit = bit_index(address)?;
    let mut byte = read_byte_at(transport, address.area, address.byte).await?;
    if value {
        byte |= 1 << bit;
    } else {
        byte &= !(1 << bit);
    }
    transport.write_area(address.area, address.byte, &[byte]).await
}

async fn write_verified(
    transport: &mut dyn PlcTransport,
    name: &str,
    address: SignalAddress,
    value: bool,
) -> Result<(), CoreError> {
    write_bit_at(transport, address, value).await?;
    let actual = read_bit_at(transport, address).await?;
    if actual != value {
        return Err(CoreError::SignalWriteVerificationFailed {
            signal: name.to_string(),
            expected: value.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

async fn toggle_at(
    transport: &mut dyn PlcTransport,
    name: &str,
    address: SignalAddress,
) -> Result<bool, CoreError> {
    let current = read_bit_at(transport, address).await?;
    let target = !current;
    write_verified(transport, name, address, target).await?;
    Ok(target)
}

async fn read_word_at(
    transport: &mut dyn PlcTransport,
    address: SignalAddress,
) -> Result<u16, CoreError> {
    let bytes = transport.read_area(address.area, address.byte, 2).await?;
    if bytes.len() < 2 {
        return Err(CoreError::Other(format!("short word read at {}", address)));
    }
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

async fn write_block_at(
    transport: &mut dyn PlcTransport,
    name: &str,
    block: BlockAddress,
    bytes: &[u8],
) -> Result<(), CoreError> {
    let area = MemoryArea::DataBlock(block.db);
    transport.write_area(area, block.start, bytes).await?;
    let actual = transport.read_area(area, block.start, block.len).await?;
    if actual != bytes {
        return Err(CoreError::SignalWriteVerificationFailed {
            signal: name.to_string(),
            expected: format!("{:?}", bytes),
            actual: format!("{:?}", actual),
        });
    }
    Ok(())
}

fn bit_index(address: SignalAddress) -> Result<u8, CoreError> {
    address.bit.ok_or_else(|| {
        CoreError::ConfigurationError(format!("{} is not a bit address", address))
    })
}
