//! Byte-level transports behind the drivers.
//!
//! Two channel shapes cover every device in the cell: the signal
//! controller's area-addressed memory ([`PlcTransport`]) and plain
//! request/response field buses ([`FrameTransport`]). The production
//! implementations speak TCP to the respective bridge hardware; the
//! [`crate::sim`] module provides in-process stand-ins with the same
//! traits for tests and the dev configuration.

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout_at;

use workcell_core::domain::signal::MemoryArea;
use workcell_core::CoreError;

/// Default deadline for a connect or a reply on either transport
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(3);

/// Area-addressed memory access on the signal controller.
///
/// The gateway owns exactly one of these behind a mutex; all reads and
/// writes of controller memory funnel through it one at a time.
#[async_trait]
pub trait PlcTransport: Send + Sync {
    /// (Re)establish the link
    async fn connect(&mut self) -> Result<(), CoreError>;

    /// Drop the link
    async fn disconnect(&mut self);

    /// True when the link is believed up
    fn is_connected(&self) -> bool;

    /// Read `len` bytes from `area` starting at byte `start`
    async fn read_area(&mut self, area: MemoryArea, start: u16, len: u16)
        -> Result<Vec<u8>, CoreError>;

    /// Write bytes to `area` starting at byte `start`
    async fn write_area(&mut self, area: MemoryArea, start: u16, bytes: &[u8])
        -> Result<(), CoreError>;
}

/// One request/response exchange on a device field bus.
///
/// The device bridges in the cell all answer a single request with a
/// single reply; framing and decoding stay with the driver that owns the
/// bus.
#[async_trait]
pub trait FrameTransport: Send + Sync {
    /// (Re)establish the link
    async fn connect(&mut self) -> Result<(), CoreError>;

    /// True when the link is believed up
    fn is_connected(&self) -> bool;

    /// Send one request and collect at least `min_reply` bytes of reply
    async fn exchange(&mut self, request: &[u8], min_reply: usize) -> Result<Vec<u8>, CoreError>;
}

fn area_label(area: MemoryArea) -> String {
    match area {
        MemoryArea::Merker => "M".to_string(),
        MemoryArea::DataBlock(db) => format!("DB{}", db),
    }
}

async fn open_stream(addr: &str, deadline: Duration) -> Result<TcpStream, CoreError> {
    let connect = TcpStream::connect(addr);
    let stream = timeout_at(tokio::time::Instant::now() + deadline, connect)
        .await
        .map_err(|_| CoreError::Timeout(format!("connecting to {}", addr)))?
        .map_err(|err| CoreError::NotConnected(format!("{}: {}", addr, err)))?;
    stream.set_nodelay(true).ok();
    Ok(stream)
}

/// Field bus transport over one TCP connection.
///
/// The stream is opened lazily on first use and dropped on any error;
/// the next exchange reconnects. Leftover bytes from an earlier exchange
/// are drained before each request, matching how the bridges behave when
/// a previous reply arrived late.
pub struct TcpFrameTransport {
    addr: String,
    reply_timeout: Duration,
    stream: Option<TcpStream>,
}

impl TcpFrameTransport {
    /// Transport for `addr` with the default reply deadline
    pub fn new(addr: impl Into<String>) -> Self {
        Self::with_timeout(addr, DEFAULT_IO_TIMEOUT)
    }

    /// Transport for `addr` with an explicit reply deadline
    pub fn with_timeout(addr: impl Into<String>, reply_timeout: Duration) -> Self {
        TcpFrameTransport {
            addr: addr.into(),
            reply_timeout,
            stream: None,
        }
    }

    async fn exchange_on(&self, stream: &mut TcpStream, request: &[u8], min_reply: usize)
        -> Result<Vec<u8>, CoreError>
    {
        // Drain anything a previous exchange left behind.
        let mut stale = [0u8; 256];
        while let Ok(n) = stream.try_read(&mut stale) {
            if n == 0 {
                return Err(CoreError::NotConnected(format!(
                    "{}: connection closed",
                    self.addr
                )));
            }
        }

        stream.write_all(request).await?;

        let deadline = tokio::time::Instant::now() + self.reply_timeout;
        let mut reply = Vec::new();
        let mut chunk = [0u8; 256];
        while reply.len() < min_reply {
            let n = timeout_at(deadline, stream.read(&mut chunk))
                .await
                .map_err(|_| {
                    CoreError::Timeout(format!(
                        "no reply from {} within {:?}",
                        self.addr, self.reply_timeout
                    ))
                })??;
            if n == 0 {
                return Err(CoreError::NotConnected(format!(
                    "{}: connection closed",
                    self.addr
                )));
            }
            reply.extend_from_slice(&chunk[..n]);
        }
        Ok(reply)
    }
}

#[async_trait]
impl FrameTransport for TcpFrameTransport {
    async fn connect(&mut self) -> Result<(), CoreError> {
        if self.stream.is_none() {
            let stream = open_stream(&self.addr, self.reply_timeout).await?;
            self.stream = Some(stream);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn exchange(&mut self, request: &[u8], min_reply: usize) -> Result<Vec<u8>, CoreError> {
        let mut stream = match self.stream.take() {
            Some(stream) => stream,
            None => open_stream(&self.addr, self.reply_timeout).await?,
        };
        match self.exchange_on(&mut stream, request, min_reply).await {
            Ok(reply) => {
                self.stream = Some(stream);
                Ok(reply)
            }
            // The stream stays dropped; the next exchange reconnects.
            Err(err) => Err(err),
        }
    }
}

const OP_READ: u8 = 0x01;
const OP_WRITE: u8 = 0x02;
const AREA_MERKER: u8 = 0x01;
const AREA_DATA_BLOCK: u8 = 0x02;
const STATUS_OK: u8 = 0x00;

fn encode_header(op: u8, area: MemoryArea, start: u16, len: u16) -> [u8; 8] {
    let (tag, db) = match area {
        MemoryArea::Merker => (AREA_MERKER, 0u16),
        MemoryArea::DataBlock(db) => (AREA_DATA_BLOCK, db),
    };
    let mut out = [0u8; 8];
    out[0] = op;
    out[1] = tag;
    out[2..4].copy_from_slice(&db.to_be_bytes());
    out[4..6].copy_from_slice(&start.to_be_bytes());
    out[6..8].copy_from_slice(&len.to_be_bytes());
    out
}

/// Signal controller transport over the field bridge's TCP protocol.
///
/// Each operation is an 8-byte header (`op`, area tag, block number,
/// start byte, length, all big-endian) followed by the payload for
/// writes; the bridge answers with a status byte and, for reads, the
/// data. Unlike the frame transport this one does not reconnect on its
/// own: the gateway owns the connection lifecycle.
pub struct TcpPlcTransport {
    addr: String,
    io_timeout: Duration,
    stream: Option<TcpStream>,
}

impl TcpPlcTransport {
    /// Transport for `addr` with the default I/O deadline
    pub fn new(addr: impl Into<String>) -> Self {
        Self::with_timeout(addr, DEFAULT_IO_TIMEOUT)
    }

    /// Transport for `addr` with an explicit I/O deadline
    pub fn with_timeout(addr: impl Into<String>, io_timeout: Duration) -> Self {
        TcpPlcTransport {
            addr: addr.into(),
            io_timeout,
            stream: None,
        }
    }

    fn take_stream(&mut self) -> Result<TcpStream, CoreError> {
        self.stream
            .take()
            .ok_or_else(|| CoreError::NotConnected(self.addr.clone()))
    }

    async fn request(&self, stream: &mut TcpStream, header: &[u8; 8], payload: &[u8], reply_len: usize)
        -> Result<Vec<u8>, CoreError>
    {
        let deadline = tokio::time::Instant::now() + self.io_timeout;
        stream.write_all(header).await?;
        if !payload.is_empty() {
            stream.write_all(payload).await?;
        }
        let mut reply = vec![0u8; 1 + reply_len];
        timeout_at(deadline, stream.read_exact(&mut reply))
            .await
            .map_err(|_| {
                CoreError::Timeout(format!(
                    "no reply from {} within {:?}",
                    self.addr, self.io_timeout
                ))
            })??;
        Ok(reply)
    }
}

#[async_trait]
impl PlcTransport for TcpPlcTransport {
    async fn connect(&mut self) -> Result<(), CoreError> {
        self.stream = None;
        let stream = open_stream(&self.addr, self.io_timeout).await?;
        self.stream = Some(stream);
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.stream = None;
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn read_area(&mut self, area: MemoryArea, start: u16, len: u16)
        -> Result<Vec<u8>, CoreError>
    {
        let mut stream = self.take_stream()?;
        let header = encode_header(OP_READ, area, start, len);
        let result = self.request(&mut stream, &header, &[], len as usize).await;
        match result {
            Ok(reply) => {
                if reply[0] != STATUS_OK {
                    self.stream = Some(stream);
                    return Err(CoreError::Other(format!(
                        "controller bridge error {} reading {}.{}",
                        reply[0],
                        area_label(area),
                        start
                    )));
                }
                self.stream = Some(stream);
                Ok(reply[1..].to_vec())
            }
            Err(err) => Err(err),
        }
    }

    async fn write_area(&mut self, area: MemoryArea, start: u16, bytes: &[u8])
        -> Result<(), CoreError>
    {
        let mut stream = self.take_stream()?;
        let header = encode_header(OP_WRITE, area, start, bytes.len() as u16);
        let result = self.request(&mut stream, &header, bytes, 0).await;
        match result {
            Ok(reply) => {
                self.stream = Some(stream);
                if reply[0] != STATUS_OK {
                    return Err(CoreError::Other(format!(
                        "controller bridge error {} writing {}.{}",
                        reply[0],
                        area_label(area),
                        start
                    )));
                }
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}
