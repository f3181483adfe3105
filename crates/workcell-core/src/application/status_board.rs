//! Latest-status fan-out.
//!
//! Each device key gets one `tokio::sync::watch` channel: the owning driver
//! is the single writer, everyone else reads or subscribes. The board also
//! backs the interlock gate, so policy decisions always see one coherent
//! snapshot.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::watch;

use crate::domain::device::DeviceCommand;
use crate::domain::interlock::{self, Decision};
use crate::domain::status::{CellSnapshot, DeviceStatus};
use crate::error::CoreError;
use crate::types::DeviceKey;

/// Publish/subscribe board of the latest snapshot per device key
#[derive(Default)]
pub struct StatusBoard {
    channels: DashMap<DeviceKey, watch::Sender<DeviceStatus>>,
}

impl StatusBoard {
    /// Empty board
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish one snapshot, creating the key's channel on first publish.
    /// One driver owns each key; concurrent writers to the same key are a
    /// wiring bug.
    pub fn publish(&self, status: DeviceStatus) {
        let key = status.key();
        match self.channels.entry(key) {
            Entry::Occupied(entry) => {
                entry.get().send_replace(status);
            }
            Entry::Vacant(entry) => {
                let (tx, _rx) = watch::channel(status);
                entry.insert(tx);
            }
        }
    }

    /// Latest snapshot for one key
    pub fn get(&self, key: &DeviceKey) -> Option<DeviceStatus> {
        self.channels.get(key).map(|tx| tx.borrow().clone())
    }

    /// Subscribe to one key's updates; `None` until its first publish
    pub fn subscribe(&self, key: &DeviceKey) -> Option<watch::Receiver<DeviceStatus>> {
        self.channels.get(key).map(|tx| tx.subscribe())
    }

    /// One coherent snapshot across every published key
    pub fn snapshot(&self) -> CellSnapshot {
        let mut snapshot = CellSnapshot::new();
        for entry in self.channels.iter() {
            snapshot.put(entry.value().borrow().clone());
        }
        snapshot
    }

    /// Every key that has published at least once
    pub fn keys(&self) -> Vec<DeviceKey> {
        self.channels.iter().map(|entry| *entry.key()).collect()
    }
}

/// The drivers' view of the safety policy.
///
/// `check` takes a fresh board snapshot per call; decisions are never
/// cached across calls.
#[derive(Clone)]
pub struct InterlockGate {
    board: Arc<StatusBoard>,
}

impl InterlockGate {
    /// Gate over a shared board
    pub fn new(board: Arc<StatusBoard>) -> Self {
        InterlockGate { board }
    }

    /// Evaluate the policy for one command
    pub fn decide(&self, command: &DeviceCommand) -> Decision {
        interlock::evaluate(&self.board.snapshot(), command)
    }

    /// Policy check as a driver-layer result
    pub fn check(&self, command: &DeviceCommand) -> Result<(), CoreError> {
        self.decide(command).into_result()
    }
}
