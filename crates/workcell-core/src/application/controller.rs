//! The seam between the engine and the hardware drivers.
//!
//! The core defines the controller trait; the devices crate implements it
//! once per device kind. A controller owns its physical channel, its local
//! state machine, and the final interlock check before anything goes on the
//! wire.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::device::{CommandAck, DeviceCommand};
use crate::error::CoreError;
use crate::types::DeviceKind;

/// One driver, serving every unit of its device kind
#[async_trait]
pub trait DeviceController: Send + Sync {
    /// The device kind this controller serves
    fn kind(&self) -> DeviceKind;

    /// Validate a command against the device state machine and the safety
    /// policy, then issue it. Returns an acknowledgment; completion is
    /// observed through status polls.
    async fn execute(&self, command: DeviceCommand) -> Result<CommandAck, CoreError>;

    /// Poll the hardware now and publish fresh snapshots
    async fn refresh(&self) -> Result<(), CoreError>;
}

/// Routes commands to the controller registered for their device kind
#[derive(Default)]
pub struct DeviceRegistry {
    controllers: HashMap<DeviceKind, Arc<dyn DeviceController>>,
}

impl DeviceRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a controller, replacing any previous one for its kind
    pub fn register(&mut self, controller: Arc<dyn DeviceController>) {
        self.controllers.insert(controller.kind(), controller);
    }

    /// Look up the controller for a device kind
    pub fn get(&self, kind: DeviceKind) -> Result<Arc<dyn DeviceController>, CoreError> {
        self.controllers.get(&kind).cloned().ok_or_else(|| {
            CoreError::ConfigurationError(format!("no controller registered for {}", kind))
        })
    }

    /// Route one command to its controller
    pub async fn execute(&self, command: DeviceCommand) -> Result<CommandAck, CoreError> {
        let controller = self.get(command.key().kind)?;
        controller.execute(command).await
    }

    /// Every registered kind
    pub fn kinds(&self) -> Vec<DeviceKind> {
        self.controllers.keys().copied().collect()
    }
}
