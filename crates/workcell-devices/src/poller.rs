//! Background polling.
//!
//! One task per registered driver calls `refresh` on a fixed cadence so
//! the status board stays current without request traffic. The drivers
//! publish offline snapshots on failure themselves; the poller only
//! keeps the cadence and the log noise down, warning once per outage
//! and noting the recovery.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use workcell_core::{DeviceController, DeviceRegistry};

/// Cadence devices are polled at unless configured otherwise
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Spawn one polling task per registered controller
pub fn spawn_pollers(registry: &DeviceRegistry, interval: Duration) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    for kind in registry.kinds() {
        if let Ok(controller) = registry.get(kind) {
            handles.push(spawn_poller(controller, interval));
        }
    }
    handles
}

/// Spawn a task polling one controller on a fixed cadence
pub fn spawn_poller(controller: Arc<dyn DeviceController>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut healthy = true;
        loop {
            ticker.tick().await;
            match controller.refresh().await {
                Ok(()) => {
                    if !healthy {
                        healthy = true;
                        info!(device = %controller.kind(), "device polling recovered");
                    }
                }
                Err(err) if healthy => {
                    healthy = false;
                    warn!(device = %controller.kind(), error = %err, "device poll failed");
                }
                Err(err) => {
                    debug!(device = %controller.kind(), error = %err, "device poll still failing");
                }
            }
        }
    })
}
