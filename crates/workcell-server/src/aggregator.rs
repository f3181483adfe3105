//! Aggregate cell status
//!
//! Operator consoles want one answer to "what is the cell doing", not a
//! fan-out over four device endpoints. The aggregator composes the latest
//! device snapshots, the signal controller link state, and every known
//! flow into a single view. It reads caches only, so a wedged device can
//! never stall a status request; staleness is bounded by the poll
//! interval.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use workcell_core::{CellSnapshot, FlowEngine, FlowSnapshot, StatusBoard};
use workcell_devices::{ConnectionState, PlcGateway};

/// One consistent view of the whole cell
#[derive(Debug, Clone, Serialize)]
pub struct AggregateSnapshot {
    /// Link state of the signal controller
    pub plc: ConnectionState,
    /// Latest snapshot per device
    pub devices: CellSnapshot,
    /// Every known flow
    pub flows: Vec<FlowSnapshot>,
    /// When this view was assembled
    pub generated_at: DateTime<Utc>,
}

/// Assembles cell-wide snapshots on demand
pub struct StatusAggregator {
    board: Arc<StatusBoard>,
    gateway: Arc<PlcGateway>,
    engine: Arc<FlowEngine>,
}

impl StatusAggregator {
    /// Aggregator over the given sources
    pub fn new(
        board: Arc<StatusBoard>,
        gateway: Arc<PlcGateway>,
        engine: Arc<FlowEngine>,
    ) -> Self {
        StatusAggregator {
            board,
            gateway,
            engine,
        }
    }

    /// The current view
    pub fn snapshot(&self) -> AggregateSnapshot {
        AggregateSnapshot {
            plc: self.gateway.connection_state(),
            devices: self.board.snapshot(),
            flows: self.engine.list(),
            generated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use workcell_core::domain::device::SlotState;
    use workcell_core::domain::repository::memory::InMemoryFlowStore;
    use workcell_core::domain::signal::SignalCatalog;
    use workcell_core::domain::status::{Connection, DeviceStatus, DoorStatus};
    use workcell_core::{DeviceRegistry, EngineConfig, UnitId};
    use workcell_devices::sim::{SimPlc, SimPlcHandle};

    fn gateway() -> (Arc<PlcGateway>, SimPlcHandle) {
        let (plc, handle) = SimPlc::new();
        let gateway = Arc::new(PlcGateway::new(SignalCatalog::standard(), Box::new(plc)));
        (gateway, handle)
    }

    #[tokio::test]
    async fn test_snapshot_reflects_board_link_and_flows() {
        let board = Arc::new(StatusBoard::new());
        board.publish(DeviceStatus::Door(DoorStatus {
            unit: UnitId(2),
            connection: Connection::Online,
            state: SlotState::Closed,
            last_command: None,
            updated_at: Utc::now(),
        }));
        let (gateway, _handle) = gateway();
        gateway.connect().await.unwrap();
        let engine = Arc::new(FlowEngine::new(
            Arc::new(DeviceRegistry::new()),
            Arc::clone(&board),
            Arc::new(InMemoryFlowStore::new()),
            EngineConfig::default(),
        ));

        let aggregator = StatusAggregator::new(board, gateway, engine);
        let snapshot = aggregator.snapshot();

        assert_eq!(snapshot.plc, ConnectionState::Connected);
        assert!(snapshot.devices.door(UnitId(2)).is_some());
        assert!(snapshot.flows.is_empty());
    }

    #[test]
    fn test_snapshot_serializes_for_the_api() {
        let board = Arc::new(StatusBoard::new());
        let (gateway, _handle) = gateway();
        let engine = Arc::new(FlowEngine::new(
            Arc::new(DeviceRegistry::new()),
            Arc::clone(&board),
            Arc::new(InMemoryFlowStore::new()),
            EngineConfig::default(),
        ));

        let aggregator = StatusAggregator::new(board, gateway, engine);
        let value = serde_json::to_value(aggregator.snapshot()).unwrap();

        assert_eq!(value["plc"], "disconnected");
        assert!(value["devices"].is_object());
        assert!(value["flows"].as_array().unwrap().is_empty());
    }
}
