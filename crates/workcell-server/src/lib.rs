//!
//! Workcell Server - Control server for the Workcell orchestration platform
//!
//! This module exports all the components of the Workcell server.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use workcell_core::domain::signal::SignalCatalog;
use workcell_core::{DeviceRegistry, EngineConfig, FlowEngine, InterlockGate, StatusBoard};
use workcell_devices::{
    spawn_pollers, CentrifugeController, DoorController, FrameTransport, FurnaceController,
    PlcGateway, RobotController, SimCentrifuge, SimDoorBank, SimFrameBus, SimFurnaceBank, SimPlc,
    TcpFrameTransport, TcpPlcTransport,
};
use workcell_state_file::FileFlowStore;

/// Aggregate status module
pub mod aggregator;

/// API module
pub mod api;

/// Configuration module
pub mod config;

/// Task coordination module
pub mod coordinator;

/// Dosing platform client module
pub mod dosing;

/// Error module
pub mod error;

/// Server module
pub mod server;

// Re-export key types
pub use config::ServerConfig;
pub use coordinator::{TaskCoordinator, TaskView};
pub use dosing::{DosingPlatform, StartOptions};
pub use error::{ServerError, ServerResult};
pub use server::WorkcellServer;

use dosing::http::HttpDosingClient;

/// Run function
pub async fn run(config: ServerConfig) -> ServerResult<()> {
    // Initialize logging
    init_logging(&config);

    // Assemble and run the server
    let server = build_server(config).await?;
    server.run().await
}

/// Initialize logging
fn init_logging(config: &ServerConfig) {
    use tracing_subscriber::{fmt, EnvFilter};

    // Create filter based on config
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    // Initialize subscriber
    fmt().with_env_filter(filter).with_target(true).init();
}

/// Assemble a server from the configuration.
///
/// With `simulation` set the cell runs against in-process device models,
/// which is what the integration tests use; otherwise the transports
/// dial the configured addresses. Either way the pollers and the signal
/// controller reconnect task are left running for the life of the
/// process.
pub async fn build_server(config: ServerConfig) -> ServerResult<WorkcellServer> {
    let board = Arc::new(StatusBoard::new());
    let gate = InterlockGate::new(Arc::clone(&board));

    // Pick transports for the configured cell.
    let (gateway, door_bus, furnace_bus, centrifuge_bus) = if config.simulation {
        info!("Using simulated devices");
        let (plc, plc_handle) = SimPlc::new();
        // A zeroed controller image reads as "not ready"; report the
        // robot idle at home so the cell starts parked.
        plc_handle.set_db_word(1, 242, 1);
        plc_handle.set_db_bit(1, 218, 0, true);
        let doors = SimDoorBank::new();
        let (door_bus, _door_handle) = SimFrameBus::new(doors.responder());
        let furnaces = SimFurnaceBank::new();
        let (furnace_bus, _furnace_handle) = SimFrameBus::new(furnaces.responder());
        let centrifuge = SimCentrifuge::new();
        let (centrifuge_bus, _centrifuge_handle) = SimFrameBus::new(centrifuge.responder());
        (
            Arc::new(PlcGateway::new(SignalCatalog::standard(), Box::new(plc))),
            Box::new(door_bus) as Box<dyn FrameTransport>,
            Box::new(furnace_bus) as Box<dyn FrameTransport>,
            Box::new(centrifuge_bus) as Box<dyn FrameTransport>,
        )
    } else {
        info!(
            plc = %config.plc_address,
            "Using hardware transports"
        );
        (
            Arc::new(PlcGateway::new(
                SignalCatalog::standard(),
                Box::new(TcpPlcTransport::new(config.plc_address.as_str())),
            )),
            Box::new(TcpFrameTransport::new(config.door_address.as_str()))
                as Box<dyn FrameTransport>,
            Box::new(TcpFrameTransport::new(config.furnace_address.as_str()))
                as Box<dyn FrameTransport>,
            Box::new(TcpFrameTransport::new(config.centrifuge_address.as_str()))
                as Box<dyn FrameTransport>,
        )
    };

    // One controller per device kind, all over the shared board and gate.
    let mut registry = DeviceRegistry::new();
    registry.register(Arc::new(DoorController::new(
        door_bus,
        Arc::clone(&board),
        gate.clone(),
    )));
    registry.register(Arc::new(FurnaceController::new(
        furnace_bus,
        Arc::clone(&board),
        gate.clone(),
    )));
    registry.register(Arc::new(CentrifugeController::new(
        centrifuge_bus,
        Arc::clone(&board),
        gate.clone(),
    )));
    registry.register(Arc::new(RobotController::new(
        Arc::clone(&gateway),
        Arc::clone(&board),
        gate,
    )));
    let registry = Arc::new(registry);

    // Bring the signal link up; failures here are routine on a cold
    // cell, the reconnect task keeps trying.
    if let Err(err) = gateway.connect().await {
        warn!(error = %err, "signal controller not reachable yet");
    }
    Arc::clone(&gateway).spawn_reconnect();

    // Seed the board before anything consults the interlock policy;
    // unknown statuses read as unsafe and would refuse every command.
    for kind in registry.kinds() {
        if let Ok(controller) = registry.get(kind) {
            if let Err(err) = controller.refresh().await {
                warn!(device = %kind, error = %err, "initial status poll failed");
            }
        }
    }
    spawn_pollers(&registry, Duration::from_millis(config.poll_interval_ms));

    // Flow engine over the persisted store.
    let store = Arc::new(FileFlowStore::new(&config.state_file));
    let engine_config = EngineConfig {
        confirm_timeout: match config.confirm_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        },
        ..EngineConfig::default()
    };
    let engine = Arc::new(FlowEngine::new(
        Arc::clone(&registry),
        Arc::clone(&board),
        store,
        engine_config,
    ));
    match engine.restore().await {
        Ok(0) => {}
        Ok(restored) => info!(restored, "suspended flows restored from disk"),
        Err(err) => warn!(error = %err, "flow state restore failed; starting empty"),
    }

    // Dosing platform client and the coordinator over it.
    let dosing: Arc<dyn DosingPlatform> =
        Arc::new(HttpDosingClient::new(config.dosing_base_url.clone())?);
    let coordinator = TaskCoordinator::new(Arc::clone(&dosing), Arc::clone(&engine));
    let aggregator = Arc::new(aggregator::StatusAggregator::new(
        Arc::clone(&board),
        Arc::clone(&gateway),
        Arc::clone(&engine),
    ));

    Ok(WorkcellServer::new(
        config,
        registry,
        board,
        gateway,
        engine,
        dosing,
        coordinator,
        aggregator,
    ))
}
