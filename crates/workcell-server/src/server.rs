//! Main Workcell server implementation
//!
//! This module contains the WorkcellServer implementation. The server
//! owns the assembled components and exposes the operations the API
//! handlers call; assembly itself lives in the crate root so tests can
//! build a server against simulated devices.

use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

use workcell_core::{
    CellSnapshot, CommandAck, DeviceCommand, DeviceRegistry, ExperimentDefinition, FlowEngine,
    FlowId, FlowParams, FlowSnapshot, RecoveryMode, StatusBoard, Task, TaskId,
};
use workcell_devices::{ConnectionState, PlcGateway};

use crate::aggregator::{AggregateSnapshot, StatusAggregator};
use crate::config::ServerConfig;
use crate::coordinator::{TaskCoordinator, TaskView};
use crate::dosing::{DosingPlatform, StartOptions};
use crate::error::ServerResult;

/// Main server implementation
#[derive(Clone)]
pub struct WorkcellServer {
    /// Configuration
    pub config: ServerConfig,

    /// Controllers by device kind
    registry: Arc<DeviceRegistry>,

    /// Latest device snapshots
    board: Arc<StatusBoard>,

    /// Signal controller gateway
    gateway: Arc<PlcGateway>,

    /// Transfer flow engine
    engine: Arc<FlowEngine>,

    /// Dosing platform client
    dosing: Arc<dyn DosingPlatform>,

    /// Experiment task coordinator
    coordinator: TaskCoordinator,

    /// Cell-wide status composition
    aggregator: Arc<StatusAggregator>,
}

/// Manual Debug implementation that doesn't try to debug the components
impl std::fmt::Debug for WorkcellServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkcellServer")
            .field("config", &self.config)
            .finish()
    }
}

impl WorkcellServer {
    /// Create a new WorkcellServer from assembled components
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ServerConfig,
        registry: Arc<DeviceRegistry>,
        board: Arc<StatusBoard>,
        gateway: Arc<PlcGateway>,
        engine: Arc<FlowEngine>,
        dosing: Arc<dyn DosingPlatform>,
        coordinator: TaskCoordinator,
        aggregator: Arc<StatusAggregator>,
    ) -> Self {
        Self {
            config,
            registry,
            board,
            gateway,
            engine,
            dosing,
            coordinator,
            aggregator,
        }
    }

    /// Run the server
    pub async fn run(self) -> ServerResult<()> {
        info!("Starting Workcell server");

        // Build the API router
        let app = crate::api::build_router(Arc::new(self.clone()));

        // Create and bind the TCP listener
        let addr = format!("{}:{}", self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Listening on {}", local_addr);

        // Run the server until a shutdown signal arrives
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        self.gateway.disconnect().await;
        info!("Workcell server stopped");
        Ok(())
    }

    /// Latest snapshot of every device
    pub fn cell_snapshot(&self) -> CellSnapshot {
        self.board.snapshot()
    }

    /// Link state of the signal controller
    pub fn plc_state(&self) -> ConnectionState {
        self.gateway.connection_state()
    }

    /// Issue one manual device command
    pub async fn execute_device_command(&self, command: DeviceCommand) -> ServerResult<CommandAck> {
        let ack = self.registry.execute(command).await?;
        Ok(ack)
    }

    /// Start a transfer flow
    pub async fn start_flow(&self, params: FlowParams) -> ServerResult<FlowId> {
        let flow_id = self.engine.start(params).await?;
        Ok(flow_id)
    }

    /// Confirm a flow checkpoint
    pub async fn confirm_flow(&self, flow_id: &FlowId) -> ServerResult<()> {
        self.engine.confirm(flow_id).await?;
        Ok(())
    }

    /// Pause a flow
    pub async fn pause_flow(&self, flow_id: &FlowId) -> ServerResult<()> {
        self.engine.pause(flow_id).await?;
        Ok(())
    }

    /// Resume a suspended flow with the chosen recovery mode
    pub async fn resume_flow(&self, flow_id: &FlowId, mode: RecoveryMode) -> ServerResult<()> {
        self.engine.resume(flow_id, mode).await?;
        Ok(())
    }

    /// Cancel a flow
    pub async fn cancel_flow(&self, flow_id: &FlowId) -> ServerResult<()> {
        self.engine.cancel(flow_id).await?;
        Ok(())
    }

    /// One flow snapshot
    pub fn get_flow(&self, flow_id: &FlowId) -> ServerResult<FlowSnapshot> {
        let snapshot = self.engine.get(flow_id)?;
        Ok(snapshot)
    }

    /// Every known flow
    pub fn list_flows(&self) -> Vec<FlowSnapshot> {
        self.engine.list()
    }

    /// Upload an experiment as a new task
    pub async fn upload_task(&self, definition: ExperimentDefinition) -> ServerResult<Task> {
        self.coordinator.upload(definition).await
    }

    /// Start or restart a task
    pub async fn start_task(&self, task_id: &TaskId, options: StartOptions) -> ServerResult<Task> {
        self.coordinator.start(task_id, options).await
    }

    /// Stop a running task
    pub async fn stop_task(&self, task_id: &TaskId) -> ServerResult<Task> {
        self.coordinator.stop(task_id).await
    }

    /// Cancel a task
    pub async fn cancel_task(&self, task_id: &TaskId) -> ServerResult<Task> {
        self.coordinator.cancel(task_id).await
    }

    /// One task with its flows and remote detail
    pub fn task_view(&self, task_id: &TaskId) -> ServerResult<TaskView> {
        self.coordinator.view(task_id)
    }

    /// Every known task
    pub fn list_tasks(&self) -> Vec<Task> {
        self.coordinator.list()
    }

    /// The aggregate cell view
    pub fn aggregate_snapshot(&self) -> AggregateSnapshot {
        self.aggregator.snapshot()
    }

    /// Probe the dosing platform
    pub async fn check_dosing_health(&self) -> ServerResult<bool> {
        let healthy = self.dosing.health_check().await?;
        Ok(healthy)
    }
}

/// Resolve when the process is asked to stop
async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(err) => {
            warn!(error = %err, "cannot listen for shutdown signals");
            // Without a signal source the server runs until killed.
            std::future::pending::<()>().await;
        }
    }
}
