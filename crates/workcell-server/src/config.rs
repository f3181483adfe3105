//! Configuration for the Workcell server
//!
//! This module contains the configuration types and loading functionality.

use serde::{Deserialize, Serialize};
use std::env;
use tracing::{info, warn};

use crate::error::{ServerError, ServerResult};

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Host to bind to
    #[serde(default = "default_host")]
    pub bind_address: String,

    /// Address of the signal controller bridge
    #[serde(default = "default_plc_address")]
    pub plc_address: String,

    /// Address of the glass door bank
    #[serde(default = "default_door_address")]
    pub door_address: String,

    /// Address of the furnace chamber bank
    #[serde(default = "default_furnace_address")]
    pub furnace_address: String,

    /// Address of the centrifuge
    #[serde(default = "default_centrifuge_address")]
    pub centrifuge_address: String,

    /// Base URL of the dosing platform API
    #[serde(default = "default_dosing_url")]
    pub dosing_base_url: String,

    /// Path of the flow state file
    #[serde(default = "default_state_file")]
    pub state_file: String,

    /// Device poll interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Ceiling on a confirmation wait in seconds; 0 waits indefinitely
    #[serde(default)]
    pub confirm_timeout_secs: u64,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Run against simulated hardware instead of the cell
    #[serde(default)]
    pub simulation: bool,
}

fn default_port() -> u16 {
    8113
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_plc_address() -> String {
    "192.168.0.205:102".to_string()
}

fn default_door_address() -> String {
    "127.0.0.1:49202".to_string()
}

fn default_furnace_address() -> String {
    "127.0.0.1:49206".to_string()
}

fn default_centrifuge_address() -> String {
    "192.168.0.140:8000".to_string()
}

fn default_dosing_url() -> String {
    "http://127.0.0.1:4669".to_string()
}

fn default_state_file() -> String {
    "workcell-flows.json".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn load() -> ServerResult<Self> {
        // Start with defaults
        let mut config = Self::default();

        // Override from environment variables
        if let Ok(port) = env::var("WORKCELL_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                config.port = port;
            } else {
                warn!("Invalid WORKCELL_PORT value: {}", port);
            }
        }

        if let Ok(host) = env::var("WORKCELL_BIND_ADDRESS") {
            config.bind_address = host;
        }

        if let Ok(plc_address) = env::var("WORKCELL_PLC_ADDRESS") {
            config.plc_address = plc_address;
        }

        if let Ok(door_address) = env::var("WORKCELL_DOOR_ADDRESS") {
            config.door_address = door_address;
        }

        if let Ok(furnace_address) = env::var("WORKCELL_FURNACE_ADDRESS") {
            config.furnace_address = furnace_address;
        }

        if let Ok(centrifuge_address) = env::var("WORKCELL_CENTRIFUGE_ADDRESS") {
            config.centrifuge_address = centrifuge_address;
        }

        if let Ok(dosing_base_url) = env::var("WORKCELL_DOSING_URL") {
            config.dosing_base_url = dosing_base_url;
        }

        if let Ok(state_file) = env::var("WORKCELL_STATE_FILE") {
            config.state_file = state_file;
        }

        if let Ok(poll_interval) = env::var("WORKCELL_POLL_INTERVAL_MS") {
            if let Ok(ms) = poll_interval.parse::<u64>() {
                config.poll_interval_ms = ms;
            } else {
                warn!("Invalid WORKCELL_POLL_INTERVAL_MS value: {}", poll_interval);
            }
        }

        if let Ok(confirm_timeout) = env::var("WORKCELL_CONFIRM_TIMEOUT_SECS") {
            if let Ok(secs) = confirm_timeout.parse::<u64>() {
                config.confirm_timeout_secs = secs;
            } else {
                warn!(
                    "Invalid WORKCELL_CONFIRM_TIMEOUT_SECS value: {}",
                    confirm_timeout
                );
            }
        }

        if let Ok(log_level) = env::var("WORKCELL_LOG_LEVEL") {
            config.log_level = log_level;
        }

        if let Ok(simulation) = env::var("WORKCELL_SIMULATION") {
            config.simulation = simulation.to_lowercase() == "true" || simulation == "1";
        }

        // Validate required fields
        if config.dosing_base_url.is_empty() {
            return Err(ServerError::ConfigurationError(
                "Dosing platform URL is required".to_string(),
            ));
        }

        if !config.simulation {
            for (name, value) in [
                ("PLC", &config.plc_address),
                ("door", &config.door_address),
                ("furnace", &config.furnace_address),
                ("centrifuge", &config.centrifuge_address),
            ] {
                if value.is_empty() {
                    return Err(ServerError::ConfigurationError(format!(
                        "{} address is required outside simulation",
                        name
                    )));
                }
            }
        }

        if config.poll_interval_ms == 0 {
            return Err(ServerError::ConfigurationError(
                "Poll interval must be positive".to_string(),
            ));
        }

        info!("Loaded server configuration");
        Ok(config)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: default_host(),
            plc_address: default_plc_address(),
            door_address: default_door_address(),
            furnace_address: default_furnace_address(),
            centrifuge_address: default_centrifuge_address(),
            dosing_base_url: default_dosing_url(),
            state_file: default_state_file(),
            poll_interval_ms: default_poll_interval_ms(),
            confirm_timeout_secs: 0,
            log_level: default_log_level(),
            simulation: false,
        }
    }
}
