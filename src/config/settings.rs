use clap::ArgMatches;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::modbus::frame::MAX_READ_COUNT;
use crate::utils::error::{ModbusError, ModbusResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Server side
    pub server: ServerSettings,

    // Client side
    pub client: ClientSettings,

    // Periodic register sampling
    pub poller: PollerSettings,

    // Live register block on the server bank
    pub telemetry: TelemetrySettings,

    // Where poll events go
    pub output: OutputSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    pub host: String,
    pub port: u16,
    pub timeout_ms: u64,
    pub unit_id: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerSettings {
    pub start_address: u16,
    pub count: u16,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySettings {
    pub enabled: bool,
    pub base_address: u16,
    pub command_address: u16,
    pub update_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSettings {
    pub format: String,
    pub file_path: Option<String>,
    pub append: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 502,
            max_connections: 32,
            idle_timeout_secs: 60,
        }
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 502,
            timeout_ms: 800,
            unit_id: 1,
        }
    }
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            start_address: 9900,
            count: 10,
            poll_interval_ms: 1000,
        }
    }
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            base_address: 9900,
            command_address: 9920,
            update_interval_ms: 1000,
        }
    }
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            format: "console".to_string(),
            file_path: None,
            append: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            client: ClientSettings::default(),
            poller: PollerSettings::default(),
            telemetry: TelemetrySettings::default(),
            output: OutputSettings::default(),
        }
    }
}

impl Config {
    pub fn from_matches(matches: &ArgMatches) -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = match matches.get_one::<String>("config") {
            Some(path) if Path::new(path).exists() => {
                info!("📁 Loading configuration from {}", path);
                Self::from_file(path)?
            }
            Some(path) => {
                warn!("⚠️ Config file {} not found, using defaults", path);
                Self::default()
            }
            None => Self::default(),
        };

        // Command line arguments override the file
        if let Some(host) = matches.get_one::<String>("host") {
            config.server.host = host.clone();
            config.client.host = host.clone();
        }
        if let Some(port) = matches.get_one::<String>("port") {
            let port: u16 = port.parse()?;
            config.server.port = port;
            config.client.port = port;
        }
        if let Some(timeout) = matches.get_one::<String>("timeout") {
            config.client.timeout_ms = timeout.parse()?;
        }
        if let Some(interval) = matches.get_one::<String>("interval") {
            config.poller.poll_interval_ms = interval.parse()?;
        }
        if let Some(unit) = matches.get_one::<String>("unit") {
            config.client.unit_id = unit.parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), Box<dyn std::error::Error>> {
        // Create directory if it doesn't exist
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> ModbusResult<()> {
        if self.poller.count == 0 || self.poller.count > MAX_READ_COUNT {
            return Err(ModbusError::ConfigError(format!(
                "poller.count {} outside 1..={}",
                self.poller.count, MAX_READ_COUNT
            )));
        }
        if self.poller.poll_interval_ms == 0 {
            return Err(ModbusError::ConfigError(
                "poller.poll_interval_ms must be nonzero".to_string(),
            ));
        }
        if self.client.timeout_ms == 0 {
            return Err(ModbusError::ConfigError(
                "client.timeout_ms must be nonzero".to_string(),
            ));
        }
        if self.server.max_connections == 0 {
            return Err(ModbusError::ConfigError(
                "server.max_connections must be nonzero".to_string(),
            ));
        }
        if u32::from(self.telemetry.base_address) + 9 > 65536 {
            return Err(ModbusError::ConfigError(format!(
                "telemetry.base_address {} leaves no room for the register block",
                self.telemetry.base_address
            )));
        }
        Ok(())
    }

    pub fn get_server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn get_client_address(&self) -> String {
        format!("{}:{}", self.client.host, self.client.port)
    }

    pub fn get_poll_range(&self) -> (u16, u16) {
        (self.poller.start_address, self.poller.count)
    }
}
