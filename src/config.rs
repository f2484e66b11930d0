//! Process configuration (§1.1, §3.1): a single TOML file loaded once at
//! startup by the binaries. Library code never reads the filesystem or
//! environment directly — it only ever sees already-parsed config structs.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::buffer::{BufferManagerConfig, SignalConfig};
use crate::command::SignalType;
use crate::ingress::IngressConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Read(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandConfigEntry {
    pub can_request_id: u32,
    pub can_response_id: u32,
    pub signal_type: SignalType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanDispatcherConfig {
    pub interface_name: String,
    #[serde(default)]
    pub actuators: HashMap<String, CommandConfigEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandManagerConfig {
    pub max_concurrent_command_requests: usize,
}

impl Default for CommandManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_command_requests: 64,
        }
    }
}

fn default_signal_config() -> SignalConfig {
    SignalConfig {
        reserved_bytes: 0,
        max_samples: 256,
        max_bytes_per_sample: 1 << 20,
        max_bytes: 16 << 20,
    }
}

fn default_buffer_config() -> BufferManagerConfig {
    BufferManagerConfig {
        max_overall_bytes: 256 << 20,
        default_signal_config: default_signal_config(),
        overrides: HashMap::new(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_buffer_config")]
    pub buffer: BufferManagerConfig,
    pub can: CanDispatcherConfig,
    #[serde(default)]
    pub command_manager: CommandManagerConfig,
    #[serde(default)]
    pub ingress: IngressConfig,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

fn default_listen_addr() -> String {
    "127.0.0.1:7878".to_string()
}

impl AgentConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.display().to_string(), e))?;
        Ok(toml::from_str(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_config() {
        let toml_src = r#"
            listen_addr = "127.0.0.1:9000"

            [can]
            interface_name = "can0"

            [can.actuators.Vehicle_actuator6]
            can_request_id = 0x600
            can_response_id = 0x601
            signal_type = "Int32"

            [command_manager]
            max_concurrent_command_requests = 32

            [ingress]
            max_payload_bytes = 1048576
        "#;
        let config: AgentConfig = toml::from_str(toml_src).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9000");
        assert_eq!(config.can.interface_name, "can0");
        assert_eq!(config.command_manager.max_concurrent_command_requests, 32);
        assert_eq!(config.ingress.max_payload_bytes, 1_048_576);
        let actuator = &config.can.actuators["Vehicle_actuator6"];
        assert_eq!(actuator.can_request_id, 0x600);
    }

    #[test]
    fn missing_optional_sections_fall_back_to_defaults() {
        let toml_src = r#"
            [can]
            interface_name = "can0"
        "#;
        let config: AgentConfig = toml::from_str(toml_src).unwrap();
        assert_eq!(config.buffer.max_overall_bytes, 256 << 20);
        assert_eq!(config.command_manager.max_concurrent_command_requests, 64);
        assert_eq!(config.listen_addr, "127.0.0.1:7878");
    }
}
