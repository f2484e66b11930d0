//! Process entry point (§6.1): loads `AgentConfig`, wires the buffer
//! manager, CAN dispatcher, SOME/IP dispatcher (fake, for local runs), the
//! actuator command manager, and the ingress parser together, then serves
//! the minimal TCP transport adapter until shutdown.

use std::collections::HashMap;
use std::sync::Arc;

use fleetbridge::buffer::BufferManager;
use fleetbridge::clock::SystemClock;
use fleetbridge::command::SignalType;
use fleetbridge::config::AgentConfig;
use fleetbridge::dispatcher::can::{CanCommandDispatcher, CommandConfig, FakeCanTransport};
use fleetbridge::dispatcher::someip::{FakeSomeipInterfaceWrapper, SomeipCallStatus, SomeipCommandDispatcher};
use fleetbridge::egress::ResponseEgress;
use fleetbridge::ingress::Ingress;
use fleetbridge::manager::ActuatorCommandManager;
use fleetbridge::transport;
use tracing::{error, info};

const CONFIG_PATH_ENV: &str = "FLEETBRIDGE_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "fleetbridge.toml";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = match AgentConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %config_path, error = %e, "failed to load config, falling back to defaults");
            default_config()
        }
    };

    let clock = Arc::new(SystemClock);
    let buffer_manager = BufferManager::new(config.buffer.clone());

    let (egress, egress_rx) = ResponseEgress::channel(256);
    let manager = ActuatorCommandManager::new(
        config.command_manager.max_concurrent_command_requests,
        egress,
        buffer_manager.clone(),
        clock.clone(),
    );

    let can_actuators: HashMap<String, CommandConfig> = config
        .can
        .actuators
        .iter()
        .map(|(name, entry)| {
            (
                name.clone(),
                CommandConfig {
                    can_request_id: entry.can_request_id,
                    can_response_id: entry.can_response_id,
                    signal_type: entry.signal_type,
                },
            )
        })
        .collect();
    let can_transport = FakeCanTransport::new();
    let can_dispatcher = Arc::new(CanCommandDispatcher::new(
        can_actuators,
        can_transport,
        buffer_manager.clone(),
        clock.clone(),
        tokio::runtime::Handle::current(),
    ));
    manager.register_dispatcher("can", can_dispatcher);

    // No real vsomeip/CommonAPI binding ships with this crate (§1
    // Non-goals); the fake proxy lets the manager exercise the SOME/IP
    // interface contract end to end in local runs.
    let someip_wrapper = FakeSomeipInterfaceWrapper::builder()
        .with_actuator(
            "Vehicle.hvac.fanSpeed",
            SignalType::UInt8,
            Arc::new(std::sync::Mutex::new(SomeipCallStatus::Success)),
            Arc::new(std::sync::Mutex::new(Vec::new())),
            clock.clone(),
        )
        .build();
    let someip_dispatcher = Arc::new(SomeipCommandDispatcher::new(someip_wrapper));
    manager.register_dispatcher("someip", someip_dispatcher);

    manager.start()?;
    info!("actuator command manager started");

    let ingress = Arc::new(Ingress::new(config.ingress, buffer_manager, clock));

    let result = transport::serve(&config.listen_addr, ingress, manager.clone(), egress_rx).await;
    manager.stop();
    result.map_err(Into::into)
}

fn default_config() -> AgentConfig {
    toml::from_str(
        r#"
        [can]
        interface_name = "can0"
        "#,
    )
    .expect("embedded default config is valid TOML")
}
