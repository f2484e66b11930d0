//! SOME/IP Command Dispatcher (§4.C): a thin, generic wrapper that routes a
//! `setActuatorValue` call to a per-actuator typed method on a middleware
//! proxy, translating the proxy's call status into a `CommandStatus`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::clock::Clock;
use crate::command::{
    CommandId, CommandReasonCode, CommandStatus, NotifyCommandStatusCallback, SignalType,
    SignalValue, Timestamp, REASON_CODE_ARGUMENT_TYPE_MISMATCH, REASON_CODE_NOT_SUPPORTED,
    REASON_CODE_OEM_RANGE_START, REASON_CODE_UNAVAILABLE,
};

use super::CommandDispatcher;

/// Per-actuator dispatch closure, bound at wrapper-construction time to the
/// one generated middleware method that accepts this actuator's type.
pub type SomeipActuatorCall = Box<
    dyn Fn(SignalValue, CommandId, Timestamp, u64, NotifyCommandStatusCallback) + Send + Sync,
>;

pub struct SomeipMethodInfo {
    pub signal_type: SignalType,
    pub call: SomeipActuatorCall,
}

/// Generated-middleware-specific glue. A production implementation wraps a
/// CommonAPI-style proxy; this crate ships only the in-process fake used by
/// tests, since no middleware-binding crate is part of the dependency stack.
pub trait SomeipInterfaceWrapper: Send + Sync {
    fn init(&self) -> bool;
    fn supported_actuator_info(&self) -> &HashMap<String, SomeipMethodInfo>;
    /// Whether the underlying proxy is currently reachable. Checked before
    /// every call; a down proxy fails fast with `REASON_CODE_UNAVAILABLE`
    /// rather than invoking the per-actuator method (§4.C).
    fn is_proxy_available(&self) -> bool;
}

/// Maps a middleware call status to a `CommandStatus`/reason-code pair. Any
/// non-success status lands in the OEM reason-code range, offset by the
/// status's own numeric value, so the cloud can distinguish proxy-reported
/// failure modes without the agent needing to know their meaning.
pub fn call_status_to_outcome(status: SomeipCallStatus) -> (CommandStatus, CommandReasonCode) {
    match status {
        SomeipCallStatus::Success => (CommandStatus::Succeeded, 0),
        other => (
            CommandStatus::ExecutionFailed,
            REASON_CODE_OEM_RANGE_START + other as u32,
        ),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SomeipCallStatus {
    Success = 0,
    OutOfMemory = 1,
    NotAvailable = 2,
    ConnectionFailed = 3,
    RemoteError = 4,
    Unknown = 5,
    InvalidValue = 6,
    SubscriptionRefused = 7,
    SerializationError = 8,
}

impl std::fmt::Display for SomeipCallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SomeipCallStatus::Success => "SUCCESS",
            SomeipCallStatus::OutOfMemory => "OUT_OF_MEMORY",
            SomeipCallStatus::NotAvailable => "NOT_AVAILABLE",
            SomeipCallStatus::ConnectionFailed => "CONNECTION_FAILED",
            SomeipCallStatus::RemoteError => "REMOTE_ERROR",
            SomeipCallStatus::Unknown => "UNKNOWN",
            SomeipCallStatus::InvalidValue => "INVALID_VALUE",
            SomeipCallStatus::SubscriptionRefused => "SUBSCRIPTION_REFUSED",
            SomeipCallStatus::SerializationError => "SERIALIZATION_ERROR",
        };
        f.write_str(s)
    }
}

/// Remaining time budget to hand to the middleware call, mirroring the
/// proxy's own timeout parameter: `None` means no timeout, `Some(0)` means
/// the deadline has already passed and the call should fail immediately.
pub fn remaining_timeout_ms(
    issued_timestamp_ms: Timestamp,
    execution_timeout_ms: u64,
    now_ms: u64,
) -> Option<u64> {
    if execution_timeout_ms == 0 {
        return None;
    }
    let deadline = issued_timestamp_ms.saturating_add(execution_timeout_ms);
    Some(deadline.saturating_sub(now_ms))
}

pub struct SomeipCommandDispatcher {
    wrapper: Arc<dyn SomeipInterfaceWrapper>,
}

impl SomeipCommandDispatcher {
    pub fn new(wrapper: Arc<dyn SomeipInterfaceWrapper>) -> Self {
        Self { wrapper }
    }
}

impl CommandDispatcher for SomeipCommandDispatcher {
    fn init(&self) -> bool {
        self.wrapper.init()
    }

    fn set_actuator_value(
        &self,
        actuator_name: &str,
        signal_value: SignalValue,
        command_id: CommandId,
        issued_timestamp_ms: Timestamp,
        execution_timeout_ms: u64,
        mut notify_status: NotifyCommandStatusCallback,
    ) {
        let info = self.wrapper.supported_actuator_info().get(actuator_name);
        let Some(info) = info else {
            notify_status(
                CommandStatus::ExecutionFailed,
                REASON_CODE_NOT_SUPPORTED,
                format!("actuator '{actuator_name}' has no registered SOME/IP method"),
            );
            return;
        };

        if signal_value.signal_type() != info.signal_type {
            notify_status(
                CommandStatus::ExecutionFailed,
                REASON_CODE_ARGUMENT_TYPE_MISMATCH,
                format!(
                    "expected {:?}, got {:?}",
                    info.signal_type,
                    signal_value.signal_type()
                ),
            );
            return;
        }

        if !self.wrapper.is_proxy_available() {
            notify_status(
                CommandStatus::ExecutionFailed,
                REASON_CODE_UNAVAILABLE,
                format!("SOME/IP proxy for '{actuator_name}' is not currently available"),
            );
            return;
        }

        debug!(%command_id, actuator_name, "dispatching SOME/IP actuator call");
        (info.call)(
            signal_value,
            command_id,
            issued_timestamp_ms,
            execution_timeout_ms,
            notify_status,
        );
    }

    fn actuator_names(&self) -> Vec<String> {
        self.wrapper
            .supported_actuator_info()
            .keys()
            .cloned()
            .collect()
    }
}

/// In-process test/local-run double. Each actuator is registered with a
/// clock-aware closure that looks up a scripted response and invokes the
/// status callback synchronously, the way a loopback middleware call would.
pub struct FakeSomeipInterfaceWrapper {
    actuators: HashMap<String, SomeipMethodInfo>,
    available: AtomicBool,
}

impl FakeSomeipInterfaceWrapper {
    pub fn builder() -> FakeSomeipInterfaceWrapperBuilder {
        FakeSomeipInterfaceWrapperBuilder {
            actuators: HashMap::new(),
            available: true,
        }
    }

    /// Flips proxy reachability at runtime, e.g. to simulate the proxy
    /// going down mid-test.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

impl SomeipInterfaceWrapper for FakeSomeipInterfaceWrapper {
    fn init(&self) -> bool {
        true
    }

    fn supported_actuator_info(&self) -> &HashMap<String, SomeipMethodInfo> {
        &self.actuators
    }

    fn is_proxy_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}

pub struct FakeSomeipInterfaceWrapperBuilder {
    actuators: HashMap<String, SomeipMethodInfo>,
    available: bool,
}

impl FakeSomeipInterfaceWrapperBuilder {
    /// Registers an actuator whose scripted outcome is read from `script`
    /// each time it is called, and whose observed calls are appended to
    /// `calls` for assertions.
    pub fn with_actuator(
        mut self,
        name: &str,
        signal_type: SignalType,
        script: Arc<Mutex<SomeipCallStatus>>,
        calls: Arc<Mutex<Vec<CommandId>>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let call: SomeipActuatorCall = Box::new(move |_value, command_id, issued, timeout, mut notify| {
            calls.lock().expect("calls mutex poisoned").push(command_id);
            let remaining = remaining_timeout_ms(issued, timeout, clock.now_ms());
            let status = if remaining == Some(0) {
                SomeipCallStatus::ConnectionFailed
            } else {
                *script.lock().expect("script mutex poisoned")
            };
            let (command_status, reason_code) = call_status_to_outcome(status);
            notify(command_status, reason_code, status.to_string());
        });
        self.actuators.insert(
            name.to_string(),
            SomeipMethodInfo { signal_type, call },
        );
        self
    }

    /// Starts the built wrapper with the proxy reported as unavailable,
    /// so `set_actuator_value` fails fast with `REASON_CODE_UNAVAILABLE`
    /// until `set_available(true)` is called.
    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn build(self) -> Arc<FakeSomeipInterfaceWrapper> {
        Arc::new(FakeSomeipInterfaceWrapper {
            actuators: self.actuators,
            available: AtomicBool::new(self.available),
        })
    }
}
