//! The capability interface implemented by every vehicle-network backend
//! (§4.B, §4.C, §9 "Dynamic dispatch"). The manager stores a heterogeneous
//! map of these behind `Arc<dyn CommandDispatcher>`; no inheritance, just a
//! shared trait object.

pub mod can;
pub mod someip;

use crate::command::{CommandId, NotifyCommandStatusCallback, SignalValue, Timestamp};

pub trait CommandDispatcher: Send + Sync {
    /// Initializes the dispatcher's underlying vehicle network/service.
    /// A failed init is fatal to the manager's worker loop (§4.D).
    fn init(&self) -> bool;

    /// Dispatches a single actuator write. `notify_status` may be invoked
    /// zero or more times with `IN_PROGRESS`, then at most once with a
    /// terminal status (§6).
    fn set_actuator_value(
        &self,
        actuator_name: &str,
        signal_value: SignalValue,
        command_id: CommandId,
        issued_timestamp_ms: Timestamp,
        execution_timeout_ms: u64,
        notify_status: NotifyCommandStatusCallback,
    );

    /// Actuator names this dispatcher can route to, used to pre-size raw
    /// data buffers for STRING-typed actuators (§6).
    fn actuator_names(&self) -> Vec<String>;
}
