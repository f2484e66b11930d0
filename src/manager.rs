//! Actuator Command Manager (§4.D): the single point that validates a
//! command against the active decoder manifest, routes it to the dispatcher
//! registered for its interface, enforces the deadline one last time before
//! handoff, and funnels every outcome onto the response egress queue.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, error, info, warn};

use crate::buffer::{BufferManager, UsageStage};
use crate::clock::Clock;
use crate::command::{
    ActuatorCommandRequest, CommandResponse, CommandStatus, InterfaceId,
    SignalIdToCustomSignalDecoderFormatMap, SignalValue, REASON_CODE_DECODER_MANIFEST_OUT_OF_SYNC,
    REASON_CODE_NO_COMMAND_DISPATCHER_FOUND, REASON_CODE_NO_DECODING_RULES_FOUND,
    REASON_CODE_TIMED_OUT_BEFORE_DISPATCH,
};
use crate::dispatcher::CommandDispatcher;
use crate::egress::ResponseEgress;
use crate::error::CommandManagerError;

struct DecoderManifestState {
    decoder_manifest_id: String,
    map: SignalIdToCustomSignalDecoderFormatMap,
}

struct Queue {
    pending: Mutex<VecDeque<ActuatorCommandRequest>>,
    not_empty: Condvar,
    capacity: usize,
    in_queue: AtomicUsize,
}

impl Queue {
    fn new(capacity: usize) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            capacity,
            in_queue: AtomicUsize::new(0),
        }
    }

    /// Returns true if the request was enqueued. False means the queue was
    /// full and the request was dropped (§4.D, §7: no response is
    /// synthesized for this — it is an inbound-backpressure decision).
    fn push(&self, req: ActuatorCommandRequest) -> bool {
        let mut pending = self.pending.lock().expect("command queue mutex poisoned");
        if pending.len() >= self.capacity {
            return false;
        }
        pending.push_back(req);
        self.in_queue.store(pending.len(), Ordering::Relaxed);
        self.not_empty.notify_one();
        true
    }

    fn pop_blocking(&self, shutdown: &AtomicBool) -> Option<ActuatorCommandRequest> {
        let mut pending = self.pending.lock().expect("command queue mutex poisoned");
        loop {
            if let Some(req) = pending.pop_front() {
                self.in_queue.store(pending.len(), Ordering::Relaxed);
                return Some(req);
            }
            if shutdown.load(Ordering::SeqCst) {
                return None;
            }
            pending = self
                .not_empty
                .wait(pending)
                .expect("command queue mutex poisoned");
        }
    }
}

struct Inner {
    dispatchers: Mutex<HashMap<InterfaceId, Arc<dyn CommandDispatcher>>>,
    decoder_state: Mutex<Option<DecoderManifestState>>,
    queue: Queue,
    shutdown: AtomicBool,
    egress: ResponseEgress,
    buffer_manager: BufferManager,
    clock: Arc<dyn Clock>,
}

/// Thread-safe, cheaply cloneable handle to the actuator command manager.
#[derive(Clone)]
pub struct ActuatorCommandManager {
    inner: Arc<Inner>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ActuatorCommandManager {
    pub fn new(
        max_concurrent_command_requests: usize,
        egress: ResponseEgress,
        buffer_manager: BufferManager,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                dispatchers: Mutex::new(HashMap::new()),
                decoder_state: Mutex::new(None),
                queue: Queue::new(max_concurrent_command_requests),
                shutdown: AtomicBool::new(false),
                egress,
                buffer_manager,
                clock,
            }),
            worker: Arc::new(Mutex::new(None)),
        }
    }

    /// Inserts a dispatcher for `interface_id`. Returns false on duplicate
    /// registration, matching the source's reject-not-replace behavior.
    pub fn register_dispatcher(
        &self,
        interface_id: impl Into<InterfaceId>,
        dispatcher: Arc<dyn CommandDispatcher>,
    ) -> bool {
        let mut dispatchers = self
            .inner
            .dispatchers
            .lock()
            .expect("dispatcher map mutex poisoned");
        match dispatchers.entry(interface_id.into()) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(v) => {
                v.insert(dispatcher);
                true
            }
        }
    }

    pub fn get_actuator_names(&self) -> HashMap<InterfaceId, Vec<String>> {
        let dispatchers = self
            .inner
            .dispatchers
            .lock()
            .expect("dispatcher map mutex poisoned");
        dispatchers
            .iter()
            .map(|(interface_id, dispatcher)| (interface_id.clone(), dispatcher.actuator_names()))
            .collect()
    }

    /// Fast, non-blocking. Drops and logs on a full queue; never blocks the
    /// caller (ingress or transport thread) on the worker's pace.
    pub fn on_receiving_command_request(&self, req: ActuatorCommandRequest) {
        let command_id = req.command_id.clone();
        if !self.inner.queue.push(req) {
            warn!(%command_id, "command queue is full, dropping inbound request");
        }
    }

    pub fn on_change_of_custom_signal_decoder_format_map(
        &self,
        decoder_manifest_id: String,
        map: SignalIdToCustomSignalDecoderFormatMap,
    ) {
        let mut state = self
            .inner
            .decoder_state
            .lock()
            .expect("decoder state mutex poisoned");
        *state = Some(DecoderManifestState {
            decoder_manifest_id,
            map,
        });
    }

    /// Starts the worker thread. Fails if a dispatcher's `init()` returns
    /// false (§4.D "a failed init is fatal").
    pub fn start(&self) -> Result<(), CommandManagerError> {
        let mut worker = self.worker.lock().expect("worker handle mutex poisoned");
        if worker.is_some() {
            return Ok(());
        }

        let dispatchers = self
            .inner
            .dispatchers
            .lock()
            .expect("dispatcher map mutex poisoned")
            .clone();
        for (interface_id, dispatcher) in &dispatchers {
            if !dispatcher.init() {
                error!(%interface_id, "dispatcher failed to initialize");
                return Err(CommandManagerError::DispatcherInitFailed(interface_id.clone()));
            }
            info!(%interface_id, "dispatcher initialized");
        }

        self.inner.shutdown.store(false, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        *worker = Some(std::thread::spawn(move || worker_loop(inner)));
        Ok(())
    }

    pub fn stop(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        {
            // Wake the worker even if the queue is empty.
            let _pending = self
                .inner
                .queue
                .pending
                .lock()
                .expect("command queue mutex poisoned");
            self.inner.queue.not_empty.notify_all();
        }
        let handle = self.worker.lock().expect("worker handle mutex poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        self.inner.shutdown.store(false, Ordering::SeqCst);
    }
}

fn worker_loop(inner: Arc<Inner>) {
    while let Some(req) = inner.queue.pop_blocking(&inner.shutdown) {
        process_command_request(&inner, req);
    }
}

/// §4.D decision tree. Every branch produces exactly one response, except
/// the final branch, which hands off to the dispatcher; the dispatcher's
/// callback (via `queue_command_response`) produces the eventual response(s).
/// All branches — fast-fail and dispatched alike — funnel through
/// `queue_command_response`, which is the single place that decrements a
/// STRING argument's `UPLOADING` hint, matching the source's
/// `queueCommandResponse` being invoked on every branch.
fn process_command_request(inner: &Arc<Inner>, req: ActuatorCommandRequest) {
    let string_handle = match &req.signal_value {
        SignalValue::String { type_id, handle } => Some((*type_id, *handle)),
        _ => None,
    };

    let state = inner
        .decoder_state
        .lock()
        .expect("decoder state mutex poisoned");

    let Some(state) = state.as_ref() else {
        drop(state);
        queue_command_response(
            inner,
            &req.command_id,
            string_handle,
            CommandStatus::ExecutionFailed,
            REASON_CODE_DECODER_MANIFEST_OUT_OF_SYNC,
            "no decoder manifest has been configured".to_string(),
        );
        return;
    };

    if req.decoder_manifest_id != state.decoder_manifest_id {
        let got = req.decoder_manifest_id.clone();
        drop(state);
        queue_command_response(
            inner,
            &req.command_id,
            string_handle,
            CommandStatus::ExecutionFailed,
            REASON_CODE_DECODER_MANIFEST_OUT_OF_SYNC,
            format!("request carries manifest '{got}', active manifest differs"),
        );
        return;
    }

    let Some(decoder) = state.map.get(&req.signal_id).cloned() else {
        drop(state);
        queue_command_response(
            inner,
            &req.command_id,
            string_handle,
            CommandStatus::ExecutionFailed,
            REASON_CODE_NO_DECODING_RULES_FOUND,
            format!("no decoding rule for signal {}", req.signal_id),
        );
        return;
    };
    drop(state);

    let dispatcher = {
        let dispatchers = inner
            .dispatchers
            .lock()
            .expect("dispatcher map mutex poisoned");
        dispatchers.get(&decoder.interface_id).cloned()
    };
    let Some(dispatcher) = dispatcher else {
        queue_command_response(
            inner,
            &req.command_id,
            string_handle,
            CommandStatus::ExecutionFailed,
            REASON_CODE_NO_COMMAND_DISPATCHER_FOUND,
            format!("no dispatcher registered for interface '{}'", decoder.interface_id),
        );
        return;
    };

    let now = inner.clock.now_ms();
    if req.execution_timeout_ms > 0 && now >= req.issued_timestamp_ms + req.execution_timeout_ms {
        queue_command_response(
            inner,
            &req.command_id,
            string_handle,
            CommandStatus::ExecutionTimeout,
            REASON_CODE_TIMED_OUT_BEFORE_DISPATCH,
            "deadline already passed before dispatch".to_string(),
        );
        return;
    }

    let inner_for_notify = Arc::clone(inner);
    let command_id = req.command_id.clone();

    let notify = Box::new(move |status: CommandStatus, reason_code, reason_description: String| {
        queue_command_response(
            &inner_for_notify,
            &command_id,
            string_handle,
            status,
            reason_code,
            reason_description,
        );
    });

    dispatcher.set_actuator_value(
        &decoder.decoder_name,
        req.signal_value,
        req.command_id,
        req.issued_timestamp_ms,
        req.execution_timeout_ms,
        notify,
    );
}

/// The single point every response (fast-fail or dispatcher-produced) flows
/// through: decrements the `UPLOADING` hint for a STRING argument, if any,
/// and pushes the response onto the egress queue (§4.D).
fn queue_command_response(
    inner: &Arc<Inner>,
    command_id: &str,
    string_handle: Option<(u32, crate::buffer::RawDataHandle)>,
    status: CommandStatus,
    reason_code: crate::command::CommandReasonCode,
    reason_description: String,
) {
    if let Some((type_id, handle)) = string_handle {
        let _ = inner
            .buffer_manager
            .decrease_handle_usage_hint(type_id, handle, UsageStage::Uploading);
    }
    debug!(%command_id, reason_code, %status, "queueing command response");
    inner.egress.push(CommandResponse {
        command_id: command_id.to_string(),
        status,
        reason_code,
        reason_description,
    });
}
