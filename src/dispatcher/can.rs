//! CAN Command Dispatcher (§4.B): wire-format codec plus a concurrent
//! correlation engine that matches asynchronous response frames to
//! outstanding commands by command ID, with a per-command timeout timer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::buffer::BufferManager;
use crate::clock::Clock;
use crate::command::{
    CommandId, CommandReasonCode, CommandStatus, NotifyCommandStatusCallback, SignalType,
    SignalValue, Timestamp, CAN_COMMAND_ID_MAX_LEN, REASON_CODE_ARGUMENT_TYPE_MISMATCH,
    REASON_CODE_NOT_SUPPORTED, REASON_CODE_NO_RESPONSE, REASON_CODE_REJECTED,
    REASON_CODE_TIMED_OUT_BEFORE_DISPATCH,
};
use crate::error::CanDispatchError;

use super::CommandDispatcher;

/// Classic CAN-FD's data-length cap; the request/response payload must fit.
pub const CANFD_MAX_DLEN: usize = 64;

#[derive(Debug, Clone)]
pub struct CommandConfig {
    pub can_request_id: u32,
    pub can_response_id: u32,
    pub signal_type: SignalType,
}

#[derive(Debug, Clone)]
pub struct CanFrame {
    pub can_id: u32,
    pub payload: Vec<u8>,
}

/// Abstraction over the underlying socket so the dispatcher can be unit
/// tested without a real SocketCAN interface. A production backend would
/// implement this against `AF_CAN`/`CAN_RAW`; none ships here since no CAN
/// socket crate is part of this workspace's dependency stack.
pub trait CanTransport: Send + Sync {
    fn send(&self, frame: CanFrame) -> std::io::Result<()>;
}

/// Test/local-run double: captures sent frames, and lets a test inject
/// response frames as if they'd arrived on the wire.
#[derive(Default)]
pub struct FakeCanTransport {
    sent: Mutex<Vec<CanFrame>>,
}

impl FakeCanTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent_frames(&self) -> Vec<CanFrame> {
        self.sent.lock().expect("fake transport mutex poisoned").clone()
    }
}

impl CanTransport for FakeCanTransport {
    fn send(&self, frame: CanFrame) -> std::io::Result<()> {
        self.sent.lock().expect("fake transport mutex poisoned").push(frame);
        Ok(())
    }
}

struct ExecutionState {
    can_response_id: u32,
    notify_status: NotifyCommandStatusCallback,
    /// Completing this cancels the timeout timer task.
    cancel_timer: Option<oneshot::Sender<()>>,
}

struct Inner {
    actuators: HashMap<String, CommandConfig>,
    execution_state: Mutex<HashMap<CommandId, ExecutionState>>,
}

/// Thread-safe, cheaply cloneable handle to one CAN dispatcher instance.
#[derive(Clone)]
pub struct CanCommandDispatcher {
    inner: Arc<Inner>,
    transport: Arc<dyn CanTransport>,
    buffer_manager: BufferManager,
    clock: Arc<dyn Clock>,
    runtime_handle: tokio::runtime::Handle,
}

impl CanCommandDispatcher {
    pub fn new(
        actuators: HashMap<String, CommandConfig>,
        transport: Arc<dyn CanTransport>,
        buffer_manager: BufferManager,
        clock: Arc<dyn Clock>,
        runtime_handle: tokio::runtime::Handle,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                actuators,
                execution_state: Mutex::new(HashMap::new()),
            }),
            transport,
            buffer_manager,
            clock,
            runtime_handle,
        }
    }

    /// Feeds one frame arriving off the wire into the correlation engine.
    /// A production transport calls this from its read loop; tests call it
    /// directly to simulate an arriving response.
    pub fn handle_incoming_frame(&self, frame: &CanFrame) {
        let (command_id, status_byte, reason_code, reason_description) =
            match decode_response_frame(&frame.payload) {
                Ok(parsed) => parsed,
                Err(e) => {
                    debug!(error = %e, "discarding malformed CAN response frame");
                    return;
                }
            };

        let Some(status) = CommandStatus::from_wire(status_byte) else {
            return;
        };

        let mut table = self
            .inner
            .execution_state
            .lock()
            .expect("execution state mutex poisoned");
        let matches_response_id = matches!(
            table.get(&command_id),
            Some(entry) if entry.can_response_id == frame.can_id
        );
        if !matches_response_id {
            return;
        }

        // Always detach the entry and drop the lock before invoking the
        // callback, both for non-terminal updates and terminal ones, so it
        // may freely re-enter the dispatcher without self-deadlocking.
        let mut entry = table.remove(&command_id).expect("checked present above");
        drop(table);

        if !status.is_terminal() {
            (entry.notify_status)(status, reason_code, reason_description);
            // Still outstanding: put it back so a later response frame or
            // the timeout timer can still find it.
            let mut table = self
                .inner
                .execution_state
                .lock()
                .expect("execution state mutex poisoned");
            table.insert(command_id, entry);
            return;
        }

        if let Some(cancel) = entry.cancel_timer.take() {
            let _ = cancel.send(());
        }
        (entry.notify_status)(status, reason_code, reason_description);
    }

    fn lookup_actuator(&self, actuator_name: &str) -> Option<CommandConfig> {
        self.inner.actuators.get(actuator_name).cloned()
    }

    fn arm_timeout(&self, command_id: CommandId, remaining_ms: u64) -> oneshot::Sender<()> {
        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        self.runtime_handle.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(remaining_ms)) => {
                    let mut table = inner.execution_state.lock().expect("execution state mutex poisoned");
                    if let Some(mut entry) = table.remove(&command_id) {
                        drop(table);
                        (entry.notify_status)(
                            CommandStatus::ExecutionTimeout,
                            REASON_CODE_NO_RESPONSE,
                            "no response received before deadline".to_string(),
                        );
                    }
                }
                _ = &mut cancel_rx => {}
            }
        });
        cancel_tx
    }
}

impl CommandDispatcher for CanCommandDispatcher {
    fn init(&self) -> bool {
        true
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
        let Some(config) = self.lookup_actuator(actuator_name) else {
            notify_status(CommandStatus::ExecutionFailed, REASON_CODE_NOT_SUPPORTED, format!(
                "actuator '{actuator_name}' is not configured on this CAN dispatcher"
            ));
            return;
        };

        if signal_value.signal_type() != config.signal_type {
            notify_status(
                CommandStatus::ExecutionFailed,
                REASON_CODE_ARGUMENT_TYPE_MISMATCH,
                format!(
                    "expected {:?}, got {:?}",
                    config.signal_type,
                    signal_value.signal_type()
                ),
            );
            return;
        }

        if command_id.len() > CAN_COMMAND_ID_MAX_LEN {
            notify_status(
                CommandStatus::ExecutionFailed,
                REASON_CODE_REJECTED,
                "command id exceeds CAN frame capacity".to_string(),
            );
            return;
        }

        // Already outstanding: silently dropped per §4.B "Duplicate command IDs".
        {
            let table = self
                .inner
                .execution_state
                .lock()
                .expect("execution state mutex poisoned");
            if table.contains_key(&command_id) {
                debug!(%command_id, "duplicate setActuatorValue while a command is outstanding; ignoring");
                return;
            }
        }

        let mut loaned_string_frame = None;
        if let SignalValue::String { type_id, handle } = &signal_value {
            match self.buffer_manager.borrow_frame(*type_id, *handle) {
                Some(loaned) => loaned_string_frame = Some(loaned),
                None => {
                    notify_status(
                        CommandStatus::ExecutionFailed,
                        REASON_CODE_REJECTED,
                        "string argument handle could not be borrowed".to_string(),
                    );
                    return;
                }
            }
        }

        let now = self.clock.now_ms();
        let deadline_ms = if execution_timeout_ms > 0 {
            Some(issued_timestamp_ms + execution_timeout_ms)
        } else {
            None
        };
        if let Some(deadline) = deadline_ms {
            if now >= deadline {
                notify_status(
                    CommandStatus::ExecutionTimeout,
                    REASON_CODE_TIMED_OUT_BEFORE_DISPATCH,
                    "deadline already passed before dispatch".to_string(),
                );
                return;
            }
        }

        let payload = match encode_request_frame(
            &command_id,
            issued_timestamp_ms,
            execution_timeout_ms,
            &signal_value,
            loaned_string_frame.as_ref().map(|f| f.data()),
        ) {
            Ok(payload) => payload,
            Err(e) => {
                notify_status(CommandStatus::ExecutionFailed, REASON_CODE_REJECTED, e.to_string());
                return;
            }
        };

        let cancel_timer = deadline_ms.map(|deadline| {
            let remaining = deadline.saturating_sub(now);
            self.arm_timeout(command_id.clone(), remaining)
        });

        {
            let mut table = self
                .inner
                .execution_state
                .lock()
                .expect("execution state mutex poisoned");
            table.insert(
                command_id,
                ExecutionState {
                    can_response_id: config.can_response_id,
                    notify_status,
                    cancel_timer,
                },
            );
        }
        // The loan, if any, is dropped here; its bytes are already copied
        // into `payload`, so releasing the borrow after encoding is safe.
        drop(loaned_string_frame);

        if let Err(e) = self.transport.send(CanFrame {
            can_id: config.can_request_id,
            payload,
        }) {
            warn!(error = %e, "failed to send CAN request frame");
        }
    }

    fn actuator_names(&self) -> Vec<String> {
        self.inner.actuators.keys().cloned().collect()
    }
}

fn push_network_byte_order_u64(buf: &mut Vec<u8>, value: u64) -> Result<(), CanDispatchError> {
    push_bytes(buf, &value.to_be_bytes())
}

fn push_bytes(buf: &mut Vec<u8>, bytes: &[u8]) -> Result<(), CanDispatchError> {
    if buf.len() + bytes.len() > CANFD_MAX_DLEN {
        return Err(CanDispatchError::PayloadTooLarge(buf.len() + bytes.len(), CANFD_MAX_DLEN));
    }
    buf.extend_from_slice(bytes);
    Ok(())
}

fn push_argument(buf: &mut Vec<u8>, value: &SignalValue, string_bytes: Option<&[u8]>) -> Result<(), CanDispatchError> {
    match value {
        SignalValue::UInt8(v) => push_bytes(buf, &v.to_be_bytes()),
        SignalValue::Int8(v) => push_bytes(buf, &v.to_be_bytes()),
        SignalValue::UInt16(v) => push_bytes(buf, &v.to_be_bytes()),
        SignalValue::Int16(v) => push_bytes(buf, &v.to_be_bytes()),
        SignalValue::UInt32(v) => push_bytes(buf, &v.to_be_bytes()),
        SignalValue::Int32(v) => push_bytes(buf, &v.to_be_bytes()),
        SignalValue::UInt64(v) => push_bytes(buf, &v.to_be_bytes()),
        SignalValue::Int64(v) => push_bytes(buf, &v.to_be_bytes()),
        SignalValue::Float(v) => push_bytes(buf, &v.to_be_bytes()),
        SignalValue::Double(v) => push_bytes(buf, &v.to_be_bytes()),
        SignalValue::Boolean(v) => push_bytes(buf, &[if *v { 1 } else { 0 }]),
        SignalValue::String { .. } => {
            let bytes = string_bytes.unwrap_or(&[]);
            push_bytes(buf, bytes)?;
            push_bytes(buf, &[0])
        }
    }
}

/// Builds the request payload laid out in §4.B: null-terminated command ID,
/// 8-byte issued timestamp, 8-byte execution timeout, then the argument in
/// network byte order (or null-terminated raw bytes for STRING).
pub fn encode_request_frame(
    command_id: &str,
    issued_timestamp_ms: Timestamp,
    execution_timeout_ms: u64,
    signal_value: &SignalValue,
    string_bytes: Option<&[u8]>,
) -> Result<Vec<u8>, CanDispatchError> {
    let mut buf = Vec::with_capacity(CANFD_MAX_DLEN);
    push_bytes(&mut buf, command_id.as_bytes())?;
    push_bytes(&mut buf, &[0])?;
    push_network_byte_order_u64(&mut buf, issued_timestamp_ms)?;
    push_network_byte_order_u64(&mut buf, execution_timeout_ms)?;
    push_argument(&mut buf, signal_value, string_bytes)?;
    Ok(buf)
}

fn pop_null_terminated_string(payload: &[u8], index: &mut usize) -> Result<String, CanDispatchError> {
    let start = *index;
    let nul_pos = payload[start..]
        .iter()
        .position(|&b| b == 0)
        .ok_or(CanDispatchError::FrameTruncated("string"))?;
    let s = String::from_utf8_lossy(&payload[start..start + nul_pos]).into_owned();
    *index = start + nul_pos + 1;
    Ok(s)
}

fn pop_u8(payload: &[u8], index: &mut usize) -> Result<u8, CanDispatchError> {
    let byte = *payload.get(*index).ok_or(CanDispatchError::FrameTruncated("status"))?;
    *index += 1;
    Ok(byte)
}

fn pop_u32_be(payload: &[u8], index: &mut usize) -> Result<u32, CanDispatchError> {
    let end = *index + 4;
    let slice = payload
        .get(*index..end)
        .ok_or(CanDispatchError::FrameTruncated("reason_code"))?;
    let value = u32::from_be_bytes(slice.try_into().expect("slice is exactly 4 bytes"));
    *index = end;
    Ok(value)
}

/// Decodes the response payload laid out in §4.B: null-terminated command
/// ID, 1-byte status code, 4-byte big-endian reason code, null-terminated
/// reason description.
pub fn decode_response_frame(
    payload: &[u8],
) -> Result<(CommandId, u8, CommandReasonCode, String), CanDispatchError> {
    let mut index = 0;
    let command_id = pop_null_terminated_string(payload, &mut index)?;
    let status_byte = pop_u8(payload, &mut index)?;
    let reason_code = pop_u32_be(payload, &mut index)?;
    let reason_description = pop_null_terminated_string(payload, &mut index)?;
    Ok((command_id, status_byte, reason_code, reason_description))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Keeps the owning runtime alive for the test's duration; the
    /// dispatcher itself only holds a `Handle` into it.
    struct TestDispatcher {
        dispatcher: CanCommandDispatcher,
        transport: Arc<FakeCanTransport>,
        clock: Arc<FakeClock>,
        _runtime: tokio::runtime::Runtime,
    }

    impl std::ops::Deref for TestDispatcher {
        type Target = CanCommandDispatcher;
        fn deref(&self) -> &CanCommandDispatcher {
            &self.dispatcher
        }
    }

    fn dispatcher(actuators: HashMap<String, CommandConfig>) -> TestDispatcher {
        let transport = FakeCanTransport::new();
        let clock = Arc::new(FakeClock::new(1_000_000));
        let buffer_manager = BufferManager::new(crate::buffer::BufferManagerConfig {
            max_overall_bytes: 1 << 20,
            default_signal_config: crate::buffer::SignalConfig {
                reserved_bytes: 0,
                max_samples: 16,
                max_bytes_per_sample: 1024,
                max_bytes: 1 << 16,
            },
            overrides: HashMap::new(),
        });
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let handle = runtime.handle().clone();
        let dispatcher = CanCommandDispatcher::new(actuators, transport.clone(), buffer_manager, clock.clone(), handle);
        TestDispatcher {
            dispatcher,
            transport,
            clock,
            _runtime: runtime,
        }
    }

    fn int32_actuator() -> HashMap<String, CommandConfig> {
        let mut m = HashMap::new();
        m.insert(
            "Vehicle.actuator6".to_string(),
            CommandConfig {
                can_request_id: 0x600,
                can_response_id: 0x601,
                signal_type: SignalType::Int32,
            },
        );
        m
    }

    #[test]
    fn encode_request_frame_matches_documented_byte_layout() {
        let frame = encode_request_frame(
            "ABC",
            0,
            0,
            &SignalValue::Int32(0xAABBCCDDu32 as i32),
            None,
        )
        .unwrap();
        assert_eq!(&frame[0..4], &[b'A', b'B', b'C', 0x00]);
        assert_eq!(&frame[frame.len() - 4..], &[0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[test]
    fn decode_response_frame_parses_all_fields() {
        let mut payload = vec![b'A', b'B', b'C', 0x00];
        payload.push(0x01);
        payload.extend_from_slice(&0x1122_3344u32.to_be_bytes());
        payload.extend_from_slice(b"cat\0");
        let (id, status, reason, desc) = decode_response_frame(&payload).unwrap();
        assert_eq!(id, "ABC");
        assert_eq!(status, 1);
        assert_eq!(reason, 0x1122_3344);
        assert_eq!(desc, "cat");
    }

    #[test]
    fn decode_response_frame_rejects_truncated_frame() {
        let payload = vec![b'A', 0x00, 0x01];
        assert!(decode_response_frame(&payload).is_err());
    }

    #[test]
    fn set_actuator_value_rejects_unknown_actuator() {
        let dispatcher = dispatcher(int32_actuator());
        let received = Arc::new(StdMutex::new(None));
        let received2 = received.clone();
        dispatcher.set_actuator_value(
            "not.configured",
            SignalValue::Int32(1),
            "X".to_string(),
            0,
            0,
            Box::new(move |status, reason, _desc| {
                *received2.lock().unwrap() = Some((status, reason));
            }),
        );
        let (status, reason) = received.lock().unwrap().unwrap();
        assert_eq!(status, CommandStatus::ExecutionFailed);
        assert_eq!(reason, REASON_CODE_NOT_SUPPORTED);
    }

    #[test]
    fn set_actuator_value_rejects_type_mismatch() {
        let dispatcher = dispatcher(int32_actuator());
        let received = Arc::new(StdMutex::new(None));
        let received2 = received.clone();
        dispatcher.set_actuator_value(
            "Vehicle.actuator6",
            SignalValue::Boolean(true),
            "X".to_string(),
            0,
            0,
            Box::new(move |status, reason, _desc| {
                *received2.lock().unwrap() = Some((status, reason));
            }),
        );
        let (status, reason) = received.lock().unwrap().unwrap();
        assert_eq!(status, CommandStatus::ExecutionFailed);
        assert_eq!(reason, REASON_CODE_ARGUMENT_TYPE_MISMATCH);
    }

    #[test]
    fn duplicate_command_id_is_silently_dropped() {
        let dispatcher = dispatcher(int32_actuator());
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        dispatcher.set_actuator_value(
            "Vehicle.actuator6",
            SignalValue::Int32(1),
            "DUP".to_string(),
            dispatcher.clock.now_ms(),
            0,
            Box::new(move |_s, _r, _d| {
                calls2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        dispatcher.set_actuator_value(
            "Vehicle.actuator6",
            SignalValue::Int32(2),
            "DUP".to_string(),
            dispatcher.clock.now_ms(),
            0,
            Box::new(move |_s, _r, _d| {
                panic!("second call for an outstanding commandID must not notify");
            }),
        );
        assert_eq!(dispatcher.transport.sent_frames().len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn set_actuator_value_reports_timeout_before_dispatch() {
        let dispatcher = dispatcher(int32_actuator());
        let received = Arc::new(StdMutex::new(None));
        let received2 = received.clone();
        let issued = dispatcher.clock.now_ms() - 1000;
        dispatcher.set_actuator_value(
            "Vehicle.actuator6",
            SignalValue::Int32(1),
            "LATE".to_string(),
            issued,
            500,
            Box::new(move |status, reason, _desc| {
                *received2.lock().unwrap() = Some((status, reason));
            }),
        );
        let (status, reason) = received.lock().unwrap().unwrap();
        assert_eq!(status, CommandStatus::ExecutionTimeout);
        assert_eq!(reason, REASON_CODE_TIMED_OUT_BEFORE_DISPATCH);
        assert!(dispatcher.transport.sent_frames().is_empty());
    }

    #[test]
    fn in_progress_response_does_not_remove_outstanding_entry() {
        let dispatcher = dispatcher(int32_actuator());
        let statuses = Arc::new(StdMutex::new(Vec::new()));
        let statuses2 = statuses.clone();
        dispatcher.set_actuator_value(
            "Vehicle.actuator6",
            SignalValue::Int32(1),
            "ABC".to_string(),
            dispatcher.clock.now_ms(),
            500,
            Box::new(move |status, reason, desc| {
                statuses2.lock().unwrap().push((status, reason, desc));
            }),
        );

        let mut in_progress_payload = vec![b'A', b'B', b'C', 0x00];
        in_progress_payload.push(10);
        in_progress_payload.extend_from_slice(&0x1122_3344u32.to_be_bytes());
        in_progress_payload.extend_from_slice(b"cat\0");
        dispatcher.handle_incoming_frame(&CanFrame { can_id: 0x601, payload: in_progress_payload });

        let mut terminal_payload = vec![b'A', b'B', b'C', 0x00];
        terminal_payload.push(1);
        terminal_payload.extend_from_slice(&0x5566_7788u32.to_be_bytes());
        terminal_payload.extend_from_slice(b"dog\0");
        dispatcher.handle_incoming_frame(&CanFrame { can_id: 0x601, payload: terminal_payload });

        let got = statuses.lock().unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].0, CommandStatus::InProgress);
        assert_eq!(got[1].0, CommandStatus::Succeeded);
    }

    #[test]
    fn response_on_wrong_can_id_is_discarded() {
        let dispatcher = dispatcher(int32_actuator());
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        dispatcher.set_actuator_value(
            "Vehicle.actuator6",
            SignalValue::Int32(1),
            "ABC".to_string(),
            dispatcher.clock.now_ms(),
            500,
            Box::new(move |_s, _r, _d| {
                calls2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let mut payload = vec![b'A', b'B', b'C', 0x00];
        payload.push(1);
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.extend_from_slice(b"\0");
        dispatcher.handle_incoming_frame(&CanFrame { can_id: 0xDEAD, payload });
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
