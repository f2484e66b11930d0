//! Command Schema Ingress (§4.E): decodes a serialized cloud message into a
//! well-typed request, range-checking typed scalar arguments and staging
//! string arguments into the raw data buffer manager, or synthesizes an
//! immediate fast-fail response without ever reaching the manager.

use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use crate::buffer::{BufferManager, UsageStage};
use crate::clock::Clock;
use crate::command::{
    ActuatorCommandRequest, CommandResponse, CommandStatus, LastKnownStateCommandRequest,
    LastKnownStateOperation, SignalValue, REASON_CODE_COMMAND_REQUEST_PARSING_FAILED,
    REASON_CODE_TIMED_OUT_BEFORE_DISPATCH,
};
use crate::error::IngressError;

#[derive(Debug, Clone, serde::Serialize, Deserialize)]
pub struct IngressConfig {
    pub max_payload_bytes: usize,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: 4 * 1024 * 1024,
        }
    }
}

/// The oneof-style typed value, carried at the widest representation of its
/// kind so range-checking against the declared `SignalType` is an explicit
/// step here rather than something `serde` silently rejects or truncates.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
enum ActuatorValueWire {
    Uint8(i64),
    Int8(i64),
    Uint16(i64),
    Int16(i64),
    Uint32(i64),
    Int32(i64),
    Uint64(u64),
    Int64(i64),
    Float(f64),
    Double(f64),
    Boolean(bool),
    String(String),
}

#[derive(Debug, Deserialize)]
struct ActuatorCommandWire {
    command_id: String,
    decoder_manifest_id: String,
    issued_timestamp_ms: u64,
    timeout_ms: u64,
    signal_id: u32,
    value: Option<ActuatorValueWire>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
enum LastKnownStateOperationWire {
    Activate { deactivate_after_seconds: u32 },
    Deactivate,
    FetchSnapshot,
}

#[derive(Debug, Deserialize)]
struct LastKnownStateEntryWire {
    state_template_sync_id: String,
    #[serde(flatten)]
    operation: LastKnownStateOperationWire,
}

#[derive(Debug, Deserialize)]
struct LastKnownStateCommandWire {
    command_id: String,
    state_templates: Vec<LastKnownStateEntryWire>,
}

/// Outcome of parsing one actuator-command payload. There is no `Err` arm:
/// every failure mode the spec describes is either a synthesized response
/// or a silent drop, both of which are terminal from the caller's view.
pub enum IngestOutcome {
    /// Ready for `ActuatorCommandManager::on_receiving_command_request`.
    Accepted(ActuatorCommandRequest),
    /// A response the ingress layer produced itself, before any handoff.
    FastFail(CommandResponse),
    /// Silent drop: oversized payload, malformed JSON, unset value, or a
    /// STRING argument whose signal isn't configured in the buffer manager.
    Rejected,
}

pub struct Ingress {
    config: IngressConfig,
    buffer_manager: BufferManager,
    clock: Arc<dyn Clock>,
}

impl Ingress {
    pub fn new(config: IngressConfig, buffer_manager: BufferManager, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            buffer_manager,
            clock,
        }
    }

    pub fn parse_actuator_command(&self, payload: &[u8]) -> IngestOutcome {
        if payload.len() > self.config.max_payload_bytes {
            debug!(len = payload.len(), "dropping oversized actuator command payload");
            return IngestOutcome::Rejected;
        }

        let wire: ActuatorCommandWire = match serde_json::from_slice(payload) {
            Ok(wire) => wire,
            Err(e) => {
                debug!(error = %e, "actuator command parse failed");
                return self.fast_fail_parsing(payload);
            }
        };

        let Some(value) = wire.value else {
            return IngestOutcome::FastFail(CommandResponse {
                command_id: wire.command_id,
                status: CommandStatus::ExecutionFailed,
                reason_code: REASON_CODE_COMMAND_REQUEST_PARSING_FAILED,
                reason_description: "no value field set".to_string(),
            });
        };

        let signal_value = match self.to_signal_value(wire.signal_id, value) {
            Ok(v) => v,
            Err(IngestOutcome::Rejected) => return IngestOutcome::Rejected,
            Err(other) => return other,
        };

        let now = self.clock.now_ms();
        if wire.timeout_ms > 0 && wire.issued_timestamp_ms + wire.timeout_ms <= now {
            return IngestOutcome::FastFail(CommandResponse {
                command_id: wire.command_id,
                status: CommandStatus::ExecutionTimeout,
                reason_code: REASON_CODE_TIMED_OUT_BEFORE_DISPATCH,
                reason_description: "deadline already passed at parse time".to_string(),
            });
        }

        IngestOutcome::Accepted(ActuatorCommandRequest {
            command_id: wire.command_id,
            decoder_manifest_id: wire.decoder_manifest_id,
            signal_id: wire.signal_id,
            signal_value,
            issued_timestamp_ms: wire.issued_timestamp_ms,
            execution_timeout_ms: wire.timeout_ms,
        })
    }

    pub fn parse_last_known_state_command(
        &self,
        payload: &[u8],
    ) -> Result<Vec<LastKnownStateCommandRequest>, IngressError> {
        if payload.len() > self.config.max_payload_bytes {
            return Err(IngressError::PayloadTooLarge(payload.len(), self.config.max_payload_bytes));
        }
        let wire: LastKnownStateCommandWire = serde_json::from_slice(payload)
            .map_err(|e| IngressError::MalformedJson(e.to_string()))?;

        Ok(wire
            .state_templates
            .into_iter()
            .map(|entry| LastKnownStateCommandRequest {
                command_id: format!("{}#{}", wire.command_id, entry.state_template_sync_id),
                state_template_id: entry.state_template_sync_id,
                operation: match entry.operation {
                    LastKnownStateOperationWire::Activate { deactivate_after_seconds } => {
                        LastKnownStateOperation::Activate { deactivate_after_seconds }
                    }
                    LastKnownStateOperationWire::Deactivate => LastKnownStateOperation::Deactivate,
                    LastKnownStateOperationWire::FetchSnapshot => LastKnownStateOperation::FetchSnapshot,
                },
            })
            .collect())
    }

    /// Range-checks an integer/float value against its declared type, and
    /// for STRING, stages the bytes into the buffer manager keyed by
    /// `signal_id` (the buffer manager's typeId and the ingress signalId are
    /// the same namespace). Returns `Err(Rejected)` for an unconfigured
    /// signal, matching "silent parse-failure (no response)".
    fn to_signal_value(
        &self,
        signal_id: u32,
        value: ActuatorValueWire,
    ) -> Result<SignalValue, IngestOutcome> {
        match value {
            ActuatorValueWire::Uint8(v) => in_range(v, 0, u8::MAX as i64).map(|v| SignalValue::UInt8(v as u8)),
            ActuatorValueWire::Int8(v) => in_range(v, i8::MIN as i64, i8::MAX as i64).map(|v| SignalValue::Int8(v as i8)),
            ActuatorValueWire::Uint16(v) => in_range(v, 0, u16::MAX as i64).map(|v| SignalValue::UInt16(v as u16)),
            ActuatorValueWire::Int16(v) => in_range(v, i16::MIN as i64, i16::MAX as i64).map(|v| SignalValue::Int16(v as i16)),
            ActuatorValueWire::Uint32(v) => in_range(v, 0, u32::MAX as i64).map(|v| SignalValue::UInt32(v as u32)),
            ActuatorValueWire::Int32(v) => in_range(v, i32::MIN as i64, i32::MAX as i64).map(|v| SignalValue::Int32(v as i32)),
            ActuatorValueWire::Uint64(v) => Some(SignalValue::UInt64(v)),
            ActuatorValueWire::Int64(v) => Some(SignalValue::Int64(v)),
            ActuatorValueWire::Float(v) => Some(SignalValue::Float(v as f32)),
            ActuatorValueWire::Double(v) => Some(SignalValue::Double(v)),
            ActuatorValueWire::Boolean(v) => Some(SignalValue::Boolean(v)),
            ActuatorValueWire::String(s) => {
                let now = self.clock.now_ms();
                return match self.buffer_manager.push(signal_id, s.into_bytes(), now) {
                    Ok(handle) => {
                        let _ = self.buffer_manager.increase_handle_usage_hint(
                            signal_id,
                            handle,
                            UsageStage::Uploading,
                        );
                        Ok(SignalValue::String { type_id: signal_id, handle })
                    }
                    Err(e) => {
                        debug!(signal_id, error = %e, "string argument could not be staged into the buffer manager");
                        Err(IngestOutcome::Rejected)
                    }
                };
            }
        }
        .ok_or(IngestOutcome::Rejected)
    }

    fn fast_fail_parsing(&self, payload: &[u8]) -> IngestOutcome {
        // Even on a parse failure we try to recover a command_id so the
        // cloud can correlate the rejection; if the payload is too broken
        // for even that, there is nothing to respond to and we drop silently.
        #[derive(Deserialize)]
        struct JustCommandId {
            command_id: String,
        }
        match serde_json::from_slice::<JustCommandId>(payload) {
            Ok(partial) => IngestOutcome::FastFail(CommandResponse {
                command_id: partial.command_id,
                status: CommandStatus::ExecutionFailed,
                reason_code: REASON_CODE_COMMAND_REQUEST_PARSING_FAILED,
                reason_description: "malformed actuator command payload".to_string(),
            }),
            Err(_) => IngestOutcome::Rejected,
        }
    }
}

fn in_range(v: i64, min: i64, max: i64) -> Option<i64> {
    if v >= min && v <= max {
        Some(v)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferManagerConfig, SignalConfig};
    use crate::clock::FakeClock;
    use std::collections::HashMap;

    fn ingress_with_buffer() -> Ingress {
        let buffer_manager = BufferManager::new(BufferManagerConfig {
            max_overall_bytes: 1 << 20,
            default_signal_config: SignalConfig {
                reserved_bytes: 0,
                max_samples: 8,
                max_bytes_per_sample: 1024,
                max_bytes: 1 << 16,
            },
            overrides: HashMap::new(),
        });
        buffer_manager
            .update_config(&[crate::buffer::SignalUpdateConfig {
                type_id: 9,
                interface_id: "if0".into(),
                message_id: "msg0".into(),
            }])
            .unwrap();
        Ingress::new(
            IngressConfig::default(),
            buffer_manager,
            Arc::new(FakeClock::new(1_000_000)),
        )
    }

    fn envelope(body: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&body).unwrap()
    }

    #[test]
    fn uint8_256_is_rejected_255_is_accepted() {
        let ingress = ingress_with_buffer();
        let too_big = envelope(serde_json::json!({
            "command_id": "A", "decoder_manifest_id": "dm1",
            "issued_timestamp_ms": 1_000_000, "timeout_ms": 0, "signal_id": 1,
            "value": {"type": "uint8", "value": 256}
        }));
        assert!(matches!(ingress.parse_actuator_command(&too_big), IngestOutcome::Rejected));

        let ok = envelope(serde_json::json!({
            "command_id": "A", "decoder_manifest_id": "dm1",
            "issued_timestamp_ms": 1_000_000, "timeout_ms": 0, "signal_id": 1,
            "value": {"type": "uint8", "value": 255}
        }));
        assert!(matches!(ingress.parse_actuator_command(&ok), IngestOutcome::Accepted(_)));
    }

    #[test]
    fn int8_boundary_matches_spec() {
        let ingress = ingress_with_buffer();
        let too_small = envelope(serde_json::json!({
            "command_id": "A", "decoder_manifest_id": "dm1",
            "issued_timestamp_ms": 1_000_000, "timeout_ms": 0, "signal_id": 1,
            "value": {"type": "int8", "value": -129}
        }));
        assert!(matches!(ingress.parse_actuator_command(&too_small), IngestOutcome::Rejected));

        let ok = envelope(serde_json::json!({
            "command_id": "A", "decoder_manifest_id": "dm1",
            "issued_timestamp_ms": 1_000_000, "timeout_ms": 0, "signal_id": 1,
            "value": {"type": "int8", "value": -128}
        }));
        assert!(matches!(ingress.parse_actuator_command(&ok), IngestOutcome::Accepted(_)));
    }

    #[test]
    fn missing_value_is_a_fast_fail_parsing_response() {
        let ingress = ingress_with_buffer();
        let payload = envelope(serde_json::json!({
            "command_id": "A", "decoder_manifest_id": "dm1",
            "issued_timestamp_ms": 1_000_000, "timeout_ms": 0, "signal_id": 1
        }));
        match ingress.parse_actuator_command(&payload) {
            IngestOutcome::FastFail(response) => {
                assert_eq!(response.status, CommandStatus::ExecutionFailed);
                assert_eq!(response.reason_code, REASON_CODE_COMMAND_REQUEST_PARSING_FAILED);
            }
            _ => panic!("expected a fast-fail response"),
        }
    }

    #[test]
    fn already_expired_deadline_fast_fails_before_handoff() {
        let ingress = ingress_with_buffer();
        let payload = envelope(serde_json::json!({
            "command_id": "A", "decoder_manifest_id": "dm1",
            "issued_timestamp_ms": 999_000, "timeout_ms": 500, "signal_id": 1,
            "value": {"type": "boolean", "value": true}
        }));
        match ingress.parse_actuator_command(&payload) {
            IngestOutcome::FastFail(response) => {
                assert_eq!(response.status, CommandStatus::ExecutionTimeout);
                assert_eq!(response.reason_code, REASON_CODE_TIMED_OUT_BEFORE_DISPATCH);
            }
            _ => panic!("expected a timeout fast-fail"),
        }
    }

    #[test]
    fn string_value_is_staged_into_the_buffer_manager_with_uploading_hint() {
        let ingress = ingress_with_buffer();
        let payload = envelope(serde_json::json!({
            "command_id": "A", "decoder_manifest_id": "dm1",
            "issued_timestamp_ms": 1_000_000, "timeout_ms": 0, "signal_id": 9,
            "value": {"type": "string", "value": "hello"}
        }));
        match ingress.parse_actuator_command(&payload) {
            IngestOutcome::Accepted(req) => match req.signal_value {
                SignalValue::String { type_id, handle } => {
                    assert_eq!(type_id, 9);
                    let loaned = ingress.buffer_manager.borrow_frame(9, handle).unwrap();
                    assert_eq!(loaned.data(), b"hello");
                }
                _ => panic!("expected a string signal value"),
            },
            _ => panic!("expected acceptance"),
        }
    }

    #[test]
    fn string_value_for_unconfigured_signal_is_silently_rejected() {
        let ingress = ingress_with_buffer();
        let payload = envelope(serde_json::json!({
            "command_id": "A", "decoder_manifest_id": "dm1",
            "issued_timestamp_ms": 1_000_000, "timeout_ms": 0, "signal_id": 404,
            "value": {"type": "string", "value": "hello"}
        }));
        assert!(matches!(ingress.parse_actuator_command(&payload), IngestOutcome::Rejected));
    }

    #[test]
    fn last_known_state_batch_expands_to_one_request_per_entry() {
        let ingress = ingress_with_buffer();
        let payload = envelope(serde_json::json!({
            "command_id": "BATCH1",
            "state_templates": [
                {"state_template_sync_id": "st1", "operation": "activate", "deactivate_after_seconds": 30},
                {"state_template_sync_id": "st2", "operation": "deactivate"},
                {"state_template_sync_id": "st3", "operation": "fetch_snapshot"},
            ]
        }));
        let reqs = ingress.parse_last_known_state_command(&payload).unwrap();
        assert_eq!(reqs.len(), 3);
        assert_eq!(reqs[0].state_template_id, "st1");
        assert!(matches!(reqs[0].operation, LastKnownStateOperation::Activate { deactivate_after_seconds: 30 }));
        assert!(matches!(reqs[1].operation, LastKnownStateOperation::Deactivate));
        assert!(matches!(reqs[2].operation, LastKnownStateOperation::FetchSnapshot));
    }

    #[test]
    fn malformed_json_with_no_recoverable_command_id_is_dropped() {
        let ingress = ingress_with_buffer();
        assert!(matches!(ingress.parse_actuator_command(b"not json"), IngestOutcome::Rejected));
    }
}
