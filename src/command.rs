//! Wire-agnostic command data model: the types every dispatcher, the manager,
//! and ingress agree on regardless of which vehicle network carries a command.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque printable command identifier. The CAN dispatcher additionally
/// requires this to fit in 25 bytes including the null terminator (§4.B).
pub type CommandId = String;

pub const CAN_COMMAND_ID_MAX_LEN: usize = 24;

/// 1:1 mapping with the cloud's status enum. Gaps in the numeric values are
/// intentional and must be preserved verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CommandStatus {
    Succeeded = 1,
    ExecutionTimeout = 2,
    ExecutionFailed = 4,
    InProgress = 10,
}

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, CommandStatus::InProgress)
    }

    pub fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(CommandStatus::Succeeded),
            2 => Some(CommandStatus::ExecutionTimeout),
            4 => Some(CommandStatus::ExecutionFailed),
            10 => Some(CommandStatus::InProgress),
            _ => None,
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CommandStatus::Succeeded => "SUCCEEDED",
            CommandStatus::ExecutionTimeout => "EXECUTION_TIMEOUT",
            CommandStatus::ExecutionFailed => "EXECUTION_FAILED",
            CommandStatus::InProgress => "IN_PROGRESS",
        };
        f.write_str(s)
    }
}

pub type CommandReasonCode = u32;

pub const REASON_CODE_UNSPECIFIED: CommandReasonCode = 0x0000_0000;
pub const REASON_CODE_PRECONDITION_FAILED: CommandReasonCode = 0x0000_0001;
pub const REASON_CODE_DECODER_MANIFEST_OUT_OF_SYNC: CommandReasonCode = 0x0000_0002;
pub const REASON_CODE_NO_DECODING_RULES_FOUND: CommandReasonCode = 0x0000_0003;
pub const REASON_CODE_COMMAND_REQUEST_PARSING_FAILED: CommandReasonCode = 0x0000_0004;
pub const REASON_CODE_NO_COMMAND_DISPATCHER_FOUND: CommandReasonCode = 0x0000_0005;
pub const REASON_CODE_STATE_TEMPLATE_OUT_OF_SYNC: CommandReasonCode = 0x0000_0006;
pub const REASON_CODE_ARGUMENT_TYPE_MISMATCH: CommandReasonCode = 0x0000_0007;
pub const REASON_CODE_NOT_SUPPORTED: CommandReasonCode = 0x0000_0008;
pub const REASON_CODE_BUSY: CommandReasonCode = 0x0000_0009;
pub const REASON_CODE_REJECTED: CommandReasonCode = 0x0000_000A;
pub const REASON_CODE_ACCESS_DENIED: CommandReasonCode = 0x0000_000B;
pub const REASON_CODE_ARGUMENT_OUT_OF_RANGE: CommandReasonCode = 0x0000_000C;
pub const REASON_CODE_INTERNAL_ERROR: CommandReasonCode = 0x0000_000D;
pub const REASON_CODE_UNAVAILABLE: CommandReasonCode = 0x0000_000E;
pub const REASON_CODE_WRITE_FAILED: CommandReasonCode = 0x0000_000F;
pub const REASON_CODE_STATE_TEMPLATE_ALREADY_ACTIVATED: CommandReasonCode = 0x0000_0010;
pub const REASON_CODE_STATE_TEMPLATE_ALREADY_DEACTIVATED: CommandReasonCode = 0x0000_0011;
pub const REASON_CODE_TIMED_OUT_BEFORE_DISPATCH: CommandReasonCode = 0x0000_0012;
pub const REASON_CODE_NO_RESPONSE: CommandReasonCode = 0x0000_0013;

pub const REASON_CODE_AGENT_RANGE_END: CommandReasonCode = 0x0000_FFFF;
pub const REASON_CODE_OEM_RANGE_START: CommandReasonCode = 0x0001_0000;
pub const REASON_CODE_OEM_RANGE_END: CommandReasonCode = 0x0001_FFFF;

pub type CommandReasonDescription = String;

/// Callback invoked by a dispatcher to report command status. It may be
/// called multiple times with `InProgress`, and at most once with a
/// terminal status, per §6.
pub type NotifyCommandStatusCallback =
    Box<dyn FnMut(CommandStatus, CommandReasonCode, CommandReasonDescription) + Send>;

/// Scalar type of an actuator argument. STRING values never travel inline;
/// they are referenced by a `RawDataHandle` into the buffer manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalType {
    UInt8,
    Int8,
    UInt16,
    Int16,
    UInt32,
    Int32,
    UInt64,
    Int64,
    Float,
    Double,
    Boolean,
    String,
}

impl SignalType {
    /// Byte width of the scalar when encoded in network byte order. STRING
    /// has no fixed width (it's a variable-length blob), so it returns None.
    pub fn wire_width(self) -> Option<usize> {
        match self {
            SignalType::UInt8 | SignalType::Int8 | SignalType::Boolean => Some(1),
            SignalType::UInt16 | SignalType::Int16 => Some(2),
            SignalType::UInt32 | SignalType::Int32 | SignalType::Float => Some(4),
            SignalType::UInt64 | SignalType::Int64 | SignalType::Double => Some(8),
            SignalType::String => None,
        }
    }
}

use crate::buffer::RawDataHandle;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SignalValue {
    UInt8(u8),
    Int8(i8),
    UInt16(u16),
    Int16(i16),
    UInt32(u32),
    Int32(i32),
    UInt64(u64),
    Int64(i64),
    Float(f32),
    Double(f64),
    Boolean(bool),
    /// `typeId` identifies which per-type buffer the handle was allocated
    /// from; `handle` is the borrow key into the buffer manager.
    String { type_id: u32, handle: RawDataHandle },
}

impl SignalValue {
    pub fn signal_type(&self) -> SignalType {
        match self {
            SignalValue::UInt8(_) => SignalType::UInt8,
            SignalValue::Int8(_) => SignalType::Int8,
            SignalValue::UInt16(_) => SignalType::UInt16,
            SignalValue::Int16(_) => SignalType::Int16,
            SignalValue::UInt32(_) => SignalType::UInt32,
            SignalValue::Int32(_) => SignalType::Int32,
            SignalValue::UInt64(_) => SignalType::UInt64,
            SignalValue::Int64(_) => SignalType::Int64,
            SignalValue::Float(_) => SignalType::Float,
            SignalValue::Double(_) => SignalType::Double,
            SignalValue::Boolean(_) => SignalType::Boolean,
            SignalValue::String { .. } => SignalType::String,
        }
    }
}

pub type Timestamp = u64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActuatorCommandRequest {
    pub command_id: CommandId,
    pub decoder_manifest_id: String,
    pub signal_id: u32,
    pub signal_value: SignalValue,
    pub issued_timestamp_ms: Timestamp,
    /// Relative to `issued_timestamp_ms`. Zero means no timeout.
    pub execution_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LastKnownStateOperation {
    Activate { deactivate_after_seconds: u32 },
    Deactivate,
    FetchSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastKnownStateCommandRequest {
    pub command_id: CommandId,
    pub state_template_id: String,
    pub operation: LastKnownStateOperation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub command_id: CommandId,
    pub status: CommandStatus,
    pub reason_code: CommandReasonCode,
    pub reason_description: String,
}

/// Identifies which dispatcher backend (interface) decodes a given signal.
pub type InterfaceId = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomSignalDecoder {
    pub interface_id: InterfaceId,
    pub decoder_name: String,
}

/// Mapping signalID -> decoder, associated with one decoder manifest version.
pub type SignalIdToCustomSignalDecoderFormatMap = std::collections::HashMap<u32, CustomSignalDecoder>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_status_numeric_values_match_wire_encoding() {
        assert_eq!(CommandStatus::Succeeded as u8, 1);
        assert_eq!(CommandStatus::ExecutionTimeout as u8, 2);
        assert_eq!(CommandStatus::ExecutionFailed as u8, 4);
        assert_eq!(CommandStatus::InProgress as u8, 10);
    }

    #[test]
    fn command_status_from_wire_rejects_gaps() {
        assert!(CommandStatus::from_wire(3).is_none());
        assert!(CommandStatus::from_wire(0).is_none());
        assert_eq!(CommandStatus::from_wire(1), Some(CommandStatus::Succeeded));
    }

    #[test]
    fn only_in_progress_is_non_terminal() {
        assert!(!CommandStatus::InProgress.is_terminal());
        assert!(CommandStatus::Succeeded.is_terminal());
        assert!(CommandStatus::ExecutionTimeout.is_terminal());
        assert!(CommandStatus::ExecutionFailed.is_terminal());
    }

    #[test]
    fn reason_code_ranges_dont_overlap() {
        assert!(REASON_CODE_AGENT_RANGE_END < REASON_CODE_OEM_RANGE_START);
        assert!(REASON_CODE_OEM_RANGE_START < REASON_CODE_OEM_RANGE_END);
    }
}
