//! Internal, per-module error types. These are distinct from `CommandStatus`
//! / `CommandReasonCode` (§3): an `Err` here is the *cause*, and every call
//! site that can produce one maps it to a wire-level status/reason pair
//! before it crosses a dispatcher or response-queue boundary (§7.1).

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("unknown buffer type {0}")]
    UnknownType(u32),
    #[error("buffer type {0} is marked deleting and accepts no new pushes")]
    BufferDeleting(u32),
    #[error("sample of {size} bytes exceeds max_bytes_per_sample of {max} for type {type_id}")]
    SampleTooLarge { type_id: u32, size: usize, max: usize },
    #[error("no space available for type {0}")]
    OutOfMemory(u32),
    #[error("unknown handle {0:?} for type {1}")]
    UnknownHandle(crate::buffer::RawDataHandle, u32),
    #[error("invalid usage stage index {0}")]
    InvalidStage(usize),
}

#[derive(Debug, Error)]
pub enum CanDispatchError {
    #[error("failed to set up CAN socket on {0}: {1}")]
    SocketSetupFailed(String, String),
    #[error("response frame truncated while reading field {0}")]
    FrameTruncated(&'static str),
    #[error("request payload of {0} bytes exceeds CANFD_MAX_DLEN ({1})")]
    PayloadTooLarge(usize, usize),
}

#[derive(Debug, Error)]
pub enum CommandManagerError {
    #[error("an interface with id {0} is already registered")]
    DuplicateInterface(String),
    #[error("dispatcher for interface {0} failed to initialize")]
    DispatcherInitFailed(String),
    #[error("command manager is not running")]
    NotRunning,
}

#[derive(Debug, Error)]
pub enum IngressError {
    #[error("payload of {0} bytes exceeds the configured maximum of {1}")]
    PayloadTooLarge(usize, usize),
    #[error("malformed message: {0}")]
    MalformedJson(String),
    #[error("signal {0} is not configured in the buffer manager")]
    UnknownSignal(u32),
}
