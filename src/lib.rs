//! # fleetbridge
//!
//! The edge-vehicle runtime core for a remote-command and telemetry agent
//! that bridges a cloud control plane with in-vehicle networks. It receives
//! actuator commands and state-template activation commands, dispatches
//! them to a CAN-bus wire backend or a SOME/IP service proxy, tracks
//! execution against deadlines, and returns responses to the cloud. It also
//! ingests raw variable-size payloads (camera frames, point clouds,
//! strings) into a bounded, quota-enforced shared pool.
//!
//! ## Modules
//!
//! - [`buffer`] — the raw data buffer manager: bounded per-type pools,
//!   reference-counted borrows, usage hints, eviction.
//! - [`dispatcher`] — the CAN and SOME/IP command dispatchers behind a
//!   shared `CommandDispatcher` trait.
//! - [`manager`] — the actuator command manager: FIFO dispatch, decoder
//!   manifest cross-check, response queueing.
//! - [`ingress`] — the command schema ingress: payload parsing, range
//!   checks, string staging.
//! - [`egress`] — the bounded response queue shared with the transport
//!   layer.
//! - [`command`] — the wire-agnostic command data model shared by every
//!   other module.
//! - [`transport`] — a minimal, non-normative TCP adapter used by the
//!   `agent-bridge` binary; not a cloud wire protocol.
//! - [`config`] — process configuration, loaded once from TOML.
//! - [`clock`] — the injectable time capability used throughout for
//!   deterministic deadline/timeout tests.

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod buffer;
pub mod clock;
pub mod command;
pub mod config;
pub mod dispatcher;
pub mod egress;
pub mod error;
pub mod ingress;
pub mod manager;
pub mod transport;

pub use buffer::{BufferManager, BufferManagerConfig, LoanedFrame, RawDataHandle, UsageStage};
pub use command::{ActuatorCommandRequest, CommandResponse, CommandStatus, SignalValue};
pub use dispatcher::CommandDispatcher;
pub use egress::ResponseEgress;
pub use ingress::{IngestOutcome, Ingress};
pub use manager::ActuatorCommandManager;
