//! Pipeline abstraction layer for telecast
//!
//! This module wraps the external media framework and the state each stream
//! slot carries around it:
//! - Interface: building pipelines, state changes, bus events, checkpoints
//! - Descriptions: textual pipelines per codec, platform and role
//! - Simulation: an in-process backend used by tests and demo runs
//! - Bookkeeping: supervisor states, health counters, stage clocks
//!
//! # Architecture
//!
//! A pipeline is described as a chain of framework elements separated by `!`.
//! Identity elements between the processing stages act as checkpoints: every
//! buffer passing one triggers the subscribed `CheckpointObserver`, which
//! feeds the latency telemetry of that stream.

pub mod backend;
pub mod clock;
pub mod description;
pub mod health;
pub mod simulated;
pub mod state;
pub mod types;

pub use backend::{BusEvent, CheckpointObserver, MediaBackend, PipelineHandle, TargetState};
pub use clock::{StageClock, SystemStageClock};
pub use health::StreamHealth;
pub use state::SupervisorState;
pub use types::{StreamId, StreamRole, StreamSide, Timestamp};
