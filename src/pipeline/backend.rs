//! Interface to the external media framework
//!
//! The framework is a black box: it turns a textual description into a
//! running pipeline, reports errors and end-of-stream on a bus, accepts
//! property changes on named elements and calls back whenever a buffer passes
//! a named checkpoint. Everything the supervisor and telemetry layers need is
//! expressed through the two traits below.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::telemetry::codec::{ExtensionReader, ExtensionWriter};

/// Failures reported by the media framework
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("pipeline description rejected: {0}")]
    Parse(String),

    #[error("no element named `{0}`")]
    NoSuchElement(String),

    #[error("state change to {target} refused: {reason}")]
    StateChange { target: TargetState, reason: String },

    #[error("state change to {target} did not complete within {timeout:?}")]
    Timeout { target: TargetState, timeout: Duration },

    #[error("cannot set {element}.{key}: {reason}")]
    Property {
        element: String,
        key: String,
        reason: String,
    },
}

/// Pipeline state requested from the framework
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Playing,
    Null,
}

impl fmt::Display for TargetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetState::Playing => f.write_str("PLAYING"),
            TargetState::Null => f.write_str("NULL"),
        }
    }
}

/// Terminal notifications posted on a pipeline bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    Error(String),
    EndOfStream,
}

impl fmt::Display for BusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusEvent::Error(message) => write!(f, "error: {}", message),
            BusEvent::EndOfStream => f.write_str("end of stream"),
        }
    }
}

/// Value of an element property
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Int(i64),
    Text(String),
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Int(value) => write!(f, "{}", value),
            PropertyValue::Text(value) => f.write_str(value),
        }
    }
}

/// The buffer passing a checkpoint, as far as telemetry cares about it
pub enum BufferView<'a> {
    /// Raw or encoded media, no packet header
    Media,
    /// Outgoing transport packet whose header extensions may be written
    OutgoingPacket(&'a mut dyn ExtensionWriter),
    /// Incoming transport packet whose header extensions may be read
    IncomingPacket(&'a dyn ExtensionReader),
}

/// Receiver of checkpoint callbacks
///
/// Delivery contract: callbacks run synchronously in the framework's
/// streaming thread and block the buffer until they return. Within one
/// pipeline, checkpoints are delivered in pipeline order; no ordering holds
/// across pipelines.
pub trait CheckpointObserver: Send + Sync {
    fn on_checkpoint(&self, checkpoint: &str, buffer: BufferView<'_>);
}

/// A pipeline instance created by the framework
pub trait PipelineHandle: Send + Sync {
    fn name(&self) -> &str;

    /// Request a state change, waiting at most `timeout` for it to complete
    fn set_state(&self, target: TargetState, timeout: Duration) -> Result<(), BackendError>;

    /// Wait at most `timeout` for an error or end-of-stream notification
    fn poll_event(&self, timeout: Duration) -> Option<BusEvent>;

    fn set_property(
        &self,
        element: &str,
        key: &str,
        value: PropertyValue,
    ) -> Result<(), BackendError>;

    /// Subscribe to buffers passing the checkpoint element named `checkpoint`
    fn on_checkpoint(
        &self,
        checkpoint: &str,
        observer: Arc<dyn CheckpointObserver>,
    ) -> Result<(), BackendError>;
}

/// Factory of pipeline instances
pub trait MediaBackend: Send + Sync {
    fn build(&self, name: &str, description: &str) -> Result<Arc<dyn PipelineHandle>, BackendError>;
}
