use thiserror::Error;

use crate::pipeline::backend::{BackendError, BusEvent};
use crate::pipeline::description::DescriptionError;
use crate::pipeline::types::StreamId;

/// A pipeline could not be constructed; only this attempt is affected
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Description(#[from] DescriptionError),

    #[error("backend refused the pipeline: {0}")]
    Backend(#[source] BackendError),

    #[error("cannot subscribe to checkpoint {checkpoint}: {source}")]
    Subscribe {
        checkpoint: &'static str,
        #[source]
        source: BackendError,
    },
}

/// The constructed pipeline refused to start playing
#[derive(Debug, Error)]
#[error("{stream} refused to start playing: {source}")]
pub struct StateTransitionError {
    pub stream: StreamId,
    #[source]
    pub source: BackendError,
}

/// Either half of bringing a pipeline up
#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Play(#[from] StateTransitionError),
}

/// The running pipeline reported a terminal bus event
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamingError {
    #[error("pipeline error: {0}")]
    Bus(String),

    #[error("unexpected end of stream")]
    EndOfStream,
}

impl From<BusEvent> for StreamingError {
    fn from(event: BusEvent) -> Self {
        match event {
            BusEvent::Error(message) => StreamingError::Bus(message),
            BusEvent::EndOfStream => StreamingError::EndOfStream,
        }
    }
}

/// A cosmetic change could not be applied to the running pipeline
#[derive(Debug, Error)]
pub enum DynamicUpdateError {
    #[error(transparent)]
    Description(#[from] DescriptionError),

    #[error(transparent)]
    Property(#[from] BackendError),
}
