use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{info, warn};

use crate::pipeline::backend::{PipelineHandle, TargetState};
use crate::pipeline::types::StreamId;

/// Running pipelines, reachable from the shutdown path
///
/// Supervisors own their handles; the registry only keeps a second reference
/// so a termination signal can stop every pipeline without waiting for the
/// supervisor threads to notice.
#[derive(Clone, Default)]
pub struct HandleRegistry {
    handles: Arc<Mutex<HashMap<StreamId, Arc<dyn PipelineHandle>>>>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, stream: StreamId, handle: Arc<dyn PipelineHandle>) {
        self.lock().insert(stream, handle);
    }

    pub fn unregister(&self, stream: StreamId) {
        self.lock().remove(&stream);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Best-effort stop of every registered pipeline; returns how many stopped cleanly
    pub fn stop_all(&self, timeout: Duration) -> usize {
        // Stop outside the lock so supervisors can still unregister
        let handles: Vec<(StreamId, Arc<dyn PipelineHandle>)> = self
            .lock()
            .iter()
            .map(|(id, handle)| (*id, handle.clone()))
            .collect();

        let mut stopped = 0;
        for (stream, handle) in handles {
            match handle.set_state(TargetState::Null, timeout) {
                Ok(()) => {
                    info!("[{}] pipeline {} stopped", stream, handle.name());
                    stopped += 1;
                }
                Err(e) => warn!("[{}] failed to stop pipeline {}: {}", stream, handle.name(), e),
            }
        }
        stopped
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<StreamId, Arc<dyn PipelineHandle>>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
