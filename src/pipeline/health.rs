//! Health counters for one stream slot

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::state::SupervisorState;

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_micros() as u64
}

/// Health metrics for a stream slot
///
/// Written by the supervisor thread and by checkpoint callbacks, read by the
/// periodic summary log and by tests. Counters use atomic operations; the
/// current supervisor state sits behind a mutex since it is not a plain number.
pub struct StreamHealth {
    /// Frames folded into a complete latency record
    pub frames_recorded: AtomicU64,

    /// Frame runs discarded because checkpoints were missing or out of order
    pub frames_skipped: AtomicU64,

    /// Failed attempts to stamp frame metadata into outgoing packets
    pub codec_errors: AtomicU64,

    /// Pipelines successfully constructed
    pub builds: AtomicU64,

    /// Build or play-transition failures
    pub build_failures: AtomicU64,

    /// Error/end-of-stream events while playing
    pub streaming_failures: AtomicU64,

    /// Cosmetic changes applied to a running pipeline
    pub live_updates: AtomicU64,

    /// Pipelines torn down for a structural change or failed live update
    pub planned_rebuilds: AtomicU64,

    /// Current consecutive failure count of the supervisor
    pub consecutive_failures: AtomicU64,

    /// Unix microseconds of the last folded frame
    pub last_frame_time: AtomicU64,

    state: Mutex<SupervisorState>,
}

impl StreamHealth {
    pub fn new() -> Self {
        Self {
            frames_recorded: AtomicU64::new(0),
            frames_skipped: AtomicU64::new(0),
            codec_errors: AtomicU64::new(0),
            builds: AtomicU64::new(0),
            build_failures: AtomicU64::new(0),
            streaming_failures: AtomicU64::new(0),
            live_updates: AtomicU64::new(0),
            planned_rebuilds: AtomicU64::new(0),
            consecutive_failures: AtomicU64::new(0),
            last_frame_time: AtomicU64::new(now_micros()),
            state: Mutex::new(SupervisorState::Idle),
        }
    }

    pub fn record_frame(&self) {
        self.last_frame_time.store(now_micros(), Ordering::Relaxed);
        self.frames_recorded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skip(&self) {
        self.frames_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the error count including this one
    pub fn record_codec_error(&self) -> u64 {
        self.codec_errors.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_build(&self) {
        self.builds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_build_failure(&self) {
        self.build_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_streaming_failure(&self) {
        self.streaming_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_live_update(&self) {
        self.live_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_planned_rebuild(&self) {
        self.planned_rebuilds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_consecutive_failures(&self, count: u32) {
        self.consecutive_failures
            .store(count as u64, Ordering::Relaxed);
    }

    pub fn set_state(&self, state: SupervisorState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn frames_recorded(&self) -> u64 {
        self.frames_recorded.load(Ordering::Relaxed)
    }

    pub fn frames_skipped(&self) -> u64 {
        self.frames_skipped.load(Ordering::Relaxed)
    }

    pub fn builds(&self) -> u64 {
        self.builds.load(Ordering::Relaxed)
    }

    pub fn live_updates(&self) -> u64 {
        self.live_updates.load(Ordering::Relaxed)
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Check if no frame was folded for the given duration
    pub fn is_stalled(&self, threshold: Duration) -> bool {
        let elapsed_micros = now_micros().saturating_sub(self.last_frame_time.load(Ordering::Relaxed));
        elapsed_micros > threshold.as_micros() as u64
    }

    /// Get a summary of health metrics
    pub fn summary(&self) -> HealthSummary {
        HealthSummary {
            state: self.state(),
            frames_recorded: self.frames_recorded(),
            frames_skipped: self.frames_skipped(),
            codec_errors: self.codec_errors.load(Ordering::Relaxed),
            builds: self.builds(),
            build_failures: self.build_failures.load(Ordering::Relaxed),
            streaming_failures: self.streaming_failures.load(Ordering::Relaxed),
            live_updates: self.live_updates(),
            planned_rebuilds: self.planned_rebuilds.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures(),
        }
    }
}

impl Default for StreamHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of health metrics
#[derive(Debug, Clone)]
pub struct HealthSummary {
    pub state: SupervisorState,
    pub frames_recorded: u64,
    pub frames_skipped: u64,
    pub codec_errors: u64,
    pub builds: u64,
    pub build_failures: u64,
    pub streaming_failures: u64,
    pub live_updates: u64,
    pub planned_rebuilds: u64,
    pub consecutive_failures: u64,
}

impl std::fmt::Display for HealthSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Health: {} | {} frames ({} skipped, {} codec errors), {} builds ({} failed), {} streaming failures, {} live updates, {} rebuilds, {} consecutive failures",
            self.state,
            self.frames_recorded,
            self.frames_skipped,
            self.codec_errors,
            self.builds,
            self.build_failures,
            self.streaming_failures,
            self.live_updates,
            self.planned_rebuilds,
            self.consecutive_failures
        )
    }
}
