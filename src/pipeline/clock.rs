//! Stage clock for checkpoint timestamps

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use super::types::Timestamp;

/// Time source for checkpoint sampling
///
/// Two readings are provided:
/// - a monotonic reading, used for stage durations inside one process
/// - a real-time reading (microseconds since the Unix epoch), the only one
///   comparable across hosts and therefore the one carried on the wire
pub trait StageClock: Send + Sync {
    fn monotonic(&self) -> Timestamp;

    fn realtime(&self) -> Timestamp;
}

/// Wall clock backed by `Instant` and `SystemTime`
///
/// Monotonic timestamps are relative to the base instant captured on creation.
/// Cloning shares the base, so every clone produces comparable readings.
#[derive(Clone)]
pub struct SystemStageClock {
    base: Arc<Instant>,
}

impl SystemStageClock {
    /// Create a new clock starting now
    pub fn new() -> Self {
        Self {
            base: Arc::new(Instant::now()),
        }
    }

    /// Create a new clock with a specific base instant
    pub fn with_base(base: Instant) -> Self {
        Self {
            base: Arc::new(base),
        }
    }

    pub fn base(&self) -> Instant {
        *self.base
    }
}

impl StageClock for SystemStageClock {
    fn monotonic(&self) -> Timestamp {
        Timestamp::from_duration(self.base.elapsed())
    }

    fn realtime(&self) -> Timestamp {
        // A system clock set before the epoch reads as zero
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Timestamp::from_duration(since_epoch)
    }
}

impl Default for SystemStageClock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SystemStageClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemStageClock")
            .field("elapsed", &self.base.elapsed())
            .finish()
    }
}

/// Manually driven clock for deterministic tests and replays
///
/// Real-time readings are the monotonic reading shifted by a fixed offset.
#[derive(Debug, Clone, Default)]
pub struct ManualStageClock {
    now: Arc<AtomicI64>,
    realtime_offset: Arc<AtomicI64>,
}

impl ManualStageClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, micros: i64) {
        self.now.store(micros, Ordering::SeqCst);
    }

    pub fn advance(&self, delta: Duration) {
        self.now
            .fetch_add(delta.as_micros() as i64, Ordering::SeqCst);
    }

    pub fn set_realtime_offset(&self, micros: i64) {
        self.realtime_offset.store(micros, Ordering::SeqCst);
    }
}

impl StageClock for ManualStageClock {
    fn monotonic(&self) -> Timestamp {
        Timestamp::from_micros(self.now.load(Ordering::SeqCst))
    }

    fn realtime(&self) -> Timestamp {
        Timestamp::from_micros(
            self.now.load(Ordering::SeqCst) + self.realtime_offset.load(Ordering::SeqCst),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_clock_basic() {
        let clock = SystemStageClock::new();

        thread::sleep(Duration::from_millis(10));

        let first = clock.monotonic();
        let second = clock.monotonic();
        assert!(first.micros >= 10_000);
        assert!(second >= first);
    }

    #[test]
    fn test_clones_share_base() {
        let clock = SystemStageClock::new();
        let other = clock.clone();
        thread::sleep(Duration::from_millis(5));

        let diff = (clock.monotonic().micros - other.monotonic().micros).abs();
        assert!(diff < 1000, "Timestamps differ by {} microseconds", diff);
    }

    #[test]
    fn test_realtime_is_epoch_based() {
        let clock = SystemStageClock::new();
        // 2020-01-01 in microseconds
        assert!(clock.realtime().micros > 1_577_836_800_000_000);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualStageClock::new();
        clock.set(1_000);
        clock.advance(Duration::from_micros(250));
        clock.set_realtime_offset(1_700_000_000_000_000);

        assert_eq!(clock.monotonic(), Timestamp::from_micros(1_250));
        assert_eq!(
            clock.realtime(),
            Timestamp::from_micros(1_700_000_000_001_250)
        );
    }
}
