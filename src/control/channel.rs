use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::config::StreamConfig;

#[derive(Debug, Default)]
struct Shared {
    snapshot: Mutex<Option<StreamConfig>>,
    version: AtomicU64,
}

/// Latest accepted configuration plus a version readable without locking
///
/// Version 0 means nothing was published yet. The version is bumped while the
/// snapshot lock is held, so `snapshot()` never pairs a version with another
/// version's configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigChannel {
    shared: Arc<Shared>,
}

impl ConfigChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the configuration, returning its version
    pub fn publish(&self, config: StreamConfig) -> u64 {
        let mut snapshot = self
            .shared
            .snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *snapshot = Some(config);
        self.shared.version.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn version(&self) -> u64 {
        self.shared.version.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> Option<(u64, StreamConfig)> {
        let snapshot = self
            .shared
            .snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let config = snapshot.clone()?;
        Some((self.shared.version.load(Ordering::Acquire), config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_versions_start_at_one() {
        let channel = ConfigChannel::new();
        assert_eq!(channel.version(), 0);
        assert!(channel.snapshot().is_none());

        assert_eq!(channel.publish(StreamConfig::default()), 1);
        let mut next = StreamConfig::default();
        next.fps = 30;
        assert_eq!(channel.publish(next.clone()), 2);

        assert_eq!(channel.snapshot(), Some((2, next)));
    }

    #[test]
    fn test_snapshot_is_consistent_under_concurrent_publish() {
        let channel = ConfigChannel::new();
        let writer = {
            let channel = channel.clone();
            thread::spawn(move || {
                for fps in 1..=500u32 {
                    channel.publish(StreamConfig {
                        fps,
                        ..StreamConfig::default()
                    });
                }
            })
        };

        let mut last = 0;
        while last < 500 {
            if let Some((version, config)) = channel.snapshot() {
                assert_eq!(version, config.fps as u64);
                assert!(version >= last);
                last = version;
            }
        }
        writer.join().unwrap();
    }
}
