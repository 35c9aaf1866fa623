use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::pipeline::types::StreamId;

struct StageTotal {
    name: String,
    total_us: AtomicU64,
    samples: AtomicU64,
}

/// Lightweight per-stage accumulation of folded frame latencies,
/// logged and reset periodically.
pub struct StageStats {
    stream: StreamId,
    stages: Vec<StageTotal>,
    pub frames: AtomicU64,
    pub skipped: AtomicU64,
}

impl StageStats {
    pub fn new<I, S>(stream: StreamId, stage_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            stream,
            stages: stage_names
                .into_iter()
                .map(|name| StageTotal {
                    name: name.into(),
                    total_us: AtomicU64::new(0),
                    samples: AtomicU64::new(0),
                })
                .collect(),
            frames: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
        }
    }

    /// Unknown stage names are ignored
    pub fn add(&self, stage: &str, duration: Duration) {
        if let Some(total) = self.stages.iter().find(|s| s.name == stage) {
            total
                .total_us
                .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
            total.samples.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_frame(&self) {
        self.frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skip(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Mean per stage since the last reset, `None` for stages without samples
    pub fn averages(&self) -> Vec<(String, Option<Duration>)> {
        self.stages
            .iter()
            .map(|s| {
                let n = s.samples.load(Ordering::Relaxed);
                let avg = (n > 0)
                    .then(|| Duration::from_micros(s.total_us.load(Ordering::Relaxed) / n));
                (s.name.clone(), avg)
            })
            .collect()
    }

    pub fn log_summary(&self) {
        let frames = self.frames.load(Ordering::Relaxed);
        let skipped = self.skipped.load(Ordering::Relaxed);

        let stages: Vec<String> = self
            .averages()
            .into_iter()
            .map(|(name, avg)| match avg {
                Some(avg) => format!("{}={:.1}ms", name, avg.as_secs_f64() * 1000.0),
                None => format!("{}=?", name),
            })
            .collect();

        log::info!(
            "Latency [{}]: {} | frames={} skipped={}",
            self.stream,
            stages.join(" "),
            frames,
            skipped,
        );

        // Reset counters for next interval
        for stage in &self.stages {
            stage.total_us.store(0, Ordering::Relaxed);
            stage.samples.store(0, Ordering::Relaxed);
        }
        self.frames.store(0, Ordering::Relaxed);
        self.skipped.store(0, Ordering::Relaxed);
    }
}
