//! Folding checkpoint timestamps into per-frame latency records

use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{error, info};

use super::plan::{CheckpointPlan, FoldTrigger, Pick};
use crate::config::BenchmarkSettings;
use crate::pipeline::types::{StreamId, Timestamp};

/// Time spent between two consecutive checkpoints
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageLatency {
    pub name: &'static str,
    pub duration: Duration,
}

/// Latency breakdown of one frame through one pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameLatencyRecord {
    pub frame_id: Option<u64>,
    pub stages: Vec<StageLatency>,
}

impl FrameLatencyRecord {
    pub fn total(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }

    pub fn stage(&self, name: &str) -> Option<Duration> {
        self.stages.iter().find(|s| s.name == name).map(|s| s.duration)
    }
}

impl fmt::Display for FrameLatencyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.frame_id {
            Some(id) => write!(f, "frame {}:", id)?,
            None => write!(f, "frame ?:")?,
        }
        for stage in &self.stages {
            write!(f, " {}={:.2}ms", stage.name, stage.duration.as_secs_f64() * 1000.0)?;
        }
        write!(f, " total={:.2}ms", self.total().as_secs_f64() * 1000.0)
    }
}

/// Outcome of closing a run of checkpoint hits
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fold {
    Record(FrameLatencyRecord),
    /// A checkpoint had no hit, or hits were out of order
    Skipped,
}

#[derive(Debug)]
struct Benchmark {
    cap: usize,
    path: PathBuf,
    rows: Vec<Vec<Timestamp>>,
}

/// Collects checkpoint hits of one stream and folds them per frame
#[derive(Debug)]
pub struct LatencyRecorder {
    stream: StreamId,
    plan: CheckpointPlan,
    series: Vec<Vec<Timestamp>>,
    frame_id: Option<u64>,
    skipped: u64,
    benchmark: Option<Benchmark>,
    halted: bool,
}

impl LatencyRecorder {
    pub fn new(stream: StreamId, plan: CheckpointPlan) -> Self {
        let series = vec![Vec::new(); plan.len()];
        Self {
            stream,
            plan,
            series,
            frame_id: None,
            skipped: 0,
            benchmark: None,
            halted: false,
        }
    }

    /// Keep raw timestamps of folded frames and dump them once `samples` are in
    pub fn with_benchmark(mut self, settings: &BenchmarkSettings) -> Self {
        let path = settings
            .dump_dir
            .join(format!("{}_latency.csv", self.stream));
        self.benchmark = Some(Benchmark {
            cap: settings.samples.max(1),
            path,
            rows: Vec::with_capacity(settings.samples),
        });
        self
    }

    pub fn plan(&self) -> &CheckpointPlan {
        &self.plan
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Attach a frame id to the run in progress
    pub fn tag_frame(&mut self, id: u64) {
        self.frame_id = Some(id);
    }

    /// Append a hit; returns the fold outcome when this hit closed a run
    ///
    /// Unknown checkpoint names are ignored.
    pub fn record_checkpoint(&mut self, checkpoint: &str, at: Timestamp) -> Option<Fold> {
        if self.halted {
            return None;
        }
        let index = self.plan.position(checkpoint)?;

        match self.plan.trigger() {
            FoldTrigger::NextIngress => {
                let fold = if index == 0 && self.has_pending() {
                    Some(self.fold())
                } else {
                    None
                };
                self.series[index].push(at);
                fold
            }
            FoldTrigger::Finalize => {
                self.series[index].push(at);
                (index == self.plan.len() - 1).then(|| self.fold())
            }
        }
    }

    /// Provisional record of the run in progress
    ///
    /// `now` stands in for the final checkpoint when it has not fired yet.
    pub fn in_flight(&self, now: Timestamp) -> Option<FrameLatencyRecord> {
        let mut selected = self.selected()?;
        let last = self.series.len() - 1;
        if self.series[last].is_empty() {
            selected[last] = Some(now);
        }
        let selected: Option<Vec<Timestamp>> = selected.into_iter().collect();
        self.durations(&selected?).map(|stages| FrameLatencyRecord {
            frame_id: self.frame_id,
            stages,
        })
    }

    fn has_pending(&self) -> bool {
        self.series.iter().any(|s| !s.is_empty())
    }

    // Per checkpoint, the hit chosen by its pick rule. `None` inside the
    // vector marks a checkpoint without hits; the outer `None` means the run
    // has not started.
    fn selected(&self) -> Option<Vec<Option<Timestamp>>> {
        if !self.has_pending() {
            return None;
        }
        Some(
            self.plan
                .checkpoints()
                .iter()
                .zip(&self.series)
                .map(|(checkpoint, hits)| match checkpoint.pick {
                    Pick::First => hits.first().copied(),
                    Pick::Last => hits.last().copied(),
                })
                .collect(),
        )
    }

    fn durations(&self, selected: &[Timestamp]) -> Option<Vec<StageLatency>> {
        selected
            .windows(2)
            .zip(&self.plan.checkpoints()[1..])
            .map(|(pair, checkpoint)| {
                pair[1].since(pair[0]).map(|duration| StageLatency {
                    name: checkpoint.stage,
                    duration,
                })
            })
            .collect()
    }

    fn fold(&mut self) -> Fold {
        let selected: Option<Vec<Timestamp>> = self
            .selected()
            .and_then(|hits| hits.into_iter().collect());
        let frame_id = self.frame_id.take();
        for hits in &mut self.series {
            hits.clear();
        }

        let record = selected.and_then(|selected| {
            let stages = self.durations(&selected)?;
            Some((selected, stages))
        });

        let Some((selected, stages)) = record else {
            self.skipped += 1;
            return Fold::Skipped;
        };

        self.collect_sample(selected);
        Fold::Record(FrameLatencyRecord { frame_id, stages })
    }

    fn collect_sample(&mut self, selected: Vec<Timestamp>) {
        let Some(bench) = self.benchmark.as_mut() else {
            return;
        };
        bench.rows.push(selected);
        if bench.rows.len() < bench.cap {
            return;
        }

        match write_samples(&bench.path, &self.plan.names(), &bench.rows) {
            Ok(()) => info!(
                "[{}] wrote {} latency samples to {}",
                self.stream,
                bench.rows.len(),
                bench.path.display()
            ),
            Err(e) => error!(
                "[{}] failed to write latency samples to {}: {}",
                self.stream,
                bench.path.display(),
                e
            ),
        }
        bench.rows.clear();
        self.halted = true;
    }
}

fn write_samples(path: &Path, names: &[&str], rows: &[Vec<Timestamp>]) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "# captured {}", chrono::Local::now().to_rfc3339())?;
    writeln!(out, "{}", names.join(","))?;
    for row in rows {
        let line: Vec<String> = row.iter().map(|t| t.micros.to_string()).collect();
        writeln!(out, "{}", line.join(","))?;
    }
    out.flush()
}
