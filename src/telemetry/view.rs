//! Receiver-side view of a frame: sender stages, transit, receiver stages

use std::fmt;
use std::time::Duration;

use super::codec::FrameMetadata;
use super::recorder::FrameLatencyRecord;
use crate::pipeline::types::Timestamp;

/// Network transit of a frame, derived from two different hosts' clocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transit {
    Measured(Duration),
    /// No sender completion time or no arrival time
    Unknown,
    /// The sender's timestamp lies in the receiver's future
    ClockSkew { ahead_by: Duration },
    /// The frame is not newer than the last completed one
    OutOfOrder,
}

impl Transit {
    pub fn between(
        sent: Option<Timestamp>,
        arrived: Option<Timestamp>,
        frame_id: Option<u64>,
        last_completed: Option<u64>,
    ) -> Self {
        if let (Some(id), Some(last)) = (frame_id, last_completed) {
            if id <= last {
                return Transit::OutOfOrder;
            }
        }
        let (Some(sent), Some(arrived)) = (sent, arrived) else {
            return Transit::Unknown;
        };
        match arrived.since(sent) {
            Some(d) => Transit::Measured(d),
            None => Transit::ClockSkew {
                ahead_by: sent.since(arrived).unwrap_or(Duration::ZERO),
            },
        }
    }

    pub fn measured(&self) -> Option<Duration> {
        match self {
            Transit::Measured(d) => Some(*d),
            _ => None,
        }
    }
}

impl fmt::Display for Transit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transit::Measured(d) => write!(f, "{:.2}ms", d.as_secs_f64() * 1000.0),
            Transit::Unknown => f.write_str("?"),
            Transit::ClockSkew { ahead_by } => {
                write!(f, "skew(+{:.2}ms)", ahead_by.as_secs_f64() * 1000.0)
            }
            Transit::OutOfOrder => f.write_str("out-of-order"),
        }
    }
}

/// End-to-end breakdown of one received frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBreakdown {
    pub frame_id: Option<u64>,
    pub sender_stages: Vec<(&'static str, Option<Duration>)>,
    pub transit: Transit,
    pub receiver: FrameLatencyRecord,
}

impl FrameBreakdown {
    /// Combine the latest known sender values with a folded receiver record
    pub fn combine(
        sender_labels: &[&'static str],
        sender: &FrameMetadata,
        receiver: FrameLatencyRecord,
        arrived: Option<Timestamp>,
        last_completed: Option<u64>,
    ) -> Self {
        let frame_id = receiver.frame_id.or(sender.frame_id);
        let sender_stages = sender_labels
            .iter()
            .enumerate()
            .map(|(i, label)| (*label, sender.stage_durations.get(i).copied().flatten()))
            .collect();
        let transit = Transit::between(sender.completed_at, arrived, frame_id, last_completed);

        Self {
            frame_id,
            sender_stages,
            transit,
            receiver,
        }
    }

    /// Sum of every segment, only when all of them are known
    pub fn end_to_end(&self) -> Option<Duration> {
        let sender: Option<Duration> = self.sender_stages.iter().map(|(_, d)| *d).sum();
        Some(sender? + self.transit.measured()? + self.receiver.total())
    }
}

impl fmt::Display for FrameBreakdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.frame_id {
            Some(id) => write!(f, "frame {} |", id)?,
            None => write!(f, "frame ? |")?,
        }
        for (name, duration) in &self.sender_stages {
            match duration {
                Some(d) => write!(f, " {}={:.2}ms", name, d.as_secs_f64() * 1000.0)?,
                None => write!(f, " {}=?", name)?,
            }
        }
        write!(f, " | transit={} |", self.transit)?;
        for stage in &self.receiver.stages {
            write!(f, " {}={:.2}ms", stage.name, stage.duration.as_secs_f64() * 1000.0)?;
        }
        match self.end_to_end() {
            Some(total) => write!(f, " | e2e={:.2}ms", total.as_secs_f64() * 1000.0),
            None => write!(f, " | e2e=?"),
        }
    }
}
