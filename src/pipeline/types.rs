//! Core types shared by the pipeline, telemetry and supervisor layers

use std::fmt;
use std::time::Duration;

/// Timestamp in microseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    pub micros: i64,
}

impl Timestamp {
    /// Create a new timestamp from microseconds
    pub fn from_micros(micros: i64) -> Self {
        Self { micros }
    }

    /// Create a timestamp from a duration since the clock origin
    pub fn from_duration(duration: Duration) -> Self {
        Self {
            micros: duration.as_micros() as i64,
        }
    }

    /// Elapsed time from `earlier` to `self`, `None` if `earlier` is later
    pub fn since(&self, earlier: Timestamp) -> Option<Duration> {
        let diff = self.micros.checked_sub(earlier.micros)?;
        u64::try_from(diff).ok().map(Duration::from_micros)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}µs", self.micros)
    }
}

/// Physical camera side of the rig
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StreamSide {
    Left,
    Right,
}

impl StreamSide {
    pub const ALL: [StreamSide; 2] = [StreamSide::Left, StreamSide::Right];

    /// The primary side keeps streaming in mono mode
    pub fn is_primary(&self) -> bool {
        matches!(self, StreamSide::Left)
    }

    pub fn index(&self) -> usize {
        match self {
            StreamSide::Left => 0,
            StreamSide::Right => 1,
        }
    }

    pub fn sensor_id(&self) -> u32 {
        self.index() as u32
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamSide::Left => "left",
            StreamSide::Right => "right",
        }
    }
}

impl fmt::Display for StreamSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of the media flow handled by a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamRole {
    /// Camera → encoder → RTP → network
    Sender,
    /// Network → RTP → decoder → display
    Receiver,
}

impl StreamRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamRole::Sender => "sender",
            StreamRole::Receiver => "receiver",
        }
    }
}

impl fmt::Display for StreamRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque identifier of one stream slot (role + side)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId {
    role: StreamRole,
    side: StreamSide,
}

impl StreamId {
    pub fn new(role: StreamRole, side: StreamSide) -> Self {
        Self { role, side }
    }

    pub fn role(&self) -> StreamRole {
        self.role
    }

    pub fn side(&self) -> StreamSide {
        self.side
    }

    /// Name given to the pipeline instance of this slot
    pub fn pipeline_name(&self) -> String {
        format!("{}_{}", self.role, self.side)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.role, self.side)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_since() {
        let a = Timestamp::from_micros(1_000);
        let b = Timestamp::from_micros(3_500);
        assert_eq!(b.since(a), Some(Duration::from_micros(2_500)));
        assert_eq!(a.since(b), None);
        assert_eq!(a.since(a), Some(Duration::ZERO));
    }

    #[test]
    fn test_stream_id_names() {
        let id = StreamId::new(StreamRole::Receiver, StreamSide::Right);
        assert_eq!(id.to_string(), "receiver-right");
        assert_eq!(id.pipeline_name(), "receiver_right");
        assert!(!id.side().is_primary());
    }
}
