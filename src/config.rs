use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::description::Platform;
use crate::pipeline::types::{StreamRole, StreamSide};
use crate::supervisor::retry::RetryPolicy;

/// Video codec selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    Jpeg,
    Vp8,
    Vp9,
    H264,
    H265,
}

impl Codec {
    pub fn as_str(&self) -> &'static str {
        match self {
            Codec::Jpeg => "JPEG",
            Codec::Vp8 => "VP8",
            Codec::Vp9 => "VP9",
            Codec::H264 => "H264",
            Codec::H265 => "H265",
        }
    }
}

impl FromStr for Codec {
    type Err = ConfigValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "JPEG" => Ok(Codec::Jpeg),
            "VP8" => Ok(Codec::Vp8),
            "VP9" => Ok(Codec::Vp9),
            "H264" => Ok(Codec::H264),
            "H265" => Ok(Codec::H265),
            other => Err(ConfigValidationError::UnknownCodec(other.to_string())),
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stereo streams both cameras, mono only the primary (left) one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VideoMode {
    Stereo,
    Mono,
}

impl VideoMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoMode::Stereo => "stereo",
            VideoMode::Mono => "mono",
        }
    }
}

impl FromStr for VideoMode {
    type Err = ConfigValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stereo" => Ok(VideoMode::Stereo),
            "mono" => Ok(VideoMode::Mono),
            other => Err(ConfigValidationError::UnknownMode(other.to_string())),
        }
    }
}

impl fmt::Display for VideoMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejection reasons for a configuration that must not be published.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigValidationError {
    #[error("unknown codec `{0}`")]
    UnknownCodec(String),

    #[error("unknown video mode `{0}`")]
    UnknownMode(String),

    #[error("invalid destination address `{0}`")]
    InvalidAddress(String),

    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: i64 },
}

/// Immutable stream configuration snapshot.
///
/// Never mutated in place: every accepted control update produces a new value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub ip: IpAddr,
    pub port_left: u16,
    pub port_right: u16,
    pub codec: Codec,
    pub encoding_quality: u8,
    pub bitrate: u32,
    pub width: u32,
    pub height: u32,
    pub video_mode: VideoMode,
    pub fps: u32,
}

impl StreamConfig {
    pub fn port_for(&self, side: StreamSide) -> u16 {
        match side {
            StreamSide::Left => self.port_left,
            StreamSide::Right => self.port_right,
        }
    }

    /// Whether the given side streams under this configuration
    pub fn side_enabled(&self, side: StreamSide) -> bool {
        self.video_mode == VideoMode::Stereo || side.is_primary()
    }

    /// True iff `next` differs from `self` only in encoding quality and/or
    /// bitrate, which a running pipeline can absorb through property updates.
    pub fn can_update_live(&self, next: &StreamConfig) -> bool {
        self.width == next.width
            && self.height == next.height
            && self.fps == next.fps
            && self.codec == next.codec
            && self.video_mode == next.video_mode
            && self.ip == next.ip
            && self.port_left == next.port_left
            && self.port_right == next.port_right
    }

    pub fn dump(&self) {
        info!("=== Configuration Dump ===");
        info!("  IP Address: {}", self.ip);
        info!("  Port Left: {}", self.port_left);
        info!("  Port Right: {}", self.port_right);
        info!("  Codec: {}", self.codec);
        info!("  Encoding Quality: {}", self.encoding_quality);
        info!("  Bitrate: {}", self.bitrate);
        info!("  Resolution: {}x{}", self.width, self.height);
        info!("  Video Mode: {}", self.video_mode);
        info!("  FPS: {}", self.fps);
    }
}

/// Configuration assumed before the first control update arrives
pub const DEFAULT_STREAM_CONFIG: StreamConfig = StreamConfig {
    ip: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 100)),
    port_left: 8554,
    port_right: 8556,
    codec: Codec::Jpeg,
    encoding_quality: 85,
    bitrate: 400_000,
    width: 1920,
    height: 1080,
    video_mode: VideoMode::Stereo,
    fps: 60,
};

impl Default for StreamConfig {
    fn default() -> Self {
        DEFAULT_STREAM_CONFIG
    }
}

/// Configuration object as it arrives on the control channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawStreamConfig {
    pub ip: String,
    pub port_left: i64,
    pub port_right: i64,
    pub codec: String,
    pub encoding_quality: i64,
    pub bitrate: i64,
    pub horizontal_resolution: i64,
    pub vertical_resolution: i64,
    pub video_mode: String,
    pub fps: i64,
}

impl TryFrom<RawStreamConfig> for StreamConfig {
    type Error = ConfigValidationError;

    fn try_from(raw: RawStreamConfig) -> Result<Self, Self::Error> {
        let ip = raw
            .ip
            .parse::<IpAddr>()
            .map_err(|_| ConfigValidationError::InvalidAddress(raw.ip.clone()))?;

        Ok(StreamConfig {
            ip,
            port_left: in_range("portLeft", raw.port_left, 1, u16::MAX as i64)? as u16,
            port_right: in_range("portRight", raw.port_right, 1, u16::MAX as i64)? as u16,
            codec: raw.codec.parse()?,
            encoding_quality: in_range("encodingQuality", raw.encoding_quality, 0, 100)? as u8,
            bitrate: in_range("bitrate", raw.bitrate, 1, u32::MAX as i64)? as u32,
            width: in_range("horizontalResolution", raw.horizontal_resolution, 1, 16384)? as u32,
            height: in_range("verticalResolution", raw.vertical_resolution, 1, 16384)? as u32,
            video_mode: raw.video_mode.parse()?,
            fps: in_range("fps", raw.fps, 1, 1000)? as u32,
        })
    }
}

impl From<&StreamConfig> for RawStreamConfig {
    fn from(config: &StreamConfig) -> Self {
        Self {
            ip: config.ip.to_string(),
            port_left: config.port_left.into(),
            port_right: config.port_right.into(),
            codec: config.codec.to_string(),
            encoding_quality: config.encoding_quality.into(),
            bitrate: config.bitrate.into(),
            horizontal_resolution: config.width.into(),
            vertical_resolution: config.height.into(),
            video_mode: config.video_mode.to_string(),
            fps: config.fps.into(),
        }
    }
}

fn in_range(field: &'static str, value: i64, min: i64, max: i64) -> Result<i64, ConfigValidationError> {
    if value < min || value > max {
        return Err(ConfigValidationError::OutOfRange { field, value });
    }
    Ok(value)
}

/// Bounded waits used by the supervisor loop
#[derive(Debug, Clone)]
pub struct SupervisorTimings {
    /// Bus poll granularity; config changes and stop are observed at this rate
    pub poll_interval: Duration,
    /// Upper bound for the transition to the stopped state
    pub stop_timeout: Duration,
    /// Pause after a planned rebuild so the camera is fully released
    pub settle_delay: Duration,
    /// Sleep between re-checks while a side is disabled by mono mode
    pub mono_idle: Duration,
    /// Delay before the right camera is first built
    pub right_stagger: Duration,
    /// Interval of the health summary log while monitoring
    pub health_log_interval: Duration,
}

impl Default for SupervisorTimings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            stop_timeout: Duration::from_secs(5),
            settle_delay: Duration::from_millis(500),
            mono_idle: Duration::from_secs(1),
            right_stagger: Duration::from_millis(100),
            health_log_interval: Duration::from_secs(30),
        }
    }
}

/// One-shot benchmark dump of raw checkpoint timestamps
#[derive(Debug, Clone)]
pub struct BenchmarkSettings {
    pub samples: usize,
    pub dump_dir: PathBuf,
}

/// Process settings assembled from the command line
#[derive(Debug, Clone)]
pub struct Settings {
    pub role: RoleSelection,
    pub platform: Platform,
    pub timings: SupervisorTimings,
    pub retry: RetryPolicy,
    pub benchmark: Option<BenchmarkSettings>,
    pub initial_config: Option<PathBuf>,
    pub shutdown_grace: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            role: RoleSelection::Sender,
            platform: Platform::Desktop,
            timings: SupervisorTimings::default(),
            retry: RetryPolicy::default(),
            benchmark: None,
            initial_config: None,
            shutdown_grace: Duration::from_secs(6),
        }
    }
}

/// Which pipelines this process drives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleSelection {
    Sender,
    Receiver,
    Both,
}

impl RoleSelection {
    pub fn roles(&self) -> &'static [StreamRole] {
        match self {
            RoleSelection::Sender => &[StreamRole::Sender],
            RoleSelection::Receiver => &[StreamRole::Receiver],
            RoleSelection::Both => &[StreamRole::Sender, StreamRole::Receiver],
        }
    }
}

impl FromStr for RoleSelection {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sender" => Ok(RoleSelection::Sender),
            "receiver" => Ok(RoleSelection::Receiver),
            "both" => Ok(RoleSelection::Both),
            other => Err(anyhow::anyhow!("unknown role `{}`", other)),
        }
    }
}

/// Returns a version as specified in Cargo.toml
pub fn app_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw() -> RawStreamConfig {
        serde_json::from_str(
            r#"{"ip":"10.0.0.7","portLeft":9000,"portRight":9002,"codec":"H264",
                "encodingQuality":70,"bitrate":2000000,"horizontalResolution":1280,
                "verticalResolution":720,"videoMode":"mono","fps":30}"#,
        )
        .unwrap()
    }

    #[test]
    fn test_raw_config_validates() {
        let cfg = StreamConfig::try_from(raw()).unwrap();
        assert_eq!(cfg.ip, IpAddr::from([10, 0, 0, 7]));
        assert_eq!(cfg.codec, Codec::H264);
        assert_eq!(cfg.video_mode, VideoMode::Mono);
        assert_eq!((cfg.width, cfg.height, cfg.fps), (1280, 720, 30));
        assert_eq!(cfg.port_for(StreamSide::Right), 9002);
    }

    #[test]
    fn test_unknown_names_are_rejected() {
        let mut bad_codec = raw();
        bad_codec.codec = "AV1".into();
        assert_eq!(
            StreamConfig::try_from(bad_codec),
            Err(ConfigValidationError::UnknownCodec("AV1".into()))
        );

        let mut bad_mode = raw();
        bad_mode.video_mode = "quad".into();
        assert_eq!(
            StreamConfig::try_from(bad_mode),
            Err(ConfigValidationError::UnknownMode("quad".into()))
        );
    }

    #[test]
    fn test_out_of_range_values_are_rejected() {
        let mut bad = raw();
        bad.port_left = 70_000;
        assert!(matches!(
            StreamConfig::try_from(bad),
            Err(ConfigValidationError::OutOfRange { field: "portLeft", .. })
        ));

        let mut bad = raw();
        bad.ip = "not-an-ip".into();
        assert!(matches!(
            StreamConfig::try_from(bad),
            Err(ConfigValidationError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_live_update_only_for_quality_and_bitrate() {
        let base = StreamConfig::default();

        let mut cosmetic = base.clone();
        cosmetic.encoding_quality = 60;
        cosmetic.bitrate = 800_000;
        assert!(base.can_update_live(&cosmetic));
        assert!(base.can_update_live(&base));

        let structural: Vec<Box<dyn Fn(&mut StreamConfig)>> = vec![
            Box::new(|c| c.width = 1280),
            Box::new(|c| c.height = 720),
            Box::new(|c| c.fps = 30),
            Box::new(|c| c.codec = Codec::H265),
            Box::new(|c| c.video_mode = VideoMode::Mono),
            Box::new(|c| c.ip = IpAddr::from([127, 0, 0, 1])),
            Box::new(|c| c.port_left = 1),
            Box::new(|c| c.port_right = 2),
        ];
        for change in structural {
            let mut next = base.clone();
            change(&mut next);
            next.encoding_quality = 10;
            assert!(!base.can_update_live(&next), "{:?}", next);
        }
    }

    #[test]
    fn test_default_prints_in_control_schema() {
        let raw = RawStreamConfig::from(&DEFAULT_STREAM_CONFIG);
        let text = serde_json::to_string(&raw).unwrap();
        assert!(text.contains(r#""horizontalResolution":1920"#));
        assert!(text.contains(r#""videoMode":"stereo""#));

        let back: RawStreamConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(StreamConfig::try_from(back).unwrap(), StreamConfig::default());
    }

    #[test]
    fn test_mono_disables_secondary_side() {
        let mut cfg = StreamConfig::default();
        assert!(cfg.side_enabled(StreamSide::Right));
        cfg.video_mode = VideoMode::Mono;
        assert!(cfg.side_enabled(StreamSide::Left));
        assert!(!cfg.side_enabled(StreamSide::Right));
    }
}
