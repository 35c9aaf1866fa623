//! Textual pipeline descriptions per codec, platform and role
//!
//! Every description names its checkpoint elements (identity elements between
//! the processing stages) so telemetry can subscribe to them, and names the
//! sender's encoder `encoder` so cosmetic updates can find it.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use super::backend::PropertyValue;
use super::types::{StreamRole, StreamSide};
use crate::config::{Codec, StreamConfig};

/// Element receiving live quality/bitrate updates
pub const ENCODER_ELEMENT: &str = "encoder";

// Sender checkpoints, in pipeline order
pub const CAMSRC_IDENT: &str = "camsrc_ident";
pub const VIDCONV_IDENT: &str = "vidconv_ident";
pub const ENC_IDENT: &str = "enc_ident";
pub const RTPPAY_IDENT: &str = "rtppay_ident";

// Receiver checkpoints, in pipeline order
pub const UDPSRC_IDENT: &str = "udpsrc_ident";
pub const RTPDEPAY_IDENT: &str = "rtpdepay_ident";
pub const DEC_IDENT: &str = "dec_ident";
pub const QUEUE_IDENT: &str = "queue_ident";
pub const DISPLAY_CONV_IDENT: &str = "vidconv_ident";
pub const VIDFLIP_IDENT: &str = "vidflip_ident";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DescriptionError {
    #[error("codec {codec} is not supported for {role} pipelines in this build")]
    UnsupportedCodec { codec: Codec, role: StreamRole },
}

/// Hardware profile the sender pipelines are written for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// Test-pattern source and software encoders
    Desktop,
    /// Argus camera source and hardware encoders
    Jetson,
}

impl FromStr for Platform {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "desktop" => Ok(Platform::Desktop),
            "jetson" => Ok(Platform::Jetson),
            other => Err(anyhow::anyhow!("unknown platform `{}`", other)),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Desktop => f.write_str("desktop"),
            Platform::Jetson => f.write_str("jetson"),
        }
    }
}

/// Build the description of the pipeline serving `role` on `side`
pub fn describe(
    role: StreamRole,
    platform: Platform,
    cfg: &StreamConfig,
    side: StreamSide,
) -> Result<String, DescriptionError> {
    match role {
        StreamRole::Sender => sender_description(platform, cfg, side),
        StreamRole::Receiver => receiver_description(cfg, side),
    }
}

fn sender_description(
    platform: Platform,
    cfg: &StreamConfig,
    side: StreamSide,
) -> Result<String, DescriptionError> {
    let unsupported = || DescriptionError::UnsupportedCodec {
        codec: cfg.codec,
        role: StreamRole::Sender,
    };

    let (source, convert, memory) = match platform {
        Platform::Desktop => (
            format!("videotestsrc is-live=true pattern={}", side.sensor_id()),
            "clockoverlay ! videoflip method=vertical-flip".to_string(),
            "video/x-raw",
        ),
        Platform::Jetson => (
            format!(
                "nvarguscamerasrc aeantibanding=AeAntibandingMode_Off ee-mode=EdgeEnhancement_Off \
                 tnr-mode=NoiseReduction_Off saturation=1.2 sensor-id={}",
                side.sensor_id()
            ),
            "nvvidconv flip-method=vertical-flip".to_string(),
            "video/x-raw(memory:NVMM)",
        ),
    };

    let (encoder, payloader) = match (cfg.codec, platform) {
        (Codec::Jpeg, Platform::Desktop) => (
            format!("jpegenc name={} quality={}", ENCODER_ELEMENT, cfg.encoding_quality),
            "rtpjpegpay".to_string(),
        ),
        (Codec::Jpeg, Platform::Jetson) => (
            format!(
                "nvjpegenc name={} quality={} idct-method=ifast",
                ENCODER_ELEMENT, cfg.encoding_quality
            ),
            "rtpjpegpay mtu=1300".to_string(),
        ),
        (Codec::H264, Platform::Desktop) => (
            format!(
                "openh264enc name={} gop-size=1 bitrate={} ! h264parse config-interval=-1",
                ENCODER_ELEMENT, cfg.bitrate
            ),
            "rtph264pay aggregate-mode=none config-interval=-1".to_string(),
        ),
        (Codec::H264, Platform::Jetson) => (
            format!(
                "nvv4l2h264enc name={} insert-sps-pps=1 bitrate={} preset-level=1",
                ENCODER_ELEMENT, cfg.bitrate
            ),
            "rtph264pay mtu=1300 config-interval=1 pt=96".to_string(),
        ),
        (Codec::H265, Platform::Desktop) => (
            format!(
                "x265enc name={} tune=zerolatency bitrate={} ! h265parse config-interval=-1",
                ENCODER_ELEMENT,
                kbits(cfg.bitrate)
            ),
            "rtph265pay config-interval=-1".to_string(),
        ),
        (Codec::H265, Platform::Jetson) => (
            format!(
                "nvv4l2h265enc name={} insert-sps-pps=1 bitrate={} preset-level=1",
                ENCODER_ELEMENT, cfg.bitrate
            ),
            "rtph265pay mtu=1300 config-interval=1 pt=96".to_string(),
        ),
        (Codec::Vp8 | Codec::Vp9, _) => return Err(unsupported()),
    };

    Ok(format!(
        "{source} ! {memory},width=(int){width},height=(int){height},framerate=(fraction){fps}/1,format=(string)NV12 \
         ! identity name={CAMSRC_IDENT} ! {convert} ! identity name={VIDCONV_IDENT} \
         ! {encoder} ! identity name={ENC_IDENT} ! {payloader} ! identity name={RTPPAY_IDENT} \
         ! udpsink host={ip} sync=false port={port}",
        width = cfg.width,
        height = cfg.height,
        fps = cfg.fps,
        ip = cfg.ip,
        port = cfg.port_for(side),
    ))
}

fn receiver_description(cfg: &StreamConfig, side: StreamSide) -> Result<String, DescriptionError> {
    let (caps, depay, decoder) = match cfg.codec {
        Codec::Jpeg => (
            "application/x-rtp,encoding-name=JPEG,payload=26",
            "rtpjpegdepay",
            "jpegdec ! video/x-raw,format=RGB",
        ),
        Codec::H264 => (
            "application/x-rtp,media=video,clock-rate=90000,encoding-name=H264,payload=96",
            "rtph264depay",
            "avdec_h264",
        ),
        Codec::H265 => (
            "application/x-rtp,media=video,clock-rate=90000,encoding-name=H265,payload=96",
            "rtph265depay",
            "avdec_h265",
        ),
        Codec::Vp8 | Codec::Vp9 => {
            return Err(DescriptionError::UnsupportedCodec {
                codec: cfg.codec,
                role: StreamRole::Receiver,
            });
        }
    };

    Ok(format!(
        "udpsrc port={port} ! {caps} ! identity name={UDPSRC_IDENT} \
         ! {depay} ! identity name={RTPDEPAY_IDENT} \
         ! {decoder} ! identity name={DEC_IDENT} \
         ! queue ! identity name={QUEUE_IDENT} \
         ! videoconvert ! identity name={DISPLAY_CONV_IDENT} \
         ! videoflip method=none ! identity name={VIDFLIP_IDENT} \
         ! fpsdisplaysink sync=false",
        port = cfg.port_for(side),
    ))
}

/// Property that carries a cosmetic change into a running sender pipeline
///
/// Receivers have nothing to update and get `Ok(None)`.
pub fn live_property(
    role: StreamRole,
    platform: Platform,
    cfg: &StreamConfig,
) -> Result<Option<(&'static str, PropertyValue)>, DescriptionError> {
    if role == StreamRole::Receiver {
        return Ok(None);
    }

    match (cfg.codec, platform) {
        (Codec::Jpeg, _) => Ok(Some((
            "quality",
            PropertyValue::Int(cfg.encoding_quality as i64),
        ))),
        (Codec::H265, Platform::Desktop) => Ok(Some((
            "bitrate",
            PropertyValue::Int(kbits(cfg.bitrate) as i64),
        ))),
        (Codec::H264 | Codec::H265, _) => Ok(Some(("bitrate", PropertyValue::Int(cfg.bitrate as i64)))),
        (Codec::Vp8 | Codec::Vp9, _) => Err(DescriptionError::UnsupportedCodec {
            codec: cfg.codec,
            role,
        }),
    }
}

// x265enc takes kbit/s
fn kbits(bitrate: u32) -> u32 {
    (bitrate / 1000).max(1)
}
