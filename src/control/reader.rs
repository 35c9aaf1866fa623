//! Newline-delimited JSON control messages

use log::{info, warn};
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use super::channel::ConfigChannel;
use crate::config::{ConfigValidationError, RawStreamConfig, StreamConfig};
use crate::utils::sos::SignalOfStop;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum ControlMessage {
    Update { config: RawStreamConfig },
    Stop,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed control message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("configuration rejected: {0}")]
    Invalid(#[from] ConfigValidationError),

    #[error("control line is not UTF-8: {0}")]
    Encoding(#[from] std::str::Utf8Error),
}

/// Why the reader returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderExit {
    StopRequested,
    EndOfInput,
    Cancelled,
}

/// Parse one line; blank lines yield `None`
pub fn parse_line(line: &str) -> Result<Option<ControlMessage>, ProtocolError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(line)?))
}

/// Parse one raw line as read from the control input
pub fn parse_bytes(line: &[u8]) -> Result<Option<ControlMessage>, ProtocolError> {
    parse_line(std::str::from_utf8(line)?)
}

/// Validate and publish an update; the previous configuration stays on error
pub fn apply_update(channel: &ConfigChannel, raw: RawStreamConfig) -> Result<u64, ProtocolError> {
    let config = StreamConfig::try_from(raw)?;
    config.dump();
    let version = channel.publish(config);
    info!("Published configuration version {}", version);
    Ok(version)
}

/// Read control messages until `stop`, end of input or cancellation
///
/// A stop message and the end of input both raise the process-wide stop.
///
/// Lines are read as raw bytes so a line that is not UTF-8 is skipped like
/// any other malformed message; only an I/O failure ends the reader early.
pub async fn run<R>(mut reader: R, channel: ConfigChannel, sos: SignalOfStop) -> std::io::Result<ReaderExit>
where
    R: AsyncBufRead + Unpin,
{
    let token = sos.token();
    let mut line = Vec::new();

    loop {
        line.clear();
        let read = tokio::select! {
            _ = token.cancelled() => return Ok(ReaderExit::Cancelled),
            read = reader.read_until(b'\n', &mut line) => read?,
        };

        if read == 0 {
            info!("Control input closed, stopping");
            sos.cancel();
            return Ok(ReaderExit::EndOfInput);
        }

        match parse_bytes(&line) {
            Ok(None) => {}
            Ok(Some(ControlMessage::Update { config })) => {
                if let Err(e) = apply_update(&channel, config) {
                    warn!("{}; keeping version {}", e, channel.version());
                }
            }
            Ok(Some(ControlMessage::Stop)) => {
                info!("Stop requested on control channel");
                sos.cancel();
                return Ok(ReaderExit::StopRequested);
            }
            Err(e) => warn!("{}, line skipped", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Codec;
    use tokio::io::{AsyncWriteExt, BufReader};

    const UPDATE: &str = r#"{"cmd":"update","config":{"ip":"127.0.0.1","portLeft":5000,"portRight":5002,"codec":"H265","encodingQuality":80,"bitrate":3000000,"horizontalResolution":1280,"verticalResolution":720,"videoMode":"stereo","fps":30}}"#;

    #[test]
    fn test_parse_messages() {
        assert!(parse_line("   ").unwrap().is_none());
        assert!(matches!(
            parse_line(r#"{"cmd":"stop"}"#).unwrap(),
            Some(ControlMessage::Stop)
        ));
        assert!(matches!(
            parse_line(UPDATE).unwrap(),
            Some(ControlMessage::Update { .. })
        ));
        assert!(matches!(
            parse_line(r#"{"cmd":"reboot"}"#),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(parse_line("{not json"), Err(ProtocolError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_reader_publishes_and_stops() {
        let input = format!(
            "{}\n\ngarbage\n{}\n{}\n",
            UPDATE,
            UPDATE.replace("H265", "AV1"),
            r#"{"cmd":"stop"}"#
        );
        let channel = ConfigChannel::new();
        let sos = SignalOfStop::new();

        let exit = run(BufReader::new(input.as_bytes()), channel.clone(), sos.clone())
            .await
            .unwrap();

        assert_eq!(exit, ReaderExit::StopRequested);
        assert!(sos.cancelled());
        // The rejected update left version 1 in place
        let (version, config) = channel.snapshot().unwrap();
        assert_eq!(version, 1);
        assert_eq!(config.codec, Codec::H265);
    }

    #[tokio::test]
    async fn test_non_utf8_line_is_skipped() {
        let mut input = b"\xff\xfe garbage\n".to_vec();
        input.extend_from_slice(UPDATE.as_bytes());
        input.extend_from_slice(b"\n");

        let channel = ConfigChannel::new();
        let sos = SignalOfStop::new();
        let exit = run(BufReader::new(&input[..]), channel.clone(), sos.clone())
            .await
            .unwrap();

        assert_eq!(exit, ReaderExit::EndOfInput);
        assert_eq!(channel.version(), 1);
        assert_eq!(channel.snapshot().unwrap().1.codec, Codec::H265);
        assert!(matches!(parse_bytes(b"\xff\n"), Err(ProtocolError::Encoding(_))));
    }

    #[tokio::test]
    async fn test_end_of_input_stops_process() {
        let sos = SignalOfStop::new();
        let exit = run(BufReader::new(&b""[..]), ConfigChannel::new(), sos.clone())
            .await
            .unwrap();
        assert_eq!(exit, ReaderExit::EndOfInput);
        assert!(sos.cancelled());
    }

    #[tokio::test]
    async fn test_reader_exits_on_cancel() {
        let (client, server) = tokio::io::duplex(64);
        let sos = SignalOfStop::new();
        let task = tokio::spawn(run(BufReader::new(server), ConfigChannel::new(), sos.clone()));

        sos.cancel();
        assert_eq!(task.await.unwrap().unwrap(), ReaderExit::Cancelled);

        // Keep the writer alive until the reader is gone
        let mut client = client;
        let _ = client.shutdown().await;
    }
}
