//! Configuration intake: control messages and the versioned config channel

use std::fs;
use std::path::Path;

use anyhow::Context;

use crate::config::{RawStreamConfig, StreamConfig};

pub mod channel;
pub mod reader;

pub use channel::ConfigChannel;

/// Load a configuration object in control-message schema from a JSON file
pub fn load_config_file(path: &Path) -> anyhow::Result<StreamConfig> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("cannot read configuration file {}", path.display()))?;
    let raw: RawStreamConfig = serde_json::from_str(&text)
        .with_context(|| format!("cannot parse configuration file {}", path.display()))?;
    StreamConfig::try_from(raw).with_context(|| format!("invalid configuration in {}", path.display()))
}
