use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use tether::BridgeConfig;

use crate::cli::Cli;

/// TOML config file structure
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Bridge settings
    pub bridge: BridgeSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct BridgeSection {
    pub socket: Option<PathBuf>,
    pub label: Option<String>,
    pub max_frame_len: Option<usize>,
}

/// Load config from file
pub fn load_config(path: Option<&Path>) -> Result<FileConfig> {
    match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file: {}", path.display()))?;
            let config: FileConfig = toml::from_str(&content)
                .with_context(|| format!("failed to parse config file: {}", path.display()))?;
            Ok(config)
        }
        None => Ok(FileConfig::default()),
    }
}

/// Merge file config with CLI args and the environment
///
/// CLI takes precedence over the file, the file over the environment.
pub fn merge_config(file: FileConfig, cli: &Cli) -> Result<BridgeConfig> {
    let env = BridgeConfig::from_env().context("invalid TETHER_* environment")?;

    let socket = cli
        .socket
        .clone()
        .or(file.bridge.socket)
        .or_else(|| env.socket_path().map(Path::to_path_buf));

    let label = cli
        .label
        .clone()
        .or(file.bridge.label)
        .or_else(|| env.label().map(str::to_string));

    let mut builder = BridgeConfig::builder();
    if let Some(socket) = socket {
        builder = builder.socket_path(socket);
    }
    if let Some(label) = label {
        builder = builder.label(label);
    }
    if let Some(max_frame_len) = file.bridge.max_frame_len {
        builder = builder.max_frame_len(max_frame_len);
    }

    builder.build().context("invalid bridge configuration")
}
