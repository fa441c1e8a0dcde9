pub mod emit;
pub mod invoke;
pub mod listen;
pub mod serve;

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tether::ipc::{ChannelTransport, unix};
use tether::{Bridge, BridgeConfig};
use tokio::task::JoinHandle;

pub type SharedBridge = Arc<Bridge<ChannelTransport>>;

/// Connect to the host and start pumping frames in the background
///
/// The returned handle finishes when the host closes the connection.
pub async fn connect(config: BridgeConfig) -> Result<(SharedBridge, JoinHandle<std::io::Result<()>>)> {
    let socket = config
        .socket_path()
        .map(|path| path.display().to_string())
        .unwrap_or_default();
    let (bridge, link) = unix::open(config)
        .await
        .with_context(|| format!("failed to connect to host at {socket}"))?;
    let bridge = Arc::new(bridge);

    let pump = Arc::clone(&bridge);
    let handle = tokio::spawn(async move { link.run(&pump).await });
    Ok((bridge, handle))
}

/// Parse a command-line value as JSON, falling back to a plain string
pub fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
