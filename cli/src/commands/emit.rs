use anyhow::{Context, Result};
use tether::ipc::unix;
use tether::{BridgeConfig, EmitTarget};

use super::parse_value;
use crate::cli::EmitArgs;

pub async fn execute(args: EmitArgs, config: BridgeConfig) -> Result<()> {
    let payload = args
        .payload
        .as_deref()
        .map(parse_value)
        .unwrap_or(serde_json::Value::Null);
    let target = match args.window {
        Some(label) => EmitTarget::Window(label),
        None => EmitTarget::Host,
    };

    // No replies are expected, so the link is flushed instead of run
    let (bridge, link) = unix::open(config)
        .await
        .context("failed to connect to host")?;
    bridge
        .emit_to(target, &args.event, &payload)
        .with_context(|| format!("failed to emit {}", args.event))?;
    link.drain().await.context("failed to flush event")?;

    tracing::debug!(event = %args.event, "event sent");
    Ok(())
}
