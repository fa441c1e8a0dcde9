use anyhow::{Context, Result};
use serde_json::json;
use tether::{BridgeConfig, Event};
use tokio::sync::mpsc;

use super::connect;
use crate::cli::ListenArgs;

pub async fn execute(args: ListenArgs, config: BridgeConfig) -> Result<()> {
    let (bridge, mut link) = connect(config).await?;
    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();

    let _unlisten = if args.once {
        bridge.once(&args.event, move |event| {
            let _ = tx.send(event);
        })
    } else {
        bridge.listen(&args.event, move |event| {
            let _ = tx.send(event);
        })
    }
    .with_context(|| format!("cannot listen to {}", args.event))?;

    tracing::info!(event = %args.event, "listening");
    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                let line = json!({
                    "event": event.event,
                    "payload": event.payload,
                    "windowLabel": event.window_label,
                });
                println!("{line}");
                if args.once {
                    break;
                }
            }
            result = &mut link => {
                result.context("host link task failed")??;
                tracing::info!("host closed the connection");
                break;
            }
        }
    }

    Ok(())
}
