use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tether::BridgeConfig;
use tether::host::{HostCommand, HostRouter, HostServer};
use tether::ipc::EventMessage;

use crate::cli::ServeArgs;

/// Returns its arguments unchanged
#[derive(Debug, Deserialize, Default)]
struct Echo {
    #[serde(flatten)]
    args: Map<String, Value>,
}

impl HostCommand for Echo {
    type Response = Map<String, Value>;

    fn name(&self) -> String {
        "echo".to_string()
    }

    async fn handle(&mut self) -> Result<Self::Response, Value> {
        Ok(std::mem::take(&mut self.args))
    }
}

#[derive(Debug, Deserialize, Default)]
struct Ping {}

impl HostCommand for Ping {
    type Response = String;

    fn name(&self) -> String {
        "ping".to_string()
    }

    async fn handle(&mut self) -> Result<String, Value> {
        Ok("pong".to_string())
    }
}

pub async fn execute(args: ServeArgs, config: BridgeConfig) -> Result<()> {
    let socket = config
        .socket_path()
        .context("no socket path: pass --socket, set [bridge] socket, or TETHER_SOCKET")?
        .to_path_buf();

    let router = HostRouter::new()
        .register(Echo::default())
        .register(Ping::default());
    let server = HostServer::new(router, &socket, executor_core::tokio::TokioGlobal)
        .await
        .with_context(|| format!("failed to bind {}", socket.display()))?;
    tracing::info!(path = %socket.display(), "serving; press ctrl-c to stop");

    let heartbeat = async {
        let Some(event) = args.heartbeat.as_deref() else {
            return std::future::pending::<()>().await;
        };
        let mut tick = 0u64;
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            tick += 1;
            let message = EventMessage {
                event: event.to_string(),
                payload: json!({ "tick": tick }),
                window_label: None,
            };
            match server.broadcast(message) {
                Ok(sent) => tracing::debug!(event, sent, "heartbeat"),
                Err(e) => tracing::warn!(error = %e, "heartbeat failed"),
            }
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("failed to wait for ctrl-c")?,
        () = heartbeat => {}
    }

    server.stop();
    tracing::info!("host stopped");
    Ok(())
}
