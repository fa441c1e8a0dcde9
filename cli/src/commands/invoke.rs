use std::time::Duration;

use anyhow::{Context, Result, bail};
use tether::{BridgeConfig, CommandDescriptor, Error, InvokeOptions};

use super::{connect, parse_value};
use crate::cli::InvokeArgs;

pub async fn execute(args: InvokeArgs, config: BridgeConfig) -> Result<()> {
    let descriptor = build_descriptor(&args.command, &args.args)?;
    let (bridge, _link) = connect(config).await?;

    tracing::debug!(command = %args.command, "invoking");
    let result = match args.timeout_ms {
        Some(ms) => {
            bridge
                .invoke_with_timeout(descriptor, InvokeOptions::default(), Duration::from_millis(ms))
                .await
        }
        None => bridge.invoke(descriptor, InvokeOptions::default()).await,
    };

    match result {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Err(Error::Host(value)) => bail!("host rejected {}: {value}", args.command),
        Err(e) => Err(e).with_context(|| format!("failed to invoke {}", args.command)),
    }
}

/// Build a descriptor from `key=value` arguments
fn build_descriptor(command: &str, args: &[String]) -> Result<CommandDescriptor> {
    let mut descriptor = CommandDescriptor::new(command);
    for arg in args {
        let Some((key, value)) = arg.split_once('=') else {
            bail!("argument must be key=value: {arg}");
        };
        if key.is_empty() {
            bail!("argument has an empty key: {arg}");
        }
        descriptor = descriptor.arg(key, parse_value(value))?;
    }
    Ok(descriptor)
}
