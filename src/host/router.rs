//! Host router for dispatching invoked commands

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use serde_json::{Map, Value};

use crate::host::command::HostCommand;

/// Reply of a handler: success value or error value
pub type Reply = Result<Value, Value>;

/// Type-erased handler function
type ErasedHandler =
    Box<dyn Fn(Map<String, Value>) -> Pin<Box<dyn Future<Output = Reply> + Send>> + Send + Sync>;

/// Router that dispatches invoke requests to registered command handlers
///
/// Handlers are stored type-erased, but registration is type-safe via the
/// [`HostCommand`] trait.
pub struct HostRouter {
    handlers: HashMap<String, ErasedHandler>,
}

impl HostRouter {
    /// Create a new empty router
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a command
    ///
    /// The instance only supplies the name; each request deserializes a
    /// fresh value from its arguments.
    pub fn register<C: HostCommand>(mut self, cmd: C) -> Self {
        let name = cmd.name();
        let command_name = name.clone();

        let handler: ErasedHandler = Box::new(move |arguments: Map<String, Value>| {
            let command_name = command_name.clone();
            Box::pin(async move {
                let mut cmd: C = serde_json::from_value(Value::Object(arguments)).map_err(|e| {
                    Value::String(format!("invalid arguments for {command_name}: {e}"))
                })?;
                let response = cmd.handle().await?;
                let value =
                    serde_json::to_value(&response).map_err(|e| Value::String(e.to_string()))?;
                Ok::<_, Value>(value)
            })
        });

        self.handlers.insert(name, handler);
        self
    }

    /// Run the handler for `cmd`
    ///
    /// Unknown commands are rejected with a message, like any other error.
    pub async fn handle(&self, cmd: &str, arguments: Map<String, Value>) -> Reply {
        let Some(handler) = self.handlers.get(cmd) else {
            return Err(Value::String(format!("unknown command: {cmd}")));
        };
        handler(arguments).await
    }

    /// Names of the registered commands
    pub fn commands(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

impl Default for HostRouter {
    fn default() -> Self {
        Self::new()
    }
}
