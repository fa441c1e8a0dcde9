//! Command descriptors: the named, argument-bearing unit of work sent to the host

use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

use crate::error::{Result, SerializationError};

/// A command name plus its arguments object.
///
/// Built once per call and consumed by [`Bridge::invoke`](crate::Bridge::invoke).
#[derive(Debug, Clone, PartialEq)]
pub struct CommandDescriptor {
    name: String,
    arguments: Map<String, Value>,
}

impl CommandDescriptor {
    /// Create a descriptor with no arguments
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arguments: Map::new(),
        }
    }

    /// Create a descriptor from any value that serializes to an object.
    ///
    /// Unit and `None` are accepted as "no arguments". Anything else that is
    /// not an object fails with [`SerializationError::NotAnObject`].
    pub fn with_args<T: Serialize + ?Sized>(name: impl Into<String>, args: &T) -> Result<Self> {
        let arguments = match serde_json::to_value(args).map_err(SerializationError::from)? {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => return Err(SerializationError::NotAnObject(kind_of(&other)).into()),
        };

        Ok(Self {
            name: name.into(),
            arguments,
        })
    }

    /// Add a single argument
    pub fn arg(mut self, key: impl Into<String>, value: impl Serialize) -> Result<Self> {
        let value = serde_json::to_value(value).map_err(SerializationError::from)?;
        self.arguments.insert(key.into(), value);
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arguments(&self) -> &Map<String, Value> {
        &self.arguments
    }

    pub(crate) fn into_parts(self) -> (String, Map<String, Value>) {
        (self.name, self.arguments)
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// A typed host command
///
/// The struct carries the arguments and `Output` is what the host answers
/// with. Use [`Bridge::call`](crate::Bridge::call) to invoke it.
///
/// # Example
///
/// ```rust,ignore
/// use serde::{Deserialize, Serialize};
/// use tether::Command;
///
/// #[derive(Serialize)]
/// struct ReadText {
///     path: String,
/// }
///
/// impl Command for ReadText {
///     const NAME: &'static str = "fs_read_text";
///     type Output = String;
/// }
///
/// let text = bridge.call(&ReadText { path: "notes.txt".into() }).await?;
/// ```
pub trait Command: Serialize {
    /// Command name used by the host for dispatch
    const NAME: &'static str;

    /// The value the host resolves the call with
    type Output: DeserializeOwned;

    /// Build the descriptor for this command
    fn descriptor(&self) -> Result<CommandDescriptor> {
        CommandDescriptor::with_args(Self::NAME, self)
    }
}
