//! Host command trait definition

use std::future::Future;

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

/// A command the loopback host can execute
///
/// The struct is deserialized from the invoke arguments, and `handle` turns it
/// into the reply. `Err` values reach the caller verbatim as
/// [`Error::Host`](crate::Error::Host).
///
/// # Example
///
/// ```rust,ignore
/// use serde::Deserialize;
/// use serde_json::Value;
/// use tether::host::HostCommand;
///
/// #[derive(Deserialize, Default)]
/// struct Greet {
///     name: String,
/// }
///
/// impl HostCommand for Greet {
///     type Response = String;
///
///     fn name(&self) -> String {
///         "greet".to_string()
///     }
///
///     async fn handle(&mut self) -> Result<String, Value> {
///         Ok(format!("hello, {}", self.name))
///     }
/// }
/// ```
pub trait HostCommand: DeserializeOwned + Send + 'static {
    /// The success value returned by this command
    type Response: Serialize + Send;

    /// Command name used for dispatch
    fn name(&self) -> String;

    /// Handle this command and produce a reply
    fn handle(&mut self) -> impl Future<Output = Result<Self::Response, Value>> + Send;
}
