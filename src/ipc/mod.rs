//! Wire protocol and transports between the script context and the host
//!
//! Every message crosses the boundary as a length-prefixed MessagePack frame.
//! [`Transport`] is the only way frames leave the process; replies and host
//! events come back through [`Bridge::handle_frame`](crate::Bridge::handle_frame).

pub mod protocol;
mod transport;
#[cfg(unix)]
pub mod unix;

pub use protocol::{Envelope, EventMessage, HostMessage, InvokeRequest};
pub use transport::{ChannelTransport, Transport};
