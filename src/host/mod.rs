//! Loopback host
//!
//! A small host side of the bridge, for tests and for embedding a host in
//! Rust: commands are plain [`HostCommand`] types and the server speaks the
//! same framed protocol as [`ipc::unix`](crate::ipc::unix).
//!
//! # Example
//!
//! ```rust,ignore
//! use tether::host::{HostRouter, HostServer};
//!
//! let router = HostRouter::new().register(Greet::default());
//! let server = HostServer::new(router, "/run/app/tether.sock", executor).await?;
//! ```

mod command;
mod router;
#[cfg(unix)]
mod server;

pub use command::HostCommand;
pub use router::{HostRouter, Reply};
#[cfg(unix)]
pub use server::HostServer;
