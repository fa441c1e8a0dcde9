//! Tether - message bridge between a sandboxed script context and its host
//!
//! The script side cannot call into the native host directly. All it has is
//! a one-way send and an out-of-band delivery path for whatever the host
//! sends back. This crate builds two things on top of that:
//!
//! - **Commands**: [`Bridge::invoke`] sends a [`CommandDescriptor`] with a
//!   fresh [`CallId`] and resolves once the host answers that id. Each call
//!   settles at most once, and its entry is freed as soon as it does.
//! - **Events**: [`Bridge::listen`], [`Bridge::once`] and [`Bridge::emit`]
//!   form a publish/subscribe channel fed by local emits and by host events.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tether::{BridgeConfig, CommandDescriptor, InvokeOptions};
//!
//! async fn run() -> tether::Result<()> {
//!     let config = BridgeConfig::from_env()?;
//!     let (bridge, link) = tether::ipc::unix::open(config).await?;
//!     let bridge = Arc::new(bridge);
//!
//!     let pump = Arc::clone(&bridge);
//!     smol::spawn(async move { link.run(&pump).await }).detach();
//!
//!     let unlisten = bridge.listen("theme-changed", |event| {
//!         println!("theme is now {}", event.payload);
//!     })?;
//!
//!     let descriptor = CommandDescriptor::new("echo").arg("x", 1)?;
//!     let value = bridge.invoke(descriptor, InvokeOptions::default()).await?;
//!     assert_eq!(value, serde_json::json!({"x": 1}));
//!
//!     unlisten.unlisten();
//!     Ok(())
//! }
//! ```
//!
//! # Timeouts and cancellation
//!
//! A plain `invoke` waits as long as the host takes. Use
//! [`Bridge::invoke_with_timeout`] for a bounded wait, or drop the future to
//! abandon a call; both free its pending entry.

mod bridge;
mod config;
mod correlator;
mod descriptor;
mod error;
mod events;
pub mod host;
mod ids;
pub mod ipc;

pub use bridge::{Bridge, EmitTarget, Handled, Watch};
pub use config::{BridgeConfig, BridgeConfigBuilder, LABEL_ENV, SOCKET_ENV};
pub use correlator::{Correlator, InvokeOptions};
pub use descriptor::{Command, CommandDescriptor};
pub use error::{Error, ListenerError, ProtocolViolation, Result, SerializationError};
pub use events::{
    Delivery, Event, EventChannel, EventEnvelope, EventSource, Subscription, Unlisten,
    validate_event_name,
};
pub use ids::{CallId, CallbackKind, CallbackRef, ListenerId};
/// Re-export serde_json for building payloads.
pub use serde_json;
