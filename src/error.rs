use std::io;

use thiserror::Error;

use crate::ids::{CallId, ListenerId};

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while talking to the host
#[derive(Error, Debug)]
pub enum Error {
    /// The payload could not be turned into something transmittable.
    /// Raised before anything leaves the process.
    #[error("serialization error: {0}")]
    Serialization(#[from] SerializationError),

    /// The one-way send into the host failed
    #[error("transport error: {0}")]
    Transport(#[source] io::Error),

    /// The host rejected the call. The value is exactly what the host sent.
    #[error("host error: {0}")]
    Host(serde_json::Value),

    #[error("call id {0} is already pending")]
    DuplicateCallId(CallId),

    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    #[error("invalid event name: {0:?}")]
    InvalidEventName(String),

    #[error("configuration error: {0}")]
    InvalidConfig(String),

    #[error("bridge disconnected before the call settled")]
    Disconnected,

    #[error("call {0} timed out")]
    Timeout(CallId),
}

impl Error {
    /// The host-provided error value, if this is a host rejection
    pub fn host_value(&self) -> Option<&serde_json::Value> {
        match self {
            Error::Host(value) => Some(value),
            _ => None,
        }
    }
}

/// Errors raised while building or decoding payloads
#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("json conversion failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame encoding failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("frame decoding failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("command arguments must serialize to an object, got {0}")]
    NotAnObject(&'static str),

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },
}

/// A reply the correlator could not match to an outstanding call.
///
/// These are logged and ignored; the bridge keeps serving other calls.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("reply for call {0} which was never issued")]
    UnknownCall(CallId),

    #[error("reply for call {0} which has already settled")]
    AlreadySettled(CallId),

    #[error("malformed callback reference: {0:?}")]
    MalformedCallback(String),
}

/// A listener panicked during a delivery pass
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("listener {listener} for {event:?} failed: {message}")]
pub struct ListenerError {
    pub event: String,
    pub listener: ListenerId,
    pub message: String,
}
