//! Wire protocol types for the bridge
//!
//! Wire format:
//! ```text
//! Frame:
//!   [4 bytes: body length (u32 BE)]
//!   [body bytes (MessagePack, named fields)]
//!
//! Script -> host body: Envelope
//!   Invoke { callId, callback, error, cmd, payload, headers }
//!   Emit   { event, payload, windowLabel? }
//!
//! Host -> script body: HostMessage
//!   Callback { callback, payload }
//!   Event    { event, payload, windowLabel? }
//! ```

use std::collections::BTreeMap;
use std::io;

use futures_lite::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

use crate::error::SerializationError;
use crate::ids::{CallId, CallbackRef};

/// Default upper bound for a single frame body
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Command invocation as seen by the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeRequest {
    pub call_id: CallId,
    /// Name of the success callback
    pub callback: String,
    /// Name of the error callback
    pub error: String,
    pub cmd: String,
    pub payload: Map<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

impl InvokeRequest {
    /// Reply that resolves this call
    pub fn resolve(&self, value: Value) -> HostMessage {
        HostMessage::Callback {
            callback: self.callback.clone(),
            payload: value,
        }
    }

    /// Reply that rejects this call
    pub fn reject(&self, error: Value) -> HostMessage {
        HostMessage::Callback {
            callback: self.error.clone(),
            payload: error,
        }
    }
}

/// Event wire message, used in both directions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMessage {
    pub event: String,
    pub payload: Value,
    /// Absent means broadcast
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_label: Option<String>,
}

/// Everything the script side sends to the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Envelope {
    Invoke(InvokeRequest),
    Emit(EventMessage),
}

impl Envelope {
    pub(crate) fn invoke(
        call_id: CallId,
        cmd: String,
        payload: Map<String, Value>,
        headers: BTreeMap<String, String>,
    ) -> Self {
        Envelope::Invoke(InvokeRequest {
            call_id,
            callback: CallbackRef::success(call_id).to_string(),
            error: CallbackRef::error(call_id).to_string(),
            cmd,
            payload,
            headers,
        })
    }
}

/// Everything the host sends to the script side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HostMessage {
    /// Invoke one of the two reply callbacks of a call
    Callback { callback: String, payload: Value },
    /// A host-originated event
    Event(EventMessage),
}

/// Encode a message into a length-prefixed frame
pub fn encode_frame<T: Serialize>(message: &T, max_len: usize) -> Result<Vec<u8>, SerializationError> {
    let body = rmp_serde::to_vec_named(message)?;
    if body.len() > max_len || body.len() > u32::MAX as usize {
        return Err(SerializationError::FrameTooLarge {
            len: body.len(),
            max: max_len,
        });
    }

    let mut buf = Vec::with_capacity(4 + body.len());
    // Body length (u32 BE)
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Decode a frame body (without the length prefix)
pub fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, SerializationError> {
    rmp_serde::from_slice(body).map_err(SerializationError::from)
}

/// Read one frame body from a stream
///
/// Returns `Ok(None)` on a clean end of stream.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_len: usize,
) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    if let Err(e) = reader.read_exact(&mut len_buf).await {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(e);
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > max_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid frame length: {len}"),
        ));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Write an already encoded frame and flush it
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}
