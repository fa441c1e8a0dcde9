//! The one-way conduit into the host

use std::io;

use serde::Serialize;
use smol::channel::{Receiver, Sender, TrySendError};

use crate::error::{Error, Result};
use crate::ipc::protocol;

/// Hands encoded frames to the host.
///
/// `send_frame` must not wait for the host: replies come back through
/// [`Bridge::handle_message`](crate::Bridge::handle_message), never as a
/// return value. Failures are reported synchronously.
pub trait Transport: Send + Sync + 'static {
    /// Transmit one already encoded frame
    fn send_frame(&self, frame: Vec<u8>) -> io::Result<()>;

    /// Encode `message` and transmit it.
    ///
    /// Encoding failures are raised before anything is sent.
    fn send<T: Serialize>(&self, message: &T, max_frame_len: usize) -> Result<()>
    where
        Self: Sized,
    {
        let frame = protocol::encode_frame(message, max_frame_len)?;
        self.send_frame(frame).map_err(Error::Transport)
    }
}

/// Transport that queues frames on an in-process channel.
///
/// The receiving half is drained by whatever owns the connection to the host
/// (see [`UnixLink`](crate::ipc::unix::UnixLink)), or by a test acting as the
/// host.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    outgoing: Sender<Vec<u8>>,
}

impl ChannelTransport {
    /// Create a transport plus the receiver for the frames it sends
    pub fn new() -> (Self, Receiver<Vec<u8>>) {
        let (outgoing, incoming) = smol::channel::unbounded();
        (Self { outgoing }, incoming)
    }

    /// Whether the receiving side is still alive
    pub fn is_connected(&self) -> bool {
        !self.outgoing.is_closed()
    }
}

impl Transport for ChannelTransport {
    fn send_frame(&self, frame: Vec<u8>) -> io::Result<()> {
        self.outgoing.try_send(frame).map_err(|e| match e {
            TrySendError::Closed(_) => {
                io::Error::new(io::ErrorKind::BrokenPipe, "host connection closed")
            }
            TrySendError::Full(_) => io::Error::new(io::ErrorKind::WouldBlock, "send queue full"),
        })
    }
}
