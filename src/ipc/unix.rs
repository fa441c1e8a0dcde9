//! Unix domain socket link to the host

use std::io;
use std::path::Path;

use async_net::unix::UnixStream;
use futures_lite::future;
use smol::channel::Receiver;

use crate::bridge::Bridge;
use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use crate::ipc::protocol::{read_frame, write_frame};
use crate::ipc::transport::{ChannelTransport, Transport};

/// Connect to the host socket at `path`
///
/// The returned transport goes into a [`Bridge`]; the link has to be driven
/// with [`UnixLink::run`] for frames to actually move.
pub async fn connect(path: impl AsRef<Path>) -> io::Result<(ChannelTransport, UnixLink)> {
    let stream = UnixStream::connect(path.as_ref()).await?;
    tracing::debug!(path = %path.as_ref().display(), "connected to host");

    let (transport, outgoing) = ChannelTransport::new();
    Ok((transport, UnixLink { stream, outgoing }))
}

/// Connect using the socket path from `config` and build the bridge
pub async fn open(config: BridgeConfig) -> Result<(Bridge<ChannelTransport>, UnixLink)> {
    let path = config
        .socket_path()
        .ok_or_else(|| Error::InvalidConfig("no host socket path configured".to_string()))?
        .to_path_buf();

    let (transport, link) = connect(&path).await.map_err(Error::Transport)?;
    Ok((Bridge::with_config(transport, config), link))
}

/// The socket half of a connection: writes queued frames and routes replies
pub struct UnixLink {
    stream: UnixStream,
    outgoing: Receiver<Vec<u8>>,
}

impl UnixLink {
    /// Pump frames until either side closes.
    ///
    /// When the link ends, later sends fail with a transport error and every
    /// outstanding call is rejected with [`Error::Disconnected`].
    pub async fn run<T: Transport>(self, bridge: &Bridge<T>) -> io::Result<()> {
        let max_frame_len = bridge.config().max_frame_len();
        let mut reader = self.stream.clone();
        let mut writer = self.stream;
        let outgoing = &self.outgoing;

        let write_loop = async {
            while let Ok(frame) = outgoing.recv().await {
                write_frame(&mut writer, &frame).await?;
            }
            Ok::<_, io::Error>(())
        };

        let read_loop = async {
            while let Some(body) = read_frame(&mut reader, max_frame_len).await? {
                // Undecodable frames are logged by the bridge and skipped
                let _ = bridge.handle_frame(&body);
            }
            tracing::debug!("host closed the connection");
            Ok::<_, io::Error>(())
        };

        let result = future::or(read_loop, write_loop).await;
        if let Err(e) = &result {
            tracing::warn!(error = %e, "host link failed");
        }

        outgoing.close();
        bridge.close();
        result
    }

    /// Write whatever is queued right now, then drop the connection.
    ///
    /// For one-way clients that only emit and never wait for replies.
    pub async fn drain(mut self) -> io::Result<()> {
        while let Ok(frame) = self.outgoing.try_recv() {
            write_frame(&mut self.stream, &frame).await?;
        }
        Ok(())
    }
}
