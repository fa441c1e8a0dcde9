//! Loopback host server
//!
//! Unix domain socket server that answers invoke envelopes through a
//! [`HostRouter`] and fans emitted events out to the other connections.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_net::unix::{UnixListener, UnixStream};
use executor_core::{Executor, Task};
use smol::channel::Sender;

use crate::host::router::HostRouter;
use crate::ipc::protocol::{
    self, DEFAULT_MAX_FRAME_LEN, Envelope, EventMessage, HostMessage, read_frame, write_frame,
};

/// Host server listening on a Unix domain socket
pub struct HostServer {
    socket_path: PathBuf,
    running: Arc<AtomicBool>,
    clients: Arc<Clients>,
}

impl HostServer {
    /// Create and start a new host server
    ///
    /// # Arguments
    /// * `router` - The router answering invoke requests
    /// * `socket_path` - Path for the Unix domain socket
    /// * `executor` - Executor to spawn the server tasks on
    pub async fn new<E: Executor + Clone + 'static>(
        router: HostRouter,
        socket_path: impl AsRef<Path>,
        executor: E,
    ) -> io::Result<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();
        let router = Arc::new(router);
        let running = Arc::new(AtomicBool::new(true));
        let clients = Arc::new(Clients::default());

        // Remove existing socket file if present
        let _ = std::fs::remove_file(&socket_path);

        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&socket_path)?;
        tracing::info!(path = %socket_path.display(), "host server started");

        executor
            .spawn(run_server(
                listener,
                router,
                Arc::clone(&clients),
                Arc::clone(&running),
                executor.clone(),
            ))
            .detach();

        Ok(Self {
            socket_path,
            running,
            clients,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Send an event to every connected client
    pub fn broadcast(&self, message: EventMessage) -> io::Result<usize> {
        let frame = protocol::encode_frame(&HostMessage::Event(message), DEFAULT_MAX_FRAME_LEN)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(self.clients.send_all(&frame, None))
    }

    /// Number of connected clients
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Stop accepting connections
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        tracing::debug!(path = %self.socket_path.display(), "host server stopping");
    }
}

impl Drop for HostServer {
    fn drop(&mut self) {
        self.stop();
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

/// Writers of every live connection, for event fan-out
#[derive(Default)]
struct Clients {
    next_id: AtomicU64,
    writers: Mutex<HashMap<u64, Sender<Vec<u8>>>>,
}

impl Clients {
    fn add(&self, writer: Sender<Vec<u8>>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.writers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, writer);
        id
    }

    fn remove(&self, id: u64) {
        self.writers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    fn len(&self) -> usize {
        self.writers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Queue `frame` on every connection except `skip`
    fn send_all(&self, frame: &[u8], skip: Option<u64>) -> usize {
        let writers = self.writers.lock().unwrap_or_else(PoisonError::into_inner);
        writers
            .iter()
            .filter(|(id, _)| Some(**id) != skip)
            .filter(|(_, writer)| writer.try_send(frame.to_vec()).is_ok())
            .count()
    }
}

/// Main server accept loop
async fn run_server<E: Executor + Clone + 'static>(
    listener: UnixListener,
    router: Arc<HostRouter>,
    clients: Arc<Clients>,
    running: Arc<AtomicBool>,
    executor: E,
) {
    while running.load(Ordering::SeqCst) {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                executor
                    .spawn(handle_connection(
                        stream,
                        Arc::clone(&router),
                        Arc::clone(&clients),
                        executor.clone(),
                    ))
                    .detach();
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "failed to accept host connection");
                }
            }
        }
    }
}

/// Serve a single connection
async fn handle_connection<E: Executor + Clone + 'static>(
    stream: UnixStream,
    router: Arc<HostRouter>,
    clients: Arc<Clients>,
    executor: E,
) {
    let (writer_tx, writer_rx) = smol::channel::unbounded::<Vec<u8>>();
    let client_id = clients.add(writer_tx.clone());
    tracing::debug!(client = client_id, "client connected");

    let mut writer = stream.clone();
    executor
        .spawn(async move {
            while let Ok(frame) = writer_rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    tracing::debug!(error = %e, "failed to write host frame");
                    break;
                }
            }
        })
        .detach();

    let mut reader = stream;
    loop {
        let body = match read_frame(&mut reader, DEFAULT_MAX_FRAME_LEN).await {
            Ok(Some(body)) => body,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read envelope");
                break;
            }
        };

        let envelope: Envelope = match protocol::decode_body(&body) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "failed to parse envelope");
                continue;
            }
        };

        match envelope {
            Envelope::Invoke(request) => {
                tracing::debug!(cmd = %request.cmd, call_id = %request.call_id, "handling invoke");
                let router = Arc::clone(&router);
                let writer_tx = writer_tx.clone();
                // Each call runs on its own so a slow command doesn't hold up the rest
                executor
                    .spawn(async move {
                        let reply = match router.handle(&request.cmd, request.payload.clone()).await
                        {
                            Ok(value) => request.resolve(value),
                            Err(error) => {
                                tracing::debug!(cmd = %request.cmd, "command failed");
                                request.reject(error)
                            }
                        };
                        send_reply(&writer_tx, &reply);
                    })
                    .detach();
            }
            Envelope::Emit(message) => {
                tracing::debug!(event = %message.event, "fanning out event");
                match protocol::encode_frame(&HostMessage::Event(message), DEFAULT_MAX_FRAME_LEN) {
                    Ok(frame) => {
                        clients.send_all(&frame, Some(client_id));
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to encode event"),
                }
            }
        }
    }

    clients.remove(client_id);
    writer_tx.close();
    tracing::debug!(client = client_id, "client disconnected");
}

fn send_reply(writer: &Sender<Vec<u8>>, reply: &HostMessage) {
    match protocol::encode_frame(reply, DEFAULT_MAX_FRAME_LEN) {
        Ok(frame) => {
            if writer.try_send(frame).is_err() {
                tracing::debug!("client gone before reply");
            }
        }
        Err(e) => tracing::warn!(error = %e, "failed to encode reply"),
    }
}
