//! Rendezvous socket server.
//!
//! The server binds the daemon's unix socket, enforces single-instance
//! semantics, and runs one reader/writer task pair per accepted client.
//! Frames are decoded here and handed to the broker; everything written
//! back to the client drains from the connection's send queue.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use protocol::{FrameCodec, ProtocolError};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::broker::Broker;

/// Socket read chunk size.
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Errors binding the rendezvous socket.
#[derive(Debug, Error)]
pub enum SocketError {
    /// Another daemon answered on the socket; this process must not start.
    #[error("socket in use: another daemon is listening on {0}")]
    InUse(PathBuf),

    /// Filesystem or bind error.
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

/// The bound rendezvous socket.
pub struct DaemonSocket {
    listener: UnixListener,
    path: PathBuf,
}

impl DaemonSocket {
    /// Bind the socket at `path`, enforcing single-instance semantics.
    ///
    /// If the path already exists, a connect probe decides: a live peer
    /// means another daemon owns the endpoint ([`SocketError::InUse`]); a
    /// dead socket file is removed and the bind proceeds.
    pub async fn bind(path: &Path) -> Result<Self, SocketError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
            }
        }

        if path.exists() {
            match UnixStream::connect(path).await {
                Ok(_) => return Err(SocketError::InUse(path.to_path_buf())),
                Err(_) => {
                    info!(path = %path.display(), "Removing stale socket");
                    std::fs::remove_file(path)?;
                }
            }
        }

        let listener = UnixListener::bind(path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        info!(path = %path.display(), "Listening on rendezvous socket");
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    /// Accept one client connection.
    pub async fn accept(&self) -> io::Result<UnixStream> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(stream)
    }

    /// The socket path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the socket file. Called during shutdown.
    pub fn remove(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Accept loop: serve clients until the broker's shutdown token fires.
///
/// Per-client tasks are tracked so shutdown can wait for outbound queues
/// (including terminal EXIT frames) to reach the wire.
pub async fn serve(broker: Arc<Broker>, socket: &DaemonSocket) {
    let tracker = TaskTracker::new();
    let shutdown = broker.shutdown_token();

    loop {
        tokio::select! {
            result = socket.accept() => match result {
                Ok(stream) => {
                    let broker = Arc::clone(&broker);
                    tracker.spawn(handle_client(broker, stream));
                }
                Err(e) => {
                    error!(error = %e, "Accept failed");
                }
            },
            _ = shutdown.cancelled() => break,
        }
    }

    tracker.close();
    if tokio::time::timeout(Duration::from_secs(2), tracker.wait())
        .await
        .is_err()
    {
        warn!("Connection tasks still running at shutdown");
    }
}

/// One client: decode inbound frames, route them, drain the send queue.
async fn handle_client(broker: Arc<Broker>, stream: UnixStream) {
    let conn = broker.register_connection();
    let conn_id = conn.id();
    let (mut read_half, mut write_half) = stream.into_split();
    let codec = FrameCodec::new();

    // Writer: drain the connection's queue to the socket. Ends when the
    // queue is closed (disconnect or daemon shutdown) and fully drained.
    let writer_conn = Arc::clone(&conn);
    let writer = tokio::spawn(async move {
        let codec = FrameCodec::new();
        while let Some(msg) = writer_conn.queue().pop().await {
            if write_half.write_all(&codec.encode(&msg)).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    // Reader: accumulate socket bytes, decode frames, hand them to the
    // broker. A malformed frame closes this connection and no other.
    let shutdown = broker.shutdown_token();
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];

    'conn: loop {
        loop {
            match codec.try_decode(&buf) {
                Ok(Some((msg, consumed))) => {
                    buf.drain(..consumed);
                    broker.handle_message(&conn, msg).await;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(conn_id, error = %e, "Protocol error, closing connection");
                    break 'conn;
                }
            }
        }

        tokio::select! {
            result = read_half.read(&mut chunk) => match result {
                Ok(0) => {
                    if !buf.is_empty() {
                        warn!(conn_id, error = %ProtocolError::ShortRead, "Client closed mid-frame");
                    }
                    break;
                }
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(e) => {
                    debug!(conn_id, error = %e, "Read error");
                    break;
                }
            },
            _ = shutdown.cancelled() => break,
        }
    }

    if shutdown.is_cancelled() {
        // Daemon shutdown: keep the connection registered so the broker can
        // still enqueue terminal EXIT frames; the broker closes the queue
        // once sessions are down, which lets the writer finish draining.
        let _ = writer.await;
        broker.remove_connection(conn_id);
    } else {
        // Client went away. Disconnect releases the attachment; the
        // session keeps running.
        broker.remove_connection(conn_id);
        let _ = writer.await;
    }
}
