//! Protocol client for the daemon socket.
//!
//! Used by the CLI (`daemon status` liveness probes) and by integration
//! tests. TUI front ends carry their own client; this one is intentionally
//! minimal: connect, send frames, receive frames.

use std::path::Path;

use protocol::{FrameCodec, Message, ProtocolError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

/// A connected protocol client.
pub struct DaemonClient {
    stream: UnixStream,
    codec: FrameCodec,
    buf: Vec<u8>,
}

impl DaemonClient {
    /// Connect to the daemon socket.
    pub async fn connect(path: &Path) -> std::io::Result<Self> {
        let stream = UnixStream::connect(path).await?;
        Ok(Self {
            stream,
            codec: FrameCodec::new(),
            buf: Vec::new(),
        })
    }

    /// Send one message.
    pub async fn send(&mut self, msg: &Message) -> std::io::Result<()> {
        self.stream.write_all(&self.codec.encode(msg)).await
    }

    /// Receive the next message.
    ///
    /// Returns `Ok(None)` when the daemon closed the connection cleanly
    /// (between frames); a close mid-frame is a
    /// [`ProtocolError::ShortRead`].
    pub async fn recv(&mut self) -> Result<Option<Message>, ClientError> {
        let mut chunk = vec![0u8; 8 * 1024];
        loop {
            if let Some((msg, consumed)) = self.codec.try_decode(&self.buf)? {
                self.buf.drain(..consumed);
                return Ok(Some(msg));
            }

            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(ProtocolError::ShortRead.into());
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Send a message and wait for the next non-DATA reply.
    ///
    /// DATA frames that arrive while waiting (output from an attached
    /// session) are discarded; callers that care about output use
    /// [`DaemonClient::recv`] directly.
    pub async fn request(&mut self, msg: &Message) -> Result<Message, ClientError> {
        self.send(msg).await?;
        loop {
            match self.recv().await? {
                Some(Message::Data(_)) => continue,
                Some(reply) => return Ok(reply),
                None => return Err(ClientError::Io(std::io::ErrorKind::UnexpectedEof.into())),
            }
        }
    }
}

/// Client-side errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
