//! PTY session management.
//!
//! This module provides the core PTY spawning and I/O functionality.
//! A session is one child process (typically an AI coding agent) attached to
//! a pseudo-terminal it believes is a real one. The session owns the PTY
//! master and the child; clients come and go without it noticing.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Unique identifier for a session. Caller-chosen, unique in the registry.
pub type SessionId = String;

/// Default terminal size when the caller leaves it unset.
pub const DEFAULT_ROWS: u16 = 24;
pub const DEFAULT_COLS: u16 = 80;

/// Buffer size for reading from the PTY master.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Output channel capacity, in chunks.
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Bytes of recent output retained for `terminal:buffer` replay on the
/// WebSocket surface. The binary protocol never replays.
const SCROLLBACK_CAPACITY: usize = 64 * 1024;

/// Environment variable prefixes scrubbed from the child's environment.
///
/// The daemon itself may be running under an agent; leaking that agent's
/// credentials or session state into spawned children crosses a trust
/// boundary.
const SCRUBBED_ENV: &[&str] = &["OPENCODE", "CLAUDE", "GEMINI", "CODEX"];

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session was not found in the registry.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// The child has exited; the session no longer accepts input.
    #[error("session not running: {0}")]
    NotRunning(SessionId),

    /// Failed to open the PTY or spawn the child.
    #[error("spawn failed: {0}")]
    SpawnFailed(String),

    /// Failed to write to the PTY.
    #[error("failed to write to PTY: {0}")]
    WriteFailed(String),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What to spawn: command, arguments, working directory, environment.
#[derive(Debug, Clone)]
pub struct SessionSpec {
    /// Caller-chosen session id.
    pub id: SessionId,
    /// Working directory for the child (a git worktree, usually).
    pub workdir: Option<PathBuf>,
    /// Command to execute.
    pub command: String,
    /// Command arguments.
    pub args: Vec<String>,
    /// Extra environment variables for the child.
    pub env: Vec<(String, String)>,
    /// Terminal height; 0 means [`DEFAULT_ROWS`].
    pub rows: u16,
    /// Terminal width; 0 means [`DEFAULT_COLS`].
    pub cols: u16,
}

impl SessionSpec {
    /// Spec with defaults for everything but id and command.
    pub fn new(id: impl Into<SessionId>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            workdir: None,
            command: command.into(),
            args: Vec::new(),
            env: Vec::new(),
            rows: DEFAULT_ROWS,
            cols: DEFAULT_COLS,
        }
    }
}

/// One chunk of session output, published on the session's output channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    /// Raw bytes read from the PTY master.
    Data(Vec<u8>),
    /// The child exited; carries the exit code when the reaper got one.
    /// Published exactly once, after the final Data chunk.
    Exit(Option<i32>),
}

/// A PTY session: one child process plus its controlling pseudo-terminal.
///
/// The session publishes everything the child writes on a bounded output
/// channel; the broker fans that stream out to attached clients. Input and
/// resize calls are serialized through internal locks, so the broker can
/// call them from any task.
pub struct PtySession {
    id: SessionId,
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    child: Arc<StdMutex<Box<dyn Child + Send + Sync>>>,
    running: AtomicBool,
    exited: CancellationToken,
    exit_status: StdMutex<Option<i32>>,
    size: StdMutex<(u16, u16)>,
    scrollback: StdMutex<VecDeque<u8>>,
    pid: Option<u32>,
}

impl PtySession {
    /// Open a PTY pair and spawn the configured command in it.
    ///
    /// Returns the session and the receiving end of its output channel. On
    /// any failure the PTY file descriptors are closed and nothing is left
    /// running.
    pub fn spawn(spec: SessionSpec) -> Result<(Arc<Self>, mpsc::Receiver<OutputEvent>), SessionError> {
        let rows = if spec.rows == 0 { DEFAULT_ROWS } else { spec.rows };
        let cols = if spec.cols == 0 { DEFAULT_COLS } else { spec.cols };

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&spec.command);
        cmd.args(&spec.args);
        if let Some(ref dir) = spec.workdir {
            cmd.cwd(dir);
        }

        // The child gets a scrubbed copy of the daemon's environment rather
        // than inheriting it wholesale.
        cmd.env_clear();
        for (key, value) in std::env::vars() {
            if !is_scrubbed_var(&key) {
                cmd.env(key, value);
            }
        }
        cmd.env("TERM", "xterm-256color");
        cmd.env("OPENKANBAN_SESSION", &spec.id);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        let pid = child.process_id();

        // The slave side belongs to the child now.
        drop(pair.slave);

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);

        let session = Arc::new(PtySession {
            id: spec.id,
            master: Mutex::new(pair.master),
            writer: Mutex::new(writer),
            child: Arc::new(StdMutex::new(child)),
            running: AtomicBool::new(true),
            exited: CancellationToken::new(),
            exit_status: StdMutex::new(None),
            size: StdMutex::new((rows, cols)),
            scrollback: StdMutex::new(VecDeque::with_capacity(SCROLLBACK_CAPACITY)),
            pid,
        });

        session.clone().start_read_loop(output_tx);

        tracing::info!(
            session_id = %session.id,
            pid = ?pid,
            rows = rows,
            cols = cols,
            "Spawned session"
        );

        Ok((session, output_rx))
    }

    /// Returns the session id.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the child's process id, if known.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns the current terminal size as `(rows, cols)`.
    pub fn size(&self) -> (u16, u16) {
        *self.size.lock().expect("size lock poisoned")
    }

    /// Returns whether the child is still running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns the exit status, once the child has been reaped.
    pub fn exit_status(&self) -> Option<i32> {
        *self.exit_status.lock().expect("exit_status lock poisoned")
    }

    /// Returns a copy of the recent output retained for replay.
    pub fn scrollback(&self) -> Vec<u8> {
        let buf = self.scrollback.lock().expect("scrollback lock poisoned");
        buf.iter().copied().collect()
    }

    /// Write input bytes to the child.
    ///
    /// Returns the number of bytes written. Partial writes are retried
    /// internally; concurrent callers are serialized on the writer lock.
    pub async fn write(&self, data: &[u8]) -> Result<usize, SessionError> {
        if !self.is_running() {
            return Err(SessionError::NotRunning(self.id.clone()));
        }

        let mut writer = self.writer.lock().await;
        writer
            .write_all(data)
            .map_err(|e| SessionError::WriteFailed(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| SessionError::WriteFailed(e.to_string()))?;
        Ok(data.len())
    }

    /// Update the PTY window size.
    ///
    /// TIOCSWINSZ on the master; the kernel raises SIGWINCH in the child's
    /// process group. Silently ignored once the child has exited.
    pub async fn resize(&self, rows: u16, cols: u16) -> Result<(), SessionError> {
        if !self.is_running() {
            return Ok(());
        }

        let master = self.master.lock().await;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;

        *self.size.lock().expect("size lock poisoned") = (rows, cols);
        tracing::debug!(session_id = %self.id, rows, cols, "Resized PTY");
        Ok(())
    }

    /// Stop the child: SIGINT, then SIGKILL after `timeout`.
    ///
    /// Returns once the child has been reaped and its exit event published.
    /// Idempotent; calling it on an exited session returns immediately.
    pub async fn stop_graceful(&self, timeout: Duration) {
        if !self.is_running() {
            return;
        }

        self.signal(libc::SIGINT);

        if tokio::time::timeout(timeout, self.exited.cancelled())
            .await
            .is_err()
        {
            tracing::warn!(session_id = %self.id, "Graceful stop timed out, sending SIGKILL");
            self.signal(libc::SIGKILL);

            // The reaper owns the wait; give it a bounded window to observe
            // the kill before giving up on this call (the session itself
            // still cleans up whenever the reaper finishes).
            if tokio::time::timeout(Duration::from_secs(5), self.exited.cancelled())
                .await
                .is_err()
            {
                tracing::error!(session_id = %self.id, "Child did not exit after SIGKILL");
            }
        }
    }

    /// Stop the child immediately (`stop_graceful` with a zero timeout).
    pub async fn close(&self) {
        self.stop_graceful(Duration::ZERO).await;
    }

    /// Completes when the child has exited and its exit event is published.
    pub fn exited(&self) -> CancellationToken {
        self.exited.clone()
    }

    fn signal(&self, sig: libc::c_int) {
        if let Some(pid) = self.pid {
            // The child is its own session leader (the PTY spawn does
            // setsid), so its pgid equals its pid; signal the whole group
            // so grandchildren die with it. Fall back to the pid alone if
            // the group is already gone.
            // SAFETY: kill(2) cannot corrupt memory; worst case is ESRCH.
            unsafe {
                if libc::kill(-(pid as libc::pid_t), sig) != 0 {
                    libc::kill(pid as libc::pid_t, sig);
                }
            }
        }
    }

    /// Starts the dedicated read loop for this session.
    ///
    /// The loop reads up to 64 KiB at a time from the master and publishes
    /// each chunk on the output channel. On EOF or read error it reaps the
    /// child and publishes [`OutputEvent::Exit`] exactly once.
    fn start_read_loop(self: Arc<Self>, output_tx: mpsc::Sender<OutputEvent>) {
        let reader = {
            let master = self.master.try_lock().expect("master unlocked during spawn");
            master.try_clone_reader()
        };

        tokio::spawn(async move {
            let reader = match reader {
                Ok(reader) => Arc::new(StdMutex::new(reader)),
                Err(e) => {
                    tracing::error!(session_id = %self.id, error = %e, "Failed to get PTY reader");
                    self.finish(&output_tx, None).await;
                    return;
                }
            };

            loop {
                let reader_clone = Arc::clone(&reader);
                let result = tokio::task::spawn_blocking(move || {
                    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
                    let mut reader = reader_clone.lock().expect("reader lock poisoned");
                    match reader.read(&mut buffer) {
                        Ok(0) => Ok(None),
                        Ok(n) => {
                            buffer.truncate(n);
                            Ok(Some(buffer))
                        }
                        Err(e) => Err(e),
                    }
                })
                .await;

                match result {
                    Ok(Ok(Some(data))) => {
                        self.append_scrollback(&data);
                        if output_tx.send(OutputEvent::Data(data)).await.is_err() {
                            // Receiver gone; the broker dropped this session.
                            break;
                        }
                    }
                    Ok(Ok(None)) => {
                        tracing::debug!(session_id = %self.id, "PTY EOF");
                        break;
                    }
                    Ok(Err(e)) => {
                        // EIO here is the normal Linux signal that the slave
                        // side closed; anything else is logged the same way
                        // and handled on the exit path.
                        tracing::debug!(session_id = %self.id, error = %e, "PTY read ended");
                        break;
                    }
                    Err(e) => {
                        tracing::error!(session_id = %self.id, error = %e, "Read task panicked");
                        break;
                    }
                }
            }

            let status = self.reap().await;
            self.finish(&output_tx, status).await;
        });
    }

    /// Collect the child's exit status.
    async fn reap(&self) -> Option<i32> {
        let child = Arc::clone(&self.child);
        let result = tokio::task::spawn_blocking(move || {
            let mut child = child.lock().expect("child lock poisoned");
            child.wait()
        })
        .await;

        match result {
            Ok(Ok(status)) => Some(status.exit_code() as i32),
            Ok(Err(e)) => {
                tracing::warn!(session_id = %self.id, error = %e, "wait failed");
                None
            }
            Err(e) => {
                tracing::error!(session_id = %self.id, error = %e, "Wait task panicked");
                None
            }
        }
    }

    /// Mark the session exited and publish the terminal event.
    async fn finish(&self, output_tx: &mpsc::Sender<OutputEvent>, status: Option<i32>) {
        *self.exit_status.lock().expect("exit_status lock poisoned") = status;
        self.running.store(false, Ordering::SeqCst);

        let _ = output_tx.send(OutputEvent::Exit(status)).await;
        self.exited.cancel();

        tracing::info!(session_id = %self.id, exit_code = ?status, "Session exited");
    }

    fn append_scrollback(&self, data: &[u8]) {
        let mut buf = self.scrollback.lock().expect("scrollback lock poisoned");
        for &b in data {
            if buf.len() == SCROLLBACK_CAPACITY {
                buf.pop_front();
            }
            buf.push_back(b);
        }
    }
}

/// Whether an inherited environment variable must not reach the child.
fn is_scrubbed_var(name: &str) -> bool {
    SCRUBBED_ENV
        .iter()
        .any(|family| name == *family || name.starts_with(&format!("{family}_")))
        // GEMINI* and CODEX* are plain prefix families.
        || name.starts_with("GEMINI")
        || name.starts_with("CODEX")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn sh_spec(id: &str, script: &str) -> SessionSpec {
        let mut spec = SessionSpec::new(id, "/bin/sh");
        spec.args = vec!["-c".into(), script.into()];
        spec
    }

    async fn drain_until_exit(rx: &mut mpsc::Receiver<OutputEvent>) -> (Vec<u8>, Option<i32>) {
        let mut output = Vec::new();
        loop {
            match timeout(Duration::from_secs(10), rx.recv()).await {
                Ok(Some(OutputEvent::Data(data))) => output.extend_from_slice(&data),
                Ok(Some(OutputEvent::Exit(status))) => return (output, status),
                Ok(None) => panic!("output channel closed without exit event"),
                Err(_) => panic!("timed out waiting for exit"),
            }
        }
    }

    #[test]
    fn test_scrubbed_env_matching() {
        assert!(is_scrubbed_var("CLAUDE"));
        assert!(is_scrubbed_var("CLAUDE_API_KEY"));
        assert!(is_scrubbed_var("OPENCODE"));
        assert!(is_scrubbed_var("OPENCODE_SESSION"));
        assert!(is_scrubbed_var("GEMINI_KEY"));
        assert!(is_scrubbed_var("GEMINIFOO"));
        assert!(is_scrubbed_var("CODEX_HOME"));
        assert!(!is_scrubbed_var("CLAUDETTE"));
        assert!(!is_scrubbed_var("PATH"));
        assert!(!is_scrubbed_var("HOME"));
    }

    #[tokio::test]
    async fn test_spawn_echo_and_exit_code() {
        let (session, mut rx) = PtySession::spawn(sh_spec("s1", "echo hi; exit 7")).unwrap();

        let (output, status) = drain_until_exit(&mut rx).await;
        assert!(String::from_utf8_lossy(&output).contains("hi"));
        assert_eq!(status, Some(7));
        assert!(!session.is_running());
        assert_eq!(session.exit_status(), Some(7));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_error() {
        let spec = SessionSpec::new("s2", "/nonexistent/program/zzz");
        // portable-pty reports exec failures either at spawn time or as an
        // immediate child exit, depending on platform. Accept both shapes.
        match PtySession::spawn(spec) {
            Err(SessionError::SpawnFailed(_)) => {}
            Ok((session, mut rx)) => {
                let (_, status) = drain_until_exit(&mut rx).await;
                assert_ne!(status, Some(0));
                assert!(!session.is_running());
            }
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_write_after_exit_fails() {
        let (session, mut rx) = PtySession::spawn(sh_spec("s3", "exit 0")).unwrap();
        drain_until_exit(&mut rx).await;

        let result = session.write(b"hello\n").await;
        assert!(matches!(result, Err(SessionError::NotRunning(_))));
    }

    #[tokio::test]
    async fn test_resize_after_exit_is_ignored() {
        let (session, mut rx) = PtySession::spawn(sh_spec("s4", "exit 0")).unwrap();
        drain_until_exit(&mut rx).await;

        assert!(session.resize(50, 100).await.is_ok());
    }

    #[tokio::test]
    async fn test_session_env() {
        let (_session, mut rx) = PtySession::spawn(sh_spec(
            "env-check",
            "echo TERM=$TERM SESSION=$OPENKANBAN_SESSION",
        ))
        .unwrap();

        let (output, _) = drain_until_exit(&mut rx).await;
        let text = String::from_utf8_lossy(&output);
        assert!(text.contains("TERM=xterm-256color"), "output: {text}");
        assert!(text.contains("SESSION=env-check"), "output: {text}");
    }

    #[tokio::test]
    async fn test_stop_graceful_kills_long_lived_child() {
        let mut spec = SessionSpec::new("s5", "sleep");
        spec.args = vec!["100".into()];
        let (session, mut rx) = PtySession::spawn(spec).unwrap();

        assert!(session.is_running());
        session.stop_graceful(Duration::from_secs(2)).await;
        assert!(!session.is_running());

        let (_, _status) = drain_until_exit(&mut rx).await;
    }

    #[tokio::test]
    async fn test_stop_graceful_idempotent() {
        let (session, mut rx) = PtySession::spawn(sh_spec("s6", "exit 0")).unwrap();
        drain_until_exit(&mut rx).await;

        // Both calls return immediately on an exited session.
        session.stop_graceful(Duration::from_secs(1)).await;
        session.close().await;
    }

    #[tokio::test]
    async fn test_resize_propagates_to_child() {
        let (session, mut rx) =
            PtySession::spawn(sh_spec("s7", "sleep 0.3; stty size")).unwrap();

        session.resize(40, 132).await.unwrap();
        assert_eq!(session.size(), (40, 132));

        let (output, _) = drain_until_exit(&mut rx).await;
        assert!(
            String::from_utf8_lossy(&output).contains("40 132"),
            "output: {}",
            String::from_utf8_lossy(&output)
        );
    }

    #[tokio::test]
    async fn test_scrollback_retains_output() {
        let (session, mut rx) = PtySession::spawn(sh_spec("s8", "echo remembered")).unwrap();
        drain_until_exit(&mut rx).await;

        let text = String::from_utf8_lossy(&session.scrollback()).to_string();
        assert!(text.contains("remembered"), "scrollback: {text}");
    }

    #[tokio::test]
    async fn test_large_burst_delivered_completely() {
        // 64 KiB + 1 bytes in one burst must arrive intact, possibly split
        // across chunks.
        let (_session, mut rx) = PtySession::spawn(sh_spec(
            "s9",
            "head -c 65537 /dev/zero | tr '\\0' 'x'",
        ))
        .unwrap();

        let (output, _) = drain_until_exit(&mut rx).await;
        let xs = output.iter().filter(|&&b| b == b'x').count();
        assert_eq!(xs, 65537);
    }
}
