//! The broker: control-operation routing, fan-out, and lifecycle.
//!
//! The broker owns the session registry, the connection table, and the
//! per-session subscriber sets. Transports (the unix-socket server and the
//! WebSocket adapter) decode their own wire formats and hand the broker
//! [`Message`] values tagged with a connection; the broker is the only
//! component that touches sessions.
//!
//! Subscriber sets hold connection *ids*, not handles: the connection table
//! is the single owner of connections, so removing a connection there
//! removes it everywhere (no reference cycles between sessions and
//! connections).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::join_all;
use protocol::Message;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::board::BoardStore;
use crate::connection::{ClientConnection, ConnectionId};
use crate::session::{CreateOutcome, OutputEvent, PtySession, SessionId, SessionRegistry, SessionSpec};

/// How long a session gets between SIGINT and SIGKILL at daemon shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The central coordinator.
pub struct Broker {
    registry: SessionRegistry,
    connections: DashMap<ConnectionId, Arc<ClientConnection>>,
    subscribers: DashMap<SessionId, HashSet<ConnectionId>>,
    fanout_tasks: DashMap<SessionId, JoinHandle<()>>,
    board: Arc<BoardStore>,
    shutdown: CancellationToken,
}

impl Broker {
    /// Creates a broker around an empty registry.
    pub fn new(board: Arc<BoardStore>) -> Arc<Self> {
        Arc::new(Self {
            registry: SessionRegistry::new(),
            connections: DashMap::new(),
            subscribers: DashMap::new(),
            fanout_tasks: DashMap::new(),
            board,
            shutdown: CancellationToken::new(),
        })
    }

    /// Returns the board store.
    pub fn board(&self) -> &Arc<BoardStore> {
        &self.board
    }

    /// Returns the session registry.
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Token cancelled when the daemon is shutting down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Register a newly accepted client.
    pub fn register_connection(&self) -> Arc<ClientConnection> {
        let conn = Arc::new(ClientConnection::new());
        self.connections.insert(conn.id(), Arc::clone(&conn));
        debug!(conn_id = conn.id(), "Client connected");
        conn
    }

    /// Remove a disconnected client from the table and every subscriber set.
    ///
    /// The session, if any, keeps running; disconnect is not detach-plus-
    /// teardown, it is only the client going away.
    pub fn remove_connection(&self, conn_id: ConnectionId) {
        if let Some((_, conn)) = self.connections.remove(&conn_id) {
            if let Some(session_id) = conn.attached_session() {
                if let Some(mut subs) = self.subscribers.get_mut(&session_id) {
                    subs.remove(&conn_id);
                }
            }
            conn.queue().close();
            debug!(conn_id, "Client disconnected");
        }
    }

    /// Handle one decoded message from a connection.
    pub async fn handle_message(self: &Arc<Self>, conn: &Arc<ClientConnection>, msg: Message) {
        match msg {
            Message::Create {
                session_id,
                workdir,
                command,
                args,
            } => {
                self.handle_create(conn, session_id, workdir, command, args)
                    .await;
            }
            Message::Attach { session_id } => self.handle_attach(conn, session_id),
            Message::Detach => self.detach(conn),
            Message::Data(data) => self.handle_data(conn, &data).await,
            Message::Resize { rows, cols } => self.handle_resize(conn, rows, cols).await,
            Message::List => {
                conn.queue().push(Message::ListResponse {
                    session_ids: self.registry.list_running(),
                });
            }
            // Server-to-client messages arriving inbound are ignored.
            other => {
                trace!(conn_id = conn.id(), msg = ?other.frame_type(), "Ignoring server-direction message");
            }
        }
    }

    /// CREATE: start a session, or attach when the id already exists.
    ///
    /// On success the connection's attachment is bound to the session.
    /// This is the shared operation behind the binary CREATE frame and the
    /// WebSocket `agent:spawn` envelope.
    pub async fn create_session(
        self: &Arc<Self>,
        conn: &Arc<ClientConnection>,
        session_id: String,
        workdir: String,
        command: String,
        args: Vec<String>,
    ) -> Result<Arc<PtySession>, String> {
        if session_id.is_empty() || command.is_empty() {
            return Err("invalid create request".into());
        }

        let mut spec = SessionSpec::new(session_id.clone(), command);
        spec.args = args;
        if !workdir.is_empty() {
            spec.workdir = Some(workdir.into());
        }

        match self.registry.create_or_attach(spec).await {
            Ok(CreateOutcome::Created(session, rx)) => {
                self.start_fanout(session.id().clone(), rx);
                self.attach(conn, session.id().clone());
                info!(conn_id = conn.id(), session_id = %session.id(), "Created session");
                Ok(session)
            }
            Ok(CreateOutcome::Attached(session)) => {
                self.attach(conn, session.id().clone());
                info!(conn_id = conn.id(), session_id = %session.id(), "Attached to existing session");
                Ok(session)
            }
            Err(e) => {
                warn!(conn_id = conn.id(), session_id = %session_id, error = %e, "Create failed");
                Err(e.to_string())
            }
        }
    }

    /// ATTACH: bind the connection to a running session.
    pub fn attach_session(
        &self,
        conn: &Arc<ClientConnection>,
        session_id: &str,
    ) -> Result<Arc<PtySession>, String> {
        if session_id.is_empty() {
            return Err("empty session ID".into());
        }

        let session = self
            .registry
            .lookup(session_id)
            .ok_or_else(|| format!("session not found: {session_id}"))?;

        if !session.is_running() {
            return Err(format!("session not running: {session_id}"));
        }

        self.attach(conn, session_id.to_string());
        debug!(conn_id = conn.id(), session_id = %session.id(), "Client attached");
        Ok(session)
    }

    async fn handle_create(
        self: &Arc<Self>,
        conn: &Arc<ClientConnection>,
        session_id: String,
        workdir: String,
        command: String,
        args: Vec<String>,
    ) {
        let reply = match self
            .create_session(conn, session_id, workdir, command, args)
            .await
        {
            Ok(_) => Message::SessionOk,
            Err(message) => Message::SessionError { message },
        };
        conn.queue().push(reply);
    }

    fn handle_attach(&self, conn: &Arc<ClientConnection>, session_id: String) {
        let reply = match self.attach_session(conn, &session_id) {
            Ok(_) => Message::SessionOk,
            Err(message) => Message::SessionError { message },
        };
        conn.queue().push(reply);
    }

    /// DATA: forward input to the attached session, if any.
    ///
    /// Input for a missing or exited session is silently dropped; the
    /// client learns about termination from the EXIT frame, not from a
    /// write error.
    async fn handle_data(&self, conn: &Arc<ClientConnection>, data: &[u8]) {
        let Some(session_id) = conn.attached_session() else {
            return;
        };
        let Some(session) = self.registry.lookup(&session_id) else {
            return;
        };
        if let Err(e) = session.write(data).await {
            trace!(session_id = %session_id, error = %e, "Dropping input for dead session");
        }
    }

    /// RESIZE: propagate to the attached session, if any.
    async fn handle_resize(&self, conn: &Arc<ClientConnection>, rows: u16, cols: u16) {
        let Some(session_id) = conn.attached_session() else {
            return;
        };
        let Some(session) = self.registry.lookup(&session_id) else {
            return;
        };
        if let Err(e) = session.resize(rows, cols).await {
            warn!(session_id = %session_id, error = %e, "Resize failed");
        }
    }

    /// Bind `conn`'s attachment, replacing any previous one.
    pub fn attach(&self, conn: &Arc<ClientConnection>, session_id: SessionId) {
        self.detach(conn);
        self.subscribers
            .entry(session_id.clone())
            .or_default()
            .insert(conn.id());
        conn.set_attached(Some(session_id));
    }

    /// Clear `conn`'s attachment and subscriber-set membership.
    pub fn detach(&self, conn: &Arc<ClientConnection>) {
        if let Some(previous) = conn.attached_session() {
            if let Some(mut subs) = self.subscribers.get_mut(&previous) {
                subs.remove(&conn.id());
            }
            conn.set_attached(None);
            debug!(conn_id = conn.id(), session_id = %previous, "Client detached");
        }
    }

    /// Look up a running session for the web adapter.
    pub fn lookup_session(&self, session_id: &str) -> Option<Arc<PtySession>> {
        self.registry.lookup(session_id)
    }

    /// Start the dedicated fan-out task for a new session.
    ///
    /// The task drains the session's output channel and copies each chunk
    /// into every subscriber's send queue. It never blocks on a slow
    /// subscriber; the queue's coalescing absorbs the pressure.
    pub fn start_fanout(self: &Arc<Self>, session_id: SessionId, mut rx: mpsc::Receiver<OutputEvent>) {
        let broker = Arc::clone(self);
        let id = session_id.clone();

        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    OutputEvent::Data(data) => {
                        for conn in broker.subscriber_connections(&id) {
                            if !conn.queue().push(Message::Data(data.clone())) {
                                trace!(
                                    conn_id = conn.id(),
                                    session_id = %id,
                                    "Subscriber queue full, coalesced"
                                );
                            }
                        }
                    }
                    OutputEvent::Exit(status) => {
                        info!(session_id = %id, exit_code = ?status, "Broadcasting session exit");
                        for conn in broker.subscriber_connections(&id) {
                            conn.queue().push(Message::Exit);
                            conn.set_attached(None);
                        }
                        broker.subscribers.remove(&id);
                        broker.registry.remove(&id);
                        break;
                    }
                }
            }
            broker.fanout_tasks.remove(&id);
        });

        self.fanout_tasks.insert(session_id, handle);
    }

    /// Snapshot the live subscriber connections of a session.
    fn subscriber_connections(&self, session_id: &str) -> Vec<Arc<ClientConnection>> {
        let ids: Vec<ConnectionId> = match self.subscribers.get(session_id) {
            Some(subs) => subs.iter().copied().collect(),
            None => return Vec::new(),
        };
        ids.iter()
            .filter_map(|id| self.connections.get(id).map(|c| Arc::clone(c.value())))
            .collect()
    }

    /// Graceful shutdown.
    ///
    /// Stops every session (SIGINT, then SIGKILL after the grace period),
    /// waits for their exit broadcasts to reach subscriber queues, flushes
    /// the board, and closes all connections. Socket and PID file removal is
    /// the caller's job; it owns those resources.
    pub async fn shutdown(&self) {
        info!("Broker shutting down");
        self.shutdown.cancel();

        let sessions = self.registry.all();
        join_all(
            sessions
                .iter()
                .map(|session| session.stop_graceful(SHUTDOWN_GRACE)),
        )
        .await;

        // Exit events propagate through the fan-out tasks; wait for them so
        // every subscriber queue holds its EXIT frame before queues close.
        let handles: Vec<(SessionId, JoinHandle<()>)> = {
            let keys: Vec<SessionId> = self.fanout_tasks.iter().map(|e| e.key().clone()).collect();
            keys.into_iter()
                .filter_map(|k| self.fanout_tasks.remove(&k))
                .collect()
        };
        for (session_id, handle) in handles {
            if tokio::time::timeout(Duration::from_secs(1), handle).await.is_err() {
                warn!(session_id = %session_id, "Fan-out task did not finish in time");
            }
        }

        self.board.flush_now();

        for conn in self.connections.iter() {
            conn.queue().close();
        }
        info!("Broker shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn test_broker() -> (Arc<Broker>, TempDir) {
        let dir = TempDir::new().unwrap();
        let board = BoardStore::open(dir.path().join("board.json"));
        (Broker::new(board), dir)
    }

    async fn recv_queue(
        conn: &Arc<ClientConnection>,
        timeout: Duration,
    ) -> Option<Message> {
        tokio::time::timeout(timeout, conn.queue().pop()).await.ok()?
    }

    async fn expect_session_ok(conn: &Arc<ClientConnection>) {
        match recv_queue(conn, Duration::from_secs(5)).await {
            Some(Message::SessionOk) => {}
            other => panic!("expected SessionOk, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_create_echo_exit() {
        let (broker, _dir) = test_broker().await;
        let conn = broker.register_connection();

        broker
            .handle_create(
                &conn,
                "s1".into(),
                "/tmp".into(),
                "/bin/sh".into(),
                vec!["-c".into(), "echo hi; exit 7".into()],
            )
            .await;
        expect_session_ok(&conn).await;

        let mut output = Vec::new();
        loop {
            match recv_queue(&conn, Duration::from_secs(10)).await {
                Some(Message::Data(data)) => output.extend_from_slice(&data),
                Some(Message::Exit) => break,
                other => panic!("unexpected message: {other:?}"),
            }
        }
        assert!(String::from_utf8_lossy(&output).contains("hi"));

        // Terminal broadcast precedes registry removal; after EXIT the
        // session is gone and the attachment cleared.
        assert!(broker.registry().lookup("s1").is_none());
        assert_eq!(conn.attached_session(), None);
    }

    #[tokio::test]
    async fn test_attach_unknown_session() {
        let (broker, _dir) = test_broker().await;
        let conn = broker.register_connection();

        broker.handle_attach(&conn, "ghost".into());
        match recv_queue(&conn, Duration::from_secs(1)).await {
            Some(Message::SessionError { message }) => {
                assert_eq!(message, "session not found: ghost");
            }
            other => panic!("expected SessionError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_attach_empty_id() {
        let (broker, _dir) = test_broker().await;
        let conn = broker.register_connection();

        broker.handle_attach(&conn, String::new());
        match recv_queue(&conn, Duration::from_secs(1)).await {
            Some(Message::SessionError { message }) => {
                assert_eq!(message, "empty session ID");
            }
            other => panic!("expected SessionError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_multi_client_fanout_and_detach() {
        let (broker, _dir) = test_broker().await;
        let a = broker.register_connection();
        let b = broker.register_connection();

        broker
            .handle_create(&a, "s2".into(), String::new(), "/bin/cat".into(), vec![])
            .await;
        expect_session_ok(&a).await;

        broker.handle_attach(&b, "s2".into());
        expect_session_ok(&b).await;

        broker
            .handle_message(&a, Message::Data(b"hello\n".to_vec()))
            .await;

        for conn in [&a, &b] {
            match recv_queue(conn, Duration::from_secs(5)).await {
                Some(Message::Data(data)) => {
                    assert!(String::from_utf8_lossy(&data).contains("hello"));
                }
                other => panic!("expected Data, got {other:?}"),
            }
        }

        // B detaches; only A sees further output.
        broker.handle_message(&b, Message::Detach).await;
        broker
            .handle_message(&a, Message::Data(b"world\n".to_vec()))
            .await;

        match recv_queue(&a, Duration::from_secs(5)).await {
            Some(Message::Data(data)) => {
                assert!(String::from_utf8_lossy(&data).contains("world"));
            }
            other => panic!("expected Data, got {other:?}"),
        }
        assert!(recv_queue(&b, Duration::from_millis(300)).await.is_none());

        broker.registry().lookup("s2").unwrap().close().await;
    }

    #[tokio::test]
    async fn test_disconnect_survives_session() {
        let (broker, _dir) = test_broker().await;
        let a = broker.register_connection();

        broker
            .handle_create(&a, "s3".into(), String::new(), "/bin/cat".into(), vec![])
            .await;
        expect_session_ok(&a).await;

        broker.remove_connection(a.id());

        let session = broker.registry().lookup("s3").expect("session must survive");
        assert!(session.is_running());

        // A new client can attach to the surviving session.
        let c = broker.register_connection();
        broker.handle_attach(&c, "s3".into());
        expect_session_ok(&c).await;

        session.close().await;
    }

    #[tokio::test]
    async fn test_create_duplicate_id_attaches_second_caller() {
        let (broker, _dir) = test_broker().await;
        let a = broker.register_connection();
        let b = broker.register_connection();

        broker
            .handle_create(&a, "dup".into(), String::new(), "/bin/cat".into(), vec![])
            .await;
        expect_session_ok(&a).await;

        // Different spec, same id: second caller simply attaches.
        broker
            .handle_create(&b, "dup".into(), String::new(), "/bin/sh".into(), vec![])
            .await;
        expect_session_ok(&b).await;

        assert_eq!(broker.registry().count(), 1);
        broker.registry().lookup("dup").unwrap().close().await;
    }

    #[tokio::test]
    async fn test_list_running() {
        let (broker, _dir) = test_broker().await;
        let conn = broker.register_connection();

        broker
            .handle_create(&conn, "l1".into(), String::new(), "/bin/cat".into(), vec![])
            .await;
        expect_session_ok(&conn).await;

        broker.handle_message(&conn, Message::List).await;
        match recv_queue(&conn, Duration::from_secs(1)).await {
            Some(Message::ListResponse { session_ids }) => {
                assert_eq!(session_ids, vec!["l1".to_string()]);
            }
            other => panic!("expected ListResponse, got {other:?}"),
        }

        broker.registry().lookup("l1").unwrap().close().await;
    }

    #[tokio::test]
    async fn test_data_without_attachment_is_dropped() {
        let (broker, _dir) = test_broker().await;
        let conn = broker.register_connection();

        // No attachment: silently dropped, no reply of any kind.
        broker
            .handle_message(&conn, Message::Data(b"into the void".to_vec()))
            .await;
        assert!(recv_queue(&conn, Duration::from_millis(200)).await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_stops_sessions_and_delivers_exit() {
        let (broker, _dir) = test_broker().await;
        let conn = broker.register_connection();

        broker
            .handle_create(
                &conn,
                "s5".into(),
                String::new(),
                "/bin/sleep".into(),
                vec!["100".into()],
            )
            .await;
        expect_session_ok(&conn).await;

        broker.shutdown().await;

        // The queue was closed after the EXIT frame was enqueued.
        let mut saw_exit = false;
        while let Some(msg) = conn.queue().pop().await {
            if msg == Message::Exit {
                saw_exit = true;
            }
        }
        assert!(saw_exit, "subscriber must receive EXIT during shutdown");
        assert!(broker.registry().list_running().is_empty());
    }
}
