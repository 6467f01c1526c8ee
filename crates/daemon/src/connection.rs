//! Client connections and their bounded send queues.
//!
//! Every connected client (binary-protocol or WebSocket) is represented by a
//! [`ClientConnection`]. The broker pushes outbound messages into the
//! connection's [`SendQueue`]; a per-connection writer task drains the queue
//! to the transport. The queue is where back-pressure is absorbed: a slow
//! client loses its oldest DATA frames, never control frames, and never
//! stalls the session reader or other clients.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use protocol::Message;
use tokio::sync::Notify;

use crate::session::SessionId;

/// Unique identifier for a connection, assigned by the broker.
pub type ConnectionId = u64;

/// Default send queue capacity, in frames.
pub const SEND_QUEUE_CAPACITY: usize = 512;

/// Statistics about a connection's outbound message handling.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    /// Frames enqueued successfully.
    pub enqueued: u64,
    /// DATA frames evicted or refused because the queue was full.
    pub dropped: u64,
}

struct QueueInner {
    queue: VecDeque<Message>,
    enqueued: u64,
    dropped: u64,
    closed: bool,
}

/// Bounded outbound queue with DATA coalescing.
///
/// `push` never blocks. When the queue is full, the oldest queued DATA
/// frames are evicted to make room; control frames (EXIT, SESSION_OK,
/// SESSION_ERROR, LIST_RESPONSE) are never evicted, and an incoming DATA
/// frame that cannot fit among them is dropped instead. The relative order
/// of everything that is delivered is preserved.
pub struct SendQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
}

impl SendQueue {
    /// Creates a queue with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(SEND_QUEUE_CAPACITY)
    }

    /// Creates a queue with a specific capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                queue: VecDeque::with_capacity(capacity.min(1024)),
                enqueued: 0,
                dropped: 0,
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Enqueue a message without blocking.
    ///
    /// Returns `false` if the message was dropped (full queue, DATA frame,
    /// no older DATA to evict) or the queue is closed.
    pub fn push(&self, msg: Message) -> bool {
        let pushed = {
            let mut inner = self.inner.lock().expect("send queue lock poisoned");
            if inner.closed {
                return false;
            }

            // Evict oldest DATA frames until the new message fits. Control
            // frames pass even when the queue is full of other control
            // frames; there are never more than a handful in flight.
            while inner.queue.len() >= self.capacity {
                match inner.queue.iter().position(Message::is_data) {
                    Some(idx) => {
                        inner.queue.remove(idx);
                        inner.dropped += 1;
                    }
                    None => break,
                }
            }

            if inner.queue.len() >= self.capacity && msg.is_data() {
                inner.dropped += 1;
                false
            } else {
                inner.queue.push_back(msg);
                inner.enqueued += 1;
                true
            }
        };

        if pushed {
            self.notify.notify_one();
        }
        pushed
    }

    /// Dequeue the next message, waiting until one is available.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<Message> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().expect("send queue lock poisoned");
                if let Some(msg) = inner.queue.pop_front() {
                    return Some(msg);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Close the queue. Messages already enqueued are still delivered;
    /// further pushes are refused.
    pub fn close(&self) {
        self.inner.lock().expect("send queue lock poisoned").closed = true;
        self.notify.notify_waiters();
        // A waiter that checked the queue but has not yet registered misses
        // notify_waiters; the stored permit catches it.
        self.notify.notify_one();
    }

    /// Returns whether the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().expect("send queue lock poisoned").closed
    }

    /// Returns current queue statistics.
    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().expect("send queue lock poisoned");
        QueueStats {
            enqueued: inner.enqueued,
            dropped: inner.dropped,
        }
    }
}

impl Default for SendQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// One connected client.
///
/// The broker is the only writer of `attached_session_id`; transports only
/// read it when tearing the connection down.
pub struct ClientConnection {
    id: ConnectionId,
    attached: Mutex<Option<SessionId>>,
    queue: SendQueue,
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

impl ClientConnection {
    /// Creates a connection with a fresh id and an empty queue.
    pub fn new() -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            attached: Mutex::new(None),
            queue: SendQueue::new(),
        }
    }

    /// Returns the connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Returns the send queue.
    pub fn queue(&self) -> &SendQueue {
        &self.queue
    }

    /// Returns the id of the session this connection is attached to.
    pub fn attached_session(&self) -> Option<SessionId> {
        self.attached.lock().expect("attachment lock poisoned").clone()
    }

    /// Bind this connection's attachment. Broker-only.
    pub(crate) fn set_attached(&self, session_id: Option<SessionId>) {
        *self.attached.lock().expect("attachment lock poisoned") = session_id;
    }
}

impl Default for ClientConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(n: u8) -> Message {
        Message::Data(vec![n])
    }

    #[tokio::test]
    async fn test_push_pop_order() {
        let q = SendQueue::new();
        q.push(data(1));
        q.push(data(2));
        q.push(data(3));

        assert_eq!(q.pop().await, Some(data(1)));
        assert_eq!(q.pop().await, Some(data(2)));
        assert_eq!(q.pop().await, Some(data(3)));
    }

    #[tokio::test]
    async fn test_full_queue_drops_oldest_data() {
        let q = SendQueue::with_capacity(3);
        q.push(data(1));
        q.push(data(2));
        q.push(data(3));
        // Queue full; pushing evicts the oldest DATA.
        assert!(q.push(data(4)));

        assert_eq!(q.pop().await, Some(data(2)));
        assert_eq!(q.pop().await, Some(data(3)));
        assert_eq!(q.pop().await, Some(data(4)));
        assert_eq!(q.stats().dropped, 1);
    }

    #[tokio::test]
    async fn test_control_frames_never_evicted() {
        let q = SendQueue::with_capacity(3);
        q.push(Message::SessionOk);
        q.push(data(1));
        q.push(Message::Exit);
        // Full. The DATA frame in the middle goes, the control frames stay.
        assert!(q.push(data(2)));

        assert_eq!(q.pop().await, Some(Message::SessionOk));
        assert_eq!(q.pop().await, Some(Message::Exit));
        assert_eq!(q.pop().await, Some(data(2)));
    }

    #[tokio::test]
    async fn test_data_refused_when_full_of_control() {
        let q = SendQueue::with_capacity(2);
        q.push(Message::SessionOk);
        q.push(Message::Exit);

        // No DATA to evict; the incoming DATA is the one dropped.
        assert!(!q.push(data(1)));
        assert_eq!(q.stats().dropped, 1);

        // Control frames still pass.
        assert!(q.push(Message::ListResponse { session_ids: vec![] }));
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let q = SendQueue::new();
        q.push(data(1));
        q.close();

        assert!(!q.push(data(2)), "push after close must be refused");
        assert_eq!(q.pop().await, Some(data(1)));
        assert_eq!(q.pop().await, None);
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let q = std::sync::Arc::new(SendQueue::new());
        let q2 = std::sync::Arc::clone(&q);

        let waiter = tokio::spawn(async move { q2.pop().await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        q.push(data(9));

        let got = tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("pop should wake")
            .unwrap();
        assert_eq!(got, Some(data(9)));
    }

    #[test]
    fn test_connection_ids_unique() {
        let a = ClientConnection::new();
        let b = ClientConnection::new();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_attachment_roundtrip() {
        let conn = ClientConnection::new();
        assert_eq!(conn.attached_session(), None);
        conn.set_attached(Some("s1".into()));
        assert_eq!(conn.attached_session(), Some("s1".into()));
        conn.set_attached(None);
        assert_eq!(conn.attached_session(), None);
    }
}
