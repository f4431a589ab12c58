//! Authenticated WebSocket session state.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use rollcall_core::enrollment::Role;
use rollcall_core::ids::{SessionId, UserId};
use rollcall_core::protocol::ServerFrame;
use rollcall_core::topic::TopicKey;

/// Result of queueing a frame for a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    /// Queued for the writer task.
    Delivered,
    /// The outbound queue is full. The session should be evicted.
    QueueFull,
    /// The writer task is gone.
    Closed,
}

/// One authenticated connection for one `(user, role)` pair.
///
/// Only the registry mutates `topics`; everyone else reads through
/// [`topics`](Self::topics).
pub struct Session {
    /// Server-assigned session ID.
    pub id: SessionId,
    /// Authenticated user.
    pub user_id: UserId,
    /// Authenticated role.
    pub role: Role,
    /// When the handshake completed.
    pub connected_at: DateTime<Utc>,
    topics: Mutex<HashSet<TopicKey>>,
    last_heartbeat: Mutex<Instant>,
    tx: mpsc::Sender<Arc<String>>,
    cancel: CancellationToken,
    dropped_messages: AtomicU64,
}

impl Session {
    /// Create a session writing into `tx`.
    pub fn new(user_id: UserId, role: Role, tx: mpsc::Sender<Arc<String>>) -> Self {
        Self {
            id: SessionId::new(),
            user_id,
            role,
            connected_at: Utc::now(),
            topics: Mutex::new(HashSet::new()),
            last_heartbeat: Mutex::new(Instant::now()),
            tx,
            cancel: CancellationToken::new(),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Queue a pre-serialized frame.
    pub fn push(&self, frame: Arc<String>) -> PushOutcome {
        match self.tx.try_send(frame) {
            Ok(()) => PushOutcome::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                PushOutcome::QueueFull
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                PushOutcome::Closed
            }
        }
    }

    /// Serialize and queue a frame.
    pub fn send_frame(&self, frame: impl Into<ServerFrame>) -> PushOutcome {
        match serde_json::to_string(&frame.into()) {
            Ok(json) => self.push(Arc::new(json)),
            Err(e) => {
                tracing::error!(session_id = %self.id, error = %e, "failed to serialize frame");
                PushOutcome::Closed
            }
        }
    }

    /// Frames dropped because the queue was full or closed.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Record a heartbeat.
    pub fn mark_alive(&self) {
        *self.last_heartbeat.lock() = Instant::now();
    }

    /// Time since the last heartbeat (or the handshake).
    pub fn since_heartbeat(&self) -> Duration {
        self.last_heartbeat.lock().elapsed()
    }

    /// Copy of the current topic set.
    pub fn topics(&self) -> HashSet<TopicKey> {
        self.topics.lock().clone()
    }

    /// Whether the session holds `topic`.
    pub fn holds(&self, topic: &TopicKey) -> bool {
        self.topics.lock().contains(topic)
    }

    pub(crate) fn add_topic(&self, topic: TopicKey) -> bool {
        self.topics.lock().insert(topic)
    }

    pub(crate) fn remove_topic(&self, topic: &TopicKey) -> bool {
        self.topics.lock().remove(topic)
    }

    pub(crate) fn drain_topics(&self) -> Vec<TopicKey> {
        self.topics.lock().drain().collect()
    }

    /// Token cancelled when the session must close.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Ask the connection task to close.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::protocol::ControlFrame;

    fn make_session(capacity: usize) -> (Session, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Session::new(UserId::from("u1"), Role::Student, tx), rx)
    }

    #[tokio::test]
    async fn push_delivers_in_order() {
        let (session, mut rx) = make_session(8);
        for i in 0..3 {
            assert_eq!(session.push(Arc::new(format!("m{i}"))), PushOutcome::Delivered);
        }
        for i in 0..3 {
            assert_eq!(*rx.recv().await.unwrap(), format!("m{i}"));
        }
    }

    #[test]
    fn full_queue_reports_queue_full() {
        let (session, _rx) = make_session(1);
        assert_eq!(session.push(Arc::new("a".into())), PushOutcome::Delivered);
        assert_eq!(session.push(Arc::new("b".into())), PushOutcome::QueueFull);
        assert_eq!(session.drop_count(), 1);
    }

    #[test]
    fn closed_queue_reports_closed() {
        let (session, rx) = make_session(4);
        drop(rx);
        assert_eq!(session.push(Arc::new("a".into())), PushOutcome::Closed);
    }

    #[tokio::test]
    async fn send_frame_serializes_control_frames() {
        let (session, mut rx) = make_session(4);
        assert_eq!(session.send_frame(ControlFrame::HeartbeatAck), PushOutcome::Delivered);
        let json = rx.recv().await.unwrap();
        assert_eq!(*json, r#"{"type":"HEARTBEAT_ACK"}"#);
    }

    #[test]
    fn topic_bookkeeping() {
        let (session, _rx) = make_session(1);
        let topic = TopicKey::user("u1");
        assert!(session.add_topic(topic.clone()));
        assert!(!session.add_topic(topic.clone()));
        assert!(session.holds(&topic));
        assert_eq!(session.drain_topics(), vec![topic.clone()]);
        assert!(!session.holds(&topic));
    }

    #[test]
    fn heartbeat_resets_elapsed() {
        let (session, _rx) = make_session(1);
        std::thread::sleep(Duration::from_millis(15));
        assert!(session.since_heartbeat() >= Duration::from_millis(15));
        session.mark_alive();
        assert!(session.since_heartbeat() < Duration::from_millis(15));
    }

    #[test]
    fn close_cancels_token() {
        let (session, _rx) = make_session(1);
        assert!(!session.is_closed());
        session.close();
        assert!(session.cancel_token().is_cancelled());
    }
}
