//! Event broker: enrollment facts in, addressed envelopes out.
//!
//! Each fact becomes exactly one [`Envelope`]. Facts are deduplicated by the
//! store's change id, recorded in a bounded replay buffer and pushed once to
//! every session subscribed to any of the fact's topics. Ingestion and
//! replay share one lock, so a session never sees a live envelope overtake
//! a replayed one.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use rollcall_core::envelope::{EnrollmentFact, Envelope};
use rollcall_core::ids::{EventId, SessionId};
use rollcall_core::protocol::ControlFrame;
use rollcall_core::topic::TopicKey;
use rollcall_store::EnrollmentRepo;

use super::connection::{PushOutcome, Session};
use super::registry::SubscriptionRegistry;
use crate::metrics::{
    ENVELOPES_DROPPED_TOTAL, ENVELOPES_PUSHED_TOTAL, FACTS_DUPLICATE_TOTAL, FACTS_INGESTED_TOTAL,
    FEED_LAGGED_TOTAL, REPLAY_REQUESTS_TOTAL, SESSIONS_EVICTED_TOTAL,
};

/// Page size used when catching up from the outbox after the feed lagged.
const CATCH_UP_PAGE: usize = 500;

// ─────────────────────────────────────────────────────────────────────────────
// Dedup window
// ─────────────────────────────────────────────────────────────────────────────

/// Remembers the last `capacity` change ids, evicting FIFO.
#[derive(Debug)]
pub struct DedupWindow {
    order: VecDeque<i64>,
    seen: HashSet<i64>,
    capacity: usize,
}

impl DedupWindow {
    /// Create a window holding up to `capacity` ids.
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity.min(4096)),
            seen: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record `id`. Returns `false` if it was already present.
    pub fn insert(&mut self, id: i64) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                let _ = self.seen.remove(&old);
            }
        }
        true
    }

    /// Number of remembered ids.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether nothing is remembered.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Replay buffer
// ─────────────────────────────────────────────────────────────────────────────

struct Buffered {
    at: Instant,
    envelope: Envelope,
    frame: Arc<String>,
}

/// Result of a replay lookup.
#[derive(Debug, PartialEq, Eq)]
pub enum Replay {
    /// Everything after the requested event, filtered to the caller's topics.
    Available(Vec<Arc<String>>),
    /// The requested event has aged out, or was never buffered.
    Unavailable,
}

/// Recent envelopes bounded by count and age.
pub struct ReplayBuffer {
    entries: VecDeque<Buffered>,
    capacity: usize,
    max_age: Duration,
}

impl ReplayBuffer {
    /// Create a buffer of at most `capacity` envelopes no older than `max_age`.
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
            max_age,
        }
    }

    /// Append an envelope with its serialized frame.
    pub fn push(&mut self, envelope: Envelope, frame: Arc<String>) {
        if self.capacity == 0 {
            return;
        }
        self.entries.push_back(Buffered {
            at: Instant::now(),
            envelope,
            frame,
        });
        while self.entries.len() > self.capacity {
            let _ = self.entries.pop_front();
        }
    }

    /// Envelopes after `last_event_id` addressed to any of `topics`.
    pub fn since(&mut self, last_event_id: &EventId, topics: &HashSet<TopicKey>) -> Replay {
        self.prune();
        let Some(pos) = self
            .entries
            .iter()
            .position(|b| &b.envelope.event_id == last_event_id)
        else {
            return Replay::Unavailable;
        };
        Replay::Available(
            self.entries
                .iter()
                .skip(pos + 1)
                .filter(|b| b.envelope.topics.iter().any(|t| topics.contains(t)))
                .map(|b| Arc::clone(&b.frame))
                .collect(),
        )
    }

    /// Number of buffered envelopes.
    pub fn len(&mut self) -> usize {
        self.prune();
        self.entries.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    fn prune(&mut self) {
        while self
            .entries
            .front()
            .is_some_and(|b| b.at.elapsed() > self.max_age)
        {
            let _ = self.entries.pop_front();
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Broker
// ─────────────────────────────────────────────────────────────────────────────

/// Broker sizing.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Change ids remembered for dedup.
    pub dedup_capacity: usize,
    /// Envelopes kept for replay.
    pub replay_capacity: usize,
    /// Replay window.
    pub replay_max_age: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            dedup_capacity: 10_000,
            replay_capacity: 1_000,
            replay_max_age: Duration::from_secs(300),
        }
    }
}

/// What happened to one ingested fact.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    /// The envelope that was built.
    pub event_id: EventId,
    /// Sessions it was queued for.
    pub delivered: usize,
    /// Sessions evicted because their queue was full.
    pub evicted: usize,
}

struct BrokerState {
    dedup: DedupWindow,
    replay: ReplayBuffer,
}

/// Turns facts into envelopes and fans them out.
pub struct EventBroker {
    registry: Arc<SubscriptionRegistry>,
    state: Mutex<BrokerState>,
    last_change_id: AtomicI64,
}

impl EventBroker {
    /// Create a broker routing through `registry`.
    pub fn new(registry: Arc<SubscriptionRegistry>, config: &BrokerConfig) -> Self {
        Self {
            registry,
            state: Mutex::new(BrokerState {
                dedup: DedupWindow::new(config.dedup_capacity),
                replay: ReplayBuffer::new(config.replay_capacity, config.replay_max_age),
            }),
            last_change_id: AtomicI64::new(0),
        }
    }

    /// Highest change id ingested so far.
    pub fn last_change_id(&self) -> i64 {
        self.last_change_id.load(Ordering::Acquire)
    }

    /// Start outbox catch-up after `change_id` instead of from the beginning.
    pub fn resume_from(&self, change_id: i64) {
        let _ = self.last_change_id.fetch_max(change_id, Ordering::AcqRel);
    }

    /// Ingest one fact. Returns `None` when the change id was already seen.
    #[instrument(skip_all, fields(change_id = fact.change_id, kind = %fact.kind))]
    pub fn ingest(&self, fact: &EnrollmentFact) -> Option<Delivery> {
        let mut state = self.state.lock();
        if !state.dedup.insert(fact.change_id) {
            debug!("duplicate fact skipped");
            counter!(FACTS_DUPLICATE_TOTAL).increment(1);
            return None;
        }
        let _ = self.last_change_id.fetch_max(fact.change_id, Ordering::AcqRel);
        counter!(FACTS_INGESTED_TOTAL, "type" => fact.kind.as_str()).increment(1);

        let envelope = Envelope::from_fact(fact);
        let frame = match serde_json::to_string(&envelope) {
            Ok(json) => Arc::new(json),
            Err(e) => {
                warn!(error = %e, "failed to serialize envelope");
                return None;
            }
        };

        // One push per session, however many of the topics it holds.
        let mut recipients: HashMap<SessionId, Arc<Session>> = HashMap::new();
        for topic in &envelope.topics {
            for session in self.registry.subscribers_of(topic) {
                let _ = recipients.entry(session.id.clone()).or_insert(session);
            }
        }

        let mut delivered = 0;
        let mut evicted = 0;
        for session in recipients.values() {
            match session.push(Arc::clone(&frame)) {
                PushOutcome::Delivered => delivered += 1,
                PushOutcome::QueueFull => {
                    warn!(session_id = %session.id, "outbound queue full, evicting session");
                    counter!(SESSIONS_EVICTED_TOTAL, "reason" => "queue_full").increment(1);
                    let _ = self.registry.remove_session(&session.id);
                    session.close();
                    evicted += 1;
                }
                PushOutcome::Closed => {
                    counter!(ENVELOPES_DROPPED_TOTAL).increment(1);
                }
            }
        }
        counter!(ENVELOPES_PUSHED_TOTAL).increment(delivered as u64);

        let event_id = envelope.event_id.clone();
        debug!(%event_id, delivered, evicted, "envelope fanned out");
        state.replay.push(envelope, frame);

        Some(Delivery {
            event_id,
            delivered,
            evicted,
        })
    }

    /// Queue buffered envelopes after `last_event_id` for `session`,
    /// followed by `REPLAY_COMPLETE`, or send `REPLAY_UNAVAILABLE`.
    #[instrument(skip_all, fields(session_id = %session.id, %last_event_id))]
    pub fn replay_to(&self, session: &Session, last_event_id: &EventId) -> Replay {
        let mut state = self.state.lock();
        let replay = state.replay.since(last_event_id, &session.topics());
        match &replay {
            Replay::Available(frames) => {
                for frame in frames {
                    let _ = session.push(Arc::clone(frame));
                }
                let _ = session.send_frame(ControlFrame::ReplayComplete {
                    replayed: frames.len(),
                });
                counter!(REPLAY_REQUESTS_TOTAL, "outcome" => "available").increment(1);
            }
            Replay::Unavailable => {
                let _ = session.send_frame(ControlFrame::ReplayUnavailable);
                counter!(REPLAY_REQUESTS_TOTAL, "outcome" => "unavailable").increment(1);
            }
        }
        replay
    }

    /// Number of envelopes currently replayable.
    pub fn replay_len(&self) -> usize {
        self.state.lock().replay.len()
    }

    /// Pull outbox rows newer than the last ingested change.
    pub fn catch_up(&self, repo: &EnrollmentRepo) -> usize {
        let mut ingested = 0;
        loop {
            let facts = match repo.changes_since(self.last_change_id(), CATCH_UP_PAGE) {
                Ok(facts) => facts,
                Err(e) => {
                    warn!(error = %e, "outbox catch-up failed");
                    return ingested;
                }
            };
            let page = facts.len();
            for fact in &facts {
                if self.ingest(fact).is_some() {
                    ingested += 1;
                }
            }
            if page < CATCH_UP_PAGE {
                return ingested;
            }
        }
    }
}

/// Drive the broker from the store's change feed until cancelled.
///
/// When the feed lags, missed facts are recovered from the outbox.
pub async fn run_feed(
    broker: Arc<EventBroker>,
    mut feed: broadcast::Receiver<EnrollmentFact>,
    repo: Arc<EnrollmentRepo>,
    cancel: CancellationToken,
) {
    info!("event broker started");
    loop {
        tokio::select! {
            received = feed.recv() => match received {
                Ok(fact) => {
                    let _ = broker.ingest(&fact);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "change feed lagged, catching up from outbox");
                    counter!(FEED_LAGGED_TOTAL).increment(1);
                    let recovered = broker.catch_up(&repo);
                    info!(recovered, "outbox catch-up finished");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("change feed closed");
                    break;
                }
            },
            () = cancel.cancelled() => break,
        }
    }
    info!("event broker stopped");
}
