//! Client-side cache of enrollments.
//!
//! The [`Reconciler`] merges two inputs that may arrive in either order and
//! may overlap: REST snapshots and pushed envelopes. It does no I/O and never
//! suspends; [`SharedReconciler`] gives the connection tasks single-writer
//! access to it.
//!
//! Merge rules:
//! - A snapshot replaces the cache wholesale unless it is older than the one
//!   already applied.
//! - An envelope emitted before the current snapshot's `asOf` is stale and
//!   dropped.
//! - `NEW_ENROLLMENT` inserts only if the enrollment is unknown.
//! - A decision overwrites a pending record, inserts a terminal-only record
//!   if the request was never seen, and is a no-op on a terminal record.
//! - An envelope already applied is a no-op.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use rollcall_core::enrollment::{Enrollment, EnrollmentStatus};
use rollcall_core::envelope::{Envelope, EventType};
use rollcall_core::errors::StaleEventError;
use rollcall_core::ids::{ClassId, EnrollmentId, EventId};
use rollcall_core::traits::Snapshot;

/// How many applied event IDs are remembered for duplicate detection.
pub const DEFAULT_APPLIED_CAPACITY: usize = 4096;

/// Result of [`Reconciler::apply_event`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// A record was added.
    Inserted,
    /// A pending record became terminal.
    Updated,
    /// Nothing changed; the event was already reflected.
    Duplicate,
    /// Emitted before the current snapshot; dropped.
    Stale,
    /// The envelope carried no enrollment.
    Ignored,
}

impl ApplyOutcome {
    /// Whether the cache changed.
    #[must_use]
    pub fn changed(self) -> bool {
        matches!(self, Self::Inserted | Self::Updated)
    }
}

/// A one-time notification for the UI.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notice {
    /// Envelope that produced it.
    pub event_id: EventId,
    /// Event kind.
    pub event_type: EventType,
    /// Enrollment concerned.
    pub enrollment_id: EnrollmentId,
    /// Its class.
    pub class_id: ClassId,
    /// Display text.
    pub message: String,
}

/// Pure enrollment cache.
#[derive(Debug)]
pub struct Reconciler {
    by_id: HashMap<EnrollmentId, Enrollment>,
    last_synced_at: Option<DateTime<Utc>>,
    applied: HashSet<EventId>,
    applied_order: VecDeque<EventId>,
    applied_capacity: usize,
    last_event_id: Option<EventId>,
    notices: Vec<Notice>,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reconciler {
    /// Empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_APPLIED_CAPACITY)
    }

    /// Empty cache remembering up to `applied_capacity` event IDs.
    #[must_use]
    pub fn with_capacity(applied_capacity: usize) -> Self {
        Self {
            by_id: HashMap::new(),
            last_synced_at: None,
            applied: HashSet::new(),
            applied_order: VecDeque::new(),
            applied_capacity: applied_capacity.max(1),
            last_event_id: None,
            notices: Vec::new(),
        }
    }

    /// Replace the cache with `snapshot`.
    ///
    /// Returns `false` and changes nothing if the snapshot is older than the
    /// one already applied.
    pub fn apply_snapshot(&mut self, snapshot: &Snapshot) -> bool {
        if self.last_synced_at.is_some_and(|synced| snapshot.as_of < synced) {
            debug!(as_of = %snapshot.as_of, "ignoring out-of-order snapshot");
            return false;
        }
        self.by_id = snapshot
            .enrollments
            .iter()
            .map(|e| (e.enrollment_id.clone(), e.clone()))
            .collect();
        self.last_synced_at = Some(snapshot.as_of);
        true
    }

    /// Layer one pushed envelope on top of the cache.
    pub fn apply_event(&mut self, envelope: &Envelope) -> ApplyOutcome {
        if self.applied.contains(&envelope.event_id) {
            return ApplyOutcome::Duplicate;
        }
        if let Some(synced) = self.last_synced_at.filter(|synced| envelope.emitted_at < *synced) {
            let stale = StaleEventError {
                event_id: envelope.event_id.clone(),
                emitted_at: envelope.emitted_at,
                last_synced_at: synced,
            };
            debug!(error = %stale, "dropping stale event");
            return ApplyOutcome::Stale;
        }
        let Some(incoming) = envelope.enrollment.as_ref() else {
            return ApplyOutcome::Ignored;
        };

        let outcome = match self.by_id.entry(incoming.enrollment_id.clone()) {
            Entry::Vacant(slot) => {
                let _ = slot.insert(incoming.clone());
                ApplyOutcome::Inserted
            }
            Entry::Occupied(mut slot) => {
                let existing = slot.get_mut();
                if envelope.event_type == EventType::NewEnrollment || existing.is_terminal() {
                    ApplyOutcome::Duplicate
                } else {
                    existing.status = incoming.status;
                    existing.decided_at = incoming.decided_at;
                    existing.decided_by.clone_from(&incoming.decided_by);
                    ApplyOutcome::Updated
                }
            }
        };

        if outcome.changed() {
            self.notices.push(Notice {
                event_id: envelope.event_id.clone(),
                event_type: envelope.event_type,
                enrollment_id: incoming.enrollment_id.clone(),
                class_id: envelope.class_id.clone(),
                message: envelope.message.clone(),
            });
        }
        self.remember(&envelope.event_id);
        outcome
    }

    fn remember(&mut self, event_id: &EventId) {
        if self.applied.insert(event_id.clone()) {
            self.applied_order.push_back(event_id.clone());
            while self.applied_order.len() > self.applied_capacity {
                if let Some(old) = self.applied_order.pop_front() {
                    let _ = self.applied.remove(&old);
                }
            }
        }
        self.last_event_id = Some(event_id.clone());
    }

    // ── Views ───────────────────────────────────────────────────────────────

    /// Pending enrollments, oldest request first.
    #[must_use]
    pub fn pending(&self) -> Vec<Enrollment> {
        let mut out: Vec<Enrollment> = self
            .by_id
            .values()
            .filter(|e| e.status == EnrollmentStatus::Pending)
            .cloned()
            .collect();
        sort_by_request(&mut out);
        out
    }

    /// One enrollment.
    #[must_use]
    pub fn get(&self, id: &EnrollmentId) -> Option<&Enrollment> {
        self.by_id.get(id)
    }

    /// Every cached enrollment of a class, oldest request first.
    #[must_use]
    pub fn for_class(&self, class: &ClassId) -> Vec<Enrollment> {
        let mut out: Vec<Enrollment> = self
            .by_id
            .values()
            .filter(|e| &e.class_id == class)
            .cloned()
            .collect();
        sort_by_request(&mut out);
        out
    }

    /// Status of the most recent request in a class.
    #[must_use]
    pub fn latest_status(&self, class: &ClassId) -> Option<EnrollmentStatus> {
        self.by_id
            .values()
            .filter(|e| &e.class_id == class)
            .max_by(|a, b| {
                a.requested_at
                    .cmp(&b.requested_at)
                    .then_with(|| a.enrollment_id.as_str().cmp(b.enrollment_id.as_str()))
            })
            .map(|e| e.status)
    }

    /// Everything in the cache, oldest request first.
    #[must_use]
    pub fn all(&self) -> Vec<Enrollment> {
        let mut out: Vec<Enrollment> = self.by_id.values().cloned().collect();
        sort_by_request(&mut out);
        out
    }

    /// Drain notices produced since the last call.
    pub fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    /// Server clock of the current baseline.
    #[must_use]
    pub fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        self.last_synced_at
    }

    /// Most recent envelope applied, for replay requests.
    #[must_use]
    pub fn last_event_id(&self) -> Option<&EventId> {
        self.last_event_id.as_ref()
    }

    /// Number of cached enrollments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

fn sort_by_request(list: &mut [Enrollment]) {
    list.sort_by(|a, b| {
        a.requested_at
            .cmp(&b.requested_at)
            .then_with(|| a.enrollment_id.as_str().cmp(b.enrollment_id.as_str()))
    });
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared handle
// ─────────────────────────────────────────────────────────────────────────────

/// Cloneable, mutex-guarded [`Reconciler`].
///
/// Every method holds the lock only for the duration of one merge or read.
#[derive(Clone, Debug, Default)]
pub struct SharedReconciler {
    inner: Arc<Mutex<Reconciler>>,
}

impl SharedReconciler {
    /// Wrap an empty reconciler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// See [`Reconciler::apply_snapshot`].
    pub fn apply_snapshot(&self, snapshot: &Snapshot) -> bool {
        self.inner.lock().apply_snapshot(snapshot)
    }

    /// See [`Reconciler::apply_event`].
    pub fn apply_event(&self, envelope: &Envelope) -> ApplyOutcome {
        self.inner.lock().apply_event(envelope)
    }

    /// Run `f` against the current state.
    pub fn read<R>(&self, f: impl FnOnce(&Reconciler) -> R) -> R {
        f(&self.inner.lock())
    }

    /// See [`Reconciler::pending`].
    #[must_use]
    pub fn pending(&self) -> Vec<Enrollment> {
        self.inner.lock().pending()
    }

    /// See [`Reconciler::get`].
    #[must_use]
    pub fn get(&self, id: &EnrollmentId) -> Option<Enrollment> {
        self.inner.lock().get(id).cloned()
    }

    /// See [`Reconciler::latest_status`].
    #[must_use]
    pub fn latest_status(&self, class: &ClassId) -> Option<EnrollmentStatus> {
        self.inner.lock().latest_status(class)
    }

    /// See [`Reconciler::take_notices`].
    pub fn take_notices(&self) -> Vec<Notice> {
        self.inner.lock().take_notices()
    }

    /// See [`Reconciler::last_event_id`].
    #[must_use]
    pub fn last_event_id(&self) -> Option<EventId> {
        self.inner.lock().last_event_id().cloned()
    }
}
