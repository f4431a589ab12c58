//! Subscription registry: topic key → live sessions.
//!
//! Authorization happens here, before anything is inserted. Both indexes are
//! sharded `DashMap`s so fan-out lookups for one topic never contend with
//! subscribes on another.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use rollcall_core::enrollment::Role;
use rollcall_core::errors::AuthorizationError;
use rollcall_core::ids::SessionId;
use rollcall_core::topic::TopicKey;
use rollcall_core::traits::ClassRoster;

use super::connection::Session;

/// Live topic subscriptions for every authenticated session.
pub struct SubscriptionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
    topics: DashMap<TopicKey, HashSet<SessionId>>,
    roster: Arc<dyn ClassRoster>,
}

impl SubscriptionRegistry {
    /// Create an empty registry that checks class ownership with `roster`.
    pub fn new(roster: Arc<dyn ClassRoster>) -> Self {
        Self {
            sessions: DashMap::new(),
            topics: DashMap::new(),
            roster,
        }
    }

    /// Track a freshly authenticated session.
    pub fn register(&self, session: Arc<Session>) {
        debug!(session_id = %session.id, user_id = %session.user_id, "session registered");
        let _ = self.sessions.insert(session.id.clone(), session);
    }

    /// Look up a session.
    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|s| Arc::clone(s.value()))
    }

    /// Check whether `session` may read `topic`.
    pub async fn authorize(
        &self,
        session: &Session,
        topic: &TopicKey,
    ) -> Result<(), AuthorizationError> {
        match topic {
            TopicKey::Class(class) => {
                if session.role != Role::Teacher {
                    return Err(AuthorizationError::WrongRole {
                        actual: session.role,
                        required: Role::Teacher,
                    });
                }
                if self.roster.is_owner(&session.user_id, class).await {
                    Ok(())
                } else {
                    Err(AuthorizationError::NotClassOwner {
                        user: session.user_id.clone(),
                        class: class.clone(),
                    })
                }
            }
            TopicKey::User(user) if *user == session.user_id => Ok(()),
            TopicKey::User(_) => Err(AuthorizationError::ForeignUserTopic {
                user: session.user_id.clone(),
                topic: topic.clone(),
            }),
        }
    }

    /// Authorize and add `topic` to `session`. Idempotent.
    ///
    /// Returns `true` when the subscription is new.
    pub async fn subscribe(
        &self,
        session: &Arc<Session>,
        topic: TopicKey,
    ) -> Result<bool, AuthorizationError> {
        self.authorize(session, &topic).await?;

        let added = session.add_topic(topic.clone());
        let _ = self
            .topics
            .entry(topic.clone())
            .or_default()
            .insert(session.id.clone());

        // Lost a race with remove_session: undo so no orphan entry remains.
        if !self.sessions.contains_key(&session.id) {
            self.detach(&session.id, &topic);
            let _ = session.remove_topic(&topic);
            return Ok(false);
        }

        if added {
            debug!(session_id = %session.id, %topic, "subscribed");
        }
        Ok(added)
    }

    /// Remove `topic` from `session`. Returns whether it was held.
    pub fn unsubscribe(&self, session: &Session, topic: &TopicKey) -> bool {
        let held = session.remove_topic(topic);
        if held {
            self.detach(&session.id, topic);
            debug!(session_id = %session.id, %topic, "unsubscribed");
        }
        held
    }

    /// Drop a session and all its subscriptions.
    ///
    /// Cost is proportional to the session's own topic count.
    pub fn remove_session(&self, id: &SessionId) -> Option<Arc<Session>> {
        let (_, session) = self.sessions.remove(id)?;
        let topics = session.drain_topics();
        for topic in &topics {
            self.detach(id, topic);
        }
        info!(session_id = %id, topics = topics.len(), "session removed");
        Some(session)
    }

    /// Current subscribers of `topic`. Each session appears once.
    pub fn subscribers_of(&self, topic: &TopicKey) -> Vec<Arc<Session>> {
        let ids: Vec<SessionId> = match self.topics.get(topic) {
            Some(set) => set.iter().cloned().collect(),
            None => return Vec::new(),
        };
        ids.iter().filter_map(|id| self.get(id)).collect()
    }

    /// Snapshot of every registered session.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Number of registered sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of topics with at least one subscriber.
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    fn detach(&self, id: &SessionId, topic: &TopicKey) {
        if let Some(mut set) = self.topics.get_mut(topic) {
            let _ = set.remove(id);
        }
        let _ = self.topics.remove_if(topic, |_, set| set.is_empty());
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use rollcall_core::ids::{ClassId, UserId};
    use tokio::sync::mpsc;

    /// Roster backed by a fixed list of `(teacher, class)` pairs.
    pub(crate) struct StaticRoster(pub Vec<(&'static str, &'static str)>);

    #[async_trait]
    impl ClassRoster for StaticRoster {
        async fn is_owner(&self, teacher: &UserId, class: &ClassId) -> bool {
            self.0
                .iter()
                .any(|(t, c)| teacher.as_str() == *t && class.as_str() == *c)
        }
    }

    pub(crate) fn session(user: &str, role: Role) -> Arc<Session> {
        let (tx, _rx) = mpsc::channel(16);
        Arc::new(Session::new(UserId::from(user), role, tx))
    }

    fn registry() -> SubscriptionRegistry {
        SubscriptionRegistry::new(Arc::new(StaticRoster(vec![("T", "C"), ("T", "D")])))
    }

    #[tokio::test]
    async fn owner_subscribes_to_class() {
        let reg = registry();
        let t = session("T", Role::Teacher);
        reg.register(t.clone());

        assert!(reg.subscribe(&t, TopicKey::class("C")).await.unwrap());
        assert!(reg.subscribe(&t, TopicKey::class("D")).await.unwrap());
        assert_eq!(reg.subscribers_of(&TopicKey::class("C")).len(), 1);
        assert_eq!(reg.topic_count(), 2);
    }

    #[tokio::test]
    async fn subscribe_is_idempotent() {
        let reg = registry();
        let t = session("T", Role::Teacher);
        reg.register(t.clone());

        assert!(reg.subscribe(&t, TopicKey::class("C")).await.unwrap());
        assert!(!reg.subscribe(&t, TopicKey::class("C")).await.unwrap());
        assert_eq!(reg.subscribers_of(&TopicKey::class("C")).len(), 1);
    }

    #[tokio::test]
    async fn non_owner_is_rejected_and_nothing_is_added() {
        let reg = registry();
        let t2 = session("T2", Role::Teacher);
        reg.register(t2.clone());

        let err = reg.subscribe(&t2, TopicKey::class("C")).await.unwrap_err();
        assert_matches!(err, AuthorizationError::NotClassOwner { .. });
        assert!(reg.subscribers_of(&TopicKey::class("C")).is_empty());
        assert!(!t2.holds(&TopicKey::class("C")));
        assert_eq!(reg.topic_count(), 0);
    }

    #[tokio::test]
    async fn students_cannot_follow_classes_or_other_users() {
        let reg = registry();
        let s = session("S", Role::Student);
        reg.register(s.clone());

        assert_matches!(
            reg.subscribe(&s, TopicKey::class("C")).await,
            Err(AuthorizationError::WrongRole { required: Role::Teacher, .. })
        );
        assert_matches!(
            reg.subscribe(&s, TopicKey::user("S2")).await,
            Err(AuthorizationError::ForeignUserTopic { .. })
        );
        assert!(reg.subscribe(&s, TopicKey::user("S")).await.unwrap());
    }

    #[tokio::test]
    async fn remove_session_clears_every_topic() {
        let reg = registry();
        let t = session("T", Role::Teacher);
        let other = session("T", Role::Teacher);
        reg.register(t.clone());
        reg.register(other.clone());
        let _ = reg.subscribe(&t, TopicKey::class("C")).await.unwrap();
        let _ = reg.subscribe(&t, TopicKey::class("D")).await.unwrap();
        let _ = reg.subscribe(&other, TopicKey::class("C")).await.unwrap();

        assert!(reg.remove_session(&t.id).is_some());
        assert_eq!(reg.session_count(), 1);
        assert_eq!(reg.topic_count(), 1);
        let subs = reg.subscribers_of(&TopicKey::class("C"));
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].id, other.id);
        assert!(reg.remove_session(&t.id).is_none());
    }

    #[tokio::test]
    async fn unsubscribe_removes_one_topic() {
        let reg = registry();
        let t = session("T", Role::Teacher);
        reg.register(t.clone());
        let _ = reg.subscribe(&t, TopicKey::class("C")).await.unwrap();

        assert!(reg.unsubscribe(&t, &TopicKey::class("C")));
        assert!(!reg.unsubscribe(&t, &TopicKey::class("C")));
        assert!(reg.subscribers_of(&TopicKey::class("C")).is_empty());
    }

    #[tokio::test]
    async fn subscribe_after_removal_leaves_no_orphans() {
        let reg = registry();
        let t = session("T", Role::Teacher);
        reg.register(t.clone());
        let _ = reg.remove_session(&t.id);

        assert!(!reg.subscribe(&t, TopicKey::class("C")).await.unwrap());
        assert_eq!(reg.topic_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_subscribers_are_never_duplicated() {
        let reg = Arc::new(registry());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let reg = Arc::clone(&reg);
            handles.push(tokio::spawn(async move {
                let t = session("T", Role::Teacher);
                reg.register(t.clone());
                for _ in 0..10 {
                    let _ = reg.subscribe(&t, TopicKey::class("C")).await.unwrap();
                    let subs = reg.subscribers_of(&TopicKey::class("C"));
                    let unique: HashSet<_> = subs.iter().map(|s| s.id.clone()).collect();
                    assert_eq!(unique.len(), subs.len());
                    let _ = reg.unsubscribe(&t, &TopicKey::class("C"));
                }
                let _ = reg.subscribe(&t, TopicKey::class("C")).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(reg.subscribers_of(&TopicKey::class("C")).len(), 16);
    }
}
