//! Client against a real server.

#![allow(missing_docs)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::accept_async;

use rollcall_client::{
    ClientConfig, ClientError, ConnectionManager, ConnectionStatus, CredentialProvider,
    HttpSnapshotSource, SnapshotSource, StaticCredentials,
};
use rollcall_core::enrollment::{EnrollmentStatus, Role};
use rollcall_core::envelope::{Envelope, EventType};
use rollcall_core::ids::{ClassId, EnrollmentId, SessionId, UserId};
use rollcall_core::protocol::{ClientFrame, ControlFrame, ServerFrame};
use rollcall_core::retry::ReconnectPolicy;
use rollcall_core::topic::TopicKey;
use rollcall_core::traits::Snapshot;
use rollcall_server::metrics::detached_handle;
use rollcall_server::{JwtAuthority, RollcallServer, ServerConfig, ServerHandle};
use rollcall_store::{Database, EnrollmentRepo, RosterRepo};

const SECRET: &str = "client-integration-secret-42";

/// Mints tokens the way the external auth service would.
struct JwtCredentials(JwtAuthority);

#[async_trait]
impl CredentialProvider for JwtCredentials {
    async fn token(&self, user: &UserId, role: Role) -> Result<String, ClientError> {
        Ok(self.0.issue(user, role, Duration::from_secs(60)).unwrap())
    }
}

/// Always mints a token for someone else.
struct ImpostorCredentials(JwtAuthority);

#[async_trait]
impl CredentialProvider for ImpostorCredentials {
    async fn token(&self, _user: &UserId, _role: Role) -> Result<String, ClientError> {
        Ok(self
            .0
            .issue(&UserId::from("mallory"), Role::Student, Duration::from_secs(60))
            .unwrap())
    }
}

struct Harness {
    server: RollcallServer,
    handle: ServerHandle,
    auth: JwtAuthority,
    http: reqwest::Client,
}

impl Harness {
    async fn start() -> Self {
        Self::start_with(ServerConfig::default()).await
    }

    /// T owns classes C and D.
    async fn start_with(config: ServerConfig) -> Self {
        let db = Database::in_memory().unwrap();
        let roster = RosterRepo::new(db.clone());
        roster.add_owner(&ClassId::from("C"), &UserId::from("T")).unwrap();
        roster.add_owner(&ClassId::from("D"), &UserId::from("T")).unwrap();
        let auth = JwtAuthority::new(SECRET);
        let server = RollcallServer::new(
            config,
            Arc::new(EnrollmentRepo::new(db)),
            Arc::new(roster),
            Arc::new(auth.clone()),
            detached_handle(),
        );
        let handle = server.listen().await.unwrap();
        Self {
            server,
            handle,
            auth,
            http: reqwest::Client::new(),
        }
    }

    fn config(&self, topic: TopicKey) -> ClientConfig {
        let mut config = ClientConfig::new(
            format!("ws://{}/ws", self.handle.addr()),
            format!("http://{}", self.handle.addr()),
        )
        .with_topic(topic);
        config.heartbeat_interval = Duration::from_millis(200);
        config.heartbeat_timeout = Duration::from_secs(2);
        config.reconnect = ReconnectPolicy {
            base_delay_ms: 20,
            max_delay_ms: 100,
            jitter_factor: 0.0,
        };
        config
    }

    fn credentials(&self) -> Arc<dyn CredentialProvider> {
        Arc::new(JwtCredentials(self.auth.clone()))
    }

    fn manager(&self, config: ClientConfig, user: &str, role: Role) -> ConnectionManager {
        let snapshots =
            HttpSnapshotSource::new(&config.api_url, UserId::from(user), role, self.credentials());
        ConnectionManager::new(config, self.credentials(), Arc::new(snapshots))
    }

    fn student(&self, user: &str) -> ConnectionManager {
        self.manager(self.config(TopicKey::user(user)), user, Role::Student)
    }

    fn teacher_config(&self, classes: &[&str]) -> ClientConfig {
        let (first, rest) = classes.split_first().unwrap();
        rest.iter().fold(self.config(TopicKey::class(*first)), |config, class| {
            config.with_topic(TopicKey::class(*class))
        })
    }

    fn teacher(&self, user: &str, classes: &[&str]) -> ConnectionManager {
        self.manager(self.teacher_config(classes), user, Role::Teacher)
    }

    fn token(&self, user: &str, role: Role) -> String {
        self.auth
            .issue(&UserId::from(user), role, Duration::from_secs(60))
            .unwrap()
    }

    async fn enroll(&self, student: &str, class: &str) -> EnrollmentId {
        let body: Value = self
            .http
            .post(format!("http://{}/api/enrollments", self.handle.addr()))
            .bearer_auth(self.token(student, Role::Student))
            .json(&json!({"classId": class}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        EnrollmentId::from(body["enrollmentId"].as_str().unwrap())
    }

    async fn decide(&self, id: &EnrollmentId, decision: &str) {
        let resp = self
            .http
            .post(format!(
                "http://{}/api/enrollments/{id}/decision",
                self.handle.addr()
            ))
            .bearer_auth(self.token("T", Role::Teacher))
            .json(&json!({"decision": decision}))
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_success(), "{}", resp.status());
    }

    async fn wait_subscribed(&self, topic: &TopicKey) {
        let registry = Arc::clone(self.server.registry());
        assert!(eventually(|| !registry.subscribers_of(topic).is_empty()).await);
    }

    /// Evict the session holding `topic`, as the heartbeat sweep would.
    fn drop_session(&self, topic: &TopicKey) -> SessionId {
        let registry = self.server.registry();
        let id = registry.subscribers_of(topic)[0].id.clone();
        if let Some(session) = registry.remove_session(&id) {
            session.close();
        }
        id
    }

    /// Wait for a session other than `previous` to hold `topic`, then for
    /// the client to report connected again.
    async fn wait_redialed(&self, manager: &ConnectionManager, topic: &TopicKey, previous: &SessionId) {
        let registry = Arc::clone(self.server.registry());
        assert!(
            eventually(|| registry
                .subscribers_of(topic)
                .iter()
                .any(|s| &s.id != previous))
            .await
        );
        let mut status = manager.watch_status();
        let _ = tokio::time::timeout(
            Duration::from_secs(2),
            status.wait_for(|s| *s == ConnectionStatus::Connected),
        )
        .await
        .unwrap()
        .unwrap();
    }
}

/// Redials late enough for a test to commit changes while disconnected.
fn slow_reconnect() -> ReconnectPolicy {
    ReconnectPolicy {
        base_delay_ms: 300,
        max_delay_ms: 300,
        jitter_factor: 0.0,
    }
}

async fn next_event(events: &mut broadcast::Receiver<Envelope>) -> Envelope {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap()
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..150 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn missed_rejection_is_recovered_by_resync() {
    let h = Harness::start().await;
    let student = h.student("S");
    student.connect(UserId::from("S"), Role::Student).await.unwrap();
    assert_eq!(student.status(), ConnectionStatus::Connected);

    let id = h.enroll("S", "C").await;
    student.disconnect().await;
    assert_eq!(student.status(), ConnectionStatus::Disconnected);

    h.decide(&id, "REJECTED").await;

    student.connect(UserId::from("S"), Role::Student).await.unwrap();
    let class = ClassId::from("C");
    assert_eq!(
        student.reconciler().latest_status(&class),
        Some(EnrollmentStatus::Rejected)
    );
    let records = student.reconciler().read(|r| r.for_class(&class));
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].enrollment_id, id);
    assert!(student.reconciler().pending().is_empty());

    student.disconnect().await;
}

#[tokio::test]
async fn decision_is_pushed_to_connected_student() {
    let h = Harness::start().await;
    let student = h.student("S");
    let mut events = student.events();
    student.connect(UserId::from("S"), Role::Student).await.unwrap();
    h.wait_subscribed(&TopicKey::user("S")).await;

    let id = h.enroll("S", "C").await;
    h.decide(&id, "APPROVED").await;

    let env = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(env.event_type, EventType::EnrollmentAccepted);
    assert_eq!(
        student.reconciler().get(&id).map(|e| e.status),
        Some(EnrollmentStatus::Approved)
    );
    let notices = student.reconciler().take_notices();
    assert_eq!(notices.len(), 1);
    assert!(notices[0].message.ends_with("was accepted"));

    student.disconnect().await;
}

#[tokio::test]
async fn teacher_view_tracks_requests_and_decisions() {
    let h = Harness::start().await;
    let existing = h.enroll("S0", "C").await;

    let teacher = h.teacher("T", &["C"]);
    let mut events = teacher.events();
    teacher.connect(UserId::from("T"), Role::Teacher).await.unwrap();
    // The initial resync already holds the earlier request.
    assert_eq!(teacher.reconciler().pending().len(), 1);
    h.wait_subscribed(&TopicKey::class("C")).await;

    let fresh = h.enroll("S1", "C").await;
    let env = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(env.event_type, EventType::NewEnrollment);
    assert_eq!(teacher.reconciler().pending().len(), 2);

    h.decide(&existing, "APPROVED").await;
    let _ = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    let pending = teacher.reconciler().pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].enrollment_id, fresh);

    teacher.disconnect().await;
}

#[tokio::test]
async fn auth_rejection_fails_connect() {
    let h = Harness::start().await;
    let config = h.config(TopicKey::user("S"));
    let snapshots =
        HttpSnapshotSource::new(&config.api_url, UserId::from("S"), Role::Student, h.credentials());
    let manager = ConnectionManager::new(
        config,
        Arc::new(ImpostorCredentials(h.auth.clone())),
        Arc::new(snapshots),
    );

    let err = manager
        .connect(UserId::from("S"), Role::Student)
        .await
        .unwrap_err();
    assert_matches!(err, ClientError::Auth(_));
    assert!(!err.is_retryable());
    assert_eq!(manager.status(), ConnectionStatus::Disconnected);
    assert!(manager.last_error().is_some());
}

#[tokio::test]
async fn reconnects_after_server_drops_session() {
    let h = Harness::start().await;
    let student = h.student("S");
    let mut events = student.events();
    student.connect(UserId::from("S"), Role::Student).await.unwrap();
    let topic = TopicKey::user("S");
    h.wait_subscribed(&topic).await;

    let first = h.drop_session(&topic);

    // A new session with a fresh ID shows up once the client redials.
    h.wait_redialed(&student, &topic, &first).await;

    let id = h.enroll("S", "C").await;
    h.decide(&id, "REJECTED").await;
    let env = next_event(&mut events).await;
    assert_eq!(env.event_type, EventType::EnrollmentRejected);

    student.disconnect().await;
}

#[tokio::test]
async fn sustained_outage_reports_offline() {
    let h = Harness::start().await;
    let mut config = h.config(TopicKey::user("S"));
    config.offline_after = 2;
    let snapshots =
        HttpSnapshotSource::new(&config.api_url, UserId::from("S"), Role::Student, h.credentials());
    let student = ConnectionManager::new(config, h.credentials(), Arc::new(snapshots));
    student.connect(UserId::from("S"), Role::Student).await.unwrap();

    let mut status = student.watch_status();
    h.handle.shutdown().await;

    let _ = tokio::time::timeout(
        Duration::from_secs(5),
        status.wait_for(|s| *s == ConnectionStatus::Offline),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(student.last_error().is_some());

    student.disconnect().await;
    assert_eq!(student.status(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn teacher_with_two_classes_keeps_both_across_reconnect() {
    let h = Harness::start().await;
    let _ = h.enroll("S0", "C").await;

    let mut config = h.teacher_config(&["C", "D"]);
    config.reconnect = slow_reconnect();
    let teacher = h.manager(config, "T", Role::Teacher);
    let mut events = teacher.events();
    teacher.connect(UserId::from("T"), Role::Teacher).await.unwrap();
    let class_d = TopicKey::class("D");
    h.wait_subscribed(&class_d).await;

    let live = h.enroll("S1", "D").await;
    let pushed = next_event(&mut events).await;
    assert_eq!(pushed.enrollment.map(|e| e.enrollment_id), Some(live.clone()));

    let first = h.drop_session(&class_d);
    let missed = h.enroll("S2", "D").await;
    h.wait_redialed(&teacher, &class_d, &first).await;

    let reconciler = teacher.reconciler();
    assert_eq!(reconciler.read(|r| r.for_class(&ClassId::from("C"))).len(), 1);
    let in_d: Vec<EnrollmentId> = reconciler
        .read(|r| r.for_class(&ClassId::from("D")))
        .into_iter()
        .map(|e| e.enrollment_id)
        .collect();
    assert_eq!(in_d.len(), 2);
    assert!(in_d.contains(&live));
    assert!(in_d.contains(&missed));
    assert_eq!(reconciler.pending().len(), 3);

    teacher.disconnect().await;
}

#[tokio::test]
async fn refused_topic_is_dropped_without_breaking_resync() {
    let h = Harness::start().await;
    let _ = h.enroll("S0", "C").await;

    // T does not own class X.
    let teacher = h.teacher("T", &["C", "X"]);
    teacher.connect(UserId::from("T"), Role::Teacher).await.unwrap();
    assert_eq!(teacher.topics(), vec![TopicKey::class("C")]);
    assert!(teacher.last_error().is_some());
    assert_eq!(teacher.reconciler().pending().len(), 1);

    // Adding a topic at runtime resyncs once the server acknowledges it.
    let earlier = h.enroll("S1", "D").await;
    teacher.subscribe(TopicKey::class("D"));
    let reconciler = teacher.reconciler().clone();
    assert!(eventually(|| reconciler.get(&earlier).is_some()).await);
    assert_eq!(teacher.status(), ConnectionStatus::Connected);

    teacher.disconnect().await;
}

#[tokio::test]
async fn replay_on_reconnect_delivers_missed_envelopes() {
    let h = Harness::start().await;
    let mut config = h.config(TopicKey::user("S"));
    config.replay_on_reconnect = true;
    config.reconnect = slow_reconnect();
    let student = h.manager(config, "S", Role::Student);
    let mut events = student.events();
    student.connect(UserId::from("S"), Role::Student).await.unwrap();
    let topic = TopicKey::user("S");
    h.wait_subscribed(&topic).await;

    let approved = h.enroll("S", "C").await;
    h.decide(&approved, "APPROVED").await;
    let seen = loop {
        let env = next_event(&mut events).await;
        if env.event_type == EventType::EnrollmentAccepted {
            break env;
        }
    };
    assert_eq!(student.reconciler().last_event_id(), Some(seen.event_id));

    let first = h.drop_session(&topic);
    let rejected = h.enroll("S", "D").await;
    h.decide(&rejected, "REJECTED").await;
    h.wait_redialed(&student, &topic, &first).await;

    // Resync never broadcasts, so an event here came from the replay.
    let env = loop {
        let env = next_event(&mut events).await;
        if env.event_type == EventType::EnrollmentRejected {
            break env;
        }
    };
    assert_eq!(env.enrollment.map(|e| e.enrollment_id), Some(rejected.clone()));
    assert_eq!(
        student.reconciler().get(&rejected).map(|e| e.status),
        Some(EnrollmentStatus::Rejected)
    );

    student.disconnect().await;
}

#[tokio::test]
async fn replay_unavailable_falls_back_to_resync() {
    let h = Harness::start_with(ServerConfig {
        replay_capacity: 1,
        ..ServerConfig::default()
    })
    .await;
    let mut config = h.config(TopicKey::user("S"));
    config.replay_on_reconnect = true;
    config.reconnect = slow_reconnect();
    let student = h.manager(config, "S", Role::Student);
    let mut events = student.events();
    student.connect(UserId::from("S"), Role::Student).await.unwrap();
    let topic = TopicKey::user("S");
    h.wait_subscribed(&topic).await;

    let approved = h.enroll("S", "C").await;
    h.decide(&approved, "APPROVED").await;
    while next_event(&mut events).await.event_type != EventType::EnrollmentAccepted {}

    // Two more envelopes push the last applied one out of the buffer.
    let first = h.drop_session(&topic);
    let rejected = h.enroll("S", "D").await;
    h.decide(&rejected, "REJECTED").await;
    h.wait_redialed(&student, &topic, &first).await;

    let reconciler = student.reconciler().clone();
    assert!(
        eventually(|| reconciler.get(&rejected).map(|e| e.status)
            == Some(EnrollmentStatus::Rejected))
        .await
    );
    assert!(events.try_recv().is_err());
    assert_eq!(student.reconciler().pending().len(), 0);

    student.disconnect().await;
}

/// A WebSocket peer that authenticates anyone, acknowledges every
/// SUBSCRIBE after `ack_delay` and otherwise never says a word.
struct SilentServer {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    acked: Arc<AtomicBool>,
}

impl SilentServer {
    async fn start(ack_delay: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let acked = Arc::new(AtomicBool::new(false));
        let (count, flag) = (Arc::clone(&accepted), Arc::clone(&acked));
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let n = count.fetch_add(1, Ordering::SeqCst);
                let flag = Arc::clone(&flag);
                tokio::spawn(async move {
                    let Ok(mut ws) = accept_async(stream).await else {
                        return;
                    };
                    while let Some(Ok(msg)) = ws.next().await {
                        let Message::Text(text) = msg else { continue };
                        let reply = match serde_json::from_str::<ClientFrame>(text.as_str()) {
                            Ok(ClientFrame::Auth { .. }) => ControlFrame::AuthOk {
                                session_id: format!("silent-{n}"),
                            },
                            Ok(ClientFrame::Subscribe { topic }) => {
                                tokio::time::sleep(ack_delay).await;
                                flag.store(true, Ordering::SeqCst);
                                ControlFrame::Subscribed {
                                    topic: topic.parse().unwrap(),
                                }
                            }
                            _ => continue,
                        };
                        let json = serde_json::to_string(&ServerFrame::from(reply)).unwrap();
                        if ws.send(Message::text(json)).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        Self {
            addr,
            accepted,
            acked,
        }
    }

    fn config(&self) -> ClientConfig {
        ClientConfig::new(format!("ws://{}/ws", self.addr), format!("http://{}", self.addr))
            .with_topic(TopicKey::user("S"))
    }
}

/// Records whether the subscription was acknowledged at each fetch.
#[derive(Default)]
struct RecordingSnapshots {
    acked: Arc<AtomicBool>,
    fetches: Mutex<Vec<bool>>,
}

#[async_trait]
impl SnapshotSource for RecordingSnapshots {
    async fn fetch(&self, _topics: &[TopicKey]) -> Result<Snapshot, ClientError> {
        self.fetches.lock().push(self.acked.load(Ordering::SeqCst));
        Ok(Snapshot {
            enrollments: Vec::new(),
            as_of: chrono::Utc::now(),
        })
    }
}

#[tokio::test]
async fn silent_peer_trips_heartbeat_timeout_and_redials() {
    let server = SilentServer::start(Duration::ZERO).await;
    let mut config = server.config();
    config.heartbeat_interval = Duration::from_millis(50);
    config.heartbeat_timeout = Duration::from_millis(300);
    config.reconnect = ReconnectPolicy {
        base_delay_ms: 20,
        max_delay_ms: 100,
        jitter_factor: 0.0,
    };
    let manager = ConnectionManager::new(
        config,
        Arc::new(StaticCredentials("token".into())),
        Arc::new(RecordingSnapshots::default()),
    );
    manager.connect(UserId::from("S"), Role::Student).await.unwrap();
    assert_eq!(manager.status(), ConnectionStatus::Connected);

    let accepted = Arc::clone(&server.accepted);
    assert!(eventually(|| accepted.load(Ordering::SeqCst) >= 2).await);
    let error = manager.last_error().unwrap_or_default();
    assert!(error.contains("heartbeat"), "{error}");

    manager.disconnect().await;
}

#[tokio::test]
async fn resync_waits_for_subscription_ack() {
    let server = SilentServer::start(Duration::from_millis(300)).await;
    let snapshots = Arc::new(RecordingSnapshots {
        acked: Arc::clone(&server.acked),
        fetches: Mutex::default(),
    });
    let manager = ConnectionManager::new(
        server.config(),
        Arc::new(StaticCredentials("token".into())),
        Arc::clone(&snapshots) as Arc<dyn SnapshotSource>,
    );
    manager.connect(UserId::from("S"), Role::Student).await.unwrap();

    assert_eq!(*snapshots.fetches.lock(), vec![true]);

    manager.disconnect().await;
}
