//! `RollcallServer`: axum HTTP + WebSocket gateway.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use rollcall_core::traits::{ClassRoster, EnrollmentStore, TokenVerifier};
use rollcall_store::EnrollmentRepo;

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::health::{self, HealthResponse};
use crate::metrics::WS_CONNECTIONS_REFUSED_TOTAL;
use crate::routes;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::broker::{BrokerConfig, EventBroker, run_feed};
use crate::websocket::handler::Hub;
use crate::websocket::heartbeat::run_sweep;
use crate::websocket::registry::SubscriptionRegistry;
use crate::websocket::session::{SessionContext, run_ws_session};

// ─────────────────────────────────────────────────────────────────────────────
// Connection cap
// ─────────────────────────────────────────────────────────────────────────────

/// Counts open WebSocket connections against a cap.
#[derive(Debug)]
pub struct ConnectionSlots {
    active: AtomicUsize,
    max: usize,
}

/// Releases its slot on drop.
#[derive(Debug)]
pub struct SlotGuard(Arc<ConnectionSlots>);

impl ConnectionSlots {
    /// Allow up to `max` concurrent connections.
    pub fn new(max: usize) -> Arc<Self> {
        Arc::new(Self {
            active: AtomicUsize::new(0),
            max,
        })
    }

    /// Claim a slot, or `None` when the cap is reached.
    pub fn try_acquire(self: &Arc<Self>) -> Option<SlotGuard> {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max).then_some(n + 1)
            })
            .ok()
            .map(|_| SlotGuard(Arc::clone(self)))
    }

    /// Slots in use.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let _ = self.0.active.fetch_sub(1, Ordering::AcqRel);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// State
// ─────────────────────────────────────────────────────────────────────────────

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Per-connection context (registry, broker, verifier, timeouts).
    pub session: SessionContext,
    /// Enrollment records.
    pub store: Arc<dyn EnrollmentStore>,
    /// Class ownership.
    pub roster: Arc<dyn ClassRoster>,
    /// WebSocket connection cap.
    pub connections: Arc<ConnectionSlots>,
    /// Prometheus renderer.
    pub metrics: PrometheusHandle,
    /// When the server started.
    pub start_time: Instant,
}

/// The notification gateway.
pub struct RollcallServer {
    config: ServerConfig,
    repo: Arc<EnrollmentRepo>,
    registry: Arc<SubscriptionRegistry>,
    broker: Arc<EventBroker>,
    shutdown: Arc<ShutdownCoordinator>,
    state: AppState,
}

impl RollcallServer {
    /// Wire a server over `repo`, `roster` and `verifier`.
    pub fn new(
        config: ServerConfig,
        repo: Arc<EnrollmentRepo>,
        roster: Arc<dyn ClassRoster>,
        verifier: Arc<dyn TokenVerifier>,
        metrics: PrometheusHandle,
    ) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new(Arc::clone(&roster)));
        let broker = Arc::new(EventBroker::new(
            Arc::clone(&registry),
            &BrokerConfig {
                dedup_capacity: config.dedup_capacity,
                replay_capacity: config.replay_capacity,
                replay_max_age: config.replay_max_age,
            },
        ));
        let shutdown = Arc::new(ShutdownCoordinator::new());

        let state = AppState {
            session: SessionContext {
                hub: Hub {
                    registry: Arc::clone(&registry),
                    broker: Arc::clone(&broker),
                },
                verifier,
                auth_timeout: config.auth_timeout,
                outbound_queue: config.outbound_queue,
                shutdown: shutdown.token(),
            },
            store: Arc::clone(&repo) as Arc<dyn EnrollmentStore>,
            roster,
            connections: ConnectionSlots::new(config.max_connections),
            metrics,
            start_time: Instant::now(),
        };

        Self {
            config,
            repo,
            registry,
            broker,
            shutdown,
            state,
        }
    }

    /// Build the axum router with all routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route(
                "/api/enrollments",
                get(routes::list_enrollments).post(routes::request_enrollment),
            )
            .route("/api/enrollments/status", get(routes::enrollment_status))
            .route("/api/enrollments/{id}/decision", post(routes::decide_enrollment))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Bind, start background tasks and serve. Returns once listening.
    pub async fn listen(&self) -> Result<ServerHandle, ServerError> {
        // Subscribe before reading the resume point so nothing falls between.
        let feed = self.repo.subscribe_changes();
        self.broker.resume_from(self.repo.latest_change_id()?);

        let token = self.shutdown.token();
        let broker_task = tokio::spawn(run_feed(
            Arc::clone(&self.broker),
            feed,
            Arc::clone(&self.repo),
            token.clone(),
        ));
        let sweep_task = tokio::spawn(run_sweep(
            Arc::clone(&self.registry),
            self.config.heartbeat_interval,
            self.config.heartbeat_timeout,
            token.clone(),
        ));

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr()).await?;
        let addr = listener.local_addr()?;
        info!(%addr, "rollcall server listening");

        let router = self.router();
        let serve_token = token.clone();
        let serve_task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(serve_token.cancelled_owned())
                .await
            {
                warn!(error = %e, "http server stopped with error");
            }
        });

        Ok(ServerHandle {
            addr,
            shutdown: Arc::clone(&self.shutdown),
            tasks: vec![broker_task, sweep_task, serve_task],
            timeout: self.config.shutdown_timeout,
        })
    }

    /// The subscription registry.
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// The event broker.
    pub fn broker(&self) -> &Arc<EventBroker> {
        &self.broker
    }

    /// The shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// The server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// A running server.
pub struct ServerHandle {
    addr: SocketAddr,
    shutdown: Arc<ShutdownCoordinator>,
    tasks: Vec<JoinHandle<()>>,
    timeout: std::time::Duration,
}

impl ServerHandle {
    /// Bound address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Bound port.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Signal shutdown and wait for background tasks.
    pub async fn shutdown(self) {
        let clean = self
            .shutdown
            .graceful_shutdown(self.tasks, Some(self.timeout))
            .await;
        info!(clean, "rollcall server stopped");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// GET /ws
async fn ws_handler(
    State(state): State<AppState>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Some(slot) = state.connections.try_acquire() else {
        counter!(WS_CONNECTIONS_REFUSED_TOTAL).increment(1);
        warn!(active = state.connections.active(), "connection limit reached");
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };
    let ctx = state.session.clone();
    ws.on_upgrade(move |socket| async move {
        run_ws_session(socket, ctx).await;
        drop(slot);
    })
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let registry = &state.session.hub.registry;
    Json(health::health_check(
        state.start_time,
        state.connections.active(),
        registry.session_count(),
        registry.topic_count(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> String {
    state.metrics.render()
}
