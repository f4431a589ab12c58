//! WebSocket session lifecycle: handshake, frame loop, cleanup.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use rollcall_core::enrollment::Role;
use rollcall_core::errors::AuthError;
use rollcall_core::ids::UserId;
use rollcall_core::protocol::{ClientFrame, ControlFrame, ErrorCode, ServerFrame};
use rollcall_core::traits::{Identity, TokenVerifier};

use super::connection::Session;
use super::handler::{Hub, handle_message};
use crate::auth::ensure_matches;
use crate::metrics::{
    AUTH_REJECTED_TOTAL, SESSIONS_ACTIVE, WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE,
    WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL,
};

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

/// Everything a connection task needs.
#[derive(Clone)]
pub struct SessionContext {
    /// Registry and broker.
    pub hub: Hub,
    /// Token verification.
    pub verifier: Arc<dyn TokenVerifier>,
    /// Deadline for the AUTH frame.
    pub auth_timeout: Duration,
    /// Outbound queue depth.
    pub outbound_queue: usize,
    /// Server-wide shutdown.
    pub shutdown: CancellationToken,
}

/// Run one WebSocket connection from upgrade to close.
///
/// 1. Waits up to `auth_timeout` for an AUTH frame and verifies it
/// 2. Registers a [`Session`] and answers `AUTH_OK`
/// 3. Dispatches frames until the peer leaves, the session is evicted or
///    the server shuts down
/// 4. Removes the session and all its subscriptions
#[instrument(skip_all)]
pub async fn run_ws_session(ws: WebSocket, ctx: SessionContext) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let connection_start = Instant::now();
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    if let Some(identity) = handshake(&mut ws_tx, &mut ws_rx, &ctx).await {
        run_authenticated(ws_tx, ws_rx, identity, &ctx).await;
    }

    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(connection_start.elapsed().as_secs_f64());
}

// ─────────────────────────────────────────────────────────────────────────────
// Handshake
// ─────────────────────────────────────────────────────────────────────────────

async fn handshake(
    ws_tx: &mut WsSink,
    ws_rx: &mut WsStream,
    ctx: &SessionContext,
) -> Option<Identity> {
    let waited = tokio::select! {
        waited = tokio::time::timeout(ctx.auth_timeout, wait_for_auth(ws_tx, ws_rx)) => waited,
        () = ctx.shutdown.cancelled() => return None,
    };
    let claimed = match waited {
        Ok(Some(claimed)) => claimed,
        Ok(None) => return None,
        Err(_) => {
            reject(ws_tx, &AuthError::Timeout).await;
            return None;
        }
    };

    let (user_id, role, token) = claimed;
    let verified = ctx
        .verifier
        .verify_token(&token)
        .await
        .and_then(|identity| ensure_matches(&identity, &user_id, role).map(|()| identity));

    match verified {
        Ok(identity) => Some(identity),
        Err(e) => {
            reject(ws_tx, &e).await;
            None
        }
    }
}

/// Read frames until an AUTH arrives. Anything else is answered with
/// `NOT_AUTHENTICATED` (or `INVALID_FRAME`) and ignored.
async fn wait_for_auth(
    ws_tx: &mut WsSink,
    ws_rx: &mut WsStream,
) -> Option<(UserId, Role, String)> {
    while let Some(Ok(msg)) = ws_rx.next().await {
        let Some(text) = message_text(&msg) else {
            if matches!(msg, Message::Close(_)) {
                return None;
            }
            continue;
        };
        let reply = match serde_json::from_str::<ClientFrame>(&text) {
            Ok(ClientFrame::Auth { user_id, role, token }) => return Some((user_id, role, token)),
            Ok(_) => ControlFrame::Error {
                code: ErrorCode::NotAuthenticated,
                message: "first frame must be AUTH".into(),
                topic: None,
            },
            Err(e) => ControlFrame::Error {
                code: ErrorCode::InvalidFrame,
                message: format!("invalid frame: {e}"),
                topic: None,
            },
        };
        if send_direct(ws_tx, reply).await.is_err() {
            return None;
        }
    }
    None
}

async fn reject(ws_tx: &mut WsSink, error: &AuthError) {
    let reason = match error {
        AuthError::Timeout => "timeout".to_owned(),
        other => other.to_string(),
    };
    info!(%reason, "authentication rejected");
    counter!(AUTH_REJECTED_TOTAL, "reason" => auth_reason_label(error)).increment(1);

    let _ = send_direct(ws_tx, ControlFrame::AuthRejected { reason }).await;
    let _ = ws_tx
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: "authentication failed".into(),
        })))
        .await;
}

fn auth_reason_label(error: &AuthError) -> &'static str {
    match error {
        AuthError::InvalidToken(_) => "invalid_token",
        AuthError::Expired => "expired",
        AuthError::IdentityMismatch { .. } => "identity_mismatch",
        AuthError::Timeout => "timeout",
        AuthError::Rejected(_) => "rejected",
    }
}

async fn send_direct(ws_tx: &mut WsSink, frame: ControlFrame) -> Result<(), axum::Error> {
    match serde_json::to_string(&ServerFrame::from(frame)) {
        Ok(json) => ws_tx.send(Message::Text(json.into())).await,
        Err(e) => {
            warn!(error = %e, "failed to serialize control frame");
            Ok(())
        }
    }
}

fn message_text(msg: &Message) -> Option<String> {
    match msg {
        Message::Text(t) => Some(t.to_string()),
        Message::Binary(data) => std::str::from_utf8(data).ok().map(str::to_owned),
        Message::Ping(_) | Message::Pong(_) | Message::Close(_) => None,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Authenticated phase
// ─────────────────────────────────────────────────────────────────────────────

async fn run_authenticated(
    mut ws_tx: WsSink,
    mut ws_rx: WsStream,
    identity: Identity,
    ctx: &SessionContext,
) {
    let (send_tx, mut send_rx) = mpsc::channel::<Arc<String>>(ctx.outbound_queue.max(1));
    let session = Arc::new(Session::new(identity.user_id, identity.role, send_tx));
    let session_id = session.id.clone();

    ctx.hub.registry.register(Arc::clone(&session));
    gauge!(SESSIONS_ACTIVE).increment(1.0);
    info!(%session_id, user_id = %session.user_id, role = %session.role, "session authenticated");

    let _ = session.send_frame(ControlFrame::AuthOk {
        session_id: session_id.to_string(),
    });

    // Outbound forwarder: queue → socket, until closed or cancelled.
    let cancel = session.cancel_token().clone();
    let shutdown = ctx.shutdown.clone();
    let outbound = tokio::spawn(async move {
        loop {
            tokio::select! {
                msg = send_rx.recv() => match msg {
                    Some(text) => {
                        if ws_tx.send(Message::Text(text.as_str().into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                () = cancel.cancelled() => {
                    let _ = ws_tx.send(Message::Close(Some(CloseFrame {
                        code: close_code::AWAY,
                        reason: "session closed".into(),
                    }))).await;
                    break;
                }
                () = shutdown.cancelled() => {
                    let _ = ws_tx.send(Message::Close(Some(CloseFrame {
                        code: close_code::RESTART,
                        reason: "server shutting down".into(),
                    }))).await;
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            next = ws_rx.next() => {
                let Some(Ok(msg)) = next else { break };
                // Any inbound frame counts as liveness.
                session.mark_alive();
                match msg {
                    Message::Close(_) => {
                        debug!(%session_id, "client sent close frame");
                        break;
                    }
                    Message::Ping(_) | Message::Pong(_) => {}
                    other => {
                        if let Some(text) = message_text(&other) {
                            handle_message(&text, &session, &ctx.hub).await;
                        }
                    }
                }
            }
            () = session.cancel_token().cancelled() => break,
            () = ctx.shutdown.cancelled() => break,
        }
    }

    let _ = ctx.hub.registry.remove_session(&session_id);
    session.close();
    gauge!(SESSIONS_ACTIVE).decrement(1.0);
    if tokio::time::timeout(Duration::from_secs(1), outbound).await.is_err() {
        debug!(%session_id, "outbound task did not finish in time");
    }
    info!(%session_id, dropped = session.drop_count(), "session closed");
}
