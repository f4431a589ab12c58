//! Frame dispatch for authenticated sessions.
//!
//! Every reply goes through the session's outbound queue, so replies and
//! pushed envelopes share one ordered stream.

use std::sync::Arc;

use metrics::counter;
use tracing::{debug, instrument, warn};

use rollcall_core::protocol::{ClientFrame, ControlFrame, ErrorCode};
use rollcall_core::topic::TopicKey;

use super::broker::EventBroker;
use super::connection::Session;
use super::registry::SubscriptionRegistry;
use crate::metrics::SUBSCRIBE_DENIED_TOTAL;

/// Shared services a session's frames are dispatched against.
#[derive(Clone)]
pub struct Hub {
    /// Topic subscriptions.
    pub registry: Arc<SubscriptionRegistry>,
    /// Fan-out and replay.
    pub broker: Arc<EventBroker>,
}

fn error_frame(code: ErrorCode, message: impl Into<String>, topic: Option<String>) -> ControlFrame {
    ControlFrame::Error {
        code,
        message: message.into(),
        topic,
    }
}

/// Handle one text frame from an authenticated session.
#[instrument(skip_all, fields(session_id = %session.id))]
pub async fn handle_message(text: &str, session: &Arc<Session>, hub: &Hub) {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            warn!(error = %e, "invalid frame received");
            let _ = session.send_frame(error_frame(
                ErrorCode::InvalidFrame,
                format!("invalid frame: {e}"),
                None,
            ));
            return;
        }
    };

    let reply = match frame {
        ClientFrame::Auth { .. } => {
            error_frame(ErrorCode::InvalidFrame, "session is already authenticated", None)
        }
        ClientFrame::Heartbeat => {
            session.mark_alive();
            ControlFrame::HeartbeatAck
        }
        ClientFrame::Subscribe { topic } => subscribe(session, hub, &topic).await,
        ClientFrame::Unsubscribe { topic } => match topic.parse::<TopicKey>() {
            Ok(key) => {
                let _ = hub.registry.unsubscribe(session, &key);
                ControlFrame::Unsubscribed { topic: key }
            }
            Err(e) => error_frame(ErrorCode::InvalidTopic, e.to_string(), Some(topic)),
        },
        ClientFrame::Replay { last_event_id } => {
            // The broker queues the envelopes and the closing control frame.
            let _ = hub.broker.replay_to(session, &last_event_id);
            return;
        }
    };
    let _ = session.send_frame(reply);
}

async fn subscribe(session: &Arc<Session>, hub: &Hub, raw: &str) -> ControlFrame {
    let key = match raw.parse::<TopicKey>() {
        Ok(key) => key,
        Err(e) => return error_frame(ErrorCode::InvalidTopic, e.to_string(), Some(raw.into())),
    };
    match hub.registry.subscribe(session, key.clone()).await {
        Ok(_) => ControlFrame::Subscribed { topic: key },
        Err(e) => {
            debug!(topic = raw, error = %e, "subscribe denied");
            counter!(SUBSCRIBE_DENIED_TOTAL).increment(1);
            error_frame(ErrorCode::Authorization, e.to_string(), Some(raw.into()))
        }
    }
}
