// =============================================================================
// WebSocket Handler — topic subscriptions over the fan-out hub
// =============================================================================
//
// Clients connect to `/ws` (optionally with `?token=` for immediate
// authentication) and drive a small JSON protocol:
//
//   {"action": "authenticate", "token": "..."}
//   {"action": "subscribe",    "topic": "candles:RELIANCE:5s"}
//   {"action": "unsubscribe",  "topic": "candles:RELIANCE:5s"}
//
// Subscribing attaches a forwarder from the hub's broadcast channel for that
// topic into this connection's bounded outbound queue. A connection that
// cannot keep up sees `Lagged` on some topic and is disconnected — slow
// consumers never stall the publisher, and every delivered topic stream stays
// in publish order.
//
// The private topic `user:{email}` requires prior authentication as exactly
// that email.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::auth::resolve_token;
use crate::app_state::AppState;
use crate::storage::UserRow;

// =============================================================================
// Protocol types
// =============================================================================

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

#[derive(Deserialize)]
struct ClientMessage {
    action: String,
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    token: Option<String>,
}

/// Messages flowing into the connection's outbound queue.
enum Outbound {
    /// An envelope from the hub, already serialized.
    Data(String),
    /// A forwarder observed `Lagged` on this topic; the connection dies.
    Lagged(String),
}

// =============================================================================
// WebSocket upgrade handler
// =============================================================================

/// Axum handler for the WebSocket upgrade request.
///
/// A `?token=` query parameter authenticates the connection up front; an
/// invalid one rejects the upgrade. Connections without a token are allowed
/// and limited to public topics until they authenticate in-band.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let identity = match query.token {
        Some(token) => match resolve_token(&state, &token) {
            Ok(user) => Some(user),
            Err(e) => {
                warn!("WebSocket connection rejected: invalid token");
                return e.into_response();
            }
        },
        None => None,
    };

    debug!(authenticated = identity.is_some(), "WebSocket upgrade accepted");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state, identity))
        .into_response()
}

// =============================================================================
// Connection handler
// =============================================================================

/// Manages one WebSocket connection: the inbound protocol loop, the outbound
/// queue drain, and one forwarder task per subscribed topic.
async fn handle_ws_connection(
    socket: WebSocket,
    state: Arc<AppState>,
    mut identity: Option<UserRow>,
) {
    let (mut sender, mut receiver) = socket.split();
    let (out_tx, mut out_rx) =
        mpsc::channel::<Outbound>(state.config.subscriber_queue_capacity);

    let mut subscriptions: HashMap<String, JoinHandle<()>> = HashMap::new();

    loop {
        tokio::select! {
            // ── Outbound queue: hub envelopes and lag notices ───────────
            out = out_rx.recv() => {
                match out {
                    Some(Outbound::Data(json)) => {
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            debug!("WebSocket send failed — disconnecting");
                            break;
                        }
                    }
                    Some(Outbound::Lagged(topic)) => {
                        warn!(topic = %topic, "subscriber lagged behind — disconnecting");
                        let notice = serde_json::json!({
                            "event": "disconnected",
                            "reason": "slow_consumer",
                            "topic": topic,
                        });
                        let _ = sender.send(Message::Text(notice.to_string().into())).await;
                        break;
                    }
                    None => break,
                }
            }

            // ── Inbound protocol loop ───────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let reply = handle_client_message(
                            &state,
                            &text,
                            &mut identity,
                            &mut subscriptions,
                            &out_tx,
                        );
                        if sender.send(Message::Text(reply.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        info!("WebSocket close frame received");
                        break;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!("WebSocket binary message ignored");
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error — disconnecting");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    for (_, handle) in subscriptions.drain() {
        handle.abort();
    }
    debug!("WebSocket connection closed — forwarders stopped");
}

/// Apply one client protocol message, returning the JSON reply to send.
fn handle_client_message(
    state: &Arc<AppState>,
    text: &str,
    identity: &mut Option<UserRow>,
    subscriptions: &mut HashMap<String, JoinHandle<()>>,
    out_tx: &mpsc::Sender<Outbound>,
) -> serde_json::Value {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(_) => {
            return serde_json::json!({ "event": "error", "error": "malformed message" })
        }
    };

    match msg.action.as_str() {
        "authenticate" => {
            let token = msg.token.unwrap_or_default();
            match resolve_token(state, &token) {
                Ok(user) => {
                    info!(user = %user.email, "WebSocket authenticated");
                    let email = user.email.clone();
                    *identity = Some(user);
                    serde_json::json!({ "event": "authenticated", "email": email })
                }
                Err(e) => serde_json::json!({ "event": "error", "error": e.to_string() }),
            }
        }

        "subscribe" => {
            let topic = match msg.topic {
                Some(t) if !t.is_empty() => t,
                _ => return serde_json::json!({ "event": "error", "error": "missing topic" }),
            };

            // The per-user room is private to its owner.
            if let Some(email) = topic.strip_prefix("user:") {
                let authed = identity.as_ref().map(|u| u.email.as_str());
                if authed != Some(email) {
                    return serde_json::json!({
                        "event": "error",
                        "error": "authentication required for this topic",
                        "topic": topic,
                    });
                }
            }

            if subscriptions.contains_key(&topic) {
                return serde_json::json!({ "event": "subscribed", "topic": topic });
            }

            let mut rx = state.hub.subscribe(&topic);
            let tx = out_tx.clone();
            let task_topic = topic.clone();
            let handle = tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(envelope) => {
                            if tx.send(Outbound::Data(envelope)).await.is_err() {
                                break;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(topic = %task_topic, skipped, "broadcast receiver lagged");
                            let _ = tx.send(Outbound::Lagged(task_topic.clone())).await;
                            break;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
            subscriptions.insert(topic.clone(), handle);
            serde_json::json!({ "event": "subscribed", "topic": topic })
        }

        "unsubscribe" => {
            let topic = msg.topic.unwrap_or_default();
            if let Some(handle) = subscriptions.remove(&topic) {
                handle.abort();
            }
            serde_json::json!({ "event": "unsubscribed", "topic": topic })
        }

        other => serde_json::json!({
            "event": "error",
            "error": format!("unknown action '{other}'"),
        }),
    }
}
