// =============================================================================
// WebSocket Handler — push feed of health events
// =============================================================================
//
// Clients connect to `/api/v1/events/ws?token=<token>` and receive:
//   1. The retained recent events on connect, oldest first.
//   2. Every new `HealthEvent` as it is raised.
//
// Each frame is one JSON object `{ "seq": n, "event": {...} }`. A subscriber
// that falls behind the broadcast buffer gets `{ "seq": n, "lagged": k }`
// instead of the `k` dropped events and keeps streaming.
//
// The handler also responds to Ping frames with Pong frames and cleans up on
// disconnect.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::api::auth::validate_token;
use crate::app_state::AppState;
use crate::health::HealthEvent;

/// Events replayed to a client on connect.
const BACKLOG_ON_CONNECT: usize = 50;

// =============================================================================
// Query parameters
// =============================================================================

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

// =============================================================================
// Frames
// =============================================================================

#[derive(Debug, Serialize)]
struct Frame<'a> {
    seq: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    event: Option<&'a HealthEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lagged: Option<u64>,
}

// =============================================================================
// WebSocket upgrade handler
// =============================================================================

/// Validates the token from the `?token=` query parameter before upgrading.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let token = query.token.unwrap_or_default();
    if !validate_token(&token) {
        warn!("WebSocket connection rejected: invalid token");
        return (
            axum::http::StatusCode::FORBIDDEN,
            "Invalid or missing token",
        )
            .into_response();
    }

    info!("WebSocket connection accepted — upgrading");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
        .into_response()
}

// =============================================================================
// Connection handler
// =============================================================================

/// Manages a single WebSocket connection lifecycle.
///
/// Runs two concurrent branches via `tokio::select!`:
///   1. **Push** — forward every broadcast health event.
///   2. **Recv** — process incoming client frames (Ping/Pong, Close).
async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>) {
    // Subscribe before replaying the backlog so nothing raised in between is
    // missed; an event may then appear twice, never zero times.
    let mut events = state.health.subscribe();
    let (mut sender, mut receiver) = socket.split();
    let mut sequence: u64 = 0;

    let mut backlog = state.health.recent(BACKLOG_ON_CONNECT);
    backlog.reverse();
    for event in &backlog {
        if let Err(e) = send_frame(&mut sender, &mut sequence, Some(event), None).await {
            warn!(error = %e, "Failed to send WebSocket backlog");
            return;
        }
    }

    loop {
        tokio::select! {
            // ── Push: forward health events ─────────────────────────────
            received = events.recv() => {
                let sent = match received {
                    Ok(event) => send_frame(&mut sender, &mut sequence, Some(&event), None).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "WebSocket subscriber lagged behind health events");
                        send_frame(&mut sender, &mut sequence, None, Some(skipped)).await
                    }
                    Err(RecvError::Closed) => {
                        info!("health channel closed — disconnecting");
                        break;
                    }
                };
                if let Err(e) = sent {
                    debug!(error = %e, "WebSocket send failed — disconnecting");
                    break;
                }
            }

            // ── Recv: process incoming messages ─────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(error = %e, "Failed to send Pong — disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("WebSocket Close frame received — disconnecting");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Text, binary and pong frames carry nothing for us.
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error — disconnecting");
                        break;
                    }
                    None => {
                        info!("WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    info!(frames = sequence, "WebSocket connection closed");
}

// =============================================================================
// Helpers
// =============================================================================

async fn send_frame<S>(
    sender: &mut S,
    sequence: &mut u64,
    event: Option<&HealthEvent>,
    lagged: Option<u64>,
) -> Result<(), axum::Error>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    *sequence += 1;
    let frame = Frame {
        seq: *sequence,
        event,
        lagged,
    };

    match serde_json::to_string(&frame) {
        Ok(json) => {
            sender.send(Message::Text(json)).await?;
            debug!(seq = *sequence, "WebSocket frame sent");
            Ok(())
        }
        Err(e) => {
            // Serialisation errors are not network errors; don't disconnect.
            warn!(error = %e, "Failed to serialize health frame");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::Severity;

    #[test]
    fn frames_carry_either_an_event_or_a_lag_count() {
        let event = HealthEvent::new(Severity::Error, "ledger", "ledger_io_error", "disk full");
        let json = serde_json::to_value(Frame {
            seq: 1,
            event: Some(&event),
            lagged: None,
        })
        .unwrap();
        assert_eq!(json["event"]["code"], "ledger_io_error");
        assert!(json.get("lagged").is_none());

        let json = serde_json::to_value(Frame {
            seq: 2,
            event: None,
            lagged: Some(7),
        })
        .unwrap();
        assert_eq!(json["lagged"], 7);
        assert!(json.get("event").is_none());
    }
}
