use axum::{
    body::Bytes,
    extract::{
        State,
        ws::{Message as WsFrame, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::api::AppState;
use super::models::{Autopilot, Message, Run, RunIndexRow};

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── Push frames ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum AgentEvent {
    /// First frame on every connection.
    Snapshot {
        runs: Vec<Run>,
        autopilots: Vec<Autopilot>,
        messages: Vec<Message>,
    },
    RunUpserted {
        run: Run,
    },
    AutopilotUpserted {
        autopilot: Autopilot,
    },
    RunsIndex {
        runs: Vec<RunIndexRow>,
    },
    NewMessage {
        message: Message,
    },
    Typing {
        user_id: String,
        channel_id: String,
        parent_id: Option<String>,
    },
}

/// Destination for registry publications. Implementations must not call back
/// into the registry; they run while its lock is held.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: &AgentEvent);
}

impl EventSink for broadcast::Sender<String> {
    fn publish(&self, event: &AgentEvent) {
        broadcast_message(self, event);
    }
}

// ── WebSocket handler ────────────────────────────────────────────────

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, receiver) = socket.split();
    // Subscribe before snapshotting so nothing published in between is lost.
    let rx = state.ws_tx.subscribe();
    let snapshot = state.registry.snapshot();
    match serde_json::to_string(&snapshot) {
        Ok(json) => {
            if sender.send(WsFrame::Text(json.into())).await.is_err() {
                return;
            }
        }
        Err(e) => tracing::warn!(error = %e, "failed to serialize snapshot frame"),
    }
    run_socket_loop(sender, receiver, rx).await;
}

/// Core WebSocket loop with ping/pong keepalive.
///
/// Combines broadcast forwarding, client message receiving, and periodic
/// ping/pong health checking into a single select loop. If no Pong is
/// received within [`PONG_TIMEOUT`] after a Ping is sent, the connection
/// is considered dead and the loop exits.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, WsFrame>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<String>,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    tracing::debug!("websocket pong timeout, closing");
                    break;
                }
                if sender.send(WsFrame::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            result = rx.recv() => {
                match result {
                    Ok(msg) => {
                        if sender.send(WsFrame::Text(msg.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Clients reconcile from later full frames.
                        tracing::warn!(skipped, "websocket subscriber lagged");
                        continue;
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(WsFrame::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(WsFrame::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(WsFrame::Close(None)).await;
}

// ── Broadcast helper ─────────────────────────────────────────────────

/// Serialize and broadcast an event to all connected subscribers.
/// Returns silently even if nobody is listening.
pub fn broadcast_message(tx: &broadcast::Sender<String>, event: &AgentEvent) {
    match serde_json::to_string(event) {
        Ok(json) => {
            let _ = tx.send(json);
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize agent event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::models::{Container, RunStatus};

    fn sample_row() -> RunIndexRow {
        RunIndexRow {
            id: "run-1".into(),
            title: "Weekly recap".into(),
            status: RunStatus::Running,
            progress_pct: 50,
            latest_update: "Collecting".into(),
            created_at: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_runs_index_serialization() {
        let event = AgentEvent::RunsIndex {
            runs: vec![sample_row()],
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"RunsIndex\""));
        assert!(json.contains("\"data\""));
        assert!(json.contains("\"status\":\"running\""));
        assert!(json.contains("\"progress_pct\":50"));
    }

    #[test]
    fn test_typing_serialization() {
        let event = AgentEvent::Typing {
            user_id: "workspace-agent".into(),
            channel_id: "general".into(),
            parent_id: Some("msg-1".into()),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"Typing\""));
        assert!(json.contains("\"channel_id\":\"general\""));
    }

    #[test]
    fn test_event_roundtrip_deserialization() {
        let event = AgentEvent::NewMessage {
            message: Message::from_agent("m1".into(), &Container::channel("general").id, "hi".into()),
        };
        let json = serde_json::to_string(&event).unwrap();
        let parsed: AgentEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }

    #[tokio::test]
    async fn test_broadcast_channel_delivers_to_subscribers() {
        let (tx, mut rx) = broadcast::channel::<String>(16);
        let event = AgentEvent::RunsIndex { runs: vec![] };
        tx.publish(&event);
        let received = rx.recv().await.unwrap();
        let parsed: AgentEvent = serde_json::from_str(&received).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_broadcast_no_receivers_does_not_panic() {
        let (tx, _) = broadcast::channel::<String>(16);
        broadcast_message(&tx, &AgentEvent::RunsIndex { runs: vec![] });
    }
}
