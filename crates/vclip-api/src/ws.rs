//! `/export/progress/{id}` websocket handler (§4.7) with backpressure.
//!
//! Grounded in the teacher's `handle_process_socket`: a bounded mpsc
//! send-task plus a `tokio::select!` over progress-stream / heartbeat-tick
//! / client-message. Differences from the teacher, per §4.7:
//! - Heartbeat interval is ≤ 10 s, not 30 s, and disconnection is decided
//!   by a 3-miss counter rather than a single timeout.
//! - The client-message match gains a `"status"` branch that replies
//!   out-of-band with a `RenderJob` snapshot, without touching the live
//!   stream.
//! - A late subscriber gets one snapshot on attach, never a history replay
//!   (see `crate::orchestrator` for why `ProgressChannel::get_full_history`
//!   is deliberately unused here).

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{info, warn};

use vclip_models::{JobId, ProgressRecord, RenderJob};
use vclip_queue::ProgressEvent;

use crate::metrics;
use crate::state::AppState;

const WS_SEND_BUFFER_SIZE: usize = 32;
const WS_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const WS_MAX_MISSED_HEARTBEATS: u32 = 3;

static ACTIVE_WS_CONNECTIONS: AtomicI64 = AtomicI64::new(0);

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Ping,
    Status,
}

/// Server-sent shapes. `Progress` forwards `ProgressRecord`'s own
/// `{"type": "progress"|"error", ...}` tagging unchanged rather than
/// nesting it inside another tag, since clients already parse that shape
/// off the worker's line-delimited stdout protocol (§4.6) and the
/// websocket just relays it.
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ServerMessage<'a> {
    Pong { r#type: &'static str },
    Snapshot { r#type: &'static str, job: &'a RenderJob },
    Progress(ProgressRecord),
}

impl<'a> ServerMessage<'a> {
    fn pong() -> Self {
        Self::Pong { r#type: "pong" }
    }

    fn snapshot(job: &'a RenderJob) -> Self {
        Self::Snapshot { r#type: "snapshot", job }
    }
}

async fn send_ws_message(tx: &mpsc::Sender<Message>, msg: &ServerMessage<'_>) -> bool {
    let Ok(json) = serde_json::to_string(msg) else { return false };
    match tx.try_send(Message::Text(json.clone())) {
        Ok(_) => true,
        Err(mpsc::error::TrySendError::Full(_)) => tx.send(Message::Text(json)).await.is_ok(),
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

pub async fn ws_progress(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let count = ACTIVE_WS_CONNECTIONS.fetch_add(1, Ordering::SeqCst) + 1;
    metrics::set_ws_active_connections(count);
    metrics::record_ws_connection("progress");

    ws.on_upgrade(move |socket| async move {
        handle_progress_socket(socket, state, JobId::from(id)).await;
        let count = ACTIVE_WS_CONNECTIONS.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::set_ws_active_connections(count);
    })
}

async fn handle_progress_socket(socket: WebSocket, state: AppState, job_id: JobId) {
    use futures_util::{SinkExt, StreamExt};

    let (ws_sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(WS_SEND_BUFFER_SIZE);

    let send_task = tokio::spawn(async move {
        let mut ws_sender = ws_sender;
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    let (snapshot, mut events) = match state.orchestrator.subscribe(&job_id).await {
        Ok(pair) => pair,
        Err(e) => {
            let _ = tx
                .send(Message::Text(format!("{{\"type\":\"error\",\"message\":\"{e}\"}}")))
                .await;
            drop(tx);
            let _ = send_task.await;
            return;
        }
    };

    // Snapshot-not-replay: the new subscriber sees where the job stands
    // right now, never the events that already happened.
    send_ws_message(&tx, &ServerMessage::snapshot(&snapshot)).await;

    let mut heartbeat = interval(WS_HEARTBEAT_INTERVAL);
    let mut missed_heartbeats: u32 = 0;

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(ProgressEvent { record, .. }) => {
                        metrics::record_ws_message_sent("progress", "progress");
                        let is_terminal = matches!(record, ProgressRecord::Error { .. });
                        if !send_ws_message(&tx, &ServerMessage::Progress(record)).await {
                            warn!(job = %job_id, "websocket send failed, client disconnected");
                            break;
                        }
                        if is_terminal {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(job = %job_id, skipped = n, "progress subscriber lagged, events dropped");
                    }
                }
            }
            _ = heartbeat.tick() => {
                missed_heartbeats += 1;
                if missed_heartbeats > WS_MAX_MISSED_HEARTBEATS {
                    warn!(job = %job_id, "heartbeat exceeded missed-beat budget, closing channel");
                    break;
                }
                if tx.send(Message::Ping(vec![])).await.is_err() {
                    break;
                }
            }
            client_msg = receiver.next() => {
                match client_msg {
                    Some(Ok(Message::Pong(_))) => {
                        missed_heartbeats = 0;
                    }
                    Some(Ok(Message::Text(text))) => {
                        missed_heartbeats = 0;
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(ClientMessage::Ping) => {
                                send_ws_message(&tx, &ServerMessage::pong()).await;
                            }
                            Ok(ClientMessage::Status) => {
                                if let Ok(job) = state.orchestrator.status(&job_id).await {
                                    send_ws_message(&tx, &ServerMessage::snapshot(&job)).await;
                                }
                            }
                            Err(_) => {}
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(job = %job_id, "client closed progress connection");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    drop(tx);
    let _ = send_task.await;
}
