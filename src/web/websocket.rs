//! Per-job WebSocket feed.
//!
//! A client gets the persisted log replayed as line events, then the
//! live event tail. History comes from the database read, the tail from
//! the broadcast channel; the read happens before subscribing, so the
//! replay is a consistent snapshot and the subscription picks up from
//! there. A slow client that overruns its channel gets a drop notice
//! instead of stalling the pipeline.

use axum::{
    extract::ws::{Message, WebSocket},
    extract::{Path, State, WebSocketUpgrade},
    response::IntoResponse,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use super::WebState;
use crate::core::JobEvent;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<WebState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, id))
}

async fn handle_socket(mut socket: WebSocket, state: WebState, job_id: String) {
    if state.ctx.store.get(&job_id).await.is_none() {
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    // Replay history first, then follow the live tail.
    let history = state.ctx.store.full_log(&job_id).await.unwrap_or_default();
    for line in history {
        if send_event(&mut socket, &JobEvent::line(line)).await.is_err() {
            return;
        }
    }
    let mut events = state.ctx.store.hub().subscribe(&job_id);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if send_event(&mut socket, &event).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    let notice = JobEvent::line(format!("[ripd] {missed} events dropped (slow client)"));
                    if send_event(&mut socket, &notice).await.is_err() {
                        break;
                    }
                }
                // Channel gone: the job was deleted
                Err(RecvError::Closed) => break,
            },
            msg = socket.recv() => match msg {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // feed is one-way; ignore client chatter
                Some(Err(e)) => {
                    debug!(error = %e, "WebSocket receive error");
                    break;
                }
            },
        }
    }

    debug!(job_id, "WebSocket connection closed");
}

async fn send_event(socket: &mut WebSocket, event: &JobEvent) -> Result<(), axum::Error> {
    let payload = serde_json::to_string(event)
        .unwrap_or_else(|_| r#"{"line":"[ripd] serialization error"}"#.to_string());
    socket.send(Message::Text(payload.into())).await
}
