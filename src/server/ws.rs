//! WebSocket monitoring endpoint.
//!
//! A client joins one task's event stream by sending
//! `{"event": "join_task", "task_uuid": "..."}` after connecting; the
//! server then pushes `{event, data}` envelopes for node updates, task
//! updates, logs, and browser URL changes. `ping` gets a `pong` reply;
//! unknown events are ignored by both sides.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::AppState;
use crate::events::DEFAULT_SUBSCRIBER_CAPACITY;

#[derive(Debug, Deserialize)]
struct ClientMessage {
    event: String,
    #[serde(default)]
    task_uuid: Option<String>,
}

pub(super) async fn ws_handler(
    State(state): State<AppState>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    // First, wait for the join message identifying the task to watch.
    let task_id = loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => match parse_client_message(&text) {
                Some(message) if message.event == "join_task" => match message.task_uuid {
                    Some(task_id) => break task_id,
                    None => {
                        let _ = socket
                            .send(Message::Text(
                                json!({
                                    "event": "error",
                                    "data": { "message": "join_task requires task_uuid" }
                                })
                                .to_string(),
                            ))
                            .await;
                    }
                },
                Some(message) if message.event == "ping" => {
                    let _ = socket
                        .send(Message::Text(json!({ "event": "pong" }).to_string()))
                        .await;
                }
                // Unknown events are ignored.
                _ => {}
            },
            Some(Ok(Message::Close(_))) | None => return,
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                debug!(%err, "websocket receive error before join");
                return;
            }
        }
    };

    debug!(task = %task_id, "websocket client joined task stream");
    let mut events = state
        .registry
        .bus()
        .subscribe(&task_id, DEFAULT_SUBSCRIBER_CAPACITY);
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let payload = match serde_json::to_string(&event) {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(%err, "failed to encode event");
                        continue;
                    }
                };
                if sink.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(message) = parse_client_message(&text) {
                            if message.event == "ping" {
                                let reply = json!({ "event": "pong" }).to_string();
                                if sink.send(Message::Text(reply)).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(%err, "websocket receive error");
                        break;
                    }
                }
            }
        }
    }
}

fn parse_client_message(text: &str) -> Option<ClientMessage> {
    serde_json::from_str(text).ok()
}
