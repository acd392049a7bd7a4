//! Browser WebSocket gateway.
//!
//! One socket binds to one session (id in the URL). Frames are parsed into
//! typed commands and forwarded to the session's bridge; envelopes flow
//! back through a bounded per-subscriber channel pumped by a send task.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use bytes::Bytes;
use companion_protocol::{BrowserCommand, Envelope, EventPayload, EventSource};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bridge::BridgeMsg;
use crate::state::Daemon;

const SUBSCRIBER_QUEUE: usize = 128;

/// Frames the send task can emit.
enum Outbound {
    Envelope(Box<Envelope>),
    Pong(Bytes),
}

/// `GET /ws/browser/{session_id}` upgrade handler. Auth ran in middleware.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(daemon): State<Arc<Daemon>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, session_id, daemon))
}

async fn handle_socket(socket: WebSocket, session_id: String, daemon: Arc<Daemon>) {
    let subscriber_id = companion_protocol::new_id();
    info!(
        component = "gateway",
        event = "gateway.socket.open",
        session_id = %session_id,
        subscriber_id = %subscriber_id,
        "Browser connected"
    );

    let (mut ws_tx, mut ws_rx) = socket.split();

    let Some(bridge) = daemon.bridge(&session_id) else {
        // Dormant or unknown session — one error frame, then close.
        let exists = daemon.store.get(&session_id).is_some();
        let envelope = Envelope::new(
            EventSource::WsBridge,
            Some(session_id.clone()),
            EventPayload::Error {
                message: if exists {
                    "session is not live; relaunch it first".into()
                } else {
                    "session not found".into()
                },
            },
        );
        if let Ok(json) = serde_json::to_string(&envelope) {
            let _ = ws_tx.send(Message::Text(json.into())).await;
        }
        let _ = ws_tx.close().await;
        return;
    };

    // Bridge → browser channel; overflow drops the subscriber bridge-side.
    let (envelope_tx, mut envelope_rx) = mpsc::channel::<Envelope>(SUBSCRIBER_QUEUE);
    bridge
        .send(BridgeMsg::Subscribe {
            subscriber_id: subscriber_id.clone(),
            tx: envelope_tx,
        })
        .await;

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(SUBSCRIBER_QUEUE);

    let send_task = tokio::spawn(async move {
        while let Some(out) = outbound_rx.recv().await {
            let result = match out {
                Outbound::Envelope(envelope) => match serde_json::to_string(&envelope) {
                    Ok(json) => ws_tx.send(Message::Text(json.into())).await,
                    Err(e) => {
                        warn!(
                            component = "gateway",
                            event = "gateway.serialize_error",
                            error = %e,
                            "Failed to serialize envelope"
                        );
                        continue;
                    }
                },
                Outbound::Pong(data) => ws_tx.send(Message::Pong(data)).await,
            };
            if result.is_err() {
                debug!(
                    component = "gateway",
                    event = "gateway.send_failed",
                    "WebSocket send failed, client disconnected"
                );
                break;
            }
        }
    });

    // Pump bridge envelopes into the socket writer.
    let pump_tx = outbound_tx.clone();
    let pump_task = tokio::spawn(async move {
        while let Some(envelope) = envelope_rx.recv().await {
            if pump_tx
                .send(Outbound::Envelope(Box::new(envelope)))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    // Browser → bridge read loop.
    while let Some(result) = ws_rx.next().await {
        let text = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Ping(data)) => {
                let _ = outbound_tx.send(Outbound::Pong(data)).await;
                continue;
            }
            Ok(Message::Close(_)) => {
                debug!(
                    component = "gateway",
                    event = "gateway.socket.client_close",
                    subscriber_id = %subscriber_id,
                    "Client sent close frame"
                );
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(
                    component = "gateway",
                    event = "gateway.socket.error",
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
        };

        let command: BrowserCommand = match serde_json::from_str(&text) {
            Ok(cmd) => cmd,
            Err(e) => {
                let envelope = Envelope::new(
                    EventSource::WsBridge,
                    Some(session_id.clone()),
                    EventPayload::Error {
                        message: format!("unrecognized frame: {e}"),
                    },
                );
                let _ = outbound_tx.send(Outbound::Envelope(Box::new(envelope))).await;
                continue;
            }
        };

        bridge
            .send(BridgeMsg::Browser {
                subscriber_id: subscriber_id.clone(),
                command,
            })
            .await;
    }

    bridge
        .send(BridgeMsg::Unsubscribe {
            subscriber_id: subscriber_id.clone(),
        })
        .await;
    pump_task.abort();
    send_task.abort();
    info!(
        component = "gateway",
        event = "gateway.socket.closed",
        session_id = %session_id,
        subscriber_id = %subscriber_id,
        "Browser disconnected"
    );
}
