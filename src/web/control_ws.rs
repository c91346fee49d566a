//! Control session WebSocket (`/api/ws/control`)
//!
//! Each text message is one control request; each gets exactly one reply.
//! Job completion notices for jobs this session requested arrive later.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::state::AppState;

pub async fn control_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_control_socket(socket, state))
}

async fn handle_control_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let manager = state.control.clone();
    let mut handle = manager.open();
    let mut shutdown_rx = state.shutdown_tx.subscribe();

    let mut ping_interval = tokio::time::interval(std::time::Duration::from_secs(30));
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let reply = tokio::select! {
            msg = receiver.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(data))) => String::from_utf8_lossy(&data).into_owned(),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!("Control session {} receive error: {}", handle.id, e);
                        break;
                    }
                };
                manager.handle_message(&handle.id, &text).await
            }

            notification = handle.notifications.recv() => match notification {
                Some(reply) => reply,
                None => break,
            },

            _ = shutdown_rx.recv() => break,

            _ = ping_interval.tick() => {
                if sender.send(Message::Ping(vec![])).await.is_err() {
                    break;
                }
                continue;
            }
        };

        if sender.send(Message::Text(reply.to_json())).await.is_err() {
            debug!("Control session {} went away", handle.id);
            break;
        }
    }

    manager.close(&handle.id);
    let _ = sender.send(Message::Close(None)).await;
}
