//! WebSocket handler for real-time event streaming
//!
//! This module provides a WebSocket endpoint at `/api/ws` that:
//! - Broadcasts system events to connected clients
//! - Supports topic-based event filtering
//! - Includes heartbeat (ping/pong) mechanism

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::events::SystemEvent;
use crate::state::AppState;

/// Client-to-server message
#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "payload")]
enum ClientMessage {
    /// Subscribe to event topics
    #[serde(rename = "subscribe")]
    Subscribe { topics: Vec<String> },

    /// Unsubscribe from event topics
    #[serde(rename = "unsubscribe")]
    Unsubscribe { topics: Vec<String> },

    /// Ping (keep-alive)
    #[serde(rename = "ping")]
    Ping,
}

/// WebSocket upgrade handler for `/api/ws`
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    // Subscribe to event bus
    let mut event_rx = state.events.subscribe();
    let mut shutdown_rx = state.shutdown_tx.subscribe();

    // Track subscribed topics (default: none until client subscribes)
    let mut subscribed_topics: Vec<String> = vec![];

    info!("Event WebSocket client connected");

    // Heartbeat interval (30 seconds)
    let mut heartbeat_interval = tokio::time::interval(tokio::time::Duration::from_secs(30));

    loop {
        tokio::select! {
            // Receive message from client
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = handle_client_message(&text, &mut subscribed_topics) {
                            warn!("Failed to handle client message: {}", e);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Event WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket receive error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            // Receive event from event bus
            event = event_rx.recv() => {
                match event {
                    Ok(event) => {
                        if should_send_event(&event, &subscribed_topics) {
                            if let Ok(json) = serde_json::to_string(&event) {
                                if sender.send(Message::Text(json)).await.is_err() {
                                    warn!("Failed to send event to client, disconnecting");
                                    break;
                                }
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("WebSocket client lagged by {} events", n);
                        let error_event = SystemEvent::SystemError {
                            module: "events".to_string(),
                            severity: "warning".to_string(),
                            message: format!("Lagged by {} events", n),
                        };
                        if let Ok(json) = serde_json::to_string(&error_event) {
                            let _ = sender.send(Message::Text(json)).await;
                        }
                    }
                    Err(_) => {
                        warn!("Event bus closed");
                        break;
                    }
                }
            }

            _ = shutdown_rx.recv() => break,

            // Heartbeat
            _ = heartbeat_interval.tick() => {
                if sender.send(Message::Ping(vec![])).await.is_err() {
                    warn!("Failed to send ping, disconnecting");
                    break;
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
    debug!("Event WebSocket handler exiting");
}

/// Handle message from client
fn handle_client_message(text: &str, topics: &mut Vec<String>) -> Result<(), serde_json::Error> {
    let msg: ClientMessage = serde_json::from_str(text)?;

    match msg {
        ClientMessage::Subscribe { topics: new_topics } => {
            info!("Client subscribed to topics: {:?}", new_topics);
            *topics = new_topics;
        }
        ClientMessage::Unsubscribe {
            topics: remove_topics,
        } => {
            topics.retain(|t| !remove_topics.contains(t));
            info!("Client unsubscribed from topics: {:?}", remove_topics);
        }
        ClientMessage::Ping => {
            debug!("Received ping from client");
        }
    }

    Ok(())
}

/// Check if an event should be sent based on subscribed topics
fn should_send_event(event: &SystemEvent, topics: &[String]) -> bool {
    topics.iter().any(|topic| event.matches_topic(topic))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaKind;

    fn viewer_event() -> SystemEvent {
        SystemEvent::ViewerConnected {
            session_id: "s1".to_string(),
            kind: MediaKind::Audio,
            viewers: 1,
        }
    }

    #[test]
    fn test_should_send_event() {
        let event = viewer_event();
        assert!(should_send_event(&event, &["*".to_string()]));
        assert!(should_send_event(&event, &["stream.*".to_string()]));
        assert!(should_send_event(
            &event,
            &["clip.*".to_string(), "stream.viewer_connected".to_string()]
        ));
        assert!(!should_send_event(&event, &["clip.*".to_string()]));
        assert!(!should_send_event(&event, &[]));
    }

    #[test]
    fn test_subscribe_unsubscribe() {
        let mut topics = Vec::new();
        handle_client_message(
            r#"{"type":"subscribe","payload":{"topics":["clip.*","stream.*"]}}"#,
            &mut topics,
        )
        .unwrap();
        assert_eq!(topics, vec!["clip.*", "stream.*"]);

        handle_client_message(
            r#"{"type":"unsubscribe","payload":{"topics":["stream.*"]}}"#,
            &mut topics,
        )
        .unwrap();
        assert_eq!(topics, vec!["clip.*"]);

        assert!(handle_client_message("{bad", &mut topics).is_err());
    }
}
