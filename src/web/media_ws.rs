//! Viewer WebSockets (`/api/ws/video`, `/api/ws/audio`)
//!
//! The first message is a JSON text hello describing the stream. Every
//! following message is a binary packet:
//!
//! ```text
//! Byte 0:      Type (0x01 = video, 0x02 = audio)
//! Bytes 1-4:   Timestamp (u32 LE, milliseconds since relay start)
//! Bytes 5-8:   Sequence (u32 LE)
//! Bytes 9-12:  Data length (u32 LE)
//! Bytes 13+:   Frame payload
//! ```

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::media::MediaKind;
use crate::state::AppState;
use crate::stream::{FrameSink, Framing, SinkError};

/// Relay sink writing to the send half of a WebSocket
pub struct WsSink {
    sender: SplitSink<WebSocket, Message>,
    /// Send the next payload as a text message
    text_next: bool,
}

impl WsSink {
    pub fn new(sender: SplitSink<WebSocket, Message>) -> Self {
        Self {
            sender,
            text_next: false,
        }
    }

    /// Sink whose first payload (the hello) goes out as text
    pub fn with_text_preamble(sender: SplitSink<WebSocket, Message>) -> Self {
        Self {
            sender,
            text_next: true,
        }
    }
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, data: Bytes) -> Result<(), SinkError> {
        let message = if std::mem::take(&mut self.text_next) {
            Message::Text(String::from_utf8_lossy(&data).into_owned())
        } else {
            Message::Binary(data.into())
        };
        self.sender
            .send(message)
            .await
            .map_err(|e| SinkError::Write(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.sender.send(Message::Close(None)).await;
    }
}

/// Stream description sent before the first packet
fn hello(state: &AppState, kind: MediaKind) -> Bytes {
    let value = match kind {
        MediaKind::Video => {
            let video = &state.config.video;
            json!({
                "type": "hello",
                "kind": kind,
                "width": video.width,
                "height": video.height,
                "format": video.format,
                "fps": video.fps,
            })
        }
        MediaKind::Audio => {
            let audio = &state.config.audio;
            json!({
                "type": "hello",
                "kind": kind,
                "sample_rate": audio.sample_rate,
                "channels": audio.channels,
                "format": "s16le",
                "chunk_samples": audio.chunk_samples,
            })
        }
    };
    Bytes::from(value.to_string())
}

pub async fn video_ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_media_socket(socket, state, MediaKind::Video))
}

pub async fn audio_ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_media_socket(socket, state, MediaKind::Audio))
}

async fn handle_media_socket(socket: WebSocket, state: Arc<AppState>, kind: MediaKind) {
    let capture_enabled = match kind {
        MediaKind::Video => state.video.is_some(),
        MediaKind::Audio => state.audio.is_some(),
    };
    let (mut sender, mut receiver) = socket.split();

    if !capture_enabled {
        warn!("{} capture disabled, rejecting viewer", kind);
        let _ = sender
            .send(Message::Text(
                json!({ "error": format!("{} capture is disabled", kind) }).to_string(),
            ))
            .await;
        let _ = sender.send(Message::Close(None)).await;
        return;
    }

    let (session, task) = state.relay.attach(
        kind,
        Framing::Packet,
        WsSink::with_text_preamble(sender),
        Some(hello(&state, kind)),
    );
    let session_id = session.id().to_string();
    info!("{} viewer {} connected", kind, session_id);

    // The relay task owns the send half; this loop only watches for hang-up
    loop {
        tokio::select! {
            _ = session.cancel_token().cancelled() => break,
            msg = receiver.next() => match msg {
                Some(Ok(Message::Close(_))) | None => {
                    debug!("Viewer {} requested close", session_id);
                    session.close();
                    break;
                }
                Some(Err(e)) => {
                    debug!("Viewer {} receive error: {}", session_id, e);
                    session.close();
                    break;
                }
                Some(Ok(Message::Text(text))) => {
                    debug!("Ignoring text from viewer {}: {}", session_id, text);
                }
                Some(Ok(_)) => {}
            },
        }
    }

    match task.await {
        Ok(reason) => debug!("Viewer {} task ended: {}", session_id, reason.as_str()),
        Err(e) => warn!("Viewer {} task failed: {}", session_id, e),
    }
}
