//! MJPEG multipart viewer

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;

use crate::error::AppError;
use crate::media::{is_valid_jpeg, MediaKind};
use crate::state::AppState;
use crate::stream::{ChannelSink, Framing};

/// `multipart/x-mixed-replace` stream of the live MJPEG video
///
/// The viewer is an ordinary relay session with raw framing; the HTTP body
/// drains its sink. A dropped connection closes the receiver, the next
/// write fails and the relay tears the session down.
pub async fn mjpeg_stream(State(state): State<Arc<AppState>>) -> Response {
    if !state.mjpeg_available() {
        return AppError::ServiceUnavailable(
            "MJPEG stream needs an enabled MJPEG video source".to_string(),
        )
        .into_response();
    }

    // Capacity 1: at most one frame in flight per HTTP client
    let (sink, mut rx) = ChannelSink::pair(1);
    let (session, _task) = state
        .relay
        .attach(MediaKind::Video, Framing::Raw, sink, None);

    let body_stream = async_stream::stream! {
        let _session = session;
        while let Some(data) = rx.recv().await {
            if is_valid_jpeg(&data) {
                yield Ok::<Bytes, std::io::Error>(create_mjpeg_part(&data));
            }
        }
    };

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "multipart/x-mixed-replace; boundary=frame"),
            (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
            (header::PRAGMA, "no-cache"),
            (header::EXPIRES, "0"),
        ],
        Body::from_stream(body_stream),
    )
        .into_response()
}

/// Create MJPEG multipart frame bytes
fn create_mjpeg_part(jpeg_data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(128 + jpeg_data.len());

    buf.put_slice(b"--frame\r\n");
    buf.put_slice(b"Content-Type: image/jpeg\r\n");
    buf.put_slice(format!("Content-Length: {}\r\n", jpeg_data.len()).as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(jpeg_data);
    buf.put_slice(b"\r\n");

    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mjpeg_part_layout() {
        let part = create_mjpeg_part(&[0xFF, 0xD8, 1, 2, 0xFF, 0xD9]);
        let text = String::from_utf8_lossy(&part);
        assert!(text.starts_with("--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 6\r\n\r\n"));
        assert!(part.ends_with(&[0xFF, 0xD9, b'\r', b'\n']));
    }
}
