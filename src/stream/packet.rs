//! Binary viewer packet framing
//!
//! Each frame relayed to a WebSocket viewer is one binary message:
//!
//! ```text
//! Byte 0:      Type (0x01 = video, 0x02 = audio)
//! Bytes 1-4:   Timestamp (u32 LE, milliseconds since stream start)
//! Bytes 5-8:   Sequence (u32 LE, wraps)
//! Bytes 9-12:  Data length (u32 LE)
//! Bytes 13+:   Payload
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use std::time::Instant;

use crate::media::MediaFrame;

/// Header size in bytes
pub const PACKET_HEADER_LEN: usize = 13;

/// Encode a frame into a viewer packet
pub fn encode_packet(frame: &MediaFrame, stream_start: Instant) -> Bytes {
    let timestamp_ms = frame
        .captured_at
        .saturating_duration_since(stream_start)
        .as_millis() as u32;

    let mut buf = BytesMut::with_capacity(PACKET_HEADER_LEN + frame.len());
    buf.put_u8(frame.kind().packet_type());
    buf.put_u32_le(timestamp_ms);
    buf.put_u32_le(frame.sequence as u32);
    buf.put_u32_le(frame.len() as u32);
    buf.put_slice(frame.data());
    buf.freeze()
}
