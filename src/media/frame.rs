//! Media frame data structures

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use typeshare::typeshare;

use super::format::{AudioFormat, PixelFormat, Resolution};

/// Minimum plausible JPEG size (bytes)
const MIN_JPEG_SIZE: usize = 125;

/// Kind of media carried by a frame
#[typeshare]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    /// Packet type byte used on the viewer wire protocol
    pub fn packet_type(&self) -> u8 {
        match self {
            MediaKind::Video => 0x01,
            MediaKind::Audio => 0x02,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Layout of a frame's payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    Video {
        resolution: Resolution,
        format: PixelFormat,
    },
    Audio(AudioFormat),
}

impl FrameFormat {
    pub fn kind(&self) -> MediaKind {
        match self {
            FrameFormat::Video { .. } => MediaKind::Video,
            FrameFormat::Audio(_) => MediaKind::Audio,
        }
    }
}

/// One unit of captured media: a video image or an audio chunk
///
/// Frames are immutable once produced. Cloning is cheap: the payload is
/// reference counted, so fan-out to many consumers never copies pixel data.
#[derive(Debug, Clone)]
pub struct MediaFrame {
    data: Bytes,
    format: FrameFormat,
    /// Frame sequence number (monotonic per capture loop)
    pub sequence: u64,
    /// Timestamp when frame was captured
    pub captured_at: Instant,
}

impl MediaFrame {
    /// Create a frame with an explicit format
    pub fn new(data: Bytes, format: FrameFormat, sequence: u64) -> Self {
        Self {
            data,
            format,
            sequence,
            captured_at: Instant::now(),
        }
    }

    /// Create a video frame
    pub fn video(data: Bytes, resolution: Resolution, format: PixelFormat, sequence: u64) -> Self {
        Self::new(data, FrameFormat::Video { resolution, format }, sequence)
    }

    /// Create an audio chunk
    pub fn audio(data: Bytes, format: AudioFormat, sequence: u64) -> Self {
        Self::new(data, FrameFormat::Audio(format), sequence)
    }

    pub fn kind(&self) -> MediaKind {
        self.format.kind()
    }

    pub fn format(&self) -> FrameFormat {
        self.format
    }

    /// Get frame data as bytes slice
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Get frame data as Bytes (cheap clone)
    pub fn data_bytes(&self) -> Bytes {
        self.data.clone()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Resolution of a video frame
    pub fn resolution(&self) -> Option<Resolution> {
        match self.format {
            FrameFormat::Video { resolution, .. } => Some(resolution),
            FrameFormat::Audio(_) => None,
        }
    }

    /// Pixel format of a video frame
    pub fn pixel_format(&self) -> Option<PixelFormat> {
        match self.format {
            FrameFormat::Video { format, .. } => Some(format),
            FrameFormat::Audio(_) => None,
        }
    }

    /// Get age of this frame (time since capture)
    pub fn age(&self) -> Duration {
        self.captured_at.elapsed()
    }

    /// Check if format is JPEG/MJPEG
    pub fn is_jpeg(&self) -> bool {
        matches!(self.pixel_format(), Some(PixelFormat::Mjpeg))
    }

    /// Validate JPEG frame data
    pub fn is_valid_jpeg(&self) -> bool {
        self.is_jpeg() && is_valid_jpeg(&self.data)
    }

    /// Check that a video frame matches the expected geometry
    ///
    /// Raw formats must carry exactly one full image; JPEG frames must carry
    /// SOI/EOI markers. Audio frames never match a video geometry.
    pub fn matches_geometry(&self, resolution: Resolution, format: PixelFormat) -> bool {
        let FrameFormat::Video {
            resolution: actual_res,
            format: actual_fmt,
        } = self.format
        else {
            return false;
        };

        if actual_res != resolution || actual_fmt != format {
            return false;
        }

        match format.frame_size(resolution) {
            Some(expected) => self.data.len() == expected,
            None => is_valid_jpeg(&self.data),
        }
    }
}

/// Validate JPEG frame data
pub fn is_valid_jpeg(data: &[u8]) -> bool {
    if data.len() < MIN_JPEG_SIZE {
        return false;
    }
    // Check JPEG header
    let start_marker = ((data[0] as u16) << 8) | data[1] as u16;
    if start_marker != 0xFFD8 {
        return false;
    }
    // Check JPEG end marker
    let end = data.len();
    let end_marker = ((data[end - 2] as u16) << 8) | data[end - 1] as u16;
    // Valid end markers: 0xFFD9, 0xD900, 0x0000 (padded)
    matches!(end_marker, 0xFFD9 | 0xD900 | 0x0000)
}

#[cfg(test)]
pub(crate) mod test_frames {
    use super::*;

    /// A synthetic JPEG-shaped payload (valid markers, filler body)
    pub fn fake_jpeg(len: usize, fill: u8) -> Bytes {
        let mut data = vec![0xFF, 0xD8];
        data.extend(std::iter::repeat(fill).take(len.saturating_sub(4)));
        data.extend([0xFF, 0xD9]);
        Bytes::from(data)
    }

    pub fn mjpeg_frame(sequence: u64) -> MediaFrame {
        MediaFrame::video(
            fake_jpeg(2048, (sequence % 251) as u8),
            Resolution::VGA,
            PixelFormat::Mjpeg,
            sequence,
        )
    }

    pub fn grey_frame(resolution: Resolution, sequence: u64) -> MediaFrame {
        let size = PixelFormat::Grey.frame_size(resolution).unwrap_or(0);
        MediaFrame::video(
            Bytes::from(vec![(sequence % 256) as u8; size]),
            resolution,
            PixelFormat::Grey,
            sequence,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::test_frames::*;
    use super::*;

    #[test]
    fn test_valid_jpeg() {
        assert!(is_valid_jpeg(&fake_jpeg(256, 0)));
        // Invalid - too small
        assert!(!is_valid_jpeg(&[0xFF, 0xD8, 0xFF, 0xD9]));
        // Invalid - wrong header
        let mut bad = vec![0x00, 0x00];
        bad.extend(vec![0u8; 200]);
        assert!(!is_valid_jpeg(&bad));
    }

    #[test]
    fn test_matches_geometry_raw() {
        let res = Resolution::new(32, 16);
        let frame = grey_frame(res, 1);
        assert!(frame.matches_geometry(res, PixelFormat::Grey));
        assert!(!frame.matches_geometry(Resolution::new(16, 16), PixelFormat::Grey));
        assert!(!frame.matches_geometry(res, PixelFormat::Yuyv));

        let truncated = MediaFrame::video(Bytes::from(vec![0u8; 10]), res, PixelFormat::Grey, 2);
        assert!(!truncated.matches_geometry(res, PixelFormat::Grey));
    }

    #[test]
    fn test_matches_geometry_jpeg_and_audio() {
        let frame = mjpeg_frame(7);
        assert!(frame.matches_geometry(Resolution::VGA, PixelFormat::Mjpeg));
        assert!(frame.is_valid_jpeg());

        let audio = MediaFrame::audio(Bytes::from(vec![0u8; 64]), AudioFormat::new(8000, 1), 0);
        assert_eq!(audio.kind(), MediaKind::Audio);
        assert!(!audio.matches_geometry(Resolution::VGA, PixelFormat::Mjpeg));
        assert!(audio.resolution().is_none());
    }
}
