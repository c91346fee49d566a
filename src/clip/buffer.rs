//! Rolling clip buffer
//!
//! Holds the most recent `buffer_seconds * fps` video frames so a trigger can
//! save what happened just before it fired.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::media::{MediaFrame, PixelFormat, Resolution};
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// Fixed-capacity ring of frames, oldest overwritten first
struct FrameRing {
    frames: Vec<Option<MediaFrame>>,
    capacity: usize,
    write_pos: usize,
    count: usize,
}

impl FrameRing {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: (0..capacity).map(|_| None).collect(),
            capacity,
            write_pos: 0,
            count: 0,
        }
    }

    fn push(&mut self, frame: MediaFrame) {
        self.frames[self.write_pos] = Some(frame);
        self.write_pos = (self.write_pos + 1) % self.capacity;
        if self.count < self.capacity {
            self.count += 1;
        }
    }

    /// Frames in capture order, oldest first
    fn ordered(&self) -> Vec<MediaFrame> {
        let start = (self.write_pos + self.capacity - self.count) % self.capacity;
        (0..self.count)
            .filter_map(|i| self.frames[(start + i) % self.capacity].clone())
            .collect()
    }

    fn clear(&mut self) {
        for frame in &mut self.frames {
            *frame = None;
        }
        self.write_pos = 0;
        self.count = 0;
    }
}

/// Expected geometry of buffered frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClipGeometry {
    pub resolution: Resolution,
    pub format: PixelFormat,
    pub fps: u32,
}

impl ClipGeometry {
    pub fn new(resolution: Resolution, format: PixelFormat, fps: u32) -> Self {
        Self {
            resolution,
            format,
            fps: fps.max(1),
        }
    }
}

/// Rolling window of recent video frames
///
/// Only the capture loop adds frames; the clip finalizer takes snapshots.
/// The lock is held just long enough to push one frame or clone the frame
/// handles, never across encoding.
pub struct RollingClipBuffer {
    ring: Mutex<FrameRing>,
    geometry: ClipGeometry,
    rejected: AtomicU64,
    throttler: LogThrottler,
}

impl RollingClipBuffer {
    /// Create a buffer holding `buffer_seconds` of video at the geometry's fps
    pub fn new(geometry: ClipGeometry, buffer_seconds: u32) -> Self {
        let capacity = buffer_seconds.max(1).saturating_mul(geometry.fps) as usize;
        Self::with_capacity(geometry, capacity)
    }

    pub fn with_capacity(geometry: ClipGeometry, capacity: usize) -> Self {
        Self {
            ring: Mutex::new(FrameRing::new(capacity)),
            geometry,
            rejected: AtomicU64::new(0),
            throttler: LogThrottler::new(Duration::from_secs(5)),
        }
    }

    /// Append a frame, evicting the oldest at capacity
    ///
    /// Frames that do not match the configured geometry are rejected and
    /// counted. Returns whether the frame was accepted.
    pub fn add_frame(&self, frame: MediaFrame) -> bool {
        let geometry = self.geometry;
        if !frame.matches_geometry(geometry.resolution, geometry.format) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            warn_throttled!(
                self.throttler,
                "clip_buffer_reject",
                "Rejected frame #{} for clip buffer: expected {} {}, got {:?} ({} bytes)",
                frame.sequence,
                geometry.resolution,
                geometry.format,
                frame.format(),
                frame.len()
            );
            return false;
        }

        self.ring.lock().push(frame);
        true
    }

    /// Ordered copy of the buffered frames, oldest first
    pub fn snapshot(&self) -> Vec<MediaFrame> {
        self.ring.lock().ordered()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.ring.lock().capacity
    }

    pub fn clear(&self) {
        self.ring.lock().clear();
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn geometry(&self) -> ClipGeometry {
        self.geometry
    }

    /// Seconds of video currently buffered
    pub fn buffered_secs(&self) -> f32 {
        self.len() as f32 / self.geometry.fps as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::frame::test_frames::{grey_frame, mjpeg_frame};
    use bytes::Bytes;
    use std::sync::Arc;

    fn grey_geometry() -> ClipGeometry {
        ClipGeometry::new(Resolution::new(16, 16), PixelFormat::Grey, 30)
    }

    #[test]
    fn test_snapshot_keeps_last_frames() {
        let geometry = grey_geometry();
        let buffer = RollingClipBuffer::with_capacity(geometry, 4);
        for seq in 1..=6 {
            assert!(buffer.add_frame(grey_frame(geometry.resolution, seq)));
        }

        let seqs: Vec<u64> = buffer.snapshot().iter().map(|f| f.sequence).collect();
        assert_eq!(seqs, vec![3, 4, 5, 6]);
    }

    #[test]
    fn test_warm_up_is_shorter() {
        let geometry = grey_geometry();
        let buffer = RollingClipBuffer::new(geometry, 4);
        assert_eq!(buffer.capacity(), 120);
        assert!(buffer.snapshot().is_empty());

        buffer.add_frame(grey_frame(geometry.resolution, 1));
        buffer.add_frame(grey_frame(geometry.resolution, 2));
        let seqs: Vec<u64> = buffer.snapshot().iter().map(|f| f.sequence).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn test_rejects_wrong_geometry() {
        let geometry = grey_geometry();
        let buffer = RollingClipBuffer::with_capacity(geometry, 4);

        assert!(!buffer.add_frame(grey_frame(Resolution::new(32, 16), 1)));
        assert!(!buffer.add_frame(mjpeg_frame(2)));
        let truncated = MediaFrame::video(
            Bytes::from(vec![0u8; 100]),
            geometry.resolution,
            PixelFormat::Grey,
            3,
        );
        assert!(!buffer.add_frame(truncated));

        assert_eq!(buffer.rejected_count(), 3);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_concurrent_snapshot_is_ordered() {
        let geometry = grey_geometry();
        let buffer = Arc::new(RollingClipBuffer::with_capacity(geometry, 32));

        let writer = {
            let buffer = buffer.clone();
            std::thread::spawn(move || {
                for seq in 0..5_000 {
                    buffer.add_frame(grey_frame(geometry.resolution, seq));
                }
            })
        };

        for _ in 0..500 {
            let snapshot = buffer.snapshot();
            assert!(snapshot.len() <= 32);
            for pair in snapshot.windows(2) {
                assert_eq!(pair[1].sequence, pair[0].sequence + 1);
            }
            for frame in &snapshot {
                // Every frame is whole and carries its own fill byte
                assert_eq!(frame.len(), 256);
                assert!(frame.data().iter().all(|b| *b == (frame.sequence % 256) as u8));
            }
        }

        writer.join().unwrap();
        assert_eq!(buffer.len(), 32);
    }
}
