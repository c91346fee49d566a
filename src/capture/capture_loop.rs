//! Capture loop
//!
//! Drives one `CaptureSource` on a blocking thread: read, stamp, hand off
//! to the relay and the clip buffer, sleep out the rest of the interval.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use typeshare::typeshare;

use super::source::CaptureSource;
use crate::clip::RollingClipBuffer;
use crate::error::{AppError, Result};
use crate::error_throttled;
use crate::events::{EventBus, SystemEvent};
use crate::media::{FrameFormat, MediaFrame, MediaKind};
use crate::stream::BoundedChannel;
use crate::utils::LogThrottler;

/// Longest single sleep, so a stop request is noticed quickly
const STOP_POLL: Duration = Duration::from_millis(50);

/// Capture loop state
#[typeshare]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureState {
    /// Not started, or stopped
    Stopped,
    /// Producing frames
    Running,
    /// Repeated read failures, retrying at reduced rate
    Degraded,
}

/// Retry timing after read failures
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Delay after an isolated failure
    pub retry_delay: Duration,
    /// Delay once degraded
    pub degraded_delay: Duration,
    /// Consecutive failures before degrading
    pub degrade_after: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_millis(100),
            degraded_delay: Duration::from_secs(1),
            degrade_after: 3,
        }
    }
}

/// Capture statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct CaptureStats {
    /// Current FPS (calculated)
    pub current_fps: f32,
    pub frames_captured: u64,
    pub read_errors: u64,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Owns one capture source and the thread that reads it
pub struct CaptureLoop {
    name: String,
    format: FrameFormat,
    interval: Duration,
    /// Present while stopped; moved into the worker while running
    source: Mutex<Option<Box<dyn CaptureSource>>>,
    output: Arc<BoundedChannel<MediaFrame>>,
    buffer: Option<Arc<RollingClipBuffer>>,
    events: Option<Arc<EventBus>>,
    policy: RetryPolicy,
    state: Arc<watch::Sender<CaptureState>>,
    stats: Arc<Mutex<CaptureStats>>,
    stop_flag: Arc<AtomicBool>,
    /// Next frame sequence; survives stop/start
    sequence: Arc<AtomicU64>,
    handle: tokio::sync::Mutex<Option<JoinHandle<Box<dyn CaptureSource>>>>,
}

impl CaptureLoop {
    /// Create a loop feeding `output`
    pub fn new(source: Box<dyn CaptureSource>, output: Arc<BoundedChannel<MediaFrame>>) -> Self {
        let (state, _) = watch::channel(CaptureState::Stopped);
        Self {
            name: source.name().to_string(),
            format: source.format(),
            interval: source.interval(),
            source: Mutex::new(Some(source)),
            output,
            buffer: None,
            events: None,
            policy: RetryPolicy::default(),
            state: Arc::new(state),
            stats: Arc::new(Mutex::new(CaptureStats::default())),
            stop_flag: Arc::new(AtomicBool::new(false)),
            sequence: Arc::new(AtomicU64::new(0)),
            handle: tokio::sync::Mutex::new(None),
        }
    }

    /// Also append video frames to a clip buffer
    pub fn with_clip_buffer(mut self, buffer: Arc<RollingClipBuffer>) -> Self {
        self.buffer = Some(buffer);
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> MediaKind {
        self.format.kind()
    }

    pub fn format(&self) -> FrameFormat {
        self.format
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn state(&self) -> CaptureState {
        *self.state.borrow()
    }

    /// Subscribe to state changes
    pub fn state_watch(&self) -> watch::Receiver<CaptureState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.state() != CaptureState::Stopped
    }

    /// Start capturing in background
    pub async fn start(&self) -> Result<()> {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            return Ok(());
        }
        let source = self.source.lock().take().ok_or_else(|| {
            AppError::Internal(format!("Capture source {} is not available", self.name))
        })?;

        info!(
            "Starting {} capture on {} (interval {:?})",
            self.kind(),
            self.name,
            self.interval
        );
        self.stop_flag.store(false, Ordering::SeqCst);

        let worker = Worker {
            source,
            output: self.output.clone(),
            buffer: self.buffer.clone(),
            events: self.events.clone(),
            policy: self.policy,
            state: self.state.clone(),
            stats: self.stats.clone(),
            stop_flag: self.stop_flag.clone(),
            sequence: self.sequence.clone(),
        };
        *handle = Some(tokio::task::spawn_blocking(move || worker.run()));
        Ok(())
    }

    /// Stop capturing and wait for the thread to exit
    pub async fn stop(&self) -> Result<()> {
        let Some(handle) = self.handle.lock().await.take() else {
            return Ok(());
        };

        info!("Stopping capture on {}", self.name);
        self.stop_flag.store(true, Ordering::SeqCst);

        let source = handle
            .await
            .map_err(|e| AppError::Internal(format!("Capture thread failed: {}", e)))?;
        *self.source.lock() = Some(source);
        Ok(())
    }
}

/// State moved into the capture thread
struct Worker {
    source: Box<dyn CaptureSource>,
    output: Arc<BoundedChannel<MediaFrame>>,
    buffer: Option<Arc<RollingClipBuffer>>,
    events: Option<Arc<EventBus>>,
    policy: RetryPolicy,
    state: Arc<watch::Sender<CaptureState>>,
    stats: Arc<Mutex<CaptureStats>>,
    stop_flag: Arc<AtomicBool>,
    sequence: Arc<AtomicU64>,
}

impl Worker {
    /// Main capture loop (runs in blocking thread). Hands the source back.
    fn run(mut self) -> Box<dyn CaptureSource> {
        let format = self.source.format();
        let kind = format.kind();
        let interval = self.source.interval();
        let self_paced = self.source.self_paced();
        let throttler = LogThrottler::with_secs(5);

        let mut frames_this_run = 0u64;
        let mut consecutive_failures = 0u32;
        let mut fps_frame_count = 0u64;
        let mut fps_window_start = Instant::now();

        self.set_state(CaptureState::Running, None);

        while !self.stop_flag.load(Ordering::Relaxed) {
            let started = Instant::now();

            let data = match self.source.read() {
                Ok(data) => data,
                Err(e) => {
                    consecutive_failures += 1;
                    {
                        let mut s = self.stats.lock();
                        s.read_errors += 1;
                        s.consecutive_failures = consecutive_failures;
                        s.last_error = Some(e.to_string());
                    }
                    error_throttled!(
                        throttler,
                        "capture_read",
                        "Capture read failed on {} ({} in a row): {}",
                        self.source.name(),
                        consecutive_failures,
                        e
                    );

                    let delay = if consecutive_failures >= self.policy.degrade_after {
                        if consecutive_failures == self.policy.degrade_after {
                            warn!(
                                "Capture on {} degraded after {} consecutive failures",
                                self.source.name(),
                                consecutive_failures
                            );
                            self.set_state(CaptureState::Degraded, Some(e.to_string()));
                        }
                        self.policy.degraded_delay
                    } else {
                        self.policy.retry_delay
                    };
                    self.sleep(delay);
                    continue;
                }
            };

            if consecutive_failures > 0 {
                if consecutive_failures >= self.policy.degrade_after {
                    info!(
                        "Capture on {} recovered after {} failures",
                        self.source.name(),
                        consecutive_failures
                    );
                    self.set_state(CaptureState::Running, None);
                }
                consecutive_failures = 0;
                throttler.clear("capture_read");
            }

            let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
            let frame = MediaFrame::new(data, format, sequence);
            frames_this_run += 1;

            if kind == MediaKind::Video {
                if let Some(buffer) = &self.buffer {
                    buffer.add_frame(frame.clone());
                }
            }
            self.output.put(frame);

            fps_frame_count += 1;
            {
                let mut s = self.stats.lock();
                s.frames_captured += 1;
                s.consecutive_failures = 0;
                let elapsed = fps_window_start.elapsed();
                if elapsed >= Duration::from_secs(1) {
                    s.current_fps = fps_frame_count as f32 / elapsed.as_secs_f32();
                    fps_frame_count = 0;
                    fps_window_start = Instant::now();
                } else if elapsed.as_millis() > 100 {
                    // Partial estimate if we have at least 100ms of data
                    s.current_fps = fps_frame_count as f32 / elapsed.as_secs_f32();
                }
            }

            if !self_paced {
                if let Some(rest) = interval.checked_sub(started.elapsed()) {
                    self.sleep(rest);
                }
            }
        }

        debug!(
            "Capture on {} stopped after {} frames",
            self.source.name(),
            frames_this_run
        );
        self.set_state(CaptureState::Stopped, None);
        self.stats.lock().current_fps = 0.0;
        self.source
    }

    /// Sleep that wakes early on stop
    fn sleep(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        loop {
            if self.stop_flag.load(Ordering::Relaxed) {
                return;
            }
            let Some(left) = deadline.checked_duration_since(Instant::now()) else {
                return;
            };
            if left.is_zero() {
                return;
            }
            std::thread::sleep(left.min(STOP_POLL));
        }
    }

    fn set_state(&self, next: CaptureState, error: Option<String>) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if !changed {
            return;
        }

        if let Some(events) = &self.events {
            events.publish(SystemEvent::CaptureStateChanged {
                kind: self.source.kind(),
                state: next,
                source: self.source.name().to_string(),
                error,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::source::TestPatternSource;
    use crate::clip::ClipGeometry;
    use crate::media::{PixelFormat, Resolution};
    use bytes::Bytes;
    use std::sync::atomic::AtomicU32;

    /// Fails a scripted number of reads, then succeeds
    struct FlakySource {
        fail_first: u32,
        reads: Arc<AtomicU32>,
    }

    impl CaptureSource for FlakySource {
        fn name(&self) -> &str {
            "flaky"
        }

        fn format(&self) -> FrameFormat {
            FrameFormat::Video {
                resolution: Resolution::new(4, 4),
                format: PixelFormat::Grey,
            }
        }

        fn interval(&self) -> Duration {
            Duration::from_millis(5)
        }

        fn read(&mut self) -> Result<Bytes> {
            let n = self.reads.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(AppError::capture("flaky", "device busy"))
            } else {
                Ok(Bytes::from(vec![n as u8; 16]))
            }
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            retry_delay: Duration::from_millis(5),
            degraded_delay: Duration::from_millis(40),
            degrade_after: 3,
        }
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_frames_reach_channel_and_buffer() {
        let res = Resolution::new(16, 16);
        let source = TestPatternSource::new(res, PixelFormat::Grey, 200).unwrap();
        let channel = Arc::new(BoundedChannel::new(4));
        let buffer = Arc::new(RollingClipBuffer::with_capacity(
            ClipGeometry::new(res, PixelFormat::Grey, 30),
            100,
        ));

        let capture = CaptureLoop::new(Box::new(source), channel.clone())
            .with_clip_buffer(buffer.clone());
        capture.start().await.unwrap();
        wait_for(|| buffer.len() >= 10).await;
        capture.stop().await.unwrap();

        assert_eq!(capture.state(), CaptureState::Stopped);
        assert!(channel.len() <= 4);

        // Buffer keeps strict capture order from sequence 0
        let seqs: Vec<u64> = buffer.snapshot().iter().map(|f| f.sequence).collect();
        assert_eq!(seqs[0], 0);
        for pair in seqs.windows(2) {
            assert_eq!(pair[1], pair[0] + 1);
        }
        assert!(capture.stats().frames_captured >= 10);
    }

    #[tokio::test]
    async fn test_degrades_and_recovers() {
        let reads = Arc::new(AtomicU32::new(0));
        let source = FlakySource {
            fail_first: 4,
            reads: reads.clone(),
        };
        let channel = Arc::new(BoundedChannel::new(64));
        let events = Arc::new(EventBus::new());
        let mut rx = events.subscribe();

        let capture = CaptureLoop::new(Box::new(source), channel.clone())
            .with_events(events.clone())
            .with_retry_policy(fast_policy());
        capture.start().await.unwrap();
        wait_for(|| channel.len() >= 2).await;
        capture.stop().await.unwrap();

        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SystemEvent::CaptureStateChanged { state, error, .. } = event {
                if state == CaptureState::Degraded {
                    assert!(error.unwrap().contains("device busy"));
                }
                states.push(state);
            }
        }
        assert_eq!(
            states,
            vec![
                CaptureState::Running,
                CaptureState::Degraded,
                CaptureState::Running,
                CaptureState::Stopped
            ]
        );

        let stats = capture.stats();
        assert_eq!(stats.read_errors, 4);
        assert_eq!(stats.consecutive_failures, 0);
        // Sequence numbers count frames, not reads
        assert_eq!(channel.try_get().unwrap().sequence, 0);
    }

    #[tokio::test]
    async fn test_isolated_failures_do_not_degrade() {
        let reads = Arc::new(AtomicU32::new(0));
        let source = FlakySource {
            fail_first: 2,
            reads: reads.clone(),
        };
        let channel = Arc::new(BoundedChannel::new(8));
        let capture = CaptureLoop::new(Box::new(source), channel.clone())
            .with_retry_policy(fast_policy());
        let mut state_rx = capture.state_watch();

        capture.start().await.unwrap();
        wait_for(|| channel.len() >= 1).await;
        assert_eq!(*state_rx.borrow_and_update(), CaptureState::Running);
        capture.stop().await.unwrap();
        assert_eq!(capture.stats().read_errors, 2);
    }

    #[tokio::test]
    async fn test_restart_reuses_source() {
        let res = Resolution::new(16, 16);
        let source = TestPatternSource::new(res, PixelFormat::Grey, 200).unwrap();
        let channel = Arc::new(BoundedChannel::new(2));
        let buffer = Arc::new(RollingClipBuffer::with_capacity(
            ClipGeometry::new(res, PixelFormat::Grey, 30),
            1000,
        ));
        let capture = CaptureLoop::new(Box::new(source), channel.clone())
            .with_clip_buffer(buffer.clone());

        capture.start().await.unwrap();
        // Second start is a no-op
        capture.start().await.unwrap();
        wait_for(|| buffer.len() >= 3).await;
        capture.stop().await.unwrap();
        let first_run = buffer.len();

        capture.start().await.unwrap();
        wait_for(|| buffer.len() >= first_run + 3).await;
        capture.stop().await.unwrap();
        assert!(!capture.is_running());

        // Sequence numbers keep rising across the restart
        let seqs: Vec<u64> = buffer.snapshot().iter().map(|f| f.sequence).collect();
        assert_eq!(seqs[0], 0);
        for pair in seqs.windows(2) {
            assert_eq!(pair[1], pair[0] + 1);
        }
    }
}
