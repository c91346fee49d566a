use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::capture::{self, CaptureLoop, CaptureState, CaptureStats};
use crate::clip::{
    build_encoder, ClipFinalizer, ClipGeometry, ClipStore, FfmpegRemuxer, Remuxer,
    RollingClipBuffer,
};
use crate::config::AppConfig;
use crate::control::SessionManager;
use crate::error::Result;
use crate::events::EventBus;
use crate::media::{MediaKind, PixelFormat};
use crate::stream::{BroadcastRelay, RelayStats};

/// Application-wide state shared across handlers
pub struct AppState {
    /// Effective configuration (file plus command line overrides)
    pub config: Arc<AppConfig>,
    /// Event bus for real-time notifications
    pub events: Arc<EventBus>,
    /// Live relay (viewer registry and dispatchers)
    pub relay: Arc<BroadcastRelay>,
    pub video: Option<Arc<CaptureLoop>>,
    pub audio: Option<Arc<CaptureLoop>>,
    pub clip_buffer: Arc<RollingClipBuffer>,
    pub finalizer: Arc<ClipFinalizer>,
    /// Control sessions
    pub control: Arc<SessionManager>,
    /// Shutdown signal sender
    pub shutdown_tx: broadcast::Sender<()>,
    dispatchers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    started_at: Instant,
}

/// One capture loop in `/api/stream/status`
#[derive(Debug, Serialize)]
pub struct CaptureStatus {
    pub source: String,
    pub state: CaptureState,
    pub stats: CaptureStats,
}

/// Rolling buffer fill in `/api/stream/status`
#[derive(Debug, Serialize)]
pub struct BufferStatus {
    pub frames: usize,
    pub capacity: usize,
    pub seconds: f32,
    pub rejected: u64,
}

#[derive(Debug, Serialize)]
pub struct StreamStatus {
    pub uptime_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video: Option<CaptureStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<CaptureStatus>,
    pub relay: RelayStats,
    pub buffer: BufferStatus,
    pub jobs_in_flight: usize,
    pub control_sessions: usize,
}

impl AppState {
    /// Wire every component from the configuration
    ///
    /// Opens the enabled capture sources; failure to open one is returned.
    /// Nothing runs until [`start`](Self::start).
    pub fn build(config: AppConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let config = Arc::new(config);
        let events = Arc::new(EventBus::new());
        let relay = BroadcastRelay::with_events(config.relay_config(), events.clone());

        let geometry = ClipGeometry::new(
            config.video.resolution(),
            config.video.format,
            config.video.fps,
        );
        let clip_buffer = Arc::new(RollingClipBuffer::new(
            geometry,
            config.clips.buffer_seconds,
        ));

        let video = if config.video.enabled {
            let source = capture::open_video_source(&config.video)?;
            let capture = CaptureLoop::new(source, relay.ingest(MediaKind::Video))
                .with_clip_buffer(clip_buffer.clone())
                .with_events(events.clone());
            Some(Arc::new(capture))
        } else {
            None
        };

        let audio = if config.audio.enabled {
            let source = capture::open_audio_source(&config.audio)?;
            let capture =
                CaptureLoop::new(source, relay.ingest(MediaKind::Audio)).with_events(events.clone());
            Some(Arc::new(capture))
        } else {
            None
        };

        let encoder = build_encoder(config.clips.encoder, &config.clips.ffmpeg_path);
        let remuxer = config.clips.remux.then(|| {
            Arc::new(FfmpegRemuxer::new(
                &config.clips.ffmpeg_path,
                Duration::from_secs(config.clips.remux_timeout_secs),
            )) as Arc<dyn Remuxer>
        });
        let finalizer = Arc::new(
            ClipFinalizer::new(
                clip_buffer.clone(),
                encoder,
                remuxer,
                Arc::new(ClipStore::new(&config.clips.dir)),
                config.finalizer_config(),
            )
            .with_events(events.clone()),
        );
        let control = SessionManager::new(finalizer.clone());
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Arc::new(Self {
            config,
            events,
            relay,
            video,
            audio,
            clip_buffer,
            finalizer,
            control,
            shutdown_tx,
            dispatchers: parking_lot::Mutex::new(Vec::new()),
            started_at: Instant::now(),
        }))
    }

    /// Start relay dispatchers and capture loops
    pub async fn start(&self) -> Result<()> {
        self.dispatchers.lock().extend(self.relay.start());
        for capture in self.captures() {
            capture.start().await?;
        }
        Ok(())
    }

    /// Stop capture, close viewers, wait for in-flight clip jobs
    pub async fn shutdown(&self, drain_timeout: Duration) {
        let _ = self.shutdown_tx.send(());
        for capture in self.captures() {
            if let Err(e) = capture.stop().await {
                warn!("Failed to stop capture {}: {}", capture.name(), e);
            }
        }
        self.relay.shutdown();
        let dispatchers: Vec<_> = self.dispatchers.lock().drain(..).collect();
        for handle in dispatchers {
            let _ = handle.await;
        }

        let in_flight = self.finalizer.in_flight();
        if in_flight > 0 {
            info!("Waiting for {} clip job(s) to finish", in_flight);
            if !self.finalizer.drain(drain_timeout).await {
                warn!(
                    "{} clip job(s) still running at shutdown",
                    self.finalizer.in_flight()
                );
            }
        }
    }

    fn captures(&self) -> impl Iterator<Item = &Arc<CaptureLoop>> {
        self.video.iter().chain(self.audio.iter())
    }

    /// The live video is MJPEG, so the multipart endpoint can serve it
    pub fn mjpeg_available(&self) -> bool {
        self.video.is_some() && self.config.video.format == PixelFormat::Mjpeg
    }

    pub fn stream_status(&self) -> StreamStatus {
        let capture_status = |capture: &Arc<CaptureLoop>| CaptureStatus {
            source: capture.name().to_string(),
            state: capture.state(),
            stats: capture.stats(),
        };
        StreamStatus {
            uptime_secs: self.started_at.elapsed().as_secs(),
            video: self.video.as_ref().map(capture_status),
            audio: self.audio.as_ref().map(capture_status),
            relay: self.relay.stats(),
            buffer: BufferStatus {
                frames: self.clip_buffer.len(),
                capacity: self.clip_buffer.capacity(),
                seconds: self.clip_buffer.buffered_secs(),
                rejected: self.clip_buffer.rejected_count(),
            },
            jobs_in_flight: self.finalizer.in_flight(),
            control_sessions: self.control.session_count(),
        }
    }
}
