//! Broadcast relay
//!
//! Fans captured frames out to every connected viewer.
//!
//! ```text
//! capture loop --put--> ingest[kind] --dispatcher--> session.queue --session task--> sink
//! ```
//!
//! The capture loop only ever touches the ingest channel, so connecting or
//! dropping viewers never blocks it. Each session task drains its own queue
//! and writes with a timeout; a failing viewer is torn down alone.

use arc_swap::ArcSwap;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::channel::BoundedChannel;
use super::packet::encode_packet;
use super::session::{Framing, SessionId, SessionInfo, SessionState, ViewerSession};
use super::sink::FrameSink;
use crate::events::{ClientStats, EventBus, SystemEvent};
use crate::media::{MediaFrame, MediaKind};

/// Relay tuning
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Capacity of the video ingest channel and each video session queue
    pub video_capacity: usize,
    /// Capacity of the audio ingest channel and each audio session queue
    pub audio_capacity: usize,
    /// Per-write deadline for viewer sinks
    pub write_timeout: Duration,
    /// Bounded wait when a video queue is empty
    pub video_interval: Duration,
    /// Bounded wait when an audio queue is empty
    pub audio_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            video_capacity: 10,
            audio_capacity: 50,
            write_timeout: Duration::from_millis(2000),
            video_interval: Duration::from_millis(33),
            audio_interval: Duration::from_millis(23),
        }
    }
}

impl RelayConfig {
    fn capacity(&self, kind: MediaKind) -> usize {
        match kind {
            MediaKind::Video => self.video_capacity,
            MediaKind::Audio => self.audio_capacity,
        }
    }

    fn interval(&self, kind: MediaKind) -> Duration {
        match kind {
            MediaKind::Video => self.video_interval,
            MediaKind::Audio => self.audio_interval,
        }
    }
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    WriteFailed,
    WriteTimeout,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ClientClosed => "client_closed",
            CloseReason::WriteFailed => "write_failed",
            CloseReason::WriteTimeout => "write_timeout",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

/// Relay statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct RelayStats {
    pub video_viewers: usize,
    pub audio_viewers: usize,
    pub video_ingest_dropped: u64,
    pub audio_ingest_dropped: u64,
    pub sessions: Vec<SessionInfo>,
}

type Registry = HashMap<SessionId, Arc<ViewerSession>>;

/// Multi-viewer broadcast relay
pub struct BroadcastRelay {
    config: RelayConfig,
    sessions: ArcSwap<Registry>,
    video_ingest: Arc<BoundedChannel<MediaFrame>>,
    audio_ingest: Arc<BoundedChannel<MediaFrame>>,
    stream_start: Instant,
    shutdown: CancellationToken,
    events: Option<Arc<EventBus>>,
}

impl BroadcastRelay {
    pub fn new(config: RelayConfig) -> Arc<Self> {
        Self::build(config, None)
    }

    /// Create a relay that publishes viewer connect/disconnect events
    pub fn with_events(config: RelayConfig, events: Arc<EventBus>) -> Arc<Self> {
        Self::build(config, Some(events))
    }

    fn build(config: RelayConfig, events: Option<Arc<EventBus>>) -> Arc<Self> {
        Arc::new(Self {
            video_ingest: Arc::new(BoundedChannel::new(config.video_capacity)),
            audio_ingest: Arc::new(BoundedChannel::new(config.audio_capacity)),
            config,
            sessions: ArcSwap::from_pointee(HashMap::new()),
            stream_start: Instant::now(),
            shutdown: CancellationToken::new(),
            events,
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Ingest channel the capture loop of `kind` feeds
    pub fn ingest(&self, kind: MediaKind) -> Arc<BoundedChannel<MediaFrame>> {
        match kind {
            MediaKind::Video => self.video_ingest.clone(),
            MediaKind::Audio => self.audio_ingest.clone(),
        }
    }

    /// Spawn one dispatcher task per media kind
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        [MediaKind::Video, MediaKind::Audio]
            .into_iter()
            .map(|kind| {
                let relay = self.clone();
                tokio::spawn(async move { relay.dispatch_loop(kind).await })
            })
            .collect()
    }

    async fn dispatch_loop(self: Arc<Self>, kind: MediaKind) {
        let ingest = self.ingest(kind);
        let wait = self.config.interval(kind).max(Duration::from_millis(10));
        debug!("{} dispatcher started", kind);

        loop {
            let frame = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                frame = ingest.recv_timeout(wait) => frame,
            };
            if let Some(frame) = frame {
                self.dispatch(&frame);
            }
        }

        debug!("{} dispatcher stopped", kind);
    }

    /// Put a frame into every subscribed session's queue
    pub fn dispatch(&self, frame: &MediaFrame) -> usize {
        let sessions = self.sessions.load();
        let mut delivered = 0;
        for session in sessions.values() {
            if session.kind() == frame.kind() && session.state() != SessionState::Closing {
                session.queue().put(frame.clone());
                delivered += 1;
            }
        }
        delivered
    }

    /// Register interest in a media kind. The session starts in `Connecting`.
    pub fn register(&self, kind: MediaKind, framing: Framing) -> Arc<ViewerSession> {
        let session = Arc::new(ViewerSession::new(
            kind,
            framing,
            self.config.capacity(kind),
        ));

        let entry = session.clone();
        self.sessions.rcu(move |current| {
            let mut next = HashMap::clone(current);
            next.insert(entry.id().to_string(), entry.clone());
            next
        });

        let viewers = self.viewer_count(kind);
        info!("Viewer {} connected ({}, total: {})", session.id(), kind, viewers);
        self.publish(SystemEvent::ViewerConnected {
            session_id: session.id().to_string(),
            kind,
            viewers,
        });
        session
    }

    /// Remove a session from the registry
    pub fn unregister(&self, id: &str) -> Option<Arc<ViewerSession>> {
        let mut removed = None;
        self.sessions.rcu(|current| {
            let mut next = HashMap::clone(current);
            removed = next.remove(id);
            next
        });
        removed
    }

    /// Register a viewer and spawn its session task
    ///
    /// `preamble`, if given, is written before any frame and counts as the
    /// first successful write.
    pub fn attach<S: FrameSink>(
        self: &Arc<Self>,
        kind: MediaKind,
        framing: Framing,
        sink: S,
        preamble: Option<Bytes>,
    ) -> (Arc<ViewerSession>, JoinHandle<CloseReason>) {
        let session = self.register(kind, framing);
        let relay = self.clone();
        let task_session = session.clone();
        let handle =
            tokio::spawn(async move { relay.run_session(task_session, sink, preamble).await });
        (session, handle)
    }

    /// Drive one session until it closes
    pub async fn run_session<S: FrameSink>(
        self: Arc<Self>,
        session: Arc<ViewerSession>,
        mut sink: S,
        preamble: Option<Bytes>,
    ) -> CloseReason {
        let interval = self.config.interval(session.kind());

        let reason = 'run: {
            if let Some(preamble) = preamble {
                if let Err(reason) = self.write(&session, &mut sink, preamble).await {
                    break 'run reason;
                }
            }

            loop {
                let frame = tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => break 'run CloseReason::Shutdown,
                    _ = session.cancel_token().cancelled() => break 'run CloseReason::ClientClosed,
                    frame = session.queue().recv_timeout(interval) => frame,
                };
                let Some(frame) = frame else { continue };

                let data = match session.framing() {
                    Framing::Packet => encode_packet(&frame, self.stream_start),
                    Framing::Raw => frame.data_bytes(),
                };
                if let Err(reason) = self.write(&session, &mut sink, data).await {
                    break 'run reason;
                }
                session.record_frame_sent();
            }
        };

        self.close_session(&session, &mut sink, reason).await;
        reason
    }

    async fn write<S: FrameSink>(
        &self,
        session: &ViewerSession,
        sink: &mut S,
        data: Bytes,
    ) -> Result<(), CloseReason> {
        match tokio::time::timeout(self.config.write_timeout, sink.send(data)).await {
            Ok(Ok(())) => {
                if session.advance(SessionState::Streaming) {
                    debug!("Viewer {} streaming", session.id());
                }
                Ok(())
            }
            Ok(Err(e)) => {
                debug!("Viewer {} write failed: {}", session.id(), e);
                Err(CloseReason::WriteFailed)
            }
            Err(_) => {
                warn!(
                    "Viewer {} write timed out after {:?}",
                    session.id(),
                    self.config.write_timeout
                );
                Err(CloseReason::WriteTimeout)
            }
        }
    }

    async fn close_session<S: FrameSink>(
        &self,
        session: &Arc<ViewerSession>,
        sink: &mut S,
        reason: CloseReason,
    ) {
        session.advance(SessionState::Closing);
        self.unregister(session.id());
        session.queue().clear();
        session.close();
        sink.close().await;
        session.advance(SessionState::Closed);

        let duration_secs = session.connected_duration().as_secs_f32();
        let frames_sent = session.frames_sent();
        let avg_fps = if duration_secs > 0.1 {
            frames_sent as f32 / duration_secs
        } else {
            0.0
        };
        let viewers = self.viewer_count(session.kind());
        info!(
            "Viewer {} disconnected after {:.1}s ({} frames, {:.1} avg FPS, {})",
            session.id(),
            duration_secs,
            frames_sent,
            avg_fps,
            reason.as_str()
        );
        self.publish(SystemEvent::ViewerDisconnected {
            session_id: session.id().to_string(),
            kind: session.kind(),
            frames_sent,
            connected_secs: duration_secs as u64,
            viewers,
            reason: reason.as_str().to_string(),
        });
    }

    fn publish(&self, event: SystemEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }

    pub fn viewer_count(&self, kind: MediaKind) -> usize {
        self.sessions
            .load()
            .values()
            .filter(|s| s.kind() == kind)
            .count()
    }

    pub fn session(&self, id: &str) -> Option<Arc<ViewerSession>> {
        self.sessions.load().get(id).cloned()
    }

    pub fn client_stats(&self) -> HashMap<String, ClientStats> {
        self.sessions
            .load()
            .iter()
            .map(|(id, s)| (id.clone(), s.client_stats()))
            .collect()
    }

    pub fn stats(&self) -> RelayStats {
        let sessions = self.sessions.load();
        let mut infos: Vec<SessionInfo> = sessions.values().map(|s| s.info()).collect();
        infos.sort_by(|a, b| b.connected_secs.cmp(&a.connected_secs));
        RelayStats {
            video_viewers: infos.iter().filter(|s| s.kind == MediaKind::Video).count(),
            audio_viewers: infos.iter().filter(|s| s.kind == MediaKind::Audio).count(),
            video_ingest_dropped: self.video_ingest.dropped_count(),
            audio_ingest_dropped: self.audio_ingest.dropped_count(),
            sessions: infos,
        }
    }

    /// Stop dispatchers and every session task
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        for session in self.sessions.load().values() {
            session.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::frame::test_frames::mjpeg_frame;
    use crate::stream::sink::SinkError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSink {
        count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl FrameSink for CountingSink {
        async fn send(&mut self, _data: Bytes) -> Result<(), SinkError> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl FrameSink for FailingSink {
        async fn send(&mut self, _data: Bytes) -> Result<(), SinkError> {
            Err(SinkError::Write("broken pipe".to_string()))
        }
    }

    struct StallingSink;

    #[async_trait]
    impl FrameSink for StallingSink {
        async fn send(&mut self, _data: Bytes) -> Result<(), SinkError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn test_config() -> RelayConfig {
        RelayConfig {
            video_capacity: 4,
            audio_capacity: 4,
            write_timeout: Duration::from_millis(100),
            video_interval: Duration::from_millis(10),
            audio_interval: Duration::from_millis(10),
        }
    }

    async fn wait_until<F: Fn() -> bool>(check: F) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn test_poisoned_session_does_not_block_others() {
        let relay = BroadcastRelay::new(test_config());
        relay.start();

        let counters: Vec<Arc<AtomicUsize>> = (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();
        for count in &counters {
            relay.attach(
                MediaKind::Video,
                Framing::Packet,
                CountingSink { count: count.clone() },
                None,
            );
        }
        let (poisoned, poisoned_task) =
            relay.attach(MediaKind::Video, Framing::Packet, FailingSink, None);
        assert_eq!(relay.viewer_count(MediaKind::Video), 4);

        let ingest = relay.ingest(MediaKind::Video);
        for seq in 0..20 {
            ingest.put(mjpeg_frame(seq));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let reason = tokio::time::timeout(Duration::from_secs(1), poisoned_task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, CloseReason::WriteFailed);
        assert_eq!(poisoned.state(), SessionState::Closed);

        wait_until(|| counters.iter().all(|c| c.load(Ordering::SeqCst) >= 10)).await;
        assert_eq!(relay.viewer_count(MediaKind::Video), 3);
        relay.shutdown();
    }

    #[tokio::test]
    async fn test_first_write_moves_to_streaming() {
        let relay = BroadcastRelay::new(test_config());
        let count = Arc::new(AtomicUsize::new(0));
        let (session, _task) = relay.attach(
            MediaKind::Audio,
            Framing::Packet,
            CountingSink { count: count.clone() },
            Some(Bytes::from_static(b"{\"sample_rate\":44100}")),
        );

        wait_until(|| session.state() == SessionState::Streaming).await;
        // The preamble is not a frame
        assert_eq!(session.frames_sent(), 0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        relay.shutdown();
    }

    #[tokio::test]
    async fn test_stalled_writer_times_out() {
        let relay = BroadcastRelay::new(test_config());
        let (session, task) = relay.attach(MediaKind::Video, Framing::Raw, StallingSink, None);
        relay.dispatch(&mjpeg_frame(1));

        let reason = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, CloseReason::WriteTimeout);
        assert_eq!(session.state(), SessionState::Closed);
        assert!(relay.session(session.id()).is_none());
    }

    #[tokio::test]
    async fn test_client_close_and_kind_filter() {
        let relay = BroadcastRelay::new(test_config());
        let count = Arc::new(AtomicUsize::new(0));
        let (audio, task) = relay.attach(
            MediaKind::Audio,
            Framing::Packet,
            CountingSink { count: count.clone() },
            None,
        );

        // Video frames never reach an audio viewer
        assert_eq!(relay.dispatch(&mjpeg_frame(1)), 0);

        audio.close();
        let reason = task.await.unwrap();
        assert_eq!(reason, CloseReason::ClientClosed);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(relay.viewer_count(MediaKind::Audio), 0);
    }

    #[tokio::test]
    async fn test_events_published() {
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe();
        let relay = BroadcastRelay::with_events(test_config(), bus);

        let (_session, task) = relay.attach(MediaKind::Video, Framing::Packet, FailingSink, None);
        relay.dispatch(&mjpeg_frame(0));
        task.await.unwrap();

        assert!(matches!(
            rx.recv().await.unwrap(),
            SystemEvent::ViewerConnected { viewers: 1, .. }
        ));
        match rx.recv().await.unwrap() {
            SystemEvent::ViewerDisconnected { reason, viewers, .. } => {
                assert_eq!(reason, "write_failed");
                assert_eq!(viewers, 0);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
