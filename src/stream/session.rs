//! Viewer sessions
//!
//! A session is one connected viewer subscribed to one media kind. It owns
//! its own bounded queue, so a slow viewer only ever loses its own frames.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::channel::BoundedChannel;
use crate::events::ClientStats;
use crate::media::{MediaFrame, MediaKind};

/// Session ID type (UUID string)
pub type SessionId = String;

/// Viewer session lifecycle: `Connecting -> Streaming -> Closing -> Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Connecting,
    Streaming,
    Closing,
    Closed,
}

impl SessionState {
    fn can_advance_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Streaming) | (Connecting | Streaming, Closing) | (Closing, Closed)
        )
    }
}

/// How frames are framed before they reach the sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Binary viewer packet with a 13-byte header
    Packet,
    /// Payload bytes only (the transport adds its own framing)
    Raw,
}

/// Rolling window FPS calculator
#[derive(Debug, Clone)]
pub struct FpsCalculator {
    frame_times: VecDeque<Instant>,
    window: Duration,
}

impl FpsCalculator {
    /// Create a new FPS calculator with 1-second window
    pub fn new() -> Self {
        Self {
            frame_times: VecDeque::with_capacity(120),
            window: Duration::from_secs(1),
        }
    }

    pub fn record_frame(&mut self) {
        let now = Instant::now();
        self.frame_times.push_back(now);

        while let Some(&oldest) = self.frame_times.front() {
            if now.duration_since(oldest) > self.window {
                self.frame_times.pop_front();
            } else {
                break;
            }
        }
    }

    /// Frames recorded in the last window
    pub fn current_fps(&self) -> u32 {
        self.frame_times.len() as u32
    }
}

impl Default for FpsCalculator {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct SessionStats {
    last_activity: Instant,
    frames_sent: u64,
    fps: FpsCalculator,
}

/// Snapshot of a session for status APIs
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub kind: MediaKind,
    pub state: SessionState,
    pub fps: u32,
    pub frames_sent: u64,
    pub connected_secs: u64,
    pub idle_ms: u64,
    pub queued: usize,
    pub dropped: u64,
}

/// One connected viewer
pub struct ViewerSession {
    id: SessionId,
    kind: MediaKind,
    framing: Framing,
    connected_at: Instant,
    queue: BoundedChannel<MediaFrame>,
    state: watch::Sender<SessionState>,
    stats: Mutex<SessionStats>,
    cancel: CancellationToken,
}

impl ViewerSession {
    pub fn new(kind: MediaKind, framing: Framing, queue_capacity: usize) -> Self {
        let now = Instant::now();
        let (state, _) = watch::channel(SessionState::Connecting);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            framing,
            connected_at: now,
            queue: BoundedChannel::new(queue_capacity),
            state,
            stats: Mutex::new(SessionStats {
                last_activity: now,
                frames_sent: 0,
                fps: FpsCalculator::new(),
            }),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Move to `next` if legal. Returns false for backwards or repeated moves.
    pub fn advance(&self, next: SessionState) -> bool {
        self.state.send_if_modified(|current| {
            if current.can_advance_to(next) {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    /// Per-session frame queue
    pub fn queue(&self) -> &BoundedChannel<MediaFrame> {
        &self.queue
    }

    /// Token cancelled when either side wants the session gone
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Ask the session task to stop
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn record_frame_sent(&self) {
        let mut stats = self.stats.lock();
        stats.last_activity = Instant::now();
        stats.frames_sent += 1;
        stats.fps.record_frame();
    }

    pub fn frames_sent(&self) -> u64 {
        self.stats.lock().frames_sent
    }

    pub fn connected_duration(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Wait until the session reaches `Closed`
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == SessionState::Closed).await;
    }

    pub fn info(&self) -> SessionInfo {
        let stats = self.stats.lock();
        SessionInfo {
            id: self.id.clone(),
            kind: self.kind,
            state: self.state(),
            fps: stats.fps.current_fps(),
            frames_sent: stats.frames_sent,
            connected_secs: self.connected_at.elapsed().as_secs(),
            idle_ms: stats.last_activity.elapsed().as_millis() as u64,
            queued: self.queue.len(),
            dropped: self.queue.dropped_count(),
        }
    }

    pub fn client_stats(&self) -> ClientStats {
        let stats = self.stats.lock();
        ClientStats {
            id: self.id.clone(),
            kind: self.kind,
            fps: stats.fps.current_fps(),
            frames_sent: stats.frames_sent,
            connected_secs: self.connected_at.elapsed().as_secs(),
        }
    }
}

impl std::fmt::Debug for ViewerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewerSession")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine() {
        let session = ViewerSession::new(MediaKind::Video, Framing::Packet, 4);
        assert_eq!(session.state(), SessionState::Connecting);

        assert!(!session.advance(SessionState::Closed));
        assert!(session.advance(SessionState::Streaming));
        assert!(!session.advance(SessionState::Connecting));
        assert!(session.advance(SessionState::Closing));
        assert!(!session.advance(SessionState::Streaming));
        assert!(session.advance(SessionState::Closed));
        assert!(!session.advance(SessionState::Closing));
    }

    #[test]
    fn test_connecting_may_close_directly() {
        let session = ViewerSession::new(MediaKind::Audio, Framing::Packet, 4);
        assert!(session.advance(SessionState::Closing));
        assert!(session.advance(SessionState::Closed));
    }

    #[test]
    fn test_fps_calculator() {
        let mut calc = FpsCalculator::new();
        assert_eq!(calc.current_fps(), 0);

        calc.record_frame();
        calc.record_frame();
        calc.record_frame();
        assert_eq!(calc.current_fps(), 3);
    }

    #[tokio::test]
    async fn test_closed_resolves() {
        let session = std::sync::Arc::new(ViewerSession::new(MediaKind::Video, Framing::Raw, 1));
        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.closed().await })
        };
        session.advance(SessionState::Closing);
        session.advance(SessionState::Closed);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_info_counts_frames() {
        let session = ViewerSession::new(MediaKind::Video, Framing::Packet, 2);
        session.record_frame_sent();
        session.record_frame_sent();
        let info = session.info();
        assert_eq!(info.frames_sent, 2);
        assert_eq!(info.state, SessionState::Connecting);
        assert_eq!(session.client_stats().frames_sent, 2);
    }
}
