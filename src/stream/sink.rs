//! Viewer transport boundary

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

/// Failure writing to a viewer
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("viewer disconnected")]
    Closed,

    #[error("write failed: {0}")]
    Write(String),
}

/// Per-viewer outbound byte transport
///
/// Implementations own the connection. A returned error is final: the
/// relay tears the session down and never writes to the sink again.
#[async_trait]
pub trait FrameSink: Send + 'static {
    async fn send(&mut self, data: Bytes) -> Result<(), SinkError>;

    /// Best-effort shutdown once the session closes
    async fn close(&mut self) {}
}

/// Sink backed by an mpsc sender
///
/// Used where another task owns the connection, like the MJPEG HTTP body
/// stream. Capacity 1 keeps at most one frame in flight per viewer.
pub struct ChannelSink {
    tx: mpsc::Sender<Bytes>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self { tx }
    }

    /// Create a sink and the receiver that drains it
    pub fn pair(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send(&mut self, data: Bytes) -> Result<(), SinkError> {
        self.tx.send(data).await.map_err(|_| SinkError::Closed)
    }
}
