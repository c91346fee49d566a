//! Live relay
//!
//! # Components
//!
//! - `BoundedChannel` - drop-oldest queue between producer and consumers
//! - `BroadcastRelay` - viewer registry, per-kind dispatchers, session tasks
//! - `ViewerSession` - one connected viewer and its state machine
//! - `FrameSink` - outbound transport boundary

pub mod channel;
pub mod packet;
pub mod relay;
pub mod session;
pub mod sink;

pub use channel::BoundedChannel;
pub use packet::encode_packet;
pub use relay::{BroadcastRelay, CloseReason, RelayConfig, RelayStats};
pub use session::{Framing, SessionId, SessionInfo, SessionState, ViewerSession};
pub use sink::{ChannelSink, FrameSink, SinkError};
