//! System event types
//!
//! Defines all event types that can be broadcast through the event bus.

use serde::{Deserialize, Serialize};

use crate::capture::CaptureState;
use crate::clip::ClipJob;
use crate::media::MediaKind;

/// Per-viewer statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientStats {
    /// Session ID
    pub id: String,
    pub kind: MediaKind,
    /// Frames sent in the last second
    pub fps: u32,
    pub frames_sent: u64,
    pub connected_secs: u64,
}

/// System event enumeration
///
/// Serialized as `{"event": "<name>", "data": {...}}`:
/// ```json
/// {
///   "event": "clip.job_updated",
///   "data": { "job": { "id": "door-1", "status": "encoding", ... } }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SystemEvent {
    // ============================================================================
    // Capture Events
    // ============================================================================
    /// Capture loop state changed
    #[serde(rename = "capture.state_changed")]
    CaptureStateChanged {
        kind: MediaKind,
        state: CaptureState,
        /// Source name (e.g. "test-pattern", "/dev/video0")
        source: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    // ============================================================================
    // Relay Events
    // ============================================================================
    #[serde(rename = "stream.viewer_connected")]
    ViewerConnected {
        session_id: String,
        kind: MediaKind,
        /// Viewers of this kind after the change
        viewers: usize,
    },

    #[serde(rename = "stream.viewer_disconnected")]
    ViewerDisconnected {
        session_id: String,
        kind: MediaKind,
        frames_sent: u64,
        connected_secs: u64,
        viewers: usize,
        /// Why the session ended: "client_closed", "write_failed", "write_timeout", "shutdown"
        reason: String,
    },

    // ============================================================================
    // Clip Events
    // ============================================================================
    /// A clip job was created or changed state
    #[serde(rename = "clip.job_updated")]
    ClipJobUpdated { job: ClipJob },

    /// Stored clip files were deleted
    #[serde(rename = "clip.deleted")]
    ClipDeleted {
        clip_id: String,
        files: Vec<String>,
    },

    // ============================================================================
    // System Events
    // ============================================================================
    #[serde(rename = "system.error")]
    SystemError {
        module: String,
        severity: String,
        message: String,
    },
}

impl SystemEvent {
    /// Get the event name (for filtering/routing)
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::CaptureStateChanged { .. } => "capture.state_changed",
            Self::ViewerConnected { .. } => "stream.viewer_connected",
            Self::ViewerDisconnected { .. } => "stream.viewer_disconnected",
            Self::ClipJobUpdated { .. } => "clip.job_updated",
            Self::ClipDeleted { .. } => "clip.deleted",
            Self::SystemError { .. } => "system.error",
        }
    }

    /// Check if event matches a topic pattern
    ///
    /// Supports wildcards: "clip.*" matches all clip events, "*" matches everything.
    pub fn matches_topic(&self, topic: &str) -> bool {
        if topic == "*" {
            return true;
        }

        let event_name = self.event_name();

        if let Some(prefix) = topic.strip_suffix(".*") {
            event_name
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('.'))
        } else {
            event_name == topic
        }
    }
}
