//! Control messages
//!
//! Requests are JSON objects `{"type": ..., "payload": ...}` or short text
//! commands (`save door-1`, `status door-1`, `list`, `ping`).

use serde::{Deserialize, Serialize};

use crate::clip::{ClipJob, StoredClip};

/// Client request
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Save the buffered window as clip `id`
    SaveClip { id: String },
    /// Current state of the job for clip `id`
    JobStatus { id: String },
    ListClips,
    Ping,
}

impl ControlRequest {
    /// Name echoed in acks
    pub fn name(&self) -> &'static str {
        match self {
            ControlRequest::SaveClip { .. } => "save_clip",
            ControlRequest::JobStatus { .. } => "job_status",
            ControlRequest::ListClips => "list_clips",
            ControlRequest::Ping => "ping",
        }
    }
}

/// Server reply
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ControlReply {
    Ack(Ack),
    JobUpdate { job: ClipJob },
    Clips { clips: Vec<StoredClip> },
    Pong,
}

/// Acknowledgement of a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ack {
    /// Request name, or "unknown" for unparseable input
    pub request: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlReply {
    pub fn ok(request: &str, id: impl Into<String>) -> Self {
        ControlReply::Ack(Ack {
            request: request.to_string(),
            ok: true,
            id: Some(id.into()),
            error: None,
        })
    }

    pub fn error(request: &str, id: Option<String>, error: impl Into<String>) -> Self {
        ControlReply::Ack(Ack {
            request: request.to_string(),
            ok: false,
            id,
            error: Some(error.into()),
        })
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                r#"{{"type":"ack","payload":{{"request":"unknown","ok":false,"error":"{}"}}}}"#,
                e
            )
        })
    }
}

/// Parse one incoming message
pub fn parse_request(text: &str) -> Result<ControlRequest, String> {
    let text = text.trim();
    if text.is_empty() {
        return Err("empty message".to_string());
    }

    if text.starts_with('{') {
        return serde_json::from_str(text).map_err(|e| format!("invalid request: {}", e));
    }

    let (command, arg) = match text.split_once(char::is_whitespace) {
        Some((command, arg)) => (command, arg.trim()),
        None => (text, ""),
    };
    let with_id = |make: fn(String) -> ControlRequest| {
        if arg.is_empty() {
            Err(format!("'{}' needs a clip identifier", command))
        } else {
            Ok(make(arg.to_string()))
        }
    };

    match command.to_ascii_lowercase().as_str() {
        "save" | "save_clip" => with_id(|id| ControlRequest::SaveClip { id }),
        "status" | "job_status" => with_id(|id| ControlRequest::JobStatus { id }),
        "list" | "list_clips" => Ok(ControlRequest::ListClips),
        "ping" => Ok(ControlRequest::Ping),
        other => Err(format!("unknown command '{}'", other)),
    }
}
