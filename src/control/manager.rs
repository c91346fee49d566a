//! Control session manager
//!
//! Tracks connected control clients, turns their messages into clip jobs
//! and pushes a `job_update` to each client when a job it requested ends.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::message::{parse_request, ControlReply, ControlRequest};
use crate::clip::{ClipFinalizer, ClipJob};

/// Outbound queue depth per control session
const REPLY_QUEUE: usize = 32;

/// Snapshot of one control session
#[derive(Debug, Clone, Serialize)]
pub struct ControlSessionInfo {
    pub id: String,
    pub connected_at: DateTime<Utc>,
    pub messages_handled: u64,
    /// Clip ids requested by this session that have not finished yet
    pub pending_jobs: Vec<String>,
}

struct SessionEntry {
    info: ControlSessionInfo,
    notify: mpsc::Sender<ControlReply>,
}

/// One open control session as seen by its transport
pub struct ControlHandle {
    pub id: String,
    /// Asynchronous replies (job completions) for this session
    pub notifications: mpsc::Receiver<ControlReply>,
}

pub struct SessionManager {
    finalizer: Arc<ClipFinalizer>,
    sessions: RwLock<HashMap<String, SessionEntry>>,
}

impl SessionManager {
    pub fn new(finalizer: Arc<ClipFinalizer>) -> Arc<Self> {
        Arc::new(Self {
            finalizer,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    /// Register a new control session
    pub fn open(&self) -> ControlHandle {
        let id = uuid::Uuid::new_v4().to_string();
        let (notify, notifications) = mpsc::channel(REPLY_QUEUE);
        self.sessions.write().insert(
            id.clone(),
            SessionEntry {
                info: ControlSessionInfo {
                    id: id.clone(),
                    connected_at: Utc::now(),
                    messages_handled: 0,
                    pending_jobs: Vec::new(),
                },
                notify,
            },
        );
        info!("Control session {} opened", id);
        ControlHandle { id, notifications }
    }

    /// Forget a session; pending notifications for it are dropped
    pub fn close(&self, session_id: &str) {
        if let Some(entry) = self.sessions.write().remove(session_id) {
            info!(
                "Control session {} closed after {} messages",
                session_id, entry.info.messages_handled
            );
        }
    }

    pub fn sessions(&self) -> Vec<ControlSessionInfo> {
        self.sessions
            .read()
            .values()
            .map(|entry| entry.info.clone())
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Handle one raw message and produce the immediate reply
    ///
    /// Never fails: malformed input yields an error ack.
    pub async fn handle_message(self: &Arc<Self>, session_id: &str, text: &str) -> ControlReply {
        if let Some(entry) = self.sessions.write().get_mut(session_id) {
            entry.info.messages_handled += 1;
        }

        match parse_request(text) {
            Ok(request) => self.handle(session_id, request).await,
            Err(e) => {
                warn!("Control session {}: {}", session_id, e);
                ControlReply::error("unknown", None, e)
            }
        }
    }

    /// Handle one parsed request
    pub async fn handle(self: &Arc<Self>, session_id: &str, request: ControlRequest) -> ControlReply {
        let name = request.name();
        debug!("Control session {}: {}", session_id, name);

        match request {
            ControlRequest::SaveClip { id } => self.save_clip(session_id, &id),
            ControlRequest::JobStatus { id } => match self.finalizer.job(&id) {
                Some(job) => ControlReply::JobUpdate { job },
                None => ControlReply::error(name, Some(id), "job not found"),
            },
            ControlRequest::ListClips => match self.finalizer.store().list().await {
                Ok(clips) => ControlReply::Clips { clips },
                Err(e) => ControlReply::error(name, None, e.to_string()),
            },
            ControlRequest::Ping => ControlReply::Pong,
        }
    }

    fn save_clip(self: &Arc<Self>, session_id: &str, raw_id: &str) -> ControlReply {
        let job = match self.finalizer.trigger(raw_id) {
            Ok(job) => job,
            Err(e) => {
                warn!("Clip trigger {:?} rejected: {}", raw_id, e);
                return ControlReply::error("save_clip", Some(raw_id.to_string()), e.to_string());
            }
        };

        if let Some(failure) = job.failure.as_ref().filter(|_| job.is_terminal()) {
            return ControlReply::error("save_clip", Some(job.id.clone()), failure.reason.clone());
        }

        self.watch_job(session_id, &job);
        ControlReply::ok("save_clip", job.id)
    }

    /// Send a `job_update` to `session_id` when the job ends
    fn watch_job(self: &Arc<Self>, session_id: &str, job: &ClipJob) {
        let Some(notify) = self.sessions.write().get_mut(session_id).map(|entry| {
            entry.info.pending_jobs.push(job.id.clone());
            entry.notify.clone()
        }) else {
            return;
        };

        let manager = self.clone();
        let session_id = session_id.to_string();
        let job_id = job.id.clone();
        tokio::spawn(async move {
            let Some(job) = manager.finalizer.await_job(&job_id).await else {
                return;
            };
            if let Some(entry) = manager.sessions.write().get_mut(&session_id) {
                entry.info.pending_jobs.retain(|id| id != &job_id);
            }
            if notify.send(ControlReply::JobUpdate { job }).await.is_err() {
                debug!("Control session {} gone before job {} ended", session_id, job_id);
            }
        });
    }
}
