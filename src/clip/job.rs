//! Clip job records and the job table

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use tokio::sync::watch;

use crate::error::{AppError, Result};

/// Clip job lifecycle
///
/// `Pending -> Encoding -> Finalizing -> Done`, with `Failed` reachable from
/// every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Encoding,
    Finalizing,
    Done,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }

    fn can_advance_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Encoding)
                | (Encoding, Finalizing)
                | (Finalizing, Done)
                | (Pending | Encoding | Finalizing, Failed)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Encoding => "encoding",
            JobStatus::Finalizing => "finalizing",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Where a failed job stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    /// Buffer was empty at trigger time
    CaptureEmpty,
    /// Encoder could not produce an output file
    EncodeError,
    /// Output could not be verified or moved into place
    FinalizeError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClipFailure {
    pub stage: FailureStage,
    pub reason: String,
}

/// One clip save request and its progress
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipJob {
    pub id: String,
    pub requested_at: DateTime<Utc>,
    pub status: JobStatus,
    /// Frames captured in the snapshot
    pub frame_count: usize,
    /// Frames the encoder skipped as malformed
    pub skipped_frames: usize,
    /// Original encoded file
    pub output_path: Option<PathBuf>,
    /// Fast-start copy, present when remux succeeded
    pub finalized_path: Option<PathBuf>,
    pub size_bytes: Option<u64>,
    /// False when the job finished without a fast-start copy
    pub optimized: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<ClipFailure>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ClipJob {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            requested_at: Utc::now(),
            status: JobStatus::Pending,
            frame_count: 0,
            skipped_frames: 0,
            output_path: None,
            finalized_path: None,
            size_bytes: None,
            optimized: false,
            failure: None,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `next` if the transition is legal. Returns false otherwise.
    pub fn advance(&mut self, next: JobStatus) -> bool {
        if !self.status.can_advance_to(next) {
            return false;
        }
        self.status = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        true
    }

    /// Mark the job failed at `stage`
    pub fn fail(&mut self, stage: FailureStage, reason: impl Into<String>) -> bool {
        if !self.advance(JobStatus::Failed) {
            return false;
        }
        self.failure = Some(ClipFailure {
            stage,
            reason: reason.into(),
        });
        true
    }
}

struct JobEntry {
    job: ClipJob,
    tx: watch::Sender<ClipJob>,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<String, JobEntry>,
    /// Insertion order, oldest first
    order: VecDeque<String>,
}

/// In-memory table of recent clip jobs
///
/// In-flight jobs are always kept; finished jobs are evicted oldest first
/// once the table holds more than `history_limit` entries. At most
/// `pending_limit` jobs may be in flight at once.
pub struct JobTable {
    inner: RwLock<Inner>,
    history_limit: usize,
    pending_limit: usize,
}

impl JobTable {
    pub fn new(history_limit: usize, pending_limit: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            history_limit: history_limit.max(1),
            pending_limit: pending_limit.max(1),
        }
    }

    /// Register a new pending job
    ///
    /// Fails with `Conflict` if a job with the same id is still in flight,
    /// and with `ServiceUnavailable` when the pending limit is reached.
    /// A finished job with the same id is replaced.
    pub fn begin(&self, id: &str) -> Result<ClipJob> {
        let mut inner = self.inner.write();

        let replaces = match inner.jobs.get(id) {
            Some(existing) if !existing.job.is_terminal() => {
                return Err(AppError::Conflict(format!(
                    "clip '{}' is already being saved",
                    id
                )));
            }
            Some(_) => true,
            None => false,
        };

        let pending = inner.jobs.values().filter(|e| !e.job.is_terminal()).count();
        if pending >= self.pending_limit {
            return Err(AppError::ServiceUnavailable(format!(
                "{} clips are already being saved, try again later",
                pending
            )));
        }

        if replaces {
            inner.order.retain(|k| k != id);
        }

        let job = ClipJob::new(id);
        let (tx, _) = watch::channel(job.clone());
        inner.jobs.insert(
            id.to_string(),
            JobEntry {
                job: job.clone(),
                tx,
            },
        );
        inner.order.push_back(id.to_string());
        Self::evict(&mut inner, self.history_limit);

        Ok(job)
    }

    fn evict(inner: &mut Inner, limit: usize) {
        while inner.jobs.len() > limit {
            let victim = inner
                .order
                .iter()
                .position(|k| inner.jobs.get(k).map_or(true, |e| e.job.is_terminal()));
            let Some(pos) = victim else { break };
            if let Some(key) = inner.order.remove(pos) {
                inner.jobs.remove(&key);
            }
        }
    }

    /// Apply `f` to a job and notify watchers. Returns the updated job.
    pub fn update<F>(&self, id: &str, f: F) -> Option<ClipJob>
    where
        F: FnOnce(&mut ClipJob),
    {
        let mut inner = self.inner.write();
        let entry = inner.jobs.get_mut(id)?;
        f(&mut entry.job);
        entry.tx.send_replace(entry.job.clone());
        Some(entry.job.clone())
    }

    pub fn get(&self, id: &str) -> Option<ClipJob> {
        self.inner.read().jobs.get(id).map(|e| e.job.clone())
    }

    /// All retained jobs, newest first
    pub fn list(&self) -> Vec<ClipJob> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .rev()
            .filter_map(|k| inner.jobs.get(k).map(|e| e.job.clone()))
            .collect()
    }

    pub fn subscribe(&self, id: &str) -> Option<watch::Receiver<ClipJob>> {
        self.inner.read().jobs.get(id).map(|e| e.tx.subscribe())
    }

    pub fn in_flight(&self) -> usize {
        self.inner
            .read()
            .jobs
            .values()
            .filter(|e| !e.job.is_terminal())
            .count()
    }

    pub fn len(&self) -> usize {
        self.inner.read().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_transitions() {
        let mut job = ClipJob::new("a");
        assert!(!job.advance(JobStatus::Done));
        assert!(job.advance(JobStatus::Encoding));
        assert!(job.advance(JobStatus::Finalizing));
        assert!(job.advance(JobStatus::Done));
        assert!(job.finished_at.is_some());
        // Terminal states are final
        assert!(!job.fail(FailureStage::FinalizeError, "late"));
        assert_eq!(job.status, JobStatus::Done);
        assert!(job.failure.is_none());
    }

    #[test]
    fn test_fail_records_stage() {
        let mut job = ClipJob::new("b");
        assert!(job.fail(FailureStage::CaptureEmpty, "no frames available"));
        assert_eq!(job.status, JobStatus::Failed);
        let failure = job.failure.unwrap();
        assert_eq!(failure.stage, FailureStage::CaptureEmpty);
        assert_eq!(failure.reason, "no frames available");
    }

    #[test]
    fn test_conflict_while_in_flight() {
        let table = JobTable::new(8, 8);
        table.begin("clip").unwrap();
        assert!(matches!(table.begin("clip"), Err(AppError::Conflict(_))));

        table.update("clip", |j| {
            j.fail(FailureStage::EncodeError, "boom");
        });
        // Finished jobs can be retriggered
        let job = table.begin("clip").unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_history_keeps_in_flight() {
        let table = JobTable::new(2, 8);
        table.begin("running").unwrap();
        for id in ["a", "b", "c"] {
            table.begin(id).unwrap();
            table.update(id, |j| {
                j.fail(FailureStage::CaptureEmpty, "empty");
            });
        }
        let ids: Vec<String> = table.list().into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec!["c", "running"]);
        assert_eq!(table.in_flight(), 1);
    }

    #[test]
    fn test_pending_limit() {
        let table = JobTable::new(8, 2);
        table.begin("a").unwrap();
        table.begin("b").unwrap();
        assert!(matches!(
            table.begin("c"),
            Err(AppError::ServiceUnavailable(_))
        ));
        // Refused triggers leave no trace
        assert!(table.get("c").is_none());
        assert_eq!(table.len(), 2);

        table.update("a", |j| {
            j.fail(FailureStage::EncodeError, "boom");
        });
        table.begin("c").unwrap();
        assert_eq!(table.in_flight(), 2);
    }

    #[tokio::test]
    async fn test_subscribe_sees_updates() {
        let table = JobTable::new(4, 4);
        table.begin("w").unwrap();
        let mut rx = table.subscribe("w").unwrap();
        table.update("w", |j| {
            j.advance(JobStatus::Encoding);
        });
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().status, JobStatus::Encoding);
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&FailureStage::CaptureEmpty).unwrap();
        assert_eq!(json, "\"capture_empty\"");
        let json = serde_json::to_string(&JobStatus::Finalizing).unwrap();
        assert_eq!(json, "\"finalizing\"");
    }
}
