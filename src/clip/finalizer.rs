//! Clip finalizer
//!
//! Turns a trigger into a durable file:
//!
//! 1. snapshot the rolling buffer (empty -> `Failed(capture_empty)`, no file)
//! 2. encode on a blocking thread into a hidden temp file, then rename
//! 3. verify the output exists, warn if it is suspiciously small
//! 4. remux into a fast-start copy; failure leaves the original valid
//! 5. `Done` (optimized or not) or `Failed` with the stage that broke
//!
//! Jobs never run on the control path. Each job owns its snapshot and
//! output paths; a semaphore bounds how many encode at once.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::buffer::RollingClipBuffer;
use super::encoder::{ClipEncoder, EncodeParams};
use super::job::{ClipJob, FailureStage, JobStatus, JobTable};
use super::remux::Remuxer;
use super::store::{sanitize_clip_id, temp_path, ClipStore};
use crate::error::{AppError, Result};
use crate::events::{EventBus, SystemEvent};
use crate::media::MediaFrame;

/// Reason recorded when a trigger finds no buffered frames
pub const NO_FRAMES_REASON: &str = "no frames available";

#[derive(Debug, Clone)]
pub struct FinalizerConfig {
    /// Outputs smaller than this are kept but logged as suspicious
    pub min_clip_bytes: u64,
    /// Jobs allowed to encode at the same time
    pub max_concurrent_encodes: usize,
    /// Accepted jobs not yet finished; each holds its own snapshot
    pub max_pending_jobs: usize,
    /// Finished jobs kept for status queries
    pub job_history: usize,
}

impl Default for FinalizerConfig {
    fn default() -> Self {
        Self {
            min_clip_bytes: 1024,
            max_concurrent_encodes: 1,
            max_pending_jobs: 8,
            job_history: 64,
        }
    }
}

pub struct ClipFinalizer {
    buffer: Arc<RollingClipBuffer>,
    encoder: Arc<dyn ClipEncoder>,
    remuxer: Option<Arc<dyn Remuxer>>,
    store: Arc<ClipStore>,
    jobs: JobTable,
    permits: Arc<Semaphore>,
    config: FinalizerConfig,
    events: Option<Arc<EventBus>>,
}

impl ClipFinalizer {
    pub fn new(
        buffer: Arc<RollingClipBuffer>,
        encoder: Arc<dyn ClipEncoder>,
        remuxer: Option<Arc<dyn Remuxer>>,
        store: Arc<ClipStore>,
        config: FinalizerConfig,
    ) -> Self {
        Self {
            buffer,
            encoder,
            remuxer,
            store,
            jobs: JobTable::new(config.job_history, config.max_pending_jobs),
            permits: Arc::new(Semaphore::new(config.max_concurrent_encodes.max(1))),
            config,
            events: None,
        }
    }

    /// Publish job updates on `events`
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn store(&self) -> &Arc<ClipStore> {
        &self.store
    }

    pub fn buffer(&self) -> &Arc<RollingClipBuffer> {
        &self.buffer
    }

    pub fn encoder_name(&self) -> &'static str {
        self.encoder.name()
    }

    /// Start saving the buffered window under `raw_id`
    ///
    /// Returns the job as of acceptance. A trigger against an empty buffer
    /// returns an already failed job. Errors are `BadRequest` for an
    /// unusable identifier, `Conflict` if that clip is still being saved and
    /// `ServiceUnavailable` when too many clips are pending.
    pub fn trigger(self: &Arc<Self>, raw_id: &str) -> Result<ClipJob> {
        let id = sanitize_clip_id(raw_id)?;
        self.jobs.begin(&id)?;

        let frames = self.buffer.snapshot();
        if frames.is_empty() {
            warn!("Clip {} requested but the buffer is empty", id);
            let job = self.update(&id, |job| {
                job.fail(FailureStage::CaptureEmpty, NO_FRAMES_REASON);
            });
            return Ok(job.unwrap_or_else(|| ClipJob::new(&id)));
        }

        let frame_count = frames.len();
        let job = self
            .update(&id, |job| job.frame_count = frame_count)
            .unwrap_or_else(|| ClipJob::new(&id));
        info!("Clip {} accepted ({} frames)", id, frame_count);

        let finalizer = self.clone();
        tokio::spawn(async move { finalizer.run_job(id, frames).await });

        Ok(job)
    }

    async fn run_job(self: Arc<Self>, id: String, frames: Vec<MediaFrame>) {
        let Ok(permit) = self.permits.clone().acquire_owned().await else {
            self.fail(&id, FailureStage::EncodeError, "finalizer is shutting down");
            return;
        };

        self.update(&id, |job| {
            job.advance(JobStatus::Encoding);
        });

        let output = self.store.original_path(&id, self.encoder.extension());
        let temp = temp_path(&output);
        let geometry = self.buffer.geometry();
        let params = EncodeParams {
            resolution: geometry.resolution,
            format: geometry.format,
            fps: geometry.fps,
        };

        let encoder = self.encoder.clone();
        let encode_temp = temp.clone();
        let encoded =
            tokio::task::spawn_blocking(move || encoder.encode(&frames, &params, &encode_temp))
                .await;
        drop(permit);

        let report = match encoded {
            Ok(Ok(report)) => report,
            Ok(Err(e)) => {
                let _ = tokio::fs::remove_file(&temp).await;
                self.fail(&id, FailureStage::EncodeError, e.to_string());
                return;
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp).await;
                self.fail(&id, FailureStage::EncodeError, format!("encoder panicked: {}", e));
                return;
            }
        };
        if report.frames_skipped > 0 {
            warn!(
                "Clip {}: skipped {} malformed frames",
                id, report.frames_skipped
            );
        }

        self.update(&id, |job| {
            job.skipped_frames = report.frames_skipped;
            job.advance(JobStatus::Finalizing);
        });

        // A fast-start copy left by an earlier clip with this id would
        // shadow the new original
        match self.store.remove_finalized(&id).await {
            Ok(true) => debug!("Clip {}: removed previous fast-start copy", id),
            Ok(false) => {}
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp).await;
                self.fail(
                    &id,
                    FailureStage::FinalizeError,
                    format!("failed to remove previous fast-start copy: {}", e),
                );
                return;
            }
        }

        let size = match self.verify_and_commit(&temp, &output).await {
            Ok(size) => size,
            Err((stage, reason)) => {
                self.fail(&id, stage, reason);
                return;
            }
        };

        let finalized = self.remux(&id, &output).await;
        let optimized = finalized.is_some();

        self.update(&id, |job| {
            job.output_path = Some(output.clone());
            job.size_bytes = Some(size);
            job.finalized_path = finalized;
            job.optimized = optimized;
            job.advance(JobStatus::Done);
        });
        info!(
            "Clip {} saved: {} ({} bytes, {} frames{})",
            id,
            output.display(),
            size,
            report.frames_written,
            if optimized { ", fast-start" } else { ", unoptimized" }
        );
    }

    /// Check the encoder output and move it into place. Returns its size.
    async fn verify_and_commit(
        &self,
        temp: &Path,
        output: &Path,
    ) -> std::result::Result<u64, (FailureStage, String)> {
        let metadata = tokio::fs::metadata(temp).await.map_err(|e| {
            (
                FailureStage::EncodeError,
                format!("encoder produced no output: {}", e),
            )
        })?;

        if let Err(e) = tokio::fs::rename(temp, output).await {
            let _ = tokio::fs::remove_file(temp).await;
            return Err((
                FailureStage::FinalizeError,
                format!("failed to move clip into place: {}", e),
            ));
        }

        let size = metadata.len();
        if size <= self.config.min_clip_bytes {
            warn!(
                "Clip {} is only {} bytes, it may be unplayable",
                output.display(),
                size
            );
        }
        Ok(size)
    }

    /// Produce the fast-start copy. None when skipped or failed.
    async fn remux(&self, id: &str, output: &Path) -> Option<PathBuf> {
        let remuxer = self.remuxer.as_ref()?;
        let finalized = self.store.finalized_path(id);
        match remuxer.remux(output, &finalized).await {
            Ok(()) => {
                debug!("Clip {} remuxed to {}", id, finalized.display());
                Some(finalized)
            }
            Err(e) => {
                warn!("Clip {} remux failed, keeping original: {}", id, e);
                None
            }
        }
    }

    fn fail(&self, id: &str, stage: FailureStage, reason: impl Into<String>) {
        let reason = reason.into();
        warn!("Clip {} failed ({:?}): {}", id, stage, reason);
        self.update(id, |job| {
            job.fail(stage, reason);
        });
    }

    fn update<F: FnOnce(&mut ClipJob)>(&self, id: &str, f: F) -> Option<ClipJob> {
        let job = self.jobs.update(id, f)?;
        if let Some(events) = &self.events {
            events.publish(SystemEvent::ClipJobUpdated { job: job.clone() });
        }
        Some(job)
    }

    /// Job for a trigger identifier, raw or already sanitized
    pub fn job(&self, id: &str) -> Option<ClipJob> {
        let id = sanitize_clip_id(id).ok()?;
        self.jobs.get(&id)
    }

    /// Recent jobs, newest first
    pub fn jobs(&self) -> Vec<ClipJob> {
        self.jobs.list()
    }

    pub fn in_flight(&self) -> usize {
        self.jobs.in_flight()
    }

    /// Wait for a job to reach `Done` or `Failed`
    pub async fn await_job(&self, id: &str) -> Option<ClipJob> {
        let id = sanitize_clip_id(id).ok()?;
        let mut rx = self.jobs.subscribe(&id)?;
        let job = rx.wait_for(|job| job.is_terminal()).await.ok()?.clone();
        Some(job)
    }

    /// Like [`await_job`](Self::await_job) with a deadline
    pub async fn await_job_timeout(&self, id: &str, timeout: Duration) -> Option<ClipJob> {
        tokio::time::timeout(timeout, self.await_job(id))
            .await
            .ok()
            .flatten()
    }

    /// Delete every stored file of a clip
    ///
    /// Refused with `Conflict` while a job for the same id is in flight.
    pub async fn delete_clip(&self, raw_id: &str) -> Result<Vec<String>> {
        let id = sanitize_clip_id(raw_id)?;
        if self.jobs.get(&id).is_some_and(|job| !job.is_terminal()) {
            return Err(AppError::Conflict(format!(
                "Clip {} is still being saved",
                id
            )));
        }
        self.store.delete(&id).await
    }

    /// Wait until no job is in flight, up to `timeout`
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.in_flight() > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }
}
