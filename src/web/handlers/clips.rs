//! Clip endpoints

use axum::{
    body::Body,
    extract::{Path as AxumPath, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::info;

use crate::clip::{sanitize_clip_id, ClipJob, StoredClip};
use crate::error::{AppError, Result};
use crate::events::SystemEvent;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct TriggerRequest {
    pub id: String,
}

/// Start saving a clip; same as `save_clip` on the control socket
///
/// 202 with the job when accepted, 503 with the failed job when the buffer
/// holds no frames yet.
pub async fn trigger_clip(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TriggerRequest>,
) -> Result<(StatusCode, Json<ClipJob>)> {
    let job = state.finalizer.trigger(&req.id)?;
    let status = if job.is_terminal() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(job)))
}

/// Recent clip jobs, newest first
pub async fn list_jobs(State(state): State<Arc<AppState>>) -> Json<Vec<ClipJob>> {
    Json(state.finalizer.jobs())
}

pub async fn get_job(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<ClipJob>> {
    state
        .finalizer
        .job(&id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Job not found: {}", id)))
}

pub async fn list_clips(State(state): State<Arc<AppState>>) -> Result<Json<Vec<StoredClip>>> {
    Ok(Json(state.finalizer.store().list().await?))
}

/// Download a clip by file name, or by clip id (fast-start copy preferred)
pub async fn download_clip(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
) -> Result<Response> {
    let store = state.finalizer.store();
    let (clip, file) = match store.open(&name).await {
        Ok(found) => found,
        Err(AppError::NotFound(_)) => {
            let id = sanitize_clip_id(&name)
                .map_err(|_| AppError::NotFound(format!("Clip not found: {}", name)))?;
            let clip = store.resolve(&id).await?;
            store.open(&clip.filename).await?
        }
        Err(e) => return Err(e),
    };

    let mime = mime_guess::from_path(&clip.filename).first_or_octet_stream();
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, mime.to_string()),
            (header::CONTENT_LENGTH, clip.size_bytes.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", clip.filename),
            ),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

#[derive(Serialize)]
pub struct DeleteResponse {
    pub success: bool,
    pub files: Vec<String>,
}

/// Delete every file of a clip id; refused while the clip is being saved
pub async fn delete_clip(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<DeleteResponse>> {
    let clip_id = sanitize_clip_id(&id)?;
    let files = state.finalizer.delete_clip(&clip_id).await?;
    info!("Clip {} deleted via API", clip_id);
    state.events.publish(SystemEvent::ClipDeleted {
        clip_id,
        files: files.clone(),
    });
    Ok(Json(DeleteResponse {
        success: true,
        files,
    }))
}
