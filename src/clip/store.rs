//! Stored clip files
//!
//! Clips live as flat files in one directory:
//! - `{id}.{ext}` - the encoder output
//! - `{id}_finalized.mp4` - the fast-start copy
//!
//! In-progress writes use hidden `.{name}.partial` files which are never
//! listed. All metadata comes from the filesystem.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{AppError, Result};

/// Suffix of the fast-start copy's file stem
pub const FINALIZED_SUFFIX: &str = "_finalized";
/// Extension of the fast-start copy
pub const FINALIZED_EXT: &str = "mp4";
const PARTIAL_EXT: &str = "partial";
/// Maximum clip identifier length (characters)
pub const MAX_CLIP_ID_LEN: usize = 128;

/// One clip file on disk
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StoredClip {
    /// Identifier of the trigger that produced the file
    pub clip_id: String,
    pub filename: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    /// True for the fast-start copy
    pub finalized: bool,
}

/// Normalize a trigger identifier into a safe file stem
///
/// Path separators and reserved characters become `_`, control characters
/// and leading dots are removed, and the result is capped at 128 characters.
pub fn sanitize_clip_id(raw: &str) -> Result<String> {
    let replaced: String = raw
        .trim()
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | ' ' => '_',
            c => c,
        })
        .collect();

    let id: String = replaced
        .trim_start_matches('.')
        .chars()
        .take(MAX_CLIP_ID_LEN)
        .collect();

    if id.is_empty() {
        return Err(AppError::BadRequest(format!(
            "Invalid clip identifier: {:?}",
            raw
        )));
    }
    if id.ends_with(FINALIZED_SUFFIX) {
        return Err(AppError::BadRequest(format!(
            "Clip identifier must not end with '{}'",
            FINALIZED_SUFFIX
        )));
    }
    Ok(id)
}

/// Hidden temp path next to `path`: `dir/.{name}.partial`
pub fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}", name, PARTIAL_EXT))
}

/// Split a listed filename into (clip_id, finalized)
fn parse_filename(filename: &str) -> Option<(String, bool)> {
    if filename.starts_with('.') {
        return None;
    }
    let (stem, ext) = filename.rsplit_once('.')?;
    if stem.is_empty() || ext == PARTIAL_EXT {
        return None;
    }
    match stem.strip_suffix(FINALIZED_SUFFIX) {
        Some(id) if ext == FINALIZED_EXT && !id.is_empty() => Some((id.to_string(), true)),
        _ => Some((stem.to_string(), false)),
    }
}

fn system_time_to_utc(time: std::time::SystemTime) -> Option<DateTime<Utc>> {
    let d = time.duration_since(std::time::UNIX_EPOCH).ok()?;
    DateTime::from_timestamp(d.as_secs() as i64, d.subsec_nanos())
}

/// Flat-directory clip store
pub struct ClipStore {
    dir: PathBuf,
}

impl ClipStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the clip directory if needed
    pub async fn ensure_dir(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            AppError::Internal(format!(
                "Failed to create clip directory {}: {}",
                self.dir.display(),
                e
            ))
        })
    }

    /// Path of the encoder output for `id`
    pub fn original_path(&self, id: &str, extension: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", id, extension))
    }

    /// Path of the fast-start copy for `id`
    pub fn finalized_path(&self, id: &str) -> PathBuf {
        self.dir
            .join(format!("{}{}.{}", id, FINALIZED_SUFFIX, FINALIZED_EXT))
    }

    /// Remove the fast-start copy of `id`, if any. Returns whether one existed.
    pub async fn remove_finalized(&self, id: &str) -> Result<bool> {
        match tokio::fs::remove_file(self.finalized_path(id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn clip_info(&self, path: &Path) -> Option<StoredClip> {
        let filename = path.file_name()?.to_string_lossy().into_owned();
        let (clip_id, finalized) = parse_filename(&filename)?;
        let metadata = tokio::fs::metadata(path).await.ok()?;
        if !metadata.is_file() {
            return None;
        }

        let created_at = metadata
            .created()
            .or_else(|_| metadata.modified())
            .ok()
            .and_then(system_time_to_utc)
            .unwrap_or_else(Utc::now);

        Some(StoredClip {
            clip_id,
            filename,
            size_bytes: metadata.len(),
            created_at,
            finalized,
        })
    }

    /// All stored clip files, newest first
    pub async fn list(&self) -> Result<Vec<StoredClip>> {
        let mut clips = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(clips),
            Err(e) => {
                return Err(AppError::Internal(format!(
                    "Failed to read clip directory: {}",
                    e
                )))
            }
        };

        while let Some(entry) = entries.next_entry().await? {
            if let Some(info) = self.clip_info(&entry.path()).await {
                clips.push(info);
            }
        }

        clips.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.filename.cmp(&b.filename))
        });
        Ok(clips)
    }

    /// Metadata of one file by name
    pub async fn stat(&self, filename: &str) -> Result<StoredClip> {
        let path = self.checked_path(filename)?;
        self.clip_info(&path)
            .await
            .ok_or_else(|| AppError::NotFound(format!("Clip not found: {}", filename)))
    }

    /// Open a clip file for download
    pub async fn open(&self, filename: &str) -> Result<(StoredClip, tokio::fs::File)> {
        let clip = self.stat(filename).await?;
        let file = tokio::fs::File::open(self.dir.join(&clip.filename)).await?;
        Ok((clip, file))
    }

    /// Every file belonging to `id`
    pub async fn find(&self, id: &str) -> Result<Vec<StoredClip>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|c| c.clip_id == id)
            .collect())
    }

    /// Best file for `id`, preferring the fast-start copy
    pub async fn resolve(&self, id: &str) -> Result<StoredClip> {
        let clips = self.find(id).await?;
        clips
            .iter()
            .find(|c| c.finalized)
            .or_else(|| clips.first())
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Clip not found: {}", id)))
    }

    /// Delete every file belonging to `id`. Returns the removed filenames.
    pub async fn delete(&self, id: &str) -> Result<Vec<String>> {
        let clips = self.find(id).await?;
        if clips.is_empty() {
            return Err(AppError::NotFound(format!("Clip not found: {}", id)));
        }

        let mut removed = Vec::with_capacity(clips.len());
        for clip in clips {
            match tokio::fs::remove_file(self.dir.join(&clip.filename)).await {
                Ok(()) => removed.push(clip.filename),
                // Raced with another delete
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(AppError::Internal(format!(
                        "Failed to delete {}: {}",
                        clip.filename, e
                    )))
                }
            }
        }

        if removed.is_empty() {
            return Err(AppError::NotFound(format!("Clip not found: {}", id)));
        }
        info!("Deleted clip {}: {}", id, removed.join(", "));
        Ok(removed)
    }

    /// Total bytes used by stored clips
    pub async fn used_space(&self) -> u64 {
        self.list()
            .await
            .map(|clips| clips.iter().map(|c| c.size_bytes).sum())
            .unwrap_or(0)
    }

    /// Reject names that are not plain visible files in the clip directory
    fn checked_path(&self, filename: &str) -> Result<PathBuf> {
        let plain = !filename.is_empty()
            && !filename.starts_with('.')
            && !filename.contains(['/', '\\', '\0']);
        if !plain {
            return Err(AppError::BadRequest(format!(
                "Invalid clip filename: {}",
                filename
            )));
        }
        Ok(self.dir.join(filename))
    }
}
