//! Fast-start remux through an external tool

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use super::store::temp_path;
use crate::error::{AppError, Result};

/// Produces a second, fast-start copy of a finished clip
///
/// Implementations must leave `input` untouched whether they succeed or not.
#[async_trait]
pub trait Remuxer: Send + Sync + 'static {
    async fn remux(&self, input: &Path, output: &Path) -> Result<()>;
}

/// `ffmpeg -i IN -c copy -movflags +faststart OUT`
pub struct FfmpegRemuxer {
    binary: PathBuf,
    timeout: Duration,
}

impl FfmpegRemuxer {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    pub fn args(input: &Path, output: &Path) -> Vec<String> {
        vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-y".into(),
            "-i".into(),
            input.to_string_lossy().into_owned(),
            "-c".into(),
            "copy".into(),
            "-movflags".into(),
            "+faststart".into(),
            "-f".into(),
            "mp4".into(),
            output.to_string_lossy().into_owned(),
        ]
    }

    async fn run(&self, input: &Path, temp: &Path) -> Result<()> {
        let args = Self::args(input, temp);
        debug!("Running {} {}", self.binary.display(), args.join(" "));

        let child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AppError::Remux(format!("failed to start {}: {}", self.binary.display(), e))
            })?;

        // Dropping the child on timeout kills it
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| AppError::Remux(format!("timed out after {:?}", self.timeout)))?
            .map_err(|e| AppError::Remux(format!("wait failed: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = stderr.lines().last().unwrap_or("no output").trim().to_string();
            return Err(AppError::Remux(format!(
                "exited with {}: {}",
                output.status, detail
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Remuxer for FfmpegRemuxer {
    async fn remux(&self, input: &Path, output: &Path) -> Result<()> {
        let temp = temp_path(output);
        match self.run(input, &temp).await {
            Ok(()) => {
                tokio::fs::rename(&temp, output).await?;
                Ok(())
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp).await;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args() {
        let args = FfmpegRemuxer::args(Path::new("in.avi"), Path::new(".out.mp4.partial"));
        assert_eq!(
            args.join(" "),
            "-hide_banner -loglevel error -y -i in.avi -c copy -movflags +faststart -f mp4 .out.mp4.partial"
        );
    }

    #[tokio::test]
    async fn test_missing_binary_leaves_input() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("clip.avi");
        tokio::fs::write(&input, vec![7u8; 4096]).await.unwrap();
        let output = dir.path().join("clip_finalized.mp4");

        let remuxer = FfmpegRemuxer::new("/nonexistent/ffmpeg-binary", Duration::from_secs(5));
        let result = remuxer.remux(&input, &output).await;

        assert!(matches!(result, Err(AppError::Remux(_))));
        assert_eq!(tokio::fs::read(&input).await.unwrap().len(), 4096);
        assert!(!output.exists());
        assert!(!temp_path(&output).exists());
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_error() {
        // `false` ignores its arguments and exits 1
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("clip.avi");
        tokio::fs::write(&input, b"data").await.unwrap();

        let remuxer = FfmpegRemuxer::new("false", Duration::from_secs(5));
        let result = remuxer.remux(&input, &dir.path().join("out.mp4")).await;
        assert!(matches!(result, Err(AppError::Remux(_))));
    }
}
