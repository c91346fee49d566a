//! ffmpeg pipe encoder
//!
//! Streams the snapshot into an `ffmpeg` child over stdin and lets it write
//! an H.264 MP4. Runs on a blocking thread, so it uses `std::process`.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;

use super::encoder::{matching_frames, ClipEncoder, EncodeParams, EncodeReport};
use crate::error::{AppError, Result};
use crate::media::{MediaFrame, PixelFormat};

pub struct FfmpegEncoder {
    binary: PathBuf,
}

impl FfmpegEncoder {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Command line for one encode (excluding the binary)
    pub fn args(params: &EncodeParams, output: &Path) -> Vec<String> {
        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-y"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        if params.format == PixelFormat::Mjpeg {
            args.extend(["-f".into(), "mjpeg".into()]);
        } else {
            args.extend([
                "-f".into(),
                "rawvideo".into(),
                "-pix_fmt".into(),
                params.format.ffmpeg_pix_fmt().into(),
                "-video_size".into(),
                params.resolution.to_string(),
            ]);
        }
        args.extend([
            "-framerate".into(),
            params.fps.to_string(),
            "-i".into(),
            "pipe:0".into(),
            "-an".into(),
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            "veryfast".into(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            // Output name may carry a temp suffix, so the muxer is explicit
            "-f".into(),
            "mp4".into(),
            output.to_string_lossy().into_owned(),
        ]);
        args
    }
}

impl ClipEncoder for FfmpegEncoder {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn extension(&self) -> &'static str {
        "mp4"
    }

    fn encode(
        &self,
        frames: &[MediaFrame],
        params: &EncodeParams,
        output: &Path,
    ) -> Result<EncodeReport> {
        let (frames, skipped) = matching_frames(frames, params);
        if frames.is_empty() {
            return Err(AppError::Encode(format!(
                "no frame matches {} {}",
                params.resolution, params.format
            )));
        }

        let args = Self::args(params, output);
        debug!("Running {} {}", self.binary.display(), args.join(" "));

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                AppError::Encode(format!("failed to start {}: {}", self.binary.display(), e))
            })?;

        // stderr must be drained while stdin is written
        let stderr_reader = child.stderr.take().map(|mut stderr| {
            std::thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf);
                buf
            })
        });

        let mut written = 0;
        let mut write_error = None;
        if let Some(mut stdin) = child.stdin.take() {
            for frame in &frames {
                if let Err(e) = stdin.write_all(frame.data()) {
                    write_error = Some(e);
                    break;
                }
                written += 1;
            }
            // stdin dropped here, ffmpeg sees EOF
        }

        let status = child
            .wait()
            .map_err(|e| AppError::Encode(format!("ffmpeg wait failed: {}", e)))?;
        let stderr = stderr_reader
            .and_then(|reader| reader.join().ok())
            .unwrap_or_default();

        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr);
            let detail = stderr
                .lines()
                .rev()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .unwrap_or("no output")
                .to_string();
            return Err(AppError::Encode(format!(
                "ffmpeg exited with {}: {}",
                status, detail
            )));
        }
        if let Some(e) = write_error {
            return Err(AppError::Encode(format!("ffmpeg pipe closed early: {}", e)));
        }

        Ok(EncodeReport {
            frames_written: written,
            frames_skipped: skipped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::frame::test_frames::mjpeg_frame;
    use crate::media::Resolution;

    #[test]
    fn test_raw_args() {
        let params = EncodeParams {
            resolution: Resolution::VGA,
            format: PixelFormat::Yuyv,
            fps: 30,
        };
        let args = FfmpegEncoder::args(&params, Path::new("/tmp/.a.mp4.partial"));
        let joined = args.join(" ");
        assert!(joined.contains("-f rawvideo -pix_fmt yuyv422 -video_size 640x480"));
        assert!(joined.contains("-framerate 30 -i pipe:0"));
        assert!(joined.ends_with("-f mp4 /tmp/.a.mp4.partial"));
    }

    #[test]
    fn test_mjpeg_args() {
        let params = EncodeParams {
            resolution: Resolution::VGA,
            format: PixelFormat::Mjpeg,
            fps: 15,
        };
        let args = FfmpegEncoder::args(&params, Path::new("out.mp4"));
        assert!(args.join(" ").contains("-f mjpeg -framerate 15"));
        assert!(!args.contains(&"-video_size".to_string()));
    }

    #[test]
    fn test_missing_binary_is_encode_error() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = FfmpegEncoder::new("/nonexistent/ffmpeg-binary");
        let params = EncodeParams {
            resolution: Resolution::VGA,
            format: PixelFormat::Mjpeg,
            fps: 30,
        };
        let result = encoder.encode(&[mjpeg_frame(1)], &params, &dir.path().join("a.mp4"));
        assert!(matches!(result, Err(AppError::Encode(_))));
    }

    #[test]
    fn test_noisy_encoder_does_not_stall() {
        use std::os::unix::fs::PermissionsExt;

        // Floods stderr before reading any input, then fails
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-ffmpeg");
        std::fs::write(
            &script,
            "#!/bin/sh\nhead -c 262144 /dev/zero >&2\ncat > /dev/null\necho 'Invalid data found' >&2\nexit 1\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let encoder = FfmpegEncoder::new(&script);
        let params = EncodeParams {
            resolution: Resolution::VGA,
            format: PixelFormat::Mjpeg,
            fps: 30,
        };
        let frames: Vec<MediaFrame> = (0..200).map(mjpeg_frame).collect();
        match encoder.encode(&frames, &params, &dir.path().join("a.mp4")) {
            Err(AppError::Encode(msg)) => assert!(msg.contains("Invalid data found"), "{}", msg),
            other => panic!("expected encode error, got {:?}", other.map(|r| r.frames_written)),
        }
    }
}
