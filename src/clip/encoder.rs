//! Clip encoder boundary

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use typeshare::typeshare;

use crate::error::Result;
use crate::media::{MediaFrame, PixelFormat, Resolution};

/// Target stream parameters for one clip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeParams {
    pub resolution: Resolution,
    pub format: PixelFormat,
    pub fps: u32,
}

/// What an encoder actually wrote
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EncodeReport {
    pub frames_written: usize,
    /// Frames dropped because they did not match the clip geometry
    pub frames_skipped: usize,
}

/// Turns an ordered frame snapshot into a playable file
///
/// `encode` is blocking and runs on a blocking thread. Mismatched frames are
/// skipped and reported, never fatal. An error means no usable output.
pub trait ClipEncoder: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// File extension of the produced container, without the dot
    fn extension(&self) -> &'static str;

    fn encode(&self, frames: &[MediaFrame], params: &EncodeParams, output: &Path)
        -> Result<EncodeReport>;
}

/// Selectable encoder backends
#[typeshare]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EncoderKind {
    /// In-process AVI writer, no external tools
    Builtin,
    /// Pipe frames into ffmpeg, H.264 MP4 output
    #[default]
    Ffmpeg,
}

impl std::str::FromStr for EncoderKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "builtin" | "avi" => Ok(EncoderKind::Builtin),
            "ffmpeg" => Ok(EncoderKind::Ffmpeg),
            _ => Err(format!("Unknown encoder: {}", s)),
        }
    }
}

/// Build the configured encoder
pub fn build_encoder(kind: EncoderKind, ffmpeg_path: impl Into<PathBuf>) -> Arc<dyn ClipEncoder> {
    match kind {
        EncoderKind::Builtin => Arc::new(super::avi::AviEncoder::new()),
        EncoderKind::Ffmpeg => Arc::new(super::ffmpeg::FfmpegEncoder::new(ffmpeg_path)),
    }
}

/// Split a snapshot into frames matching `params` and a skip count
pub(crate) fn matching_frames<'a>(
    frames: &'a [MediaFrame],
    params: &EncodeParams,
) -> (Vec<&'a MediaFrame>, usize) {
    let (good, bad): (Vec<&MediaFrame>, Vec<&MediaFrame>) = frames
        .iter()
        .partition(|f| f.matches_geometry(params.resolution, params.format));
    for frame in &bad {
        tracing::debug!(
            "Skipping frame #{} ({} bytes): does not match {} {}",
            frame.sequence,
            frame.len(),
            params.resolution,
            params.format
        );
    }
    (good, bad.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoder_kind_parse() {
        assert_eq!("AVI".parse::<EncoderKind>(), Ok(EncoderKind::Builtin));
        assert_eq!("ffmpeg".parse::<EncoderKind>(), Ok(EncoderKind::Ffmpeg));
        assert!("gstreamer".parse::<EncoderKind>().is_err());
        assert_eq!(EncoderKind::default(), EncoderKind::Ffmpeg);
    }

    #[test]
    fn test_build_encoder_extension() {
        assert_eq!(build_encoder(EncoderKind::Builtin, "ffmpeg").extension(), "avi");
        assert_eq!(build_encoder(EncoderKind::Ffmpeg, "ffmpeg").extension(), "mp4");
    }
}
