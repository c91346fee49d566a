//! Media capture
//!
//! A `CaptureLoop` owns one `CaptureSource` and runs it on a blocking
//! thread, feeding the relay's ingest channel and (for video) the rolling
//! clip buffer.

pub mod capture_loop;
pub mod source;

#[cfg(feature = "alsa")]
pub mod alsa_pcm;
#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use capture_loop::{CaptureLoop, CaptureState, CaptureStats, RetryPolicy};
pub use source::{CaptureSource, StillImageSource, TestPatternSource, ToneSource, WavLoopSource};

use crate::config::{AudioConfig, AudioSourceKind, VideoConfig, VideoSourceKind};
use crate::error::{AppError, Result};

fn required_device<'a>(device: &'a Option<String>, what: &str) -> Result<&'a str> {
    device
        .as_deref()
        .filter(|d| !d.is_empty())
        .ok_or_else(|| AppError::Config(format!("{} source needs `device` to be set", what)))
}

/// Open the configured video source
pub fn open_video_source(config: &VideoConfig) -> Result<Box<dyn CaptureSource>> {
    let resolution = config.resolution();
    match config.source {
        VideoSourceKind::TestPattern => Ok(Box::new(TestPatternSource::new(
            resolution,
            config.format,
            config.fps,
        )?)),
        VideoSourceKind::StillImage => {
            let path = required_device(&config.device, "still_image")?;
            Ok(Box::new(StillImageSource::open(
                path,
                resolution,
                config.format,
                config.fps,
            )?))
        }
        #[cfg(feature = "v4l2")]
        VideoSourceKind::V4l2 => {
            let path = required_device(&config.device, "v4l2")?;
            Ok(Box::new(v4l2::V4l2Source::open(
                path,
                resolution,
                config.format,
                config.fps,
            )?))
        }
        #[cfg(not(feature = "v4l2"))]
        VideoSourceKind::V4l2 => Err(AppError::Config(
            "Built without the `v4l2` feature".to_string(),
        )),
    }
}

/// Open the configured audio source
pub fn open_audio_source(config: &AudioConfig) -> Result<Box<dyn CaptureSource>> {
    match config.source {
        AudioSourceKind::Tone => Ok(Box::new(ToneSource::new(
            config.format(),
            config.chunk_samples,
            config.tone_hz,
        )?)),
        AudioSourceKind::Wav => {
            let path = required_device(&config.device, "wav")?;
            Ok(Box::new(WavLoopSource::open(path, config.chunk_samples)?))
        }
        #[cfg(feature = "alsa")]
        AudioSourceKind::Alsa => {
            let device = required_device(&config.device, "alsa")?;
            Ok(Box::new(alsa_pcm::AlsaSource::open(
                device,
                config.format(),
                config.chunk_samples,
            )?))
        }
        #[cfg(not(feature = "alsa"))]
        AudioSourceKind::Alsa => Err(AppError::Config(
            "Built without the `alsa` feature".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{FrameFormat, MediaKind, PixelFormat};

    #[test]
    fn test_open_default_sources() {
        let video = open_video_source(&VideoConfig::default()).unwrap();
        assert_eq!(video.kind(), MediaKind::Video);
        assert_eq!(video.name(), "test-pattern");

        let audio = open_audio_source(&AudioConfig::default()).unwrap();
        assert_eq!(
            audio.format(),
            FrameFormat::Audio(AudioConfig::default().format())
        );
    }

    #[test]
    fn test_open_requires_device() {
        let config = VideoConfig {
            source: VideoSourceKind::StillImage,
            format: PixelFormat::Mjpeg,
            ..Default::default()
        };
        assert!(matches!(open_video_source(&config), Err(AppError::Config(_))));

        let config = AudioConfig {
            source: AudioSourceKind::Wav,
            device: Some(String::new()),
            ..Default::default()
        };
        assert!(matches!(open_audio_source(&config), Err(AppError::Config(_))));
    }
}
