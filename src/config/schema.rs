use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use typeshare::typeshare;

use crate::capture::source::{chunk_interval, frame_interval};
use crate::clip::{EncoderKind, FinalizerConfig};
use crate::error::{AppError, Result};
use crate::media::{AudioFormat, PixelFormat, Resolution};
use crate::stream::RelayConfig;

/// Longest rolling clip window; the ring is preallocated at startup
pub const MAX_BUFFER_SECONDS: u32 = 300;

/// Main application configuration
#[typeshare]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Video capture settings
    pub video: VideoConfig,
    /// Audio capture settings
    pub audio: AudioConfig,
    /// Live relay settings
    pub relay: RelaySettings,
    /// Clip recording settings
    pub clips: ClipsConfig,
    /// Web server settings
    pub web: WebConfig,
}

impl AppConfig {
    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.video.enabled {
            if !self.video.resolution().is_valid() {
                return Err(AppError::Config(format!(
                    "Invalid video resolution {}",
                    self.video.resolution()
                )));
            }
            if self.video.fps == 0 || self.video.fps > 120 {
                return Err(AppError::Config(format!(
                    "Video fps must be 1-120, got {}",
                    self.video.fps
                )));
            }
        }
        if self.audio.enabled {
            if self.audio.sample_rate == 0 || self.audio.channels == 0 {
                return Err(AppError::Config(format!(
                    "Invalid audio format {} Hz / {} ch",
                    self.audio.sample_rate, self.audio.channels
                )));
            }
            if self.audio.chunk_samples == 0 {
                return Err(AppError::Config("Audio chunk size must be positive".into()));
            }
        }
        if self.relay.video_capacity == 0 || self.relay.audio_capacity == 0 {
            return Err(AppError::Config("Channel capacities must be at least 1".into()));
        }
        if self.clips.buffer_seconds == 0 || self.clips.buffer_seconds > MAX_BUFFER_SECONDS {
            return Err(AppError::Config(format!(
                "Clip buffer must hold 1-{} seconds, got {}",
                MAX_BUFFER_SECONDS, self.clips.buffer_seconds
            )));
        }
        if self.clips.max_pending_jobs == 0 {
            return Err(AppError::Config("At least one pending clip job must be allowed".into()));
        }
        Ok(())
    }

    /// Runtime relay settings; empty-queue waits follow the capture intervals
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            video_capacity: self.relay.video_capacity,
            audio_capacity: self.relay.audio_capacity,
            write_timeout: Duration::from_millis(self.relay.write_timeout_ms),
            video_interval: frame_interval(self.video.fps),
            audio_interval: chunk_interval(self.audio.chunk_samples, self.audio.sample_rate),
        }
    }

    pub fn finalizer_config(&self) -> FinalizerConfig {
        FinalizerConfig {
            min_clip_bytes: self.clips.min_clip_bytes,
            max_concurrent_encodes: self.clips.max_concurrent_encodes,
            max_pending_jobs: self.clips.max_pending_jobs,
            job_history: self.clips.job_history,
        }
    }
}

/// Where video frames come from
#[typeshare]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoSourceKind {
    /// Generated color bars
    #[default]
    TestPattern,
    /// One image file repeated (`device` is the file path)
    StillImage,
    /// V4L2 camera (`device` is e.g. /dev/video0)
    V4l2,
}

/// Video capture configuration
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VideoConfig {
    pub enabled: bool,
    pub source: VideoSourceKind,
    /// Device path or image file, depending on `source`
    pub device: Option<String>,
    /// Pixel format (e.g. "YUYV", "MJPEG", "GREY")
    pub format: PixelFormat,
    /// Resolution width
    pub width: u32,
    /// Resolution height
    pub height: u32,
    /// Frame rate
    pub fps: u32,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            source: VideoSourceKind::TestPattern,
            device: None,
            format: PixelFormat::Yuyv,
            width: 640,
            height: 480,
            fps: 30,
        }
    }
}

impl VideoConfig {
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }
}

/// Where audio chunks come from
#[typeshare]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioSourceKind {
    /// Generated sine wave
    #[default]
    Tone,
    /// WAV file played in a loop (`device` is the file path)
    Wav,
    /// ALSA capture device (`device` is e.g. "hw:0,0")
    Alsa,
}

/// Audio capture configuration
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    pub enabled: bool,
    pub source: AudioSourceKind,
    /// ALSA device name or WAV path, depending on `source`
    pub device: Option<String>,
    pub sample_rate: u32,
    pub channels: u16,
    /// Sample frames per chunk
    pub chunk_samples: u32,
    /// Frequency of the generated tone
    pub tone_hz: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            source: AudioSourceKind::Tone,
            device: None,
            sample_rate: 44_100,
            channels: 1,
            chunk_samples: 1024,
            tone_hz: 440.0,
        }
    }
}

impl AudioConfig {
    pub fn format(&self) -> AudioFormat {
        AudioFormat::new(self.sample_rate, self.channels)
    }
}

/// Live relay configuration
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelaySettings {
    /// Video channel capacity (frames)
    pub video_capacity: usize,
    /// Audio channel capacity (chunks)
    pub audio_capacity: usize,
    /// Viewer write timeout in milliseconds
    pub write_timeout_ms: u64,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            video_capacity: 10,
            audio_capacity: 50,
            write_timeout_ms: 2000,
        }
    }
}

/// Clip recording configuration
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClipsConfig {
    /// Directory holding saved clips
    pub dir: PathBuf,
    /// Seconds of video kept for each trigger
    pub buffer_seconds: u32,
    /// Smaller outputs are kept but logged
    pub min_clip_bytes: u64,
    pub encoder: EncoderKind,
    /// ffmpeg binary used for encoding and remuxing
    pub ffmpeg_path: String,
    /// Produce a fast-start copy of each clip
    pub remux: bool,
    pub remux_timeout_secs: u64,
    pub max_concurrent_encodes: usize,
    /// Accepted jobs not yet finished; further triggers are refused
    pub max_pending_jobs: usize,
    /// Finished jobs kept for status queries
    pub job_history: usize,
}

impl Default for ClipsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./videos"),
            buffer_seconds: 4,
            min_clip_bytes: 1024,
            encoder: EncoderKind::Ffmpeg,
            ffmpeg_path: "ffmpeg".to_string(),
            remux: true,
            remux_timeout_secs: 30,
            max_concurrent_encodes: 1,
            max_pending_jobs: 8,
            job_history: 64,
        }
    }
}

/// Web server configuration
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WebConfig {
    /// HTTP port
    pub http_port: u16,
    /// Bind address
    pub bind_address: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            http_port: 8000,
            bind_address: "0.0.0.0".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.video.resolution(), Resolution::VGA);
        assert_eq!(config.video.fps, 30);
        assert_eq!(config.video.format, PixelFormat::Yuyv);
        assert_eq!(config.video.source, VideoSourceKind::TestPattern);
        assert_eq!(config.audio.format(), AudioFormat::new(44_100, 1));
        assert_eq!(config.audio.chunk_samples, 1024);
        assert_eq!(config.relay.video_capacity, 10);
        assert_eq!(config.relay.audio_capacity, 50);
        assert_eq!(config.clips.buffer_seconds, 4);
        assert_eq!(config.clips.min_clip_bytes, 1024);
        assert_eq!(config.clips.remux_timeout_secs, 30);
        assert_eq!(config.clips.encoder, EncoderKind::Ffmpeg);
        assert_eq!(config.clips.max_pending_jobs, 8);
        assert_eq!(config.clips.dir, PathBuf::from("./videos"));
        assert_eq!(config.web.http_port, 8000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [video]
            format = "GREY"
            fps = 15

            [clips]
            encoder = "builtin"
            dir = "/var/clips"
            "#,
        )
        .unwrap();

        assert_eq!(config.video.format, PixelFormat::Grey);
        assert_eq!(config.video.fps, 15);
        assert_eq!(config.video.width, 640);
        assert_eq!(config.clips.encoder, EncoderKind::Builtin);
        assert_eq!(config.clips.dir, PathBuf::from("/var/clips"));
        assert_eq!(config.clips.buffer_seconds, 4);
        assert_eq!(config.audio, AudioConfig::default());
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = AppConfig::default();
        config.audio.source = AudioSourceKind::Wav;
        config.audio.device = Some("/srv/loop.wav".into());
        let text = toml::to_string_pretty(&config).unwrap();
        assert!(text.contains("source = \"wav\""));
        let parsed: AppConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_relay_config_intervals() {
        let relay = AppConfig::default().relay_config();
        assert_eq!(relay.video_interval, Duration::from_micros(33_333));
        assert_eq!(relay.audio_interval, Duration::from_micros(23_219));
        assert_eq!(relay.write_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.video.fps = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.relay.audio_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.clips.buffer_seconds = u32::MAX;
        assert!(config.validate().is_err());
        config.clips.buffer_seconds = MAX_BUFFER_SECONDS;
        assert!(config.validate().is_ok());

        let mut config = AppConfig::default();
        config.clips.max_pending_jobs = 0;
        assert!(config.validate().is_err());

        // Disabled sections are not checked
        let mut config = AppConfig::default();
        config.audio.enabled = false;
        config.audio.sample_rate = 0;
        assert!(config.validate().is_ok());
    }
}
