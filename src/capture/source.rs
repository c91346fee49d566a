//! Capture sources
//!
//! A source produces one video frame or one audio chunk per `read()` call.
//! Sources are synchronous and owned by exactly one capture loop.

use bytes::{BufMut, Bytes, BytesMut};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{AppError, Result};
use crate::media::{is_valid_jpeg, AudioFormat, FrameFormat, MediaKind, PixelFormat, Resolution};

/// A device (or synthetic generator) that yields media payloads
pub trait CaptureSource: Send + 'static {
    /// Human readable source name, used in logs and events
    fn name(&self) -> &str;

    /// Layout of every payload returned by `read`
    fn format(&self) -> FrameFormat;

    fn kind(&self) -> MediaKind {
        self.format().kind()
    }

    /// Target interval between reads
    fn interval(&self) -> Duration;

    /// Read one frame or chunk. Errors are treated as transient by the loop.
    fn read(&mut self) -> Result<Bytes>;

    /// True when `read` itself blocks until the next payload is due
    /// (hardware devices). The loop then skips its own pacing sleep.
    fn self_paced(&self) -> bool {
        false
    }
}

/// Interval of one frame at `fps`
pub fn frame_interval(fps: u32) -> Duration {
    Duration::from_micros(1_000_000 / fps.max(1) as u64)
}

/// Interval of one audio chunk of `samples` sample frames
pub fn chunk_interval(samples: u32, sample_rate: u32) -> Duration {
    Duration::from_micros(samples as u64 * 1_000_000 / sample_rate.max(1) as u64)
}

// ============================================================================
// Test pattern
// ============================================================================

/// SMPTE-style bars: white, yellow, cyan, green, magenta, red, blue, black
const BARS: [[u8; 3]; 8] = [
    [235, 235, 235],
    [235, 235, 16],
    [16, 235, 235],
    [16, 235, 16],
    [235, 16, 235],
    [235, 16, 16],
    [16, 16, 235],
    [16, 16, 16],
];

/// Pixels the bars move per frame
const SCROLL_STEP: u32 = 4;

/// BT.601 limited-range conversion
fn rgb_to_yuv([r, g, b]: [u8; 3]) -> [u8; 3] {
    let (r, g, b) = (r as i32, g as i32, b as i32);
    let y = ((66 * r + 129 * g + 25 * b + 128) >> 8) + 16;
    let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
    let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
    [
        y.clamp(0, 255) as u8,
        u.clamp(0, 255) as u8,
        v.clamp(0, 255) as u8,
    ]
}

/// Moving color bars in any raw pixel format
pub struct TestPatternSource {
    name: String,
    resolution: Resolution,
    format: PixelFormat,
    fps: u32,
    frame_index: u64,
}

impl TestPatternSource {
    pub fn new(resolution: Resolution, format: PixelFormat, fps: u32) -> Result<Self> {
        if !resolution.is_valid() {
            return Err(AppError::Config(format!(
                "Invalid test pattern resolution {}",
                resolution
            )));
        }
        if format.is_compressed() {
            return Err(AppError::Config(
                "Test pattern cannot produce MJPEG, use a still image source".to_string(),
            ));
        }
        let needs_even_width = matches!(format, PixelFormat::Yuyv | PixelFormat::Nv12);
        if (needs_even_width && resolution.width % 2 != 0)
            || (format == PixelFormat::Nv12 && resolution.height % 2 != 0)
        {
            return Err(AppError::Config(format!(
                "{} needs even dimensions, got {}",
                format, resolution
            )));
        }

        Ok(Self {
            name: "test-pattern".to_string(),
            resolution,
            format,
            fps: fps.max(1),
            frame_index: 0,
        })
    }

    fn bar_at(&self, x: u32) -> [u8; 3] {
        let width = self.resolution.width;
        let offset = (self.frame_index * SCROLL_STEP as u64 % width as u64) as u32;
        let shifted = (x + offset) % width;
        BARS[(shifted as usize * BARS.len()) / width as usize]
    }

    /// One frame; every row is identical so only one is computed
    fn render(&self) -> Bytes {
        let Resolution { width, height } = self.resolution;
        let size = self
            .format
            .frame_size(self.resolution)
            .unwrap_or_default();
        let mut out = BytesMut::with_capacity(size);

        match self.format {
            PixelFormat::Yuyv => {
                let mut row = Vec::with_capacity(width as usize * 2);
                for x in (0..width).step_by(2) {
                    let [y0, u, v] = rgb_to_yuv(self.bar_at(x));
                    let [y1, _, _] = rgb_to_yuv(self.bar_at(x + 1));
                    row.extend_from_slice(&[y0, u, y1, v]);
                }
                for _ in 0..height {
                    out.put_slice(&row);
                }
            }
            PixelFormat::Nv12 => {
                let yuv: Vec<[u8; 3]> = (0..width).map(|x| rgb_to_yuv(self.bar_at(x))).collect();
                let luma: Vec<u8> = yuv.iter().map(|p| p[0]).collect();
                let chroma: Vec<u8> = yuv.chunks(2).flat_map(|p| [p[0][1], p[0][2]]).collect();
                for _ in 0..height {
                    out.put_slice(&luma);
                }
                for _ in 0..height / 2 {
                    out.put_slice(&chroma);
                }
            }
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => {
                let bgr = self.format == PixelFormat::Bgr24;
                let row: Vec<u8> = (0..width)
                    .flat_map(|x| {
                        let [r, g, b] = self.bar_at(x);
                        if bgr {
                            [b, g, r]
                        } else {
                            [r, g, b]
                        }
                    })
                    .collect();
                for _ in 0..height {
                    out.put_slice(&row);
                }
            }
            PixelFormat::Grey => {
                let row: Vec<u8> = (0..width).map(|x| rgb_to_yuv(self.bar_at(x))[0]).collect();
                for _ in 0..height {
                    out.put_slice(&row);
                }
            }
            PixelFormat::Mjpeg => {}
        }

        out.freeze()
    }
}

impl CaptureSource for TestPatternSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn format(&self) -> FrameFormat {
        FrameFormat::Video {
            resolution: self.resolution,
            format: self.format,
        }
    }

    fn interval(&self) -> Duration {
        frame_interval(self.fps)
    }

    fn read(&mut self) -> Result<Bytes> {
        let frame = self.render();
        self.frame_index += 1;
        Ok(frame)
    }
}

// ============================================================================
// Still image
// ============================================================================

/// Repeats one image loaded from disk
///
/// MJPEG sources take a JPEG file; raw formats take a file holding exactly
/// one frame.
pub struct StillImageSource {
    name: String,
    image: Bytes,
    resolution: Resolution,
    format: PixelFormat,
    fps: u32,
}

impl StillImageSource {
    pub fn open(
        path: impl AsRef<Path>,
        resolution: Resolution,
        format: PixelFormat,
        fps: u32,
    ) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)
            .map_err(|e| AppError::capture(path.display().to_string(), e))?;
        let source = Self::from_bytes(Bytes::from(data), resolution, format, fps)
            .map_err(|e| AppError::capture(path.display().to_string(), e))?;
        info!(
            "Loaded still image {} ({} bytes, {} {})",
            path.display(),
            source.image.len(),
            resolution,
            format
        );
        Ok(Self {
            name: path.display().to_string(),
            ..source
        })
    }

    pub fn from_bytes(
        image: Bytes,
        resolution: Resolution,
        format: PixelFormat,
        fps: u32,
    ) -> Result<Self> {
        match format.frame_size(resolution) {
            None if !is_valid_jpeg(&image) => {
                return Err(AppError::Config("Still image is not a JPEG".to_string()))
            }
            Some(size) if size != image.len() => {
                return Err(AppError::Config(format!(
                    "Still image has {} bytes, {} {} needs {}",
                    image.len(),
                    resolution,
                    format,
                    size
                )))
            }
            _ => {}
        }

        Ok(Self {
            name: "still-image".to_string(),
            image,
            resolution,
            format,
            fps: fps.max(1),
        })
    }
}

impl CaptureSource for StillImageSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn format(&self) -> FrameFormat {
        FrameFormat::Video {
            resolution: self.resolution,
            format: self.format,
        }
    }

    fn interval(&self) -> Duration {
        frame_interval(self.fps)
    }

    fn read(&mut self) -> Result<Bytes> {
        Ok(self.image.clone())
    }
}

// ============================================================================
// Tone
// ============================================================================

/// Sine wave PCM generator (S16LE interleaved)
pub struct ToneSource {
    format: AudioFormat,
    chunk_samples: u32,
    frequency: f32,
    amplitude: f32,
    phase: f32,
}

impl ToneSource {
    pub fn new(format: AudioFormat, chunk_samples: u32, frequency: f32) -> Result<Self> {
        if format.sample_rate == 0 || format.channels == 0 || chunk_samples == 0 {
            return Err(AppError::Config(format!(
                "Invalid tone parameters: {} Hz, {} ch, {} samples",
                format.sample_rate, format.channels, chunk_samples
            )));
        }
        Ok(Self {
            format,
            chunk_samples,
            frequency,
            amplitude: 0.3,
            phase: 0.0,
        })
    }
}

impl CaptureSource for ToneSource {
    fn name(&self) -> &str {
        "tone"
    }

    fn format(&self) -> FrameFormat {
        FrameFormat::Audio(self.format)
    }

    fn interval(&self) -> Duration {
        chunk_interval(self.chunk_samples, self.format.sample_rate)
    }

    fn read(&mut self) -> Result<Bytes> {
        let step = std::f32::consts::TAU * self.frequency / self.format.sample_rate as f32;
        let mut out = BytesMut::with_capacity(self.format.chunk_bytes(self.chunk_samples));

        for _ in 0..self.chunk_samples {
            let sample = (self.phase.sin() * self.amplitude * i16::MAX as f32) as i16;
            for _ in 0..self.format.channels {
                out.put_i16_le(sample);
            }
            self.phase = (self.phase + step) % std::f32::consts::TAU;
        }

        Ok(out.freeze())
    }
}

// ============================================================================
// WAV loop
// ============================================================================

/// Loops the samples of a WAV file forever
///
/// Any integer or float WAV is converted to S16LE on load.
pub struct WavLoopSource {
    name: String,
    path: PathBuf,
    format: AudioFormat,
    chunk_samples: u32,
    pcm: Bytes,
    position: usize,
}

impl WavLoopSource {
    pub fn open(path: impl AsRef<Path>, chunk_samples: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let source_name = path.display().to_string();
        let mut reader =
            hound::WavReader::open(&path).map_err(|e| AppError::capture(&source_name, e))?;
        let spec = reader.spec();

        let samples: Vec<i16> = match spec.sample_format {
            hound::SampleFormat::Int => {
                let bits = spec.bits_per_sample as u32;
                reader
                    .samples::<i32>()
                    .map(|s| {
                        s.map(|v| {
                            if bits > 16 {
                                (v >> (bits - 16)) as i16
                            } else {
                                (v << (16 - bits)) as i16
                            }
                        })
                    })
                    .collect::<std::result::Result<_, _>>()
            }
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .map(|s| s.map(|v| (v.clamp(-1.0, 1.0) * i16::MAX as f32) as i16))
                .collect::<std::result::Result<_, _>>(),
        }
        .map_err(|e| AppError::capture(&source_name, e))?;

        if samples.is_empty() || spec.channels == 0 {
            return Err(AppError::capture(&source_name, "WAV file has no samples"));
        }
        if chunk_samples == 0 {
            return Err(AppError::Config("Audio chunk size must be positive".to_string()));
        }

        let mut pcm = BytesMut::with_capacity(samples.len() * 2);
        for sample in &samples {
            pcm.put_i16_le(*sample);
        }

        let format = AudioFormat::new(spec.sample_rate, spec.channels);
        info!(
            "Loaded WAV {}: {} Hz, {} ch, {} bit, {:.1}s",
            source_name,
            spec.sample_rate,
            spec.channels,
            spec.bits_per_sample,
            samples.len() as f32 / spec.channels as f32 / spec.sample_rate as f32
        );

        Ok(Self {
            name: source_name,
            path,
            format,
            chunk_samples,
            pcm: pcm.freeze(),
            position: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CaptureSource for WavLoopSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn format(&self) -> FrameFormat {
        FrameFormat::Audio(self.format)
    }

    fn interval(&self) -> Duration {
        chunk_interval(self.chunk_samples, self.format.sample_rate)
    }

    fn read(&mut self) -> Result<Bytes> {
        let want = self.format.chunk_bytes(self.chunk_samples);
        let end = self.position + want;

        // Fast path: chunk lies inside the file
        if end <= self.pcm.len() {
            let chunk = self.pcm.slice(self.position..end);
            self.position = end % self.pcm.len();
            return Ok(chunk);
        }

        let mut out = BytesMut::with_capacity(want);
        while out.len() < want {
            let take = (want - out.len()).min(self.pcm.len() - self.position);
            out.put_slice(&self.pcm[self.position..self.position + take]);
            self.position = (self.position + take) % self.pcm.len();
            if self.position == 0 {
                debug!("WAV source {} looped", self.name);
            }
        }
        Ok(out.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::frame::test_frames::fake_jpeg;
    use tempfile::TempDir;

    #[test]
    fn test_pattern_sizes() {
        let res = Resolution::new(64, 48);
        for format in [
            PixelFormat::Yuyv,
            PixelFormat::Nv12,
            PixelFormat::Rgb24,
            PixelFormat::Bgr24,
            PixelFormat::Grey,
        ] {
            let mut source = TestPatternSource::new(res, format, 30).unwrap();
            let frame = source.read().unwrap();
            assert_eq!(Some(frame.len()), format.frame_size(res), "{}", format);
        }
    }

    #[test]
    fn test_pattern_moves() {
        let mut source = TestPatternSource::new(Resolution::new(64, 8), PixelFormat::Grey, 30).unwrap();
        let first = source.read().unwrap();
        let second = source.read().unwrap();
        assert_ne!(first, second);
        // First pixel of the first frame is the white bar
        assert_eq!(first[0], rgb_to_yuv(BARS[0])[0]);
    }

    #[test]
    fn test_pattern_rejects_bad_config() {
        assert!(TestPatternSource::new(Resolution::VGA, PixelFormat::Mjpeg, 30).is_err());
        assert!(TestPatternSource::new(Resolution::new(63, 48), PixelFormat::Yuyv, 30).is_err());
        assert!(TestPatternSource::new(Resolution::new(64, 47), PixelFormat::Nv12, 30).is_err());
        assert!(TestPatternSource::new(Resolution::new(0, 48), PixelFormat::Grey, 30).is_err());
    }

    #[test]
    fn test_rgb_to_yuv_extremes() {
        assert_eq!(rgb_to_yuv([16, 16, 16]), [30, 128, 128]);
        let [y, u, v] = rgb_to_yuv([235, 235, 235]);
        assert!(y > 200);
        assert_eq!((u, v), (128, 128));
    }

    #[test]
    fn test_still_image() {
        let jpeg = fake_jpeg(4096, 7);
        let mut source =
            StillImageSource::from_bytes(jpeg.clone(), Resolution::VGA, PixelFormat::Mjpeg, 30)
                .unwrap();
        assert_eq!(source.read().unwrap(), jpeg);
        assert_eq!(source.interval(), Duration::from_micros(33_333));

        assert!(StillImageSource::from_bytes(
            Bytes::from_static(b"not a jpeg"),
            Resolution::VGA,
            PixelFormat::Mjpeg,
            30
        )
        .is_err());
        assert!(StillImageSource::from_bytes(
            Bytes::from(vec![0u8; 100]),
            Resolution::new(16, 16),
            PixelFormat::Grey,
            30
        )
        .is_err());
    }

    #[test]
    fn test_tone_chunk() {
        let format = AudioFormat::new(44_100, 2);
        let mut source = ToneSource::new(format, 1024, 440.0).unwrap();
        let chunk = source.read().unwrap();
        assert_eq!(chunk.len(), 1024 * 4);
        assert_eq!(source.kind(), MediaKind::Audio);
        assert_eq!(source.interval(), Duration::from_micros(23_219));

        // Interleaved channels carry the same sample
        assert_eq!(chunk[0..2], chunk[2..4]);
        assert!(ToneSource::new(AudioFormat::new(0, 1), 1024, 440.0).is_err());
    }

    fn write_wav(path: &Path, spec: hound::WavSpec, samples: &[i16]) {
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for s in samples {
            writer.write_sample(*s).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_wav_loop_wraps() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("loop.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 8_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let samples: Vec<i16> = (0..10).map(|i| i * 100).collect();
        write_wav(&path, spec, &samples);

        let mut source = WavLoopSource::open(&path, 4).unwrap();
        assert_eq!(source.format(), FrameFormat::Audio(AudioFormat::new(8_000, 1)));

        let decode = |b: Bytes| -> Vec<i16> {
            b.chunks(2).map(|c| i16::from_le_bytes([c[0], c[1]])).collect()
        };
        assert_eq!(decode(source.read().unwrap()), vec![0, 100, 200, 300]);
        assert_eq!(decode(source.read().unwrap()), vec![400, 500, 600, 700]);
        // Wraps back to the start
        assert_eq!(decode(source.read().unwrap()), vec![800, 900, 0, 100]);
        assert_eq!(decode(source.read().unwrap()), vec![200, 300, 400, 500]);
    }

    #[test]
    fn test_wav_24bit_is_scaled() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("hi.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 48_000,
            bits_per_sample: 24,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        writer.write_sample(256i32 * 1000).unwrap();
        writer.write_sample(-256i32 * 1000).unwrap();
        writer.finalize().unwrap();

        let mut source = WavLoopSource::open(&path, 2).unwrap();
        let chunk = source.read().unwrap();
        assert_eq!(i16::from_le_bytes([chunk[0], chunk[1]]), 1000);
        assert_eq!(i16::from_le_bytes([chunk[2], chunk[3]]), -1000);
    }

    #[test]
    fn test_wav_missing_file() {
        let err = WavLoopSource::open("/nonexistent/loop.wav", 1024).err().unwrap();
        assert!(matches!(err, AppError::Capture { .. }));
    }
}
