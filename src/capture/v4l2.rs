//! V4L2 camera source

use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use v4l::buffer::Type;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Format, FourCC};

use super::source::{frame_interval, CaptureSource};
use crate::error::{AppError, Result};
use crate::media::{FrameFormat, PixelFormat, Resolution};

/// Number of mmap capture buffers
const BUFFER_COUNT: u32 = 2;
/// Dequeue timeout, surfaces as a transient read error
const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(2);

fn to_fourcc(format: PixelFormat) -> FourCC {
    match format {
        PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
        PixelFormat::Yuyv => FourCC::new(b"YUYV"),
        PixelFormat::Nv12 => FourCC::new(b"NV12"),
        PixelFormat::Rgb24 => FourCC::new(b"RGB3"),
        PixelFormat::Bgr24 => FourCC::new(b"BGR3"),
        PixelFormat::Grey => FourCC::new(b"GREY"),
    }
}

/// Memory-mapped V4L2 capture
pub struct V4l2Source {
    name: String,
    path: PathBuf,
    resolution: Resolution,
    format: PixelFormat,
    fps: u32,
    stream: MmapStream<'static>,
}

impl V4l2Source {
    /// Open the device and negotiate the format; fails if the driver picks
    /// a different resolution or pixel format
    pub fn open(
        path: impl AsRef<Path>,
        resolution: Resolution,
        format: PixelFormat,
        fps: u32,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let name = path.display().to_string();

        let device = Device::with_path(&path)
            .map_err(|e| AppError::capture(&name, format!("failed to open: {}", e)))?;

        let requested = Format::new(resolution.width, resolution.height, to_fourcc(format));
        let actual = device
            .set_format(&requested)
            .map_err(|e| AppError::capture(&name, format!("failed to set format: {}", e)))?;
        if actual.width != resolution.width
            || actual.height != resolution.height
            || actual.fourcc != requested.fourcc
        {
            return Err(AppError::capture(
                &name,
                format!(
                    "requested {} {}, driver offers {}x{} {}",
                    resolution, format, actual.width, actual.height, actual.fourcc
                ),
            ));
        }

        if let Err(e) = device.set_params(&Parameters::with_fps(fps.max(1))) {
            warn!("Failed to set {} fps on {}: {}", fps, name, e);
        }

        let mut stream = MmapStream::with_buffers(&device, Type::VideoCapture, BUFFER_COUNT)
            .map_err(|e| AppError::capture(&name, format!("failed to map buffers: {}", e)))?;
        stream.set_timeout(DEQUEUE_TIMEOUT);

        info!("Opened {} at {} {} @ {}fps", name, resolution, format, fps);
        Ok(Self {
            name,
            path,
            resolution,
            format,
            fps: fps.max(1),
            stream,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CaptureSource for V4l2Source {
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
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| AppError::capture(&self.name, e))?;
        let used = (meta.bytesused as usize).min(buf.len());
        if used == 0 {
            return Err(AppError::capture(&self.name, "empty buffer"));
        }
        Ok(Bytes::copy_from_slice(&buf[..used]))
    }

    fn self_paced(&self) -> bool {
        true
    }
}
