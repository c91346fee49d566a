//! ALSA microphone source

use alsa::pcm::{Access, Format, Frames, HwParams, State, IO};
use alsa::{Direction, ValueOr, PCM};
use bytes::Bytes;
use std::time::Duration;
use tracing::{info, warn};

use super::source::{chunk_interval, CaptureSource};
use crate::error::{AppError, Result};
use crate::media::{AudioFormat, FrameFormat};

/// Blocking S16LE interleaved capture from an ALSA device
pub struct AlsaSource {
    name: String,
    pcm: PCM,
    format: AudioFormat,
    chunk_samples: u32,
    buffer: Vec<u8>,
}

impl AlsaSource {
    pub fn open(device: &str, format: AudioFormat, chunk_samples: u32) -> Result<Self> {
        let err = |what: &str, e: alsa::Error| AppError::capture(device, format!("{}: {}", what, e));

        let pcm = PCM::new(device, Direction::Capture, false).map_err(|e| err("failed to open", e))?;
        let actual_rate = {
            let hwp = HwParams::any(&pcm).map_err(|e| err("failed to get hw params", e))?;
            hwp.set_channels(format.channels as u32)
                .map_err(|e| err("failed to set channels", e))?;
            hwp.set_rate(format.sample_rate, ValueOr::Nearest)
                .map_err(|e| err("failed to set sample rate", e))?;
            hwp.set_format(Format::s16())
                .map_err(|e| err("failed to set format", e))?;
            hwp.set_access(Access::RWInterleaved)
                .map_err(|e| err("failed to set access", e))?;
            hwp.set_period_size_near(chunk_samples as Frames, ValueOr::Nearest)
                .map_err(|e| err("failed to set period size", e))?;
            pcm.hw_params(&hwp)
                .map_err(|e| err("failed to apply hw params", e))?;
            hwp.get_rate().unwrap_or(format.sample_rate)
        };
        if actual_rate != format.sample_rate {
            return Err(AppError::capture(
                device,
                format!(
                    "requested {} Hz, device runs at {} Hz",
                    format.sample_rate, actual_rate
                ),
            ));
        }
        pcm.prepare().map_err(|e| err("failed to prepare", e))?;

        info!(
            "Opened ALSA {}: {} Hz, {} ch, {} samples per chunk",
            device, format.sample_rate, format.channels, chunk_samples
        );
        Ok(Self {
            name: device.to_string(),
            pcm,
            format,
            chunk_samples,
            buffer: vec![0u8; format.chunk_bytes(chunk_samples)],
        })
    }
}

impl CaptureSource for AlsaSource {
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
        match self.pcm.state() {
            State::XRun => {
                warn!("Audio buffer overrun on {}, recovering", self.name);
                let _ = self.pcm.prepare();
            }
            State::Suspended => {
                warn!("Audio device {} suspended, recovering", self.name);
                let _ = self.pcm.resume();
            }
            _ => {}
        }

        let io: IO<u8> = self.pcm.io_bytes();
        let frames = io
            .readi(&mut self.buffer)
            .map_err(|e| AppError::capture(&self.name, e))?;
        if frames == 0 {
            return Err(AppError::capture(&self.name, "no samples read"));
        }
        let bytes = frames * self.format.bytes_per_frame();
        Ok(Bytes::copy_from_slice(&self.buffer[..bytes]))
    }

    fn self_paced(&self) -> bool {
        true
    }
}
