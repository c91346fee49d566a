//! In-process AVI clip writer
//!
//! Writes a single-stream RIFF AVI with an `idx1` index. Every frame is a
//! key frame, so compressed (MJPEG) and raw formats both play without
//! external tools.
//!
//! ```text
//! RIFF 'AVI '
//!   LIST 'hdrl'
//!     avih
//!     LIST 'strl'
//!       strh ('vids')
//!       strf (BITMAPINFOHEADER)
//!   LIST 'movi'
//!     00dc ...
//!   idx1
//! ```

use std::fs::File;
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

use super::encoder::{matching_frames, ClipEncoder, EncodeParams, EncodeReport};
use crate::error::{AppError, Result};
use crate::media::{MediaFrame, PixelFormat};

const AVIF_HASINDEX: u32 = 0x10;
const AVIIF_KEYFRAME: u32 = 0x10;
const BI_RGB: u32 = 0;

const AVIH_SIZE: u32 = 56;
const STRH_SIZE: u32 = 56;
const STRF_SIZE: u32 = 40;
const STRL_LIST_SIZE: u32 = 4 + (8 + STRH_SIZE) + (8 + STRF_SIZE);
const HDRL_LIST_SIZE: u32 = 4 + (8 + AVIH_SIZE) + (8 + STRL_LIST_SIZE);
/// Bytes before the first `00dc` chunk
pub const AVI_HEADER_LEN: u64 = 12 + 8 + HDRL_LIST_SIZE as u64 + 12;

fn fourcc(code: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*code)
}

/// Codec description for the stream header
struct StreamCodec {
    handler: u32,
    compression: u32,
    bit_count: u16,
    /// Raw RGB rows are stored top-down (negative height)
    top_down: bool,
}

fn stream_codec(format: PixelFormat) -> StreamCodec {
    match format {
        PixelFormat::Mjpeg => StreamCodec {
            handler: fourcc(b"MJPG"),
            compression: fourcc(b"MJPG"),
            bit_count: 24,
            top_down: false,
        },
        PixelFormat::Yuyv => StreamCodec {
            handler: fourcc(b"YUY2"),
            compression: fourcc(b"YUY2"),
            bit_count: 16,
            top_down: false,
        },
        PixelFormat::Nv12 => StreamCodec {
            handler: fourcc(b"NV12"),
            compression: fourcc(b"NV12"),
            bit_count: 12,
            top_down: false,
        },
        PixelFormat::Rgb24 | PixelFormat::Bgr24 => StreamCodec {
            handler: fourcc(b"DIB "),
            compression: BI_RGB,
            bit_count: 24,
            top_down: true,
        },
        PixelFormat::Grey => StreamCodec {
            handler: fourcc(b"Y800"),
            compression: fourcc(b"Y800"),
            bit_count: 8,
            top_down: false,
        },
    }
}

/// Streaming AVI writer
///
/// Headers are written with placeholder sizes first and rewritten by
/// [`finish`](Self::finish) once the frame count is known.
pub struct AviWriter<W: Write + Seek> {
    out: W,
    params: EncodeParams,
    /// (offset from the 'movi' fourcc, chunk size)
    index: Vec<(u32, u32)>,
    movi_bytes: u32,
    max_chunk: u32,
}

impl<W: Write + Seek> AviWriter<W> {
    pub fn new(mut out: W, params: EncodeParams) -> io::Result<Self> {
        write_headers(&mut out, &params, 0, 0, 0, 4)?;
        Ok(Self {
            out,
            params,
            index: Vec::new(),
            movi_bytes: 4,
            max_chunk: 0,
        })
    }

    pub fn write_frame(&mut self, data: &[u8]) -> io::Result<()> {
        let size = u32::try_from(data.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large for AVI"))?;
        let pad = size & 1;

        self.index.push((self.movi_bytes, size));
        self.out.write_all(b"00dc")?;
        self.out.write_all(&size.to_le_bytes())?;
        self.out.write_all(data)?;
        if pad == 1 {
            self.out.write_all(&[0])?;
        }

        self.movi_bytes = self
            .movi_bytes
            .checked_add(8 + size + pad)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "AVI exceeds 4 GiB"))?;
        self.max_chunk = self.max_chunk.max(size);
        Ok(())
    }

    pub fn frames_written(&self) -> usize {
        self.index.len()
    }

    /// Write the index, patch the headers and return the inner writer
    pub fn finish(mut self) -> io::Result<W> {
        let idx_size = 16 * self.index.len() as u32;
        self.out.write_all(b"idx1")?;
        self.out.write_all(&idx_size.to_le_bytes())?;
        for (offset, size) in &self.index {
            self.out.write_all(b"00dc")?;
            self.out.write_all(&AVIIF_KEYFRAME.to_le_bytes())?;
            self.out.write_all(&offset.to_le_bytes())?;
            self.out.write_all(&size.to_le_bytes())?;
        }

        let riff_size = 4 + (8 + HDRL_LIST_SIZE) + (8 + self.movi_bytes) + (8 + idx_size);
        self.out.seek(SeekFrom::Start(0))?;
        write_headers(
            &mut self.out,
            &self.params,
            self.index.len() as u32,
            self.max_chunk,
            riff_size,
            self.movi_bytes,
        )?;
        self.out.seek(SeekFrom::End(0))?;
        self.out.flush()?;
        Ok(self.out)
    }
}

fn write_headers<W: Write>(
    out: &mut W,
    params: &EncodeParams,
    total_frames: u32,
    max_chunk: u32,
    riff_size: u32,
    movi_size: u32,
) -> io::Result<()> {
    let codec = stream_codec(params.format);
    let fps = params.fps.max(1);
    let width = params.resolution.width;
    let height = params.resolution.height;
    let image_size = params
        .format
        .frame_size(params.resolution)
        .unwrap_or(max_chunk as usize) as u32;

    let mut buf = Vec::with_capacity(AVI_HEADER_LEN as usize);
    let u32le = |buf: &mut Vec<u8>, v: u32| buf.extend_from_slice(&v.to_le_bytes());

    buf.extend_from_slice(b"RIFF");
    u32le(&mut buf, riff_size);
    buf.extend_from_slice(b"AVI ");

    buf.extend_from_slice(b"LIST");
    u32le(&mut buf, HDRL_LIST_SIZE);
    buf.extend_from_slice(b"hdrl");

    // Main AVI header
    buf.extend_from_slice(b"avih");
    u32le(&mut buf, AVIH_SIZE);
    u32le(&mut buf, 1_000_000 / fps);
    u32le(&mut buf, max_chunk.saturating_mul(fps));
    u32le(&mut buf, 0);
    u32le(&mut buf, AVIF_HASINDEX);
    u32le(&mut buf, total_frames);
    u32le(&mut buf, 0);
    u32le(&mut buf, 1);
    u32le(&mut buf, max_chunk);
    u32le(&mut buf, width);
    u32le(&mut buf, height);
    for _ in 0..4 {
        u32le(&mut buf, 0);
    }

    buf.extend_from_slice(b"LIST");
    u32le(&mut buf, STRL_LIST_SIZE);
    buf.extend_from_slice(b"strl");

    // Stream header
    buf.extend_from_slice(b"strh");
    u32le(&mut buf, STRH_SIZE);
    buf.extend_from_slice(b"vids");
    u32le(&mut buf, codec.handler);
    u32le(&mut buf, 0);
    buf.extend_from_slice(&0u16.to_le_bytes());
    buf.extend_from_slice(&0u16.to_le_bytes());
    u32le(&mut buf, 0);
    u32le(&mut buf, 1);
    u32le(&mut buf, fps);
    u32le(&mut buf, 0);
    u32le(&mut buf, total_frames);
    u32le(&mut buf, max_chunk);
    u32le(&mut buf, u32::MAX);
    u32le(&mut buf, 0);
    buf.extend_from_slice(&0i16.to_le_bytes());
    buf.extend_from_slice(&0i16.to_le_bytes());
    buf.extend_from_slice(&(width as i16).to_le_bytes());
    buf.extend_from_slice(&(height as i16).to_le_bytes());

    // Stream format (BITMAPINFOHEADER)
    buf.extend_from_slice(b"strf");
    u32le(&mut buf, STRF_SIZE);
    u32le(&mut buf, STRF_SIZE);
    buf.extend_from_slice(&(width as i32).to_le_bytes());
    let bi_height = if codec.top_down {
        -(height as i32)
    } else {
        height as i32
    };
    buf.extend_from_slice(&bi_height.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes());
    buf.extend_from_slice(&codec.bit_count.to_le_bytes());
    u32le(&mut buf, codec.compression);
    u32le(&mut buf, image_size);
    for _ in 0..4 {
        u32le(&mut buf, 0);
    }

    buf.extend_from_slice(b"LIST");
    u32le(&mut buf, movi_size);
    buf.extend_from_slice(b"movi");

    out.write_all(&buf)
}

/// Swap R and B in packed 24-bit pixels
fn rgb_to_bgr(data: &[u8]) -> Vec<u8> {
    let mut out = data.to_vec();
    for px in out.chunks_exact_mut(3) {
        px.swap(0, 2);
    }
    out
}

/// Builtin encoder producing `.avi` files
#[derive(Debug, Default)]
pub struct AviEncoder;

impl AviEncoder {
    pub fn new() -> Self {
        Self
    }
}

impl ClipEncoder for AviEncoder {
    fn name(&self) -> &'static str {
        "builtin"
    }

    fn extension(&self) -> &'static str {
        "avi"
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

        let file = File::create(output)?;
        let mut writer = AviWriter::new(BufWriter::new(file), *params)?;
        for frame in &frames {
            if params.format == PixelFormat::Rgb24 {
                writer.write_frame(&rgb_to_bgr(frame.data()))?;
            } else {
                writer.write_frame(frame.data())?;
            }
        }
        let written = writer.frames_written();
        let file = writer
            .finish()?
            .into_inner()
            .map_err(|e| AppError::Encode(format!("flush failed: {}", e.error())))?;
        file.sync_all()?;

        Ok(EncodeReport {
            frames_written: written,
            frames_skipped: skipped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::frame::test_frames::{grey_frame, mjpeg_frame};
    use crate::media::Resolution;
    use std::io::Cursor;

    fn u32_at(data: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
    }

    #[test]
    fn test_header_layout() {
        let params = EncodeParams {
            resolution: Resolution::new(16, 16),
            format: PixelFormat::Grey,
            fps: 30,
        };
        let mut writer = AviWriter::new(Cursor::new(Vec::new()), params).unwrap();
        for seq in 0..3 {
            writer
                .write_frame(grey_frame(params.resolution, seq).data())
                .unwrap();
        }
        let data = writer.finish().unwrap().into_inner();

        assert_eq!(&data[0..4], b"RIFF");
        assert_eq!(u32_at(&data, 4) as usize, data.len() - 8);
        assert_eq!(&data[8..12], b"AVI ");
        assert_eq!(&data[24..28], b"avih");
        // dwMicroSecPerFrame, dwTotalFrames
        assert_eq!(u32_at(&data, 32), 33_333);
        assert_eq!(u32_at(&data, 48), 3);
        assert_eq!(&data[108..112], b"vids");
        assert_eq!(&data[112..116], b"Y800");
        // strh dwRate, dwLength
        assert_eq!(u32_at(&data, 132), 30);
        assert_eq!(u32_at(&data, 140), 3);
        assert_eq!(&data[164..168], b"strf");
        assert_eq!(u32_at(&data, 176), 16);

        assert_eq!(&data[212..216], b"LIST");
        assert_eq!(&data[220..224], b"movi");
        assert_eq!(&data[224..228], b"00dc");
        assert_eq!(u32_at(&data, 228), 256);
        assert_eq!(AVI_HEADER_LEN, 224);

        let movi_size = u32_at(&data, 216) as usize;
        let idx = 220 + movi_size;
        assert_eq!(&data[idx..idx + 4], b"idx1");
        assert_eq!(u32_at(&data, idx + 4), 48);
        // First index entry points just past the 'movi' fourcc
        assert_eq!(u32_at(&data, idx + 16), 4);
        assert_eq!(u32_at(&data, idx + 20), 256);
        assert_eq!(data.len(), idx + 8 + 48);
    }

    #[test]
    fn test_odd_chunks_are_padded() {
        let params = EncodeParams {
            resolution: Resolution::new(16, 16),
            format: PixelFormat::Mjpeg,
            fps: 10,
        };
        let mut writer = AviWriter::new(Cursor::new(Vec::new()), params).unwrap();
        writer.write_frame(&[1, 2, 3]).unwrap();
        writer.write_frame(&[4, 5]).unwrap();
        let data = writer.finish().unwrap().into_inner();

        // 3 bytes + 1 pad, then the next chunk
        assert_eq!(&data[236..240], b"00dc");
        assert_eq!(u32_at(&data, 216), 4 + 12 + 10);
    }

    #[test]
    fn test_encoder_skips_mismatched_frames() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("clip.avi");
        let params = EncodeParams {
            resolution: Resolution::VGA,
            format: PixelFormat::Mjpeg,
            fps: 30,
        };

        let mut frames: Vec<MediaFrame> = (0..10).map(mjpeg_frame).collect();
        frames.insert(5, grey_frame(Resolution::new(16, 16), 99));

        let report = AviEncoder::new().encode(&frames, &params, &output).unwrap();
        assert_eq!(report.frames_written, 10);
        assert_eq!(report.frames_skipped, 1);
        assert!(std::fs::metadata(&output).unwrap().len() > 10 * 2048);
    }

    #[test]
    fn test_encoder_fails_without_matching_frames() {
        let dir = tempfile::tempdir().unwrap();
        let params = EncodeParams {
            resolution: Resolution::VGA,
            format: PixelFormat::Yuyv,
            fps: 30,
        };
        let frames = vec![mjpeg_frame(1)];
        let result = AviEncoder::new().encode(&frames, &params, &dir.path().join("x.avi"));
        assert!(matches!(result, Err(AppError::Encode(_))));
    }

    #[test]
    fn test_rgb_to_bgr() {
        assert_eq!(rgb_to_bgr(&[1, 2, 3, 4, 5, 6]), vec![3, 2, 1, 6, 5, 4]);
    }
}
