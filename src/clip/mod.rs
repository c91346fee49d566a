//! Event-triggered clip recording
//!
//! The capture loop keeps a [`RollingClipBuffer`] filled; a trigger makes the
//! [`ClipFinalizer`] snapshot it, encode the snapshot into a file, remux a
//! fast-start copy and record the outcome as a [`ClipJob`]. Files are served
//! back through the [`ClipStore`].

pub mod avi;
pub mod buffer;
pub mod encoder;
pub mod ffmpeg;
pub mod finalizer;
pub mod job;
pub mod remux;
pub mod store;

pub use avi::AviEncoder;
pub use buffer::{ClipGeometry, RollingClipBuffer};
pub use encoder::{build_encoder, ClipEncoder, EncodeParams, EncodeReport, EncoderKind};
pub use ffmpeg::FfmpegEncoder;
pub use finalizer::{ClipFinalizer, FinalizerConfig, NO_FRAMES_REASON};
pub use job::{ClipFailure, ClipJob, FailureStage, JobStatus};
pub use remux::{FfmpegRemuxer, Remuxer};
pub use store::{sanitize_clip_id, ClipStore, StoredClip};
