//! clip-relay: live camera/microphone relay with a triggered clip recorder
//!
//! Capture loops feed bounded drop-oldest channels that a broadcast relay
//! fans out to WebSocket and MJPEG viewers. Video frames also land in a
//! rolling buffer; a control message snapshots it into an encoded clip.

pub mod capture;
pub mod clip;
pub mod config;
pub mod control;
pub mod error;
pub mod events;
pub mod media;
pub mod state;
pub mod stream;
pub mod utils;
pub mod web;

pub use error::{AppError, Result};
