//! error — typed failures surfaced by the reframing library
//!
//! Plumbing inside the video and inference bridges stays on `anyhow` with
//! `.context(..)`; the variants here are the ones callers branch on.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReframeError {
    /// The input argument is neither an existing file nor a camera index.
    #[error("Input file {} does not exist.", .0.display())]
    InputNotFound(PathBuf),

    #[error("no video stream found in {0}")]
    NoVideoStream(String),

    #[error("no capture backend available for camera {0} on this platform")]
    CameraUnavailable(u32),

    #[error("crop size must be non-zero, got {width}x{height}")]
    InvalidCropSpec { width: u32, height: u32 },

    #[error("detector output has unexpected shape {0:?}")]
    UnexpectedModelOutput(Vec<i64>),

    #[error("frame buffer holds {actual} bytes, expected {expected} for {width}x{height} RGB24")]
    FrameBufferSize {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
}
