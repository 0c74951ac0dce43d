//! output — input resolution and output naming
//!
//! The output name keeps the input's file name minus its last four
//! characters (assumed to be a `.ext` suffix) and appends `_out.MP4`.
//! Extensions of any other length are truncated wrongly (`clip.mpeg`
//! becomes `clip._out.MP4`); this is kept as-is so output names stay stable.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::ReframeError;

/// Directory every run writes into, relative to the working directory.
pub const OUTPUT_DIR: &str = "./out";
const OUTPUT_SUFFIX: &str = "_out.MP4";
const EXTENSION_LEN: usize = 4;

/// Where frames are read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource {
    File(PathBuf),
    Camera(u32),
}

impl InputSource {
    /// Resolve the raw CLI argument. An existing path always wins; otherwise a
    /// bare integer selects a camera device.
    pub fn resolve(raw: &str) -> Result<Self, ReframeError> {
        let path = Path::new(raw);
        if path.exists() {
            return Ok(Self::File(path.to_path_buf()));
        }
        match raw.parse::<u32>() {
            Ok(index) => Ok(Self::Camera(index)),
            Err(_) => Err(ReframeError::InputNotFound(path.to_path_buf())),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::File(path) => path.display().to_string(),
            Self::Camera(index) => format!("camera {index}"),
        }
    }
}

/// Output file name for `input`, e.g. `clips/my_video.mp4` → `my_video_out.MP4`.
pub fn output_file_name(input: &str) -> String {
    let base = input.rsplit('/').next().unwrap_or(input);
    let keep = base.chars().count().saturating_sub(EXTENSION_LEN);
    let stem: String = base.chars().take(keep).collect();
    format!("{stem}{OUTPUT_SUFFIX}")
}

/// Full output path inside `dir`.
pub fn output_path_in<P: AsRef<Path>>(dir: P, input: &str) -> PathBuf {
    dir.as_ref().join(output_file_name(input))
}

/// Create `dir` if it does not exist yet.
pub fn ensure_output_dir<P: AsRef<Path>>(dir: P) -> io::Result<()> {
    let dir = dir.as_ref();
    if !dir.exists() {
        fs::create_dir_all(dir)?;
        info!(dir = %dir.display(), "created output directory");
    }
    Ok(())
}
