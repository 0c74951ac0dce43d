pub mod detection;
pub mod error;
pub mod geometry;
pub mod output;
pub mod pipeline;
pub mod rendering;
pub mod runtime;
pub mod tracking;
pub mod video;

pub use error::ReframeError;

// Plumbing errors stay on anyhow so callers only need `reframe_core::Error`
pub use anyhow::Error;
pub use anyhow::Result;
