use anyhow::{Context, Result};
use ort::execution_providers::{self as ep, ExecutionProvider};
use ort::session::Session;
use std::fmt;
use std::path::{Path, PathBuf};

#[cfg(target_os = "linux")]
const ORT_LIBRARY: &str = "libonnxruntime.so";
#[cfg(target_os = "macos")]
const ORT_LIBRARY: &str = "libonnxruntime.dylib";
#[cfg(target_os = "windows")]
const ORT_LIBRARY: &str = "onnxruntime.dll";
#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
const ORT_LIBRARY: &str = "libonnxruntime.so";

/// Resolve and set ORT_DYLIB_PATH at runtime when it is missing or invalid.
///
/// Must run before any other thread is spawned.
///
/// Priority order:
/// 1) Existing ORT_DYLIB_PATH (if file exists)
/// 2) yolo/ or yolo/onnxruntime*/lib/ near the current exe/cwd
pub fn configure_ort_dylib() {
    if let Some(existing) = std::env::var_os("ORT_DYLIB_PATH") {
        let existing_path = PathBuf::from(existing);
        if existing_path.is_file() {
            tracing::info!(path = %existing_path.display(), "using ORT_DYLIB_PATH from environment");
            return;
        }
        tracing::warn!(
            path = %existing_path.display(),
            "ORT_DYLIB_PATH is set but file does not exist; attempting auto-discovery"
        );
    }

    for candidate in ort_candidates() {
        if candidate.is_file() {
            // SAFETY: callers invoke this while the process is still
            // single-threaded, before any async runtime or ORT session exists.
            unsafe {
                std::env::set_var("ORT_DYLIB_PATH", &candidate);
            }
            tracing::info!(path = %candidate.display(), "configured ORT_DYLIB_PATH");
            return;
        }
    }

    tracing::warn!(
        library = ORT_LIBRARY,
        "could not locate ONNX Runtime; relying on the system loader (set ORT_DYLIB_PATH to override)"
    );
}

fn ort_candidates() -> Vec<PathBuf> {
    let mut roots = Vec::new();

    if let Ok(cwd) = std::env::current_dir() {
        roots.push(cwd);
    }

    if let Ok(exe) = std::env::current_exe() {
        let mut dir = exe.parent().map(Path::to_path_buf);
        for _ in 0..4 {
            let Some(d) = dir else {
                break;
            };
            roots.push(d.clone());
            dir = d.parent().map(Path::to_path_buf);
        }
    }

    let mut candidates = Vec::new();
    for root in roots {
        candidates.push(root.join("yolo/onnxruntime/lib").join(ORT_LIBRARY));
        candidates.push(root.join("yolo").join(ORT_LIBRARY));
    }
    candidates
}

/// Device the detector session runs on. Picked once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accelerator {
    Cuda,
    CoreMl,
    Cpu,
}

impl fmt::Display for Accelerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cuda => "cuda",
            Self::CoreMl => "coreml",
            Self::Cpu => "cpu",
        })
    }
}

/// Probe the loaded ONNX Runtime for a usable accelerator, falling back to CPU.
pub fn select_accelerator() -> Accelerator {
    let accelerator = if ep::CUDAExecutionProvider::default()
        .is_available()
        .unwrap_or(false)
    {
        Accelerator::Cuda
    } else if ep::CoreMLExecutionProvider::default()
        .is_available()
        .unwrap_or(false)
    {
        Accelerator::CoreMl
    } else {
        Accelerator::Cpu
    };
    tracing::info!(%accelerator, "selected inference device");
    accelerator
}

pub(crate) fn build_session(model_path: &Path, accelerator: Accelerator) -> Result<Session> {
    let mut builder = Session::builder().context("failed to create ORT session builder")?;
    builder = builder
        .with_intra_threads(num_threads())
        .context("failed to set ORT intra threads")?;
    builder = match accelerator {
        Accelerator::Cuda => builder
            .with_execution_providers([ep::CUDAExecutionProvider::default().build()])
            .context("failed to register CUDA execution provider")?,
        Accelerator::CoreMl => builder
            .with_execution_providers([ep::CoreMLExecutionProvider::default()
                .with_compute_units(ep::coreml::CoreMLComputeUnits::CPUAndNeuralEngine)
                .build()])
            .context("failed to register CoreML execution provider")?,
        Accelerator::Cpu => builder,
    };
    builder
        .commit_from_file(model_path)
        .context("failed to commit ORT session")
}

fn num_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_look_next_to_models() {
        let candidates = ort_candidates();
        assert!(!candidates.is_empty());
        assert!(candidates.iter().all(|c| c.ends_with(ORT_LIBRARY)));
    }

    #[test]
    fn accelerator_names_are_lowercase() {
        assert_eq!(Accelerator::Cuda.to_string(), "cuda");
        assert_eq!(Accelerator::Cpu.to_string(), "cpu");
    }
}
