use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;
use tokio::runtime;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use reframe_core::{
    ReframeError,
    geometry::{CropSpec, DEFAULT_CROP_HEIGHT, DEFAULT_CROP_WIDTH},
    output::{InputSource, OUTPUT_DIR, ensure_output_dir, output_path_in},
    pipeline::{CancelFlag, MissPolicy, ReframePipeline, RunMode, RunSummary, StopReason},
    runtime::configure_ort_dylib,
    tracking::ByteTrackTracker,
    video::{FfmpegSink, FfmpegSource, FrameSource, OutputCodec},
};

const DEFAULT_MODEL: &str = "./yolo/yolo11n.onnx";
const DEFAULT_TRACKER_CONFIG: &str = "./yolo/bytetrack.yaml";

// ── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "autoreframe",
    version,
    about = "Tracks multiple objects or auto-reframes a specific object",
    long_about = None
)]
struct Cli {
    /// Path to the input video file, or a camera index (0, 1, ...)
    input_video: String,

    /// Track ID to follow for the reframe; omit to annotate every object
    track_id: Option<i64>,

    /// Width in pixels of the reframed video
    #[arg(default_value_t = DEFAULT_CROP_WIDTH)]
    crop_width: u32,

    /// Height in pixels of the reframed video
    #[arg(default_value_t = DEFAULT_CROP_HEIGHT)]
    crop_height: u32,

    /// Detector ONNX model
    #[arg(long, default_value = DEFAULT_MODEL)]
    model: PathBuf,

    /// ByteTrack parameters (YAML)
    #[arg(long, default_value = DEFAULT_TRACKER_CONFIG)]
    tracker_config: PathBuf,

    /// Output video codec
    #[arg(long, value_enum, default_value_t = Codec::Mp4v)]
    codec: Codec,

    /// When the target is missing, reuse the last crop window instead of
    /// writing the full frame
    #[arg(long)]
    hold_last_window: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum Codec {
    Mp4v,
    H264,
}

impl From<Codec> for OutputCodec {
    fn from(codec: Codec) -> Self {
        match codec {
            Codec::Mp4v => OutputCodec::Mp4v,
            Codec::H264 => OutputCodec::H264,
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    // Respect RUST_LOG; default to info
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let input = match InputSource::resolve(&cli.input_video) {
        Ok(input) => input,
        Err(e @ ReframeError::InputNotFound(_)) => {
            // Not a failure exit: nothing was attempted.
            println!("{e}");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    ensure_output_dir(OUTPUT_DIR).context("failed to create output directory")?;
    let output = output_path_in(OUTPUT_DIR, &cli.input_video);
    println!("{}", output.display());

    let mode = match cli.track_id {
        None => {
            println!("Tracking all objects in video file {}", cli.input_video);
            RunMode::TrackAll
        }
        Some(track_id) => {
            println!(
                "Tracking object with id {track_id} in video file {}",
                cli.input_video
            );
            RunMode::TrackOne {
                track_id,
                crop: CropSpec::new(cli.crop_width, cli.crop_height)?,
                miss_policy: if cli.hold_last_window {
                    MissPolicy::HoldLastWindow
                } else {
                    MissPolicy::PassThrough
                },
            }
        }
    };

    // Still single-threaded here: the tokio runtime is built afterwards.
    configure_ort_dylib();

    let job = Job {
        input,
        output,
        model: cli.model,
        tracker_config: cli.tracker_config,
        codec: cli.codec.into(),
        mode,
        cancel: CancelFlag::new(),
    };

    let rt = runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    let summary = rt.block_on(run_with_interrupt(job))?;

    report(&summary);
    Ok(())
}

/// Run the blocking job on a worker thread; Ctrl-C requests a clean stop.
async fn run_with_interrupt(job: Job) -> Result<RunSummary> {
    let on_ctrl_c = job.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing current frame");
            on_ctrl_c.cancel();
        }
    });

    tokio::task::spawn_blocking(move || job.run())
        .await
        .context("reframe worker panicked")?
}

// ── Pipeline (blocking) ──────────────────────────────────────────────────────

struct Job {
    input: InputSource,
    output: PathBuf,
    model: PathBuf,
    tracker_config: PathBuf,
    codec: OutputCodec,
    mode: RunMode,
    cancel: CancelFlag,
}

impl Job {
    fn run(self) -> Result<RunSummary> {
        let tracker = ByteTrackTracker::load(&self.model, &self.tracker_config).with_context(|| {
            format!(
                "failed to start tracker (model {}, config {})",
                self.model.display(),
                self.tracker_config.display()
            )
        })?;
        let source = FfmpegSource::open(&self.input)
            .with_context(|| format!("failed to open {}", self.input.describe()))?;

        let pb = progress_bar(source.info().total_frames);
        let pb2 = pb.clone();

        let output = self.output;
        let codec = self.codec;
        let summary = ReframePipeline::new(source, tracker)
            .with_cancel(self.cancel)
            .with_progress(move |current, _total| pb2.set_position(current))
            .run(self.mode, |spec| FfmpegSink::create(&output, spec, codec))
            .with_context(|| format!("reframe run failed for {}", output.display()))?;

        pb.finish_with_message("Done.");
        Ok(summary)
    }
}

fn report(summary: &RunSummary) {
    match summary.stop_reason {
        StopReason::EndOfStream => info!("reached end of input"),
        StopReason::NoActiveTracks => info!("stopped: tracker reported no active tracks"),
        StopReason::Cancelled => warn!("stopped: cancelled by user"),
        StopReason::ReadFailure => {
            warn!("Error retrieving frame; output contains the frames written so far")
        }
    }
    info!(
        frames_written = summary.frames_written,
        frames_dropped = summary.frames_dropped,
        frames_cropped = summary.frames_cropped,
        frames_passed_through = summary.frames_passed_through,
        "done"
    );
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn progress_bar(total: u64) -> ProgressBar {
    let pb = if total > 0 {
        let pb = ProgressBar::new(total);
        if let Ok(style) = ProgressStyle::with_template(
            "{spinner:.cyan} [{elapsed_precise}] {bar:40.magenta/blue} {pos}/{len} frames ({eta})",
        ) {
            pb.set_style(style);
        }
        pb
    } else {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {pos} frames [{elapsed_precise}]") {
            pb.set_style(style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]));
        }
        pb
    };
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positional_arguments_follow_documented_order() {
        let cli = Cli::parse_from(["autoreframe", "clip.mp4", "3", "720", "1280"]);
        assert_eq!(cli.input_video, "clip.mp4");
        assert_eq!(cli.track_id, Some(3));
        assert_eq!((cli.crop_width, cli.crop_height), (720, 1280));
        assert!(!cli.hold_last_window);
    }

    #[test]
    fn crop_size_defaults_to_portrait_hd() {
        let cli = Cli::parse_from(["autoreframe", "clip.mp4", "3"]);
        assert_eq!((cli.crop_width, cli.crop_height), (1080, 1920));
        assert_eq!(cli.model, PathBuf::from(DEFAULT_MODEL));
        assert_eq!(cli.tracker_config, PathBuf::from(DEFAULT_TRACKER_CONFIG));
    }

    #[test]
    fn track_id_is_optional() {
        let cli = Cli::parse_from(["autoreframe", "0"]);
        assert_eq!(cli.track_id, None);
    }

    #[test]
    fn unknown_frame_count_shows_a_spinner() {
        assert_eq!(progress_bar(0).length(), None);
        assert_eq!(progress_bar(120).length(), Some(120));
    }

    #[test]
    fn codec_flag_maps_to_output_codec() {
        let cli = Cli::parse_from(["autoreframe", "clip.mp4", "--codec", "h264"]);
        assert_eq!(OutputCodec::from(cli.codec), OutputCodec::H264);
    }
}
