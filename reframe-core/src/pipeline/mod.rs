use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::geometry::{CropSpec, CropWindow};
use crate::rendering::{FrameRenderer, draw_tracks};
use crate::tracking::{Tracker, TrackerOutput};
use crate::video::{FrameSink, FrameSource, RgbFrame, SinkSpec, StreamInfo, WriteOutcome};

/// Frames between timing log lines.
const PROFILE_EVERY: u64 = 300;

/// Cooperative stop request, polled once per frame.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What to emit in crop mode when the target ID is missing from a frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MissPolicy {
    /// Write the full, uncropped frame.
    #[default]
    PassThrough,
    /// Reuse the previous frame's window; pass through until the first match.
    HoldLastWindow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Draw every tracked box and its ID.
    TrackAll,
    /// Follow one persistent ID with a fixed-size crop.
    TrackOne {
        track_id: i64,
        crop: CropSpec,
        miss_policy: MissPolicy,
    },
}

impl RunMode {
    /// Output geometry for a source with `info`.
    pub fn sink_spec(&self, info: &StreamInfo) -> SinkSpec {
        match self {
            Self::TrackAll => SinkSpec {
                fps: info.fps,
                width: info.width,
                height: info.height,
            },
            Self::TrackOne { crop, .. } => {
                let effective = crop.effective(info.width, info.height);
                SinkSpec {
                    fps: info.fps,
                    width: effective.width,
                    height: effective.height,
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndOfStream,
    /// Decoding or reading failed mid-stream; output written so far is kept.
    ReadFailure,
    /// The tracker reported no active tracks; the run ends there.
    NoActiveTracks,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub frames_read: u64,
    /// Frames the sink actually encoded.
    pub frames_written: u64,
    /// Frames the sink refused, e.g. full-size pass-through frames in crop mode.
    pub frames_dropped: u64,
    pub frames_cropped: u64,
    pub frames_passed_through: u64,
    pub stop_reason: StopReason,
}

impl RunSummary {
    fn new() -> Self {
        Self {
            frames_read: 0,
            frames_written: 0,
            frames_dropped: 0,
            frames_cropped: 0,
            frames_passed_through: 0,
            stop_reason: StopReason::EndOfStream,
        }
    }

    fn record(&mut self, outcome: WriteOutcome) {
        match outcome {
            WriteOutcome::Written => self.frames_written += 1,
            WriteOutcome::Dropped => self.frames_dropped += 1,
        }
    }
}

/// One tracking run: owns the source and the tracker session, and drives
/// read → track → draw/crop → write until a stop condition.
pub struct ReframePipeline<S, T> {
    source: S,
    tracker: T,
    renderer: FrameRenderer,
    cancel: CancelFlag,
    progress: Option<Box<dyn FnMut(u64, u64)>>,
    prof_frames: u64,
    prof_track: Duration,
    prof_render: Duration,
}

impl<S: FrameSource, T: Tracker> ReframePipeline<S, T> {
    pub fn new(source: S, tracker: T) -> Self {
        Self {
            source,
            tracker,
            renderer: FrameRenderer::new(),
            cancel: CancelFlag::new(),
            progress: None,
            prof_frames: 0,
            prof_track: Duration::ZERO,
            prof_render: Duration::ZERO,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// `progress(frames_read, total_frames)` after every written frame.
    pub fn with_progress<F: FnMut(u64, u64) + 'static>(mut self, progress: F) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    pub fn stream_info(&self) -> StreamInfo {
        self.source.info()
    }

    /// Run to completion. `open_sink` receives the output geometry for `mode`.
    ///
    /// The sink is finished and the source released on every exit path; a
    /// finish failure after an earlier error is logged, not returned.
    pub fn run<K, F>(mut self, mode: RunMode, open_sink: F) -> Result<RunSummary>
    where
        K: FrameSink,
        F: FnOnce(SinkSpec) -> Result<K>,
    {
        let info = self.source.info();
        let spec = mode.sink_spec(&info);
        let mut sink = open_sink(spec)?;

        let mut summary = RunSummary::new();
        let outcome = match mode {
            RunMode::TrackAll => {
                info!(width = info.width, height = info.height, "tracking all objects");
                self.track_all(&mut sink, &mut summary)
            }
            RunMode::TrackOne {
                track_id,
                crop,
                miss_policy,
            } => {
                let effective = crop.effective(info.width, info.height);
                info!(
                    track_id,
                    crop_width = effective.width,
                    crop_height = effective.height,
                    ?miss_policy,
                    "tracking single object"
                );
                self.track_one(&mut sink, &mut summary, track_id, effective, miss_policy)
            }
        };

        let finished = sink.finish();
        match outcome {
            Ok(reason) => {
                finished?;
                summary.stop_reason = reason;
                info!(
                    frames_read = summary.frames_read,
                    frames_written = summary.frames_written,
                    frames_dropped = summary.frames_dropped,
                    frames_cropped = summary.frames_cropped,
                    frames_passed_through = summary.frames_passed_through,
                    stop_reason = ?reason,
                    "run finished"
                );
                Ok(summary)
            }
            Err(e) => {
                if let Err(finish_err) = finished {
                    warn!("failed to close output after error: {finish_err:#}");
                }
                Err(e)
            }
        }
    }

    fn track_all<K: FrameSink>(
        &mut self,
        sink: &mut K,
        summary: &mut RunSummary,
    ) -> Result<StopReason> {
        loop {
            let mut frame = match self.read_next() {
                Ok(frame) => frame,
                Err(reason) => return Ok(reason),
            };
            summary.frames_read += 1;

            let tracks = match self.track(&frame)? {
                TrackerOutput::NoActiveTracks => {
                    info!(frame = frame.index, "no active tracks; stopping");
                    return Ok(StopReason::NoActiveTracks);
                }
                TrackerOutput::Tracks(tracks) => tracks,
            };

            let render_start = Instant::now();
            draw_tracks(&mut frame, &tracks)?;
            self.prof_render += render_start.elapsed();

            summary.record(sink.write_frame(&frame)?);
            self.frame_done(summary.frames_read);
        }
    }

    fn track_one<K: FrameSink>(
        &mut self,
        sink: &mut K,
        summary: &mut RunSummary,
        track_id: i64,
        crop: CropSpec,
        miss_policy: MissPolicy,
    ) -> Result<StopReason> {
        let mut last_window: Option<CropWindow> = None;

        loop {
            let mut frame = match self.read_next() {
                Ok(frame) => frame,
                Err(reason) => return Ok(reason),
            };
            summary.frames_read += 1;

            let output = self.track(&frame)?;
            if output == TrackerOutput::NoActiveTracks {
                info!(frame = frame.index, "no active tracks; stopping");
                return Ok(StopReason::NoActiveTracks);
            }

            let window = match output.find(track_id) {
                Some(target) => {
                    let window =
                        CropWindow::around(target.bbox.center_x(), crop, frame.width, frame.height);
                    last_window = Some(window);
                    Some(window)
                }
                None => {
                    debug!(frame = frame.index, track_id, "target not in frame");
                    match miss_policy {
                        MissPolicy::PassThrough => None,
                        MissPolicy::HoldLastWindow => last_window,
                    }
                }
            };

            match window {
                Some(window) => {
                    let render_start = Instant::now();
                    self.renderer.crop_in_place(&mut frame, &window)?;
                    self.prof_render += render_start.elapsed();
                    summary.frames_cropped += 1;
                }
                None => summary.frames_passed_through += 1,
            }

            summary.record(sink.write_frame(&frame)?);
            self.frame_done(summary.frames_read);
        }
    }

    fn read_next(&mut self) -> Result<RgbFrame, StopReason> {
        if self.cancel.is_cancelled() {
            info!("cancellation requested; stopping");
            return Err(StopReason::Cancelled);
        }
        match self.source.read_frame() {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => Err(StopReason::EndOfStream),
            Err(e) => {
                warn!("error retrieving frame: {e:#}");
                Err(StopReason::ReadFailure)
            }
        }
    }

    fn track(&mut self, frame: &RgbFrame) -> Result<TrackerOutput> {
        let track_start = Instant::now();
        let output = self.tracker.track(frame);
        self.prof_track += track_start.elapsed();
        output
    }

    fn frame_done(&mut self, frames_read: u64) {
        if let Some(progress) = self.progress.as_mut() {
            progress(frames_read, self.source.info().total_frames);
        }

        self.prof_frames += 1;
        if self.prof_frames % PROFILE_EVERY == 0 {
            let frames = self.prof_frames as f64;
            info!(
                frames = self.prof_frames,
                track_ms_per_frame = format!("{:.2}", self.prof_track.as_secs_f64() * 1000.0 / frames),
                render_ms_per_frame = format!("{:.2}", self.prof_render.as_secs_f64() * 1000.0 / frames),
                "pipeline timings"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_flag_is_shared_between_clones() {
        let flag = CancelFlag::new();
        let other = flag.clone();
        assert!(!other.is_cancelled());
        flag.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn sink_spec_matches_mode() {
        let info = StreamInfo {
            fps: 30,
            width: 1920,
            height: 1080,
            total_frames: 0,
        };
        assert_eq!(
            RunMode::TrackAll.sink_spec(&info),
            SinkSpec {
                fps: 30,
                width: 1920,
                height: 1080
            }
        );

        let mode = RunMode::TrackOne {
            track_id: 1,
            crop: CropSpec::new(4000, 4000).unwrap(),
            miss_policy: MissPolicy::PassThrough,
        };
        assert_eq!(
            mode.sink_spec(&info),
            SinkSpec {
                fps: 30,
                width: 1920,
                height: 1080
            }
        );
    }

    #[test]
    fn summary_counts_written_and_dropped_separately() {
        let mut summary = RunSummary::new();
        summary.record(WriteOutcome::Written);
        summary.record(WriteOutcome::Dropped);
        summary.record(WriteOutcome::Written);
        assert_eq!((summary.frames_written, summary.frames_dropped), (2, 1));
    }

    #[test]
    fn default_miss_policy_passes_frames_through() {
        assert_eq!(MissPolicy::default(), MissPolicy::PassThrough);
    }
}
