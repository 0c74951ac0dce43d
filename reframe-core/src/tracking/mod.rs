//! tracking — per-frame tracker contract and the ByteTrack adapter
//!
//! A `Tracker` turns one frame into either a list of `(box, persistent id)`
//! pairs or the `NoActiveTracks` signal. Identity continuity lives inside
//! the tracker, so one instance serves exactly one run.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use tracing::{debug, info};
use trackforge::trackers::byte_track::ByteTrack;

use crate::detection::{BBox, DEFAULT_CONF_THRESHOLD, Detector};
use crate::video::RgbFrame;

/// Integer box in source pixels, `x_min <= x_max` and `y_min <= y_max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DetectionBox {
    pub x_min: i32,
    pub y_min: i32,
    pub x_max: i32,
    pub y_max: i32,
}

impl DetectionBox {
    pub fn new(x_min: i32, y_min: i32, x_max: i32, y_max: i32) -> Self {
        Self {
            x_min: x_min.min(x_max),
            y_min: y_min.min(y_max),
            x_max: x_max.max(x_min),
            y_max: y_max.max(y_min),
        }
    }

    /// Truncate a `[left, top, width, height]` float box to pixels.
    pub fn from_tlwh(tlwh: [f32; 4]) -> Self {
        let [left, top, width, height] = tlwh;
        Self::new(
            left as i32,
            top as i32,
            (left + width) as i32,
            (top + height) as i32,
        )
    }

    pub fn center_x(&self) -> i64 {
        i64::from(self.x_min) + (i64::from(self.x_max) - i64::from(self.x_min)) / 2
    }

    pub fn width(&self) -> u32 {
        (self.x_max - self.x_min) as u32
    }

    pub fn height(&self) -> u32 {
        (self.y_max - self.y_min) as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedDetection {
    pub bbox: DetectionBox,
    pub persistent_id: i64,
}

/// What the tracker reports for one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerOutput {
    /// The tracker holds no persistent tracks at all for this frame.
    NoActiveTracks,
    /// Active tracks exist; the list may still be empty.
    Tracks(Vec<TrackedDetection>),
}

impl TrackerOutput {
    /// First detection carrying `id`, if any.
    pub fn find(&self, id: i64) -> Option<&TrackedDetection> {
        match self {
            Self::NoActiveTracks => None,
            Self::Tracks(tracks) => tracks.iter().find(|t| t.persistent_id == id),
        }
    }
}

/// Stateful per-run object tracker.
pub trait Tracker {
    fn track(&mut self, frame: &RgbFrame) -> Result<TrackerOutput>;
}

impl<T: Tracker + ?Sized> Tracker for Box<T> {
    fn track(&mut self, frame: &RgbFrame) -> Result<TrackerOutput> {
        (**self).track(frame)
    }
}

// ── Configuration ────────────────────────────────────────────────────────────

/// ByteTrack parameters, read from the same YAML layout the stock
/// `bytetrack.yaml` uses. Unknown keys (`tracker_type`, `fuse_score`) are ignored.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Threshold for the first association pass.
    pub track_high_thresh: f32,
    /// Lowest detection score fed to the tracker at all.
    pub track_low_thresh: f32,
    /// Minimum score to start a new track.
    pub new_track_thresh: f32,
    /// Frames a lost track is kept before removal.
    pub track_buffer: u32,
    /// IoU threshold for matching.
    pub match_thresh: f32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            track_high_thresh: 0.25,
            track_low_thresh: DEFAULT_CONF_THRESHOLD,
            new_track_thresh: 0.25,
            track_buffer: 30,
            match_thresh: 0.8,
        }
    }
}

impl TrackerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let cfg: TrackerConfig = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Yaml))
            .build()
            .and_then(|c| c.try_deserialize())
            .with_context(|| format!("failed to read tracker config {}", path.display()))?;
        debug!(?cfg, "tracker config loaded");
        Ok(cfg)
    }
}

// ── ByteTrack adapter ────────────────────────────────────────────────────────

/// Detector + ByteTrack association, one session per run.
pub struct ByteTrackTracker {
    detector: Detector,
    byte_track: ByteTrack,
}

impl ByteTrackTracker {
    pub fn load<P: AsRef<Path>, Q: AsRef<Path>>(model_path: P, config_path: Q) -> Result<Self> {
        let cfg = TrackerConfig::load(config_path)?;
        let detector = Detector::load(model_path, cfg.track_low_thresh)?;
        info!(
            accelerator = %detector.accelerator(),
            track_buffer = cfg.track_buffer,
            "tracker session ready"
        );
        Ok(Self::new(detector, &cfg))
    }

    pub fn new(detector: Detector, cfg: &TrackerConfig) -> Self {
        // Numeric widths of the ByteTrack constructor are inferred.
        let byte_track = ByteTrack::new(
            cfg.track_high_thresh as _,
            cfg.track_buffer as _,
            cfg.match_thresh as _,
            cfg.new_track_thresh as _,
        );
        Self {
            detector,
            byte_track,
        }
    }
}

impl Tracker for ByteTrackTracker {
    fn track(&mut self, frame: &RgbFrame) -> Result<TrackerOutput> {
        let boxes: Vec<BBox> = self.detector.detect(frame)?;
        let detections: Vec<_> = boxes
            .iter()
            .map(|b| (b.tlwh(), b.confidence as _, b.class_id as _))
            .collect();

        let tracks = self.byte_track.update(detections);

        if tracks.is_empty() {
            debug!(frame = frame.index, "no active tracks");
            return Ok(TrackerOutput::NoActiveTracks);
        }

        let tracked = tracks
            .iter()
            .map(|t| TrackedDetection {
                bbox: DetectionBox::from_tlwh([
                    t.tlwh[0] as f32,
                    t.tlwh[1] as f32,
                    t.tlwh[2] as f32,
                    t.tlwh[3] as f32,
                ]),
                persistent_id: t.track_id as i64,
            })
            .collect::<Vec<_>>();
        debug!(frame = frame.index, tracks = tracked.len(), "tracker pass");
        Ok(TrackerOutput::Tracks(tracked))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn center_x_truncates_like_integer_pixels() {
        let b = DetectionBox::new(10, 0, 21, 5);
        assert_eq!(b.center_x(), 15);
        assert_eq!(b.width(), 11);
    }

    #[test]
    fn inverted_corners_are_normalised() {
        let b = DetectionBox::new(30, 40, 10, 20);
        assert_eq!(b, DetectionBox::new(10, 20, 30, 40));
    }

    #[test]
    fn tlwh_conversion_truncates() {
        let b = DetectionBox::from_tlwh([10.7, 5.2, 20.0, 30.9]);
        assert_eq!(b, DetectionBox::new(10, 5, 30, 36));
    }

    #[test]
    fn find_returns_first_match() {
        let a = TrackedDetection {
            bbox: DetectionBox::new(0, 0, 10, 10),
            persistent_id: 3,
        };
        let b = TrackedDetection {
            bbox: DetectionBox::new(50, 0, 60, 10),
            persistent_id: 3,
        };
        let output = TrackerOutput::Tracks(vec![a, b]);
        assert_eq!(output.find(3), Some(&a));
        assert_eq!(output.find(4), None);
        assert_eq!(TrackerOutput::NoActiveTracks.find(3), None);
    }

    #[test]
    fn stock_bytetrack_yaml_parses() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "tracker_type: bytetrack\n\
             track_high_thresh: 0.5\n\
             track_low_thresh: 0.1\n\
             new_track_thresh: 0.6\n\
             track_buffer: 60\n\
             match_thresh: 0.8\n\
             fuse_score: True"
        )
        .unwrap();

        let cfg = TrackerConfig::load(file.path()).unwrap();
        assert_eq!(cfg.track_high_thresh, 0.5);
        assert_eq!(cfg.new_track_thresh, 0.6);
        assert_eq!(cfg.track_buffer, 60);
    }

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "track_buffer: 90").unwrap();

        let cfg = TrackerConfig::load(file.path()).unwrap();
        assert_eq!(cfg.track_buffer, 90);
        assert_eq!(cfg.match_thresh, TrackerConfig::default().match_thresh);
    }

    #[test]
    fn missing_config_file_is_an_error() {
        assert!(TrackerConfig::load("no/such/bytetrack.yaml").is_err());
    }
}
