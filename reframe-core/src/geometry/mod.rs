//! geometry — crop window arithmetic
//!
//! Horizontal placement follows the tracked object and is clamped to the
//! frame. Vertical placement is a fixed centred band: no vertical tracking
//! is performed, so an object near the top or bottom edge may be cut off.

use crate::error::ReframeError;

/// Default reframe size (portrait 9:16) when only a track ID is given.
pub const DEFAULT_CROP_WIDTH: u32 = 1080;
pub const DEFAULT_CROP_HEIGHT: u32 = 1920;

/// Requested output size for a reframe run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropSpec {
    pub width: u32,
    pub height: u32,
}

impl CropSpec {
    pub fn new(width: u32, height: u32) -> Result<Self, ReframeError> {
        if width == 0 || height == 0 {
            return Err(ReframeError::InvalidCropSpec { width, height });
        }
        Ok(Self { width, height })
    }

    /// Shrink each axis to the source dimension; never crop larger than the frame.
    pub fn effective(&self, source_width: u32, source_height: u32) -> CropSpec {
        CropSpec {
            width: self.width.min(source_width),
            height: self.height.min(source_height),
        }
    }
}

impl Default for CropSpec {
    fn default() -> Self {
        Self {
            width: DEFAULT_CROP_WIDTH,
            height: DEFAULT_CROP_HEIGHT,
        }
    }
}

/// Crop rectangle in source-frame pixels, half-open on the max edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropWindow {
    pub x_min: u32,
    pub x_max: u32,
    pub y_min: u32,
    pub y_max: u32,
}

impl CropWindow {
    /// Window of `crop` size whose horizontal centre follows `center_x`.
    pub fn around(center_x: i64, crop: CropSpec, frame_width: u32, frame_height: u32) -> Self {
        let (x_min, x_max) = compute_x_range(center_x, crop.width, frame_width);
        let (y_min, y_max) = fixed_y_range(crop.height, frame_height);
        Self {
            x_min,
            x_max,
            y_min,
            y_max,
        }
    }

    pub fn width(&self) -> u32 {
        self.x_max - self.x_min
    }

    pub fn height(&self) -> u32 {
        self.y_max - self.y_min
    }
}

/// Horizontal crop range centred on `center`, shifted back inside
/// `[0, frame_width]` when it would spill over either edge.
///
/// Requires `crop_width <= frame_width`. The returned range always spans
/// exactly `crop_width` pixels.
pub fn compute_x_range(center: i64, crop_width: u32, frame_width: u32) -> (u32, u32) {
    debug_assert!(crop_width <= frame_width);
    let crop = i64::from(crop_width);
    let frame = i64::from(frame_width);

    // floor(center - crop/2) and floor(center + crop/2)
    let mut x_min = center - (crop + 1) / 2;
    let mut x_max = center + crop / 2;

    if x_min < 0 {
        x_min = 0;
        x_max = crop;
    }
    if x_max > frame {
        x_max = frame;
        x_min = frame - crop;
    }

    (x_min as u32, x_max as u32)
}

/// Static vertical band centred in the frame. Requires `crop_height <= frame_height`.
pub fn fixed_y_range(crop_height: u32, frame_height: u32) -> (u32, u32) {
    debug_assert!(crop_height <= frame_height);
    let y_min = (frame_height - crop_height) / 2;
    let y_max = (frame_height + crop_height) / 2;
    (y_min, y_max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_window_at_left_edge() {
        assert_eq!(compute_x_range(50, 200, 1000), (0, 200));
    }

    #[test]
    fn clamps_window_at_right_edge() {
        assert_eq!(compute_x_range(950, 200, 1000), (800, 1000));
    }

    #[test]
    fn centred_window_is_untouched() {
        assert_eq!(compute_x_range(500, 200, 1000), (400, 600));
    }

    #[test]
    fn x_range_invariants_hold_for_every_centre() {
        for frame_width in [1u32, 7, 64, 201, 1000] {
            for crop_width in 0..=frame_width {
                for center in -300i64..=i64::from(frame_width) + 300 {
                    let (x_min, x_max) = compute_x_range(center, crop_width, frame_width);
                    assert!(x_max <= frame_width, "{center} {crop_width} {frame_width}");
                    assert_eq!(x_max - x_min, crop_width, "{center} {crop_width} {frame_width}");
                }
            }
        }
    }

    #[test]
    fn odd_width_keeps_exact_span_near_left_edge() {
        // centre - 100.5 lands in (-1, 0); the span must still be 201.
        let (x_min, x_max) = compute_x_range(100, 201, 1000);
        assert_eq!(x_max - x_min, 201);
    }

    #[test]
    fn extreme_centres_are_clamped() {
        assert_eq!(compute_x_range(i64::from(i32::MIN), 100, 640), (0, 100));
        assert_eq!(compute_x_range(i64::from(i32::MAX), 100, 640), (540, 640));
    }

    #[test]
    fn vertical_band_is_centred() {
        assert_eq!(fixed_y_range(1080, 1080), (0, 1080));
        assert_eq!(fixed_y_range(500, 1080), (290, 790));
        assert_eq!(fixed_y_range(1080, 1081), (0, 1080));
    }

    #[test]
    fn effective_size_never_exceeds_source() {
        let spec = CropSpec::new(4000, 4000).unwrap();
        assert_eq!(spec.effective(1920, 1080), CropSpec::new(1920, 1080).unwrap());

        let spec = CropSpec::default();
        assert_eq!(spec.effective(1920, 1080), CropSpec::new(1080, 1080).unwrap());
    }

    #[test]
    fn zero_sized_crop_is_rejected() {
        assert!(matches!(
            CropSpec::new(0, 1920),
            Err(ReframeError::InvalidCropSpec { width: 0, .. })
        ));
    }

    #[test]
    fn window_around_object_has_effective_size() {
        let crop = CropSpec::default().effective(1920, 1080);
        let window = CropWindow::around(1900, crop, 1920, 1080);
        assert_eq!(window.width(), 1080);
        assert_eq!(window.height(), 1080);
        assert_eq!(window.x_max, 1920);
    }
}
