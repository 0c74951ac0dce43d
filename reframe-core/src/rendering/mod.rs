//! rendering — in-place crops and tracking overlays
//!
//! Cropping copies only the window rows into a reusable buffer and swaps it
//! into the frame. Overlays draw a thick box plus an `Id <n>` label above
//! its top-left corner using a small built-in bitmap font.

use anyhow::{Context, Result, ensure};
use image::{ImageBuffer, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;

use crate::geometry::CropWindow;
use crate::tracking::{DetectionBox, TrackedDetection};
use crate::video::RgbFrame;

/// Overlay colour (magenta).
pub const OVERLAY_COLOR: [u8; 3] = [255, 0, 255];
const BOX_THICKNESS: i32 = 5;
/// Pixel size of one font cell.
const GLYPH_SCALE: i32 = 5;
const GLYPH_W: i32 = 5;
const GLYPH_H: i32 = 7;

/// Reusable rendering context to avoid per-frame allocations.
pub struct FrameRenderer {
    crop_buf: Vec<u8>,
}

impl FrameRenderer {
    pub fn new() -> Self {
        Self {
            crop_buf: Vec::new(),
        }
    }

    /// Replace `frame` with the pixels inside `window`.
    pub fn crop_in_place(&mut self, frame: &mut RgbFrame, window: &CropWindow) -> Result<()> {
        ensure!(
            window.x_min <= window.x_max
                && window.y_min <= window.y_max
                && window.x_max <= frame.width
                && window.y_max <= frame.height,
            "crop window {window:?} outside {}x{} frame",
            frame.width,
            frame.height
        );

        let crop_w = window.width();
        let crop_h = window.height();

        // Copy only the crop rows from the raw slice — O(crop area), no full-frame clone.
        let src_stride = (frame.width * 3) as usize;
        let dst_stride = (crop_w * 3) as usize;
        let crop_len = dst_stride * crop_h as usize;
        if self.crop_buf.len() != crop_len {
            self.crop_buf.resize(crop_len, 0);
        }
        for row in 0..crop_h as usize {
            let src_start = (window.y_min as usize + row) * src_stride + window.x_min as usize * 3;
            let dst_start = row * dst_stride;
            self.crop_buf[dst_start..dst_start + dst_stride]
                .copy_from_slice(&frame.data[src_start..src_start + dst_stride]);
        }

        std::mem::swap(&mut frame.data, &mut self.crop_buf);
        frame.width = crop_w;
        frame.height = crop_h;
        Ok(())
    }
}

impl Default for FrameRenderer {
    fn default() -> Self {
        Self::new()
    }
}

/// Draw every tracked box and its persistent ID onto the frame in-place.
pub fn draw_tracks(frame: &mut RgbFrame, tracks: &[TrackedDetection]) -> Result<()> {
    if tracks.is_empty() {
        return Ok(());
    }

    // Build the image from the existing buffer — no clone; we write back in-place.
    let mut img: RgbImage =
        ImageBuffer::from_raw(frame.width, frame.height, std::mem::take(&mut frame.data))
            .context("frame buffer does not match its dimensions")?;

    let color = Rgb(OVERLAY_COLOR);
    for track in tracks {
        draw_thick_box(&mut img, &track.bbox, color);
        let label = format!("Id {}", track.persistent_id);
        let text_h = GLYPH_H * GLYPH_SCALE;
        draw_label(&mut img, &label, track.bbox.x_min, track.bbox.y_min - text_h, color);
    }

    frame.data = img.into_raw();
    Ok(())
}

fn draw_thick_box(img: &mut RgbImage, bbox: &DetectionBox, color: Rgb<u8>) {
    let half = BOX_THICKNESS / 2;
    for offset in -half..=half {
        let w = bbox.width() as i32 + 2 * offset;
        let h = bbox.height() as i32 + 2 * offset;
        if w <= 0 || h <= 0 {
            continue;
        }
        let rect = Rect::at(bbox.x_min - offset, bbox.y_min - offset).of_size(w as u32, h as u32);
        draw_hollow_rect_mut(img, rect, color);
    }
}

fn draw_label(img: &mut RgbImage, text: &str, x: i32, y: i32, color: Rgb<u8>) {
    let advance = (GLYPH_W + 1) * GLYPH_SCALE;
    for (i, ch) in text.chars().enumerate() {
        let Some(rows) = glyph(ch) else {
            continue;
        };
        let origin_x = x + i as i32 * advance;
        for (row, bits) in rows.iter().enumerate() {
            for col in 0..GLYPH_W {
                if bits & (1 << (GLYPH_W - 1 - col)) == 0 {
                    continue;
                }
                let cell = Rect::at(
                    origin_x + col * GLYPH_SCALE,
                    y + row as i32 * GLYPH_SCALE,
                )
                .of_size(GLYPH_SCALE as u32, GLYPH_SCALE as u32);
                draw_filled_rect_mut(img, cell, color);
            }
        }
    }
}

/// 5×7 bitmaps, one byte per row, MSB-first in the low five bits.
fn glyph(ch: char) -> Option<[u8; 7]> {
    let rows = match ch {
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        'I' => [0x0E, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E],
        'd' => [0x01, 0x01, 0x0D, 0x13, 0x11, 0x11, 0x0F],
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        ' ' => [0x00; 7],
        _ => return None,
    };
    Some(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> RgbFrame {
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&[x as u8, y as u8, 0]);
            }
        }
        RgbFrame::new(data, width, height, 0).unwrap()
    }

    fn pixel(frame: &RgbFrame, x: u32, y: u32) -> [u8; 3] {
        let i = ((y * frame.width + x) * 3) as usize;
        [frame.data[i], frame.data[i + 1], frame.data[i + 2]]
    }

    #[test]
    fn crop_keeps_window_pixels() {
        let mut frame = gradient(20, 10);
        let window = CropWindow {
            x_min: 5,
            x_max: 12,
            y_min: 2,
            y_max: 8,
        };
        FrameRenderer::new().crop_in_place(&mut frame, &window).unwrap();

        assert_eq!((frame.width, frame.height), (7, 6));
        assert_eq!(frame.data.len(), 7 * 6 * 3);
        assert_eq!(pixel(&frame, 0, 0), [5, 2, 0]);
        assert_eq!(pixel(&frame, 6, 5), [11, 7, 0]);
    }

    #[test]
    fn crop_outside_frame_is_rejected() {
        let mut frame = gradient(20, 10);
        let window = CropWindow {
            x_min: 15,
            x_max: 25,
            y_min: 0,
            y_max: 10,
        };
        assert!(FrameRenderer::new().crop_in_place(&mut frame, &window).is_err());
        assert_eq!(frame.width, 20);
    }

    #[test]
    fn renderer_reuses_buffer_across_frames() {
        let mut renderer = FrameRenderer::new();
        let window = CropWindow {
            x_min: 0,
            x_max: 4,
            y_min: 0,
            y_max: 4,
        };
        for _ in 0..3 {
            let mut frame = gradient(8, 8);
            renderer.crop_in_place(&mut frame, &window).unwrap();
            assert_eq!(pixel(&frame, 3, 3), [3, 3, 0]);
        }
    }

    #[test]
    fn box_outline_is_drawn() {
        let mut frame = RgbFrame::filled(200, 200, [0, 0, 0], 0);
        let track = TrackedDetection {
            bbox: DetectionBox::new(50, 80, 150, 180),
            persistent_id: 7,
        };
        draw_tracks(&mut frame, &[track]).unwrap();

        assert_eq!(pixel(&frame, 50, 120), OVERLAY_COLOR);
        assert_eq!(pixel(&frame, 100, 80), OVERLAY_COLOR);
        assert_eq!(pixel(&frame, 100, 130), [0, 0, 0]);
        // label sits above the box
        let label_lit = (0..35)
            .flat_map(|y| (50..100).map(move |x| (x, 80 - 35 + y)))
            .any(|(x, y)| pixel(&frame, x, y) == OVERLAY_COLOR);
        assert!(label_lit);
    }

    #[test]
    fn boxes_touching_the_border_are_clipped() {
        let mut frame = RgbFrame::filled(40, 40, [0, 0, 0], 0);
        let track = TrackedDetection {
            bbox: DetectionBox::new(0, 0, 39, 39),
            persistent_id: 123,
        };
        draw_tracks(&mut frame, &[track]).unwrap();
        assert_eq!(frame.data.len(), 40 * 40 * 3);
        assert_eq!(pixel(&frame, 0, 0), OVERLAY_COLOR);
    }

    #[test]
    fn no_tracks_leaves_frame_untouched() {
        let mut frame = gradient(8, 8);
        let before = frame.clone();
        draw_tracks(&mut frame, &[]).unwrap();
        assert_eq!(frame, before);
    }
}
