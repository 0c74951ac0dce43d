//! detection — YOLO-family ONNX detector
//!
//! Loads an exported `yolo*.onnx` model (input `images`, output `output0`
//! shaped `[1, 4 + classes, proposals]`), runs it on a stretched 640×640
//! copy of the frame and returns class-aware NMS'd boxes in source pixels.
//! Association across frames is not done here; see `tracking`.

use anyhow::{Context, Result};
use fast_image_resize as fr;
use ort::session::Session;
use ort::value::Tensor;
use rayon::prelude::*;
use std::path::Path;
use tracing::debug;

use crate::error::ReframeError;
use crate::runtime::{self, Accelerator};
use crate::video::RgbFrame;

/// YOLO input size (square).
const YOLO_SIZE: u32 = 640;
/// Default minimum class score. Kept low because ByteTrack also consumes
/// low-confidence boxes in its second association pass.
pub const DEFAULT_CONF_THRESHOLD: f32 = 0.1;
/// IoU threshold for NMS.
const IOU_THRESHOLD: f32 = 0.7;

/// Axis-aligned bounding box in pixel coordinates of the original frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    pub class_id: usize,
}

impl BBox {
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }
    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }
    /// `[left, top, width, height]`
    pub fn tlwh(&self) -> [f32; 4] {
        [self.x1, self.y1, self.width(), self.height()]
    }
    /// IoU (intersection over union) with another box.
    pub fn iou(&self, other: &BBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        if inter == 0.0 {
            return 0.0;
        }
        let union = self.width() * self.height() + other.width() * other.height() - inter;
        inter / union
    }
}

/// Wraps the YOLO ONNX session.
pub struct Detector {
    session: Session,
    accelerator: Accelerator,
    conf_threshold: f32,
    resizer: fr::Resizer,
    resize_buf: Vec<u8>,
}

impl Detector {
    /// Load a YOLO ONNX model from `model_path` on the best available device.
    pub fn load<P: AsRef<Path>>(model_path: P, conf_threshold: f32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let accelerator = runtime::select_accelerator();
        let session = runtime::build_session(model_path, accelerator)
            .with_context(|| format!("failed to load detector model {}", model_path.display()))?;
        Ok(Self {
            session,
            accelerator,
            conf_threshold,
            resizer: fr::Resizer::new(),
            resize_buf: vec![0u8; (YOLO_SIZE * YOLO_SIZE * 3) as usize],
        })
    }

    pub fn accelerator(&self) -> Accelerator {
        self.accelerator
    }

    /// Run inference on `frame` and return boxes in original frame pixels.
    pub fn detect(&mut self, frame: &RgbFrame) -> Result<Vec<BBox>> {
        let input_tensor = self.preprocess(frame)?;

        let outputs = self
            .session
            .run(ort::inputs!["images" => input_tensor])
            .context("detector inference failed")?;

        let (shape, data) = outputs["output0"]
            .try_extract_tensor::<f32>()
            .context("failed to extract detector output tensor")?;

        // [1, 4 + num_classes, num_proposals], stored row-major per attribute
        let dims: Vec<i64> = shape.iter().copied().collect();
        if dims.len() != 3 || dims[1] <= 4 || dims[2] <= 0 {
            return Err(ReframeError::UnexpectedModelOutput(dims).into());
        }
        let num_classes = dims[1] as usize - 4;
        let num_proposals = dims[2] as usize;

        let scale_x = frame.width as f32 / YOLO_SIZE as f32;
        let scale_y = frame.height as f32 / YOLO_SIZE as f32;
        let conf_threshold = self.conf_threshold;

        let candidates: Vec<BBox> = (0..num_proposals)
            .into_par_iter()
            .filter_map(|i| {
                let cx = data[i];
                let cy = data[num_proposals + i];
                let w = data[2 * num_proposals + i];
                let h = data[3 * num_proposals + i];

                let (class_id, score) = (0..num_classes)
                    .map(|c| (c, data[(4 + c) * num_proposals + i]))
                    .fold((0usize, f32::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });

                if score < conf_threshold {
                    return None;
                }

                // (cx,cy,w,h) in 640-space → (x1,y1,x2,y2) in the original frame
                Some(BBox {
                    x1: ((cx - w / 2.0) * scale_x).max(0.0),
                    y1: ((cy - h / 2.0) * scale_y).max(0.0),
                    x2: ((cx + w / 2.0) * scale_x).min(frame.width as f32),
                    y2: ((cy + h / 2.0) * scale_y).min(frame.height as f32),
                    confidence: score,
                    class_id,
                })
            })
            .collect();

        let kept = nms(candidates, IOU_THRESHOLD);
        debug!(frame = frame.index, detections = kept.len(), "detector pass");
        Ok(kept)
    }

    fn preprocess(&mut self, frame: &RgbFrame) -> Result<ort::value::DynValue> {
        let src =
            fr::images::ImageRef::new(frame.width, frame.height, &frame.data, fr::PixelType::U8x3)
                .context("failed to create fast_image_resize source")?;

        let mut dst = fr::images::Image::from_vec_u8(
            YOLO_SIZE,
            YOLO_SIZE,
            std::mem::take(&mut self.resize_buf),
            fr::PixelType::U8x3,
        )
        .context("failed to create fast_image_resize destination")?;

        let options = fr::ResizeOptions::new()
            .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear));
        self.resizer
            .resize(&src, &mut dst, Some(&options))
            .context("fast_image_resize detector downscale failed")?;

        self.resize_buf = dst.into_vec();
        let raw = &self.resize_buf;

        // NCHW float tensor: [1, 3, 640, 640].
        let size = (YOLO_SIZE * YOLO_SIZE) as usize;
        let mut tensor_data = vec![0f32; 3 * size];
        tensor_data
            .par_chunks_mut(size)
            .enumerate()
            .for_each(|(channel, plane)| {
                for (idx, out) in plane.iter_mut().enumerate() {
                    *out = raw[idx * 3 + channel] as f32 / 255.0;
                }
            });

        let shape = [1usize, 3, YOLO_SIZE as usize, YOLO_SIZE as usize];
        Ok(Tensor::from_array((shape, tensor_data.into_boxed_slice()))
            .context("failed to create detector input tensor")?
            .into_dyn())
    }
}

/// Greedy per-class NMS: sort by confidence descending, suppress overlapping
/// boxes of the same class.
fn nms(mut boxes: Vec<BBox>, iou_thresh: f32) -> Vec<BBox> {
    boxes.sort_unstable_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<BBox> = Vec::new();
    let mut suppressed = vec![false; boxes.len()];

    for i in 0..boxes.len() {
        if suppressed[i] {
            continue;
        }
        kept.push(boxes[i]);
        for j in (i + 1)..boxes.len() {
            if boxes[j].class_id == boxes[i].class_id && boxes[i].iou(&boxes[j]) > iou_thresh {
                suppressed[j] = true;
            }
        }
    }

    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32, class_id: usize) -> BBox {
        BBox {
            x1,
            y1,
            x2,
            y2,
            confidence,
            class_id,
        }
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = bbox(0.0, 0.0, 10.0, 10.0, 0.9, 0);
        let b = bbox(20.0, 20.0, 30.0, 30.0, 0.9, 0);
        assert_eq!(a.iou(&b), 0.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn nms_keeps_best_box_per_class() {
        let boxes = vec![
            bbox(0.0, 0.0, 100.0, 100.0, 0.6, 0),
            bbox(2.0, 2.0, 100.0, 100.0, 0.9, 0),
            bbox(2.0, 2.0, 100.0, 100.0, 0.5, 2),
        ];
        let kept = nms(boxes, 0.7);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].class_id, 2);
    }

    #[test]
    fn tlwh_uses_top_left_corner() {
        let b = bbox(10.0, 20.0, 40.0, 80.0, 0.5, 0);
        assert_eq!(b.tlwh(), [10.0, 20.0, 30.0, 60.0]);
    }
}
