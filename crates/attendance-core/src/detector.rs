//! Face-presence detection.
//!
//! [`FaceDetector`] is the seam between the video loop and whatever model
//! finds faces. [`ScrfdDetector`] runs the SCRFD ONNX model and reports
//! bounding boxes only; nothing here identifies who the face belongs to.

use crate::types::{BoundingBox, Frame};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const INPUT_SIZE: u32 = 640;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 128.0;
const SCORE_THRESHOLD: f32 = 0.5;
const NMS_THRESHOLD: f32 = 0.4;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

/// Filename of the SCRFD model inside the model directory.
pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("frame not ready ({width}x{height}, {len} bytes)")]
    FrameNotReady { width: u32, height: u32, len: usize },
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Anything that can find faces in a frame.
pub trait FaceDetector: Send {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, DetectorError>;
}

/// Scale and padding applied when fitting a frame into the square model input.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
    width: u32,
    height: u32,
}

impl Letterbox {
    fn fit(width: u32, height: u32) -> Self {
        let scale = (INPUT_SIZE as f32 / width as f32).min(INPUT_SIZE as f32 / height as f32);
        let new_w = ((width as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
        let new_h = ((height as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
        Self {
            scale,
            pad_x: ((INPUT_SIZE - new_w) / 2) as f32,
            pad_y: ((INPUT_SIZE - new_h) / 2) as f32,
            width: new_w,
            height: new_h,
        }
    }

    /// Map a point in model-input space back to frame space.
    fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// SCRFD detector running on ONNX Runtime.
pub struct ScrfdDetector {
    session: Session,
    /// (score, bbox) output indices for each stride.
    outputs: [(usize, usize); 3],
}

impl ScrfdDetector {
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();
        if names.len() < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD needs score and bbox outputs for 3 strides, model has {}",
                names.len()
            )));
        }

        let outputs = output_indices(&names);
        tracing::info!(path = model_path, ?outputs, "SCRFD detector loaded");

        Ok(Self { session, outputs })
    }

    fn preprocess(&self, frame: &Frame) -> Result<(Array4<f32>, Letterbox), DetectorError> {
        let not_ready = || DetectorError::FrameNotReady {
            width: frame.width,
            height: frame.height,
            len: frame.data.len(),
        };
        if !frame.is_ready() {
            return Err(not_ready());
        }

        let pixels = (frame.width as usize) * (frame.height as usize) * 3;
        let rgb = RgbImage::from_raw(frame.width, frame.height, frame.data[..pixels].to_vec())
            .ok_or_else(not_ready)?;

        let letterbox = Letterbox::fit(frame.width, frame.height);
        let resized = imageops::resize(&rgb, letterbox.width, letterbox.height, FilterType::Triangle);

        // Padding is left at zero, which is what the mean pixel normalizes to.
        let size = INPUT_SIZE as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        let (ox, oy) = (letterbox.pad_x as usize, letterbox.pad_y as usize);
        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, oy + y as usize, ox + x as usize]] =
                    (pixel.0[c] as f32 - PIXEL_MEAN) / PIXEL_STD;
            }
        }

        Ok((tensor, letterbox))
    }
}

impl FaceDetector for ScrfdDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, DetectorError> {
        let (input, letterbox) = self.preprocess(frame)?;
        let results = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (&stride, &(score_idx, bbox_idx)) in STRIDES.iter().zip(self.outputs.iter()) {
            let (_, scores) = results[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores/{stride}: {e}")))?;
            let (_, boxes) = results[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("boxes/{stride}: {e}")))?;
            candidates.extend(decode(scores, boxes, stride, &letterbox));
        }

        Ok(nms(candidates, NMS_THRESHOLD))
    }
}

/// Find `score_<stride>` / `bbox_<stride>` outputs by name, falling back to
/// the usual export order (scores first, then boxes).
fn output_indices(names: &[String]) -> [(usize, usize); 3] {
    let find = |prefix: &str, stride: usize| {
        let wanted = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let mut named = [(0, 0); 3];
    for (slot, &stride) in named.iter_mut().zip(STRIDES.iter()) {
        match (find("score", stride), find("bbox", stride)) {
            (Some(score), Some(bbox)) => *slot = (score, bbox),
            _ => return [(0, 3), (1, 4), (2, 5)],
        }
    }
    named
}

/// Turn one stride's anchor grid into frame-space boxes above threshold.
fn decode(scores: &[f32], boxes: &[f32], stride: usize, letterbox: &Letterbox) -> Vec<BoundingBox> {
    let grid_w = INPUT_SIZE as usize / stride;
    let step = stride as f32;

    scores
        .iter()
        .enumerate()
        .filter(|&(_, &score)| score > SCORE_THRESHOLD)
        .filter_map(|(idx, &score)| {
            let offsets = boxes.get(idx * 4..idx * 4 + 4)?;
            let cell = idx / ANCHORS_PER_CELL;
            let cx = (cell % grid_w) as f32 * step;
            let cy = (cell / grid_w) as f32 * step;

            let (x1, y1) = letterbox.to_frame(cx - offsets[0] * step, cy - offsets[1] * step);
            let (x2, y2) = letterbox.to_frame(cx + offsets[2] * step, cy + offsets[3] * step);
            Some(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression; output sorted by confidence.
fn nms(mut boxes: Vec<BoundingBox>, threshold: f32) -> Vec<BoundingBox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<BoundingBox> = Vec::with_capacity(boxes.len());
    for candidate in boxes {
        if kept.iter().all(|k| iou(k, &candidate) <= threshold) {
            kept.push(candidate);
        }
    }
    kept
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = w * h;
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
