//! ONNX Runtime implementation of the face primitive.
//!
//! Detection uses an SCRFD-family anchor-free model decoded over three
//! stride levels; embedding uses an ArcFace-family model producing
//! 512-dimensional L2-normalized vectors. Both run on CPU.

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::types::{Embedding, FaceBox};
use image::imageops::FilterType;
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::{Path, PathBuf};
use thiserror::Error;

const DETECT_SCORE_THRESHOLD: f32 = 0.5;
const DETECT_NMS_IOU: f32 = 0.4;
const DETECT_STRIDES: [usize; 3] = [8, 16, 32];
const DETECT_ANCHORS_PER_CELL: usize = 2;
const PIXEL_MEAN: f32 = 127.5;
const DETECT_PIXEL_STD: f32 = 128.0;
const EMBED_PIXEL_STD: f32 = 127.5;
const EMBED_INPUT_SIZE: u32 = 112;
const EMBED_DIM: usize = 512;

#[derive(Error, Debug)]
pub enum OnnxError {
    #[error("model file not found: {0}")]
    ModelNotFound(PathBuf),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Face detector backed by an SCRFD-family ONNX model.
pub struct OnnxDetector {
    session: Session,
    input_size: usize,
}

impl OnnxDetector {
    pub fn load(model_path: &Path, input_size: usize) -> Result<Self, OnnxError> {
        if !model_path.exists() {
            return Err(OnnxError::ModelNotFound(model_path.to_path_buf()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let num_outputs = session.outputs().len();
        tracing::info!(
            path = %model_path.display(),
            input_size,
            outputs = num_outputs,
            "loaded detection model"
        );

        // Score and bbox tensors per stride; keypoint outputs, if exported,
        // trail them and are ignored.
        if num_outputs < DETECT_STRIDES.len() * 2 {
            return Err(OnnxError::Inference(format!(
                "detection model must export score+bbox tensors for {} strides, got {num_outputs} outputs",
                DETECT_STRIDES.len()
            )));
        }

        Ok(Self { session, input_size })
    }

    /// Detect faces, sorted by descending confidence.
    pub fn detect(&mut self, image: &GrayImage) -> Result<Vec<FaceBox>, OnnxError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Ok(Vec::new());
        }

        // Stretch-resize to the model input; coordinates map back with
        // independent per-axis scales.
        let size = self.input_size as u32;
        let resized = image::imageops::resize(image, size, size, FilterType::Triangle);
        let scale_x = self.input_size as f32 / width as f32;
        let scale_y = self.input_size as f32 / height as f32;

        let input = gray_to_nchw(&resized, PIXEL_MEAN, DETECT_PIXEL_STD);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        // Positional output layout: [0..3) scores, [3..6) bbox offsets,
        // one slot per stride.
        let mut detections = Vec::new();
        for (stride_pos, &stride) in DETECT_STRIDES.iter().enumerate() {
            let (_, scores) = outputs[stride_pos]
                .try_extract_tensor::<f32>()
                .map_err(|e| OnnxError::Inference(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[stride_pos + DETECT_STRIDES.len()]
                .try_extract_tensor::<f32>()
                .map_err(|e| OnnxError::Inference(format!("bboxes stride {stride}: {e}")))?;

            decode_stride(
                scores,
                bboxes,
                stride,
                self.input_size,
                (scale_x, scale_y),
                &mut detections,
            );
        }

        let mut result = nms(detections, DETECT_NMS_IOU);
        result.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.x.total_cmp(&b.x))
        });
        Ok(result)
    }
}

/// Face embedder backed by an ArcFace-family ONNX model.
pub struct OnnxEmbedder {
    session: Session,
}

impl OnnxEmbedder {
    pub fn load(model_path: &Path) -> Result<Self, OnnxError> {
        if !model_path.exists() {
            return Err(OnnxError::ModelNotFound(model_path.to_path_buf()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(path = %model_path.display(), "loaded embedding model");
        Ok(Self { session })
    }

    /// Extract an L2-normalized embedding for one detected face.
    ///
    /// The face box is cropped and resized to the canonical embedder input;
    /// no landmark alignment is performed.
    pub fn embed(&mut self, image: &GrayImage, face: &FaceBox) -> Result<Embedding, OnnxError> {
        let crop = face.crop(image);
        let aligned = image::imageops::resize(
            &crop,
            EMBED_INPUT_SIZE,
            EMBED_INPUT_SIZE,
            FilterType::Triangle,
        );

        let input = gray_to_nchw(&aligned, PIXEL_MEAN, EMBED_PIXEL_STD);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| OnnxError::Inference(format!("embedding extraction: {e}")))?;

        if raw.len() != EMBED_DIM {
            return Err(OnnxError::Inference(format!(
                "expected {EMBED_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            raw.iter().map(|x| x / norm).collect()
        } else {
            raw.to_vec()
        };

        Ok(Embedding::new(values))
    }
}

/// Production [`FaceBackend`](crate::backend::FaceBackend): required detector
/// plus optional embedder.
pub struct OnnxBackend {
    detector: OnnxDetector,
    embedder: Option<OnnxEmbedder>,
}

impl OnnxBackend {
    /// Load the detector (required) and the embedder (optional). A missing
    /// embedder model is downgraded to `None`; any other embedder load
    /// failure propagates.
    pub fn load(config: &EngineConfig) -> Result<Self, EngineError> {
        let detector_path = config.detector_model_path();
        let detector =
            OnnxDetector::load(&detector_path, config.detection_model.input_size()).map_err(
                |e| match e {
                    OnnxError::ModelNotFound(path) => EngineError::BackendUnavailable(format!(
                        "detection model missing: {}",
                        path.display()
                    )),
                    other => EngineError::Backend(other),
                },
            )?;

        let embedder_path = config.embedder_model_path();
        let embedder = match OnnxEmbedder::load(&embedder_path) {
            Ok(e) => Some(e),
            Err(OnnxError::ModelNotFound(path)) => {
                tracing::warn!(path = %path.display(), "embedding model not found");
                None
            }
            Err(other) => return Err(other.into()),
        };

        Ok(Self { detector, embedder })
    }
}

impl crate::backend::FaceBackend for OnnxBackend {
    fn detect(&mut self, image: &GrayImage) -> Result<Vec<FaceBox>, EngineError> {
        Ok(self.detector.detect(image)?)
    }

    fn embed(&mut self, image: &GrayImage, face: &FaceBox) -> Result<Embedding, EngineError> {
        match self.embedder.as_mut() {
            Some(embedder) => Ok(embedder.embed(image, face)?),
            None => Err(EngineError::BackendUnavailable(
                "embedding model not loaded".into(),
            )),
        }
    }

    fn supports_embedding(&self) -> bool {
        self.embedder.is_some()
    }
}

/// Replicate a grayscale image into a normalized 1×3×H×W float tensor.
fn gray_to_nchw(image: &GrayImage, mean: f32, std: f32) -> Array4<f32> {
    let (width, height) = image.dimensions();
    let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));

    for (x, y, pixel) in image.enumerate_pixels() {
        let normalized = (pixel[0] as f32 - mean) / std;
        for channel in 0..3 {
            tensor[[0, channel, y as usize, x as usize]] = normalized;
        }
    }

    tensor
}

/// Decode anchor-free detections for one stride level into `out`.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    stride: usize,
    input_size: usize,
    (scale_x, scale_y): (f32, f32),
    out: &mut Vec<FaceBox>,
) {
    let grid = input_size / stride;
    let num_anchors = grid * grid * DETECT_ANCHORS_PER_CELL;

    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= DETECT_SCORE_THRESHOLD {
            continue;
        }

        let cell = idx / DETECT_ANCHORS_PER_CELL;
        let anchor_cx = ((cell % grid) * stride) as f32;
        let anchor_cy = ((cell / grid) * stride) as f32;

        let off = idx * 4;
        if off + 3 >= bboxes.len() {
            continue;
        }

        // Offsets are in stride units around the anchor center.
        let x1 = anchor_cx - bboxes[off] * stride as f32;
        let y1 = anchor_cy - bboxes[off + 1] * stride as f32;
        let x2 = anchor_cx + bboxes[off + 2] * stride as f32;
        let y2 = anchor_cy + bboxes[off + 3] * stride as f32;

        out.push(FaceBox {
            x: x1 / scale_x,
            y: y1 / scale_y,
            width: (x2 - x1) / scale_x,
            height: (y2 - y1) / scale_y,
            confidence: score,
        });
    }
}

/// Greedy non-maximum suppression by descending confidence.
fn nms(mut detections: Vec<FaceBox>, iou_threshold: f32) -> Vec<FaceBox> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<FaceBox> = Vec::new();
    for candidate in detections {
        if keep.iter().all(|kept| iou(kept, &candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

/// Intersection-over-union of two face boxes.
fn iou(a: &FaceBox, b: &FaceBox) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.width * a.height + b.width * b.height - inter;

    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_box(x: f32, y: f32, w: f32, h: f32, conf: f32) -> FaceBox {
        FaceBox { x, y, width: w, height: h, confidence: conf }
    }

    #[test]
    fn test_iou_identical() {
        let a = make_box(0.0, 0.0, 100.0, 100.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_disjoint() {
        let a = make_box(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = make_box(30.0, 30.0, 10.0, 10.0, 1.0);
        assert!(iou(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_iou_half_overlap() {
        let a = make_box(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = make_box(5.0, 0.0, 10.0, 10.0, 1.0);
        // intersection 50, union 150
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_nms_suppresses_overlap_keeps_distant() {
        let detections = vec![
            make_box(0.0, 0.0, 100.0, 100.0, 0.9),
            make_box(4.0, 4.0, 100.0, 100.0, 0.8),
            make_box(300.0, 300.0, 50.0, 50.0, 0.7),
        ];
        let kept = nms(detections, 0.4);
        assert_eq!(kept.len(), 2);
        assert!((kept[0].confidence - 0.9).abs() < 1e-6);
        assert!((kept[1].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(Vec::new(), 0.4).is_empty());
    }

    #[test]
    fn test_decode_stride_respects_threshold() {
        // Two anchors over a tiny 2-cell grid at stride 16 on a 32px input:
        // only the anchor above threshold decodes.
        let input_size = 32;
        let grid = input_size / 16;
        let num_anchors = grid * grid * DETECT_ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; num_anchors];
        scores[2] = 0.9;
        let bboxes = vec![1.0f32; num_anchors * 4];

        let mut out = Vec::new();
        decode_stride(&scores, &bboxes, 16, input_size, (1.0, 1.0), &mut out);

        assert_eq!(out.len(), 1);
        assert!((out[0].confidence - 0.9).abs() < 1e-6);
        // Anchor index 2 sits in cell 1 of the 2-wide grid: center (16, 0),
        // unit offsets of one stride on each side.
        assert!((out[0].x - 0.0).abs() < 1e-6);
        assert!((out[0].width - 32.0).abs() < 1e-6);
    }

    #[test]
    fn test_decode_stride_scales_back_to_source() {
        let input_size = 32;
        let mut scores = vec![0.0f32; 8];
        scores[0] = 0.8;
        let bboxes = vec![1.0f32; 32];

        let mut out = Vec::new();
        // Source image was half the input width, same height.
        decode_stride(&scores, &bboxes, 16, input_size, (2.0, 1.0), &mut out);

        assert_eq!(out.len(), 1);
        assert!((out[0].width - 16.0).abs() < 1e-6);
        assert!((out[0].height - 32.0).abs() < 1e-6);
    }

    #[test]
    fn test_gray_to_nchw_channels_replicated() {
        let image = GrayImage::from_pixel(4, 3, image::Luma([200u8]));
        let tensor = gray_to_nchw(&image, PIXEL_MEAN, EMBED_PIXEL_STD);
        assert_eq!(tensor.shape(), &[1, 3, 3, 4]);
        let expected = (200.0 - PIXEL_MEAN) / EMBED_PIXEL_STD;
        for channel in 0..3 {
            assert!((tensor[[0, channel, 1, 2]] - expected).abs() < 1e-6);
        }
    }
}
