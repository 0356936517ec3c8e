use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounding box for a detected face, in source-image pixel coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl FaceBox {
    /// Extract the boxed region from a grayscale image, clamped to image
    /// bounds. A box fully outside the image yields a 1×1 crop rather than
    /// panicking; detection output should never produce one, but corrupt
    /// sample files can.
    pub fn crop(&self, image: &GrayImage) -> GrayImage {
        let (iw, ih) = image.dimensions();
        let x0 = (self.x.max(0.0) as u32).min(iw.saturating_sub(1));
        let y0 = (self.y.max(0.0) as u32).min(ih.saturating_sub(1));
        let x1 = ((self.x + self.width).max(0.0) as u32).clamp(x0 + 1, iw.max(x0 + 1));
        let y1 = ((self.y + self.height).max(0.0) as u32).clamp(y0 + 1, ih.max(y0 + 1));
        image::imageops::crop_imm(image, x0, y0, x1 - x0, y1 - y0).to_image()
    }
}

/// Face embedding vector (fixed dimensionality, L2-normalized by the backend).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Euclidean distance between two embeddings. Dimension mismatch is a
    /// caller bug; the shorter vector bounds the comparison.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// A transient face observation from one frame. Never persisted.
#[derive(Debug, Clone)]
pub struct Probe {
    pub face: FaceBox,
    pub crop: GrayImage,
    /// Present only when the embedding backend is active.
    pub embedding: Option<Embedding>,
}

/// One ranked match against an enrolled subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub subject_id: String,
    /// In [0, 1]; backend-local scale, not comparable across backends.
    pub confidence: f32,
    pub distance: f32,
}

/// Per-face outcome of one recognition call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerFaceResult {
    pub face: FaceBox,
    pub is_live: bool,
    /// Ranked by descending confidence, subject id ascending on ties.
    pub candidates: Vec<MatchCandidate>,
}

/// Aggregate result of one recognition call over a single frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognitionResult {
    pub faces_detected: usize,
    pub processing_time: Duration,
    pub results: Vec<PerFaceResult>,
}

/// Outcome of retraining one subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub subject_id: String,
    /// Sample files present on disk at retrain time.
    pub samples_total: usize,
    /// Samples that still yielded exactly one detectable face.
    pub samples_used: usize,
}

/// Opaque reference to one stored training sample (its file name).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SampleRef(pub String);

impl std::fmt::Display for SampleRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
