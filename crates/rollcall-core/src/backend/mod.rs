//! Detection/embedding backend abstraction.
//!
//! The engine consumes the face primitive through [`FaceBackend`] so that the
//! matching strategy can be wired once at startup and tests can inject a
//! scripted backend. Capability probing happens exactly once, at
//! construction; it is never re-checked per call.

pub mod onnx;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::types::{Embedding, FaceBox};
use image::GrayImage;

/// Which template representation and matching strategy is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// High-dimensional embedding templates (primary).
    Embedding,
    /// Size-normalized grayscale crop templates (degraded fallback).
    Pixel,
}

/// The external face primitive: detection plus (optionally) embedding.
pub trait FaceBackend: Send {
    /// Detect faces, returned sorted by descending confidence. The order is
    /// stable for identical input and is the order the pipeline processes.
    fn detect(&mut self, image: &GrayImage) -> Result<Vec<FaceBox>, EngineError>;

    /// Extract a fixed-length embedding for one detected face. Returns
    /// [`EngineError::BackendUnavailable`] when the embedding model is not
    /// loaded; callers select the pixel strategy in that case and must not
    /// reach this path.
    fn embed(&mut self, image: &GrayImage, face: &FaceBox) -> Result<Embedding, EngineError>;

    /// Whether the embedding primitive is usable.
    fn supports_embedding(&self) -> bool;
}

/// Probe the ONNX models once and decide the backend kind.
///
/// The detector model is required; without it no operation can run. The
/// embedder model is optional — its absence selects the degraded pixel
/// strategy and is reported to callers via engine status.
pub fn probe(config: &EngineConfig) -> Result<(onnx::OnnxBackend, BackendKind), EngineError> {
    let backend = onnx::OnnxBackend::load(config)?;
    let kind = if backend.supports_embedding() {
        BackendKind::Embedding
    } else {
        tracing::warn!(
            model = %config.embedder_model_path().display(),
            "embedding model unavailable; running in degraded pixel-matching mode"
        );
        BackendKind::Pixel
    };
    Ok((backend, kind))
}
