use thiserror::Error;

/// Errors surfaced by the enrollment and recognition engine.
///
/// Enrollment/training errors are returned synchronously and never retried
/// internally; they require new caller input (e.g. a better photo).
/// Recognition against an empty or untrained store is not an error.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("no face detected in the image")]
    NoFaceDetected,

    #[error("{count} faces detected — enrollment requires an image with a single face")]
    MultipleFacesDetected { count: usize },

    #[error("not enough training samples: have {have}, need {need}")]
    InsufficientSamples { have: usize, need: usize },

    #[error("unknown subject: {0}")]
    SubjectNotFound(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("persisted template store is corrupt: {0}")]
    PersistenceCorrupt(String),

    #[error("sample not found: {0}")]
    SampleNotFound(String),

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("image decode/encode failure: {0}")]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Backend(#[from] crate::backend::onnx::OnnxError),
}
