//! rollcall-core — face enrollment, template matching, and liveness gating.
//!
//! The engine identifies enrolled subjects in still frames: detection and
//! embedding run through an ONNX backend (with a pixel-distance fallback
//! when the embedding model is unavailable), templates live in a persisted
//! store, and every detected face passes a texture-based liveness gate
//! before the attendance layer trusts the match.

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod liveness;
pub mod matcher;
pub mod store;
pub mod types;

pub use backend::{BackendKind, FaceBackend};
pub use config::{DetectionModel, EngineConfig};
pub use engine::{EngineStatus, FaceEngine};
pub use error::EngineError;
pub use types::{
    Embedding, FaceBox, MatchCandidate, PerFaceResult, RecognitionResult, SampleRef,
    TrainingSummary,
};
