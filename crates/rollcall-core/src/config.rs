use std::path::PathBuf;

/// Detector operating point: trades detection recall for speed by changing
/// the model input resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionModel {
    /// 320×320 detector input.
    Fast,
    /// 640×640 detector input.
    Accurate,
}

impl DetectionModel {
    pub fn input_size(self) -> usize {
        match self {
            DetectionModel::Fast => 320,
            DetectionModel::Accurate => 640,
        }
    }
}

/// Engine configuration, loaded from environment variables.
///
/// The liveness density bounds and the fallback confidence floor are
/// empirically chosen operating constants; they are carried here as named,
/// overridable fields rather than inline literals.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root directory for training samples and the persisted template store.
    pub data_dir: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Detector operating point.
    pub detection_model: DetectionModel,
    /// Maximum accepted embedding distance for a match candidate
    /// (lower = stricter).
    pub tolerance: f32,
    /// Minimum stored samples before a subject counts as trained.
    pub min_training_samples: usize,
    /// Master switch for the liveness gate.
    pub liveness_enabled: bool,
    /// Switch for the texture-analysis heuristic inside the gate.
    pub texture_analysis_enabled: bool,
    /// Edge density below which a crop is rejected as too smooth
    /// (flat photo or screen).
    pub min_edge_density: f32,
    /// Edge density above which a crop is rejected as too noisy
    /// (print artifacts).
    pub max_edge_density: f32,
    /// Minimum normalized confidence accepted by the pixel fallback matcher.
    pub pixel_confidence_floor: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            model_dir: PathBuf::from("models"),
            detection_model: DetectionModel::Fast,
            tolerance: 0.6,
            min_training_samples: 3,
            liveness_enabled: true,
            texture_analysis_enabled: true,
            min_edge_density: 0.05,
            max_edge_density: 0.30,
            pixel_confidence_floor: 0.5,
        }
    }
}

impl EngineConfig {
    /// Load configuration from `ROLLCALL_*` environment variables with
    /// defaults. Out-of-range tolerance values are clamped with a warning.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let data_dir = std::env::var("ROLLCALL_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);
        let model_dir = std::env::var("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.model_dir);

        let detection_model = match std::env::var("ROLLCALL_DETECTION_MODEL").as_deref() {
            Ok("accurate") => DetectionModel::Accurate,
            Ok("fast") | Err(_) => DetectionModel::Fast,
            Ok(other) => {
                tracing::warn!(value = other, "unknown ROLLCALL_DETECTION_MODEL, using fast");
                DetectionModel::Fast
            }
        };

        let mut config = Self {
            data_dir,
            model_dir,
            detection_model,
            tolerance: env_f32("ROLLCALL_TOLERANCE", defaults.tolerance),
            min_training_samples: env_usize(
                "ROLLCALL_MIN_TRAINING_SAMPLES",
                defaults.min_training_samples,
            ),
            liveness_enabled: env_bool("ROLLCALL_LIVENESS_ENABLED", defaults.liveness_enabled),
            texture_analysis_enabled: env_bool(
                "ROLLCALL_TEXTURE_ANALYSIS_ENABLED",
                defaults.texture_analysis_enabled,
            ),
            min_edge_density: env_f32("ROLLCALL_MIN_EDGE_DENSITY", defaults.min_edge_density),
            max_edge_density: env_f32("ROLLCALL_MAX_EDGE_DENSITY", defaults.max_edge_density),
            pixel_confidence_floor: env_f32(
                "ROLLCALL_PIXEL_CONFIDENCE_FLOOR",
                defaults.pixel_confidence_floor,
            ),
        };

        if !(0.0..=1.0).contains(&config.tolerance) {
            tracing::warn!(
                tolerance = config.tolerance,
                "tolerance outside [0, 1], clamping"
            );
            config.tolerance = config.tolerance.clamp(0.0, 1.0);
        }

        config
    }

    /// Path to the face detection model.
    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join("det_10g.onnx")
    }

    /// Path to the face embedding model.
    pub fn embedder_model_path(&self) -> PathBuf {
        self.model_dir.join("w600k_r50.onnx")
    }

    /// Directory holding one sample subdirectory per enrolled subject.
    pub fn training_dir(&self) -> PathBuf {
        self.data_dir.join("training")
    }

    /// Path of the persisted template snapshot.
    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join("templates.json")
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key).map(|v| v != "0").unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.tolerance, 0.6);
        assert_eq!(config.min_training_samples, 3);
        assert!(config.liveness_enabled);
        assert_eq!(config.min_edge_density, 0.05);
        assert_eq!(config.max_edge_density, 0.30);
        assert_eq!(config.pixel_confidence_floor, 0.5);
    }

    #[test]
    fn test_input_size_per_model() {
        assert_eq!(DetectionModel::Fast.input_size(), 320);
        assert_eq!(DetectionModel::Accurate.input_size(), 640);
    }

    #[test]
    fn test_snapshot_path_under_data_dir() {
        let config = EngineConfig {
            data_dir: PathBuf::from("/tmp/rc"),
            ..EngineConfig::default()
        };
        assert_eq!(config.snapshot_path(), PathBuf::from("/tmp/rc/templates.json"));
        assert_eq!(config.training_dir(), PathBuf::from("/tmp/rc/training"));
    }
}
