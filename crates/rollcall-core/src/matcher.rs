//! Matching strategies over the template store.
//!
//! One strategy is wired at startup from the probed backend kind and never
//! switched per call. Both strategies are deterministic: the same probe
//! against an unchanged store produces the same ranked list, with ties
//! broken by ascending subject id.

use crate::backend::BackendKind;
use crate::config::EngineConfig;
use crate::store::TemplateStore;
use crate::types::{MatchCandidate, Probe};
use image::imageops::FilterType;

/// Linear scale dividing raw pixel distance into a [0, 1] confidence for the
/// fallback matcher. Backend-local; not calibrated against embedding
/// confidences.
const PIXEL_DISTANCE_SCALE: f32 = 10_000.0;

/// Strategy for ranking a probe against all enrolled subjects.
pub trait MatchingStrategy: Send + Sync {
    /// Rank candidates by descending confidence. An empty template store
    /// yields an empty list, never an error.
    fn rank(&self, probe: &Probe, store: &TemplateStore, tolerance: f32) -> Vec<MatchCandidate>;
}

/// Select the strategy matching the active backend kind.
pub fn strategy_for(kind: BackendKind, config: &EngineConfig) -> Box<dyn MatchingStrategy> {
    match kind {
        BackendKind::Embedding => Box::new(EmbeddingMatcher),
        BackendKind::Pixel => Box::new(PixelMatcher {
            confidence_floor: config.pixel_confidence_floor,
        }),
    }
}

/// Primary strategy: per subject, the minimum Euclidean distance between the
/// probe embedding and the subject's embedding set; a candidate is emitted
/// iff that distance is within tolerance, with confidence `1 - distance`.
pub struct EmbeddingMatcher;

impl MatchingStrategy for EmbeddingMatcher {
    fn rank(&self, probe: &Probe, store: &TemplateStore, tolerance: f32) -> Vec<MatchCandidate> {
        let Some(embedding) = probe.embedding.as_ref() else {
            tracing::warn!("embedding matcher received a probe without an embedding");
            return Vec::new();
        };
        let Some(subjects) = store.embedding_sets() else {
            return Vec::new();
        };

        let mut candidates: Vec<MatchCandidate> = subjects
            .iter()
            .filter_map(|(subject_id, set)| {
                let distance = set
                    .iter()
                    .map(|template| embedding.euclidean_distance(template))
                    .fold(f32::INFINITY, f32::min);
                (distance <= tolerance).then(|| MatchCandidate {
                    subject_id: subject_id.clone(),
                    confidence: (1.0 - distance).clamp(0.0, 1.0),
                    distance,
                })
            })
            .collect();

        sort_candidates(&mut candidates);
        candidates
    }
}

/// Degraded fallback strategy: closest single normalized crop wins. Emits at
/// most one candidate, and only when the rescaled confidence clears the
/// configured floor. The tolerance parameter does not apply to this
/// backend-local distance scale and is ignored.
pub struct PixelMatcher {
    confidence_floor: f32,
}

impl MatchingStrategy for PixelMatcher {
    fn rank(&self, probe: &Probe, store: &TemplateStore, _tolerance: f32) -> Vec<MatchCandidate> {
        let Some((samples, labels)) = store.pixel_model() else {
            return Vec::new();
        };
        if samples.is_empty() {
            return Vec::new();
        }

        let mut best: Option<(u32, f32)> = None;
        for sample in samples {
            let resized = image::imageops::resize(
                &probe.crop,
                sample.width,
                sample.height,
                FilterType::Triangle,
            );
            let distance = sample
                .data
                .iter()
                .zip(resized.as_raw().iter())
                .map(|(&a, &b)| {
                    let diff = a as f32 - b as f32;
                    diff * diff
                })
                .sum::<f32>()
                .sqrt();

            let better = match best {
                None => true,
                Some((_, best_distance)) => distance < best_distance,
            };
            if better {
                best = Some((sample.label, distance));
            }
        }

        let Some((label, distance)) = best else {
            return Vec::new();
        };
        let confidence = (1.0 - distance / PIXEL_DISTANCE_SCALE).clamp(0.0, 1.0);
        if confidence < self.confidence_floor {
            return Vec::new();
        }

        let Some(subject_id) = labels.get(&label) else {
            tracing::warn!(label, "pixel model references an unknown label");
            return Vec::new();
        };

        vec![MatchCandidate {
            subject_id: subject_id.clone(),
            confidence,
            distance,
        }]
    }
}

fn sort_candidates(candidates: &mut [MatchCandidate]) {
    candidates.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then_with(|| a.subject_id.cmp(&b.subject_id))
    });
}
