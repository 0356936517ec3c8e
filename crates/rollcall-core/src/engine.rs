//! Recognition engine: composes the face backend, template store, liveness
//! gate, and matching strategy behind the caller-facing API.
//!
//! One `recognize` call processes one frame to completion. The store is
//! read-locked for the whole match phase and write-locked by the
//! administrator-driven training operations, so templates never change under
//! an in-flight match. Training operations persist atomically and roll the
//! in-memory state back when the snapshot write fails.

use crate::backend::{self, BackendKind, FaceBackend};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::liveness::LivenessGate;
use crate::matcher::{self, MatchingStrategy};
use crate::store::{PixelSample, TemplateStore};
use crate::types::{
    Embedding, PerFaceResult, Probe, RecognitionResult, SampleRef, TrainingSummary,
};
use image::imageops::FilterType;
use image::GrayImage;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Instant;

/// Side length of the size-normalized crops in the pixel fallback model.
const PIXEL_CROP_SIZE: u32 = 100;

/// Engine status for UI layers; carries the degraded-mode note so callers
/// can warn once instead of failing per call.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub backend: BackendKind,
    pub degraded_mode: bool,
    pub enrolled_subjects: usize,
    pub trained_subjects: usize,
    pub load_warning: Option<String>,
}

pub struct FaceEngine {
    backend: Mutex<Box<dyn FaceBackend>>,
    store: RwLock<TemplateStore>,
    strategy: Box<dyn MatchingStrategy>,
    gate: LivenessGate,
    kind: BackendKind,
    config: EngineConfig,
}

impl FaceEngine {
    /// Probe the ONNX models and open the engine. The backend kind is
    /// decided here, once.
    pub fn open(config: EngineConfig) -> Result<Self, EngineError> {
        let (onnx, _) = backend::probe(&config)?;
        Self::with_backend(config, Box::new(onnx))
    }

    /// Open the engine over an injected backend. The template store and
    /// matching strategy are wired to the backend's capabilities.
    pub fn with_backend(
        config: EngineConfig,
        backend: Box<dyn FaceBackend>,
    ) -> Result<Self, EngineError> {
        let kind = if backend.supports_embedding() {
            BackendKind::Embedding
        } else {
            BackendKind::Pixel
        };

        let store = TemplateStore::open(config.training_dir(), config.snapshot_path(), kind)?;
        if let Some(warning) = store.load_warning() {
            tracing::warn!(warning, "template store opened with recovery warning");
        }

        Ok(Self {
            backend: Mutex::new(backend),
            store: RwLock::new(store),
            strategy: matcher::strategy_for(kind, &config),
            gate: LivenessGate::from_config(&config),
            kind,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Whether the engine runs the degraded pixel fallback.
    pub fn degraded_mode(&self) -> bool {
        self.kind == BackendKind::Pixel
    }

    // --- enrollment / training -----------------------------------------

    /// Add one training sample for a subject. The image must contain
    /// exactly one detectable face. In embedding mode the new sample's
    /// embedding joins the subject's working set immediately; a retrain
    /// recomputes the authoritative set from the samples of record.
    pub fn enroll(&self, subject_id: &str, image: &GrayImage) -> Result<SampleRef, EngineError> {
        let mut backend = lock(&self.backend);
        let faces = backend.detect(image)?;
        let face = match faces.len() {
            0 => return Err(EngineError::NoFaceDetected),
            1 => &faces[0],
            count => return Err(EngineError::MultipleFacesDetected { count }),
        };

        let embedding = if self.kind == BackendKind::Embedding {
            Some(backend.embed(image, face)?)
        } else {
            None
        };
        drop(backend);

        let mut store = write_store(&self.store);
        let sample = store.save_sample(subject_id, image)?;

        if let Some(embedding) = embedding {
            let previous = store
                .embedding_sets()
                .and_then(|sets| sets.get(subject_id))
                .cloned()
                .unwrap_or_default();
            store.append_embedding(subject_id, embedding);
            if let Err(err) = store.persist() {
                store.replace_embeddings(subject_id, previous);
                return Err(err);
            }
        }

        tracing::info!(subject = subject_id, sample = %sample, "training sample enrolled");
        Ok(sample)
    }

    /// Recompute a subject's templates from its samples of record. Samples
    /// that no longer yield exactly one detectable face are skipped and
    /// reported through the summary.
    pub fn retrain(&self, subject_id: &str) -> Result<TrainingSummary, EngineError> {
        let mut backend = lock(&self.backend);
        let mut store = write_store(&self.store);

        let samples = store.sample_refs(subject_id)?;
        if samples.is_empty() && store.template_count(subject_id) == 0 {
            return Err(EngineError::SubjectNotFound(subject_id.to_string()));
        }
        if samples.len() < self.config.min_training_samples {
            return Err(EngineError::InsufficientSamples {
                have: samples.len(),
                need: self.config.min_training_samples,
            });
        }

        match self.kind {
            BackendKind::Embedding => {
                let (embeddings, used) =
                    compute_embeddings(backend.as_mut(), &store, subject_id, &samples)?;

                let previous = store.replace_embeddings(subject_id, embeddings);
                if let Err(err) = store.persist() {
                    store.replace_embeddings(subject_id, previous);
                    return Err(err);
                }

                tracing::info!(
                    subject = subject_id,
                    total = samples.len(),
                    used,
                    "subject retrained"
                );
                Ok(TrainingSummary {
                    subject_id: subject_id.to_string(),
                    samples_total: samples.len(),
                    samples_used: used,
                })
            }
            BackendKind::Pixel => {
                // The fallback representation is one flat model across all
                // subjects; rebuild it whole.
                let (pixel_samples, labels, used) =
                    rebuild_pixel_model(backend.as_mut(), &store, subject_id)?;

                let (prev_samples, prev_labels) = store.replace_pixel_model(pixel_samples, labels);
                if let Err(err) = store.persist() {
                    store.replace_pixel_model(prev_samples, prev_labels);
                    return Err(err);
                }

                tracing::info!(
                    subject = subject_id,
                    total = samples.len(),
                    used,
                    "pixel model rebuilt"
                );
                Ok(TrainingSummary {
                    subject_id: subject_id.to_string(),
                    samples_total: samples.len(),
                    samples_used: used,
                })
            }
        }
    }

    /// Remove one sample and recompute the subject's templates from the
    /// remainder. Never subtracts incrementally: the template set is always
    /// rederived from the samples of record so it cannot drift.
    pub fn delete_sample(&self, subject_id: &str, sample: &SampleRef) -> Result<(), EngineError> {
        let mut backend = lock(&self.backend);
        let mut store = write_store(&self.store);

        store.delete_sample_file(subject_id, sample)?;
        let remaining = store.sample_refs(subject_id)?;

        match self.kind {
            BackendKind::Embedding => {
                let (embeddings, _) =
                    compute_embeddings(backend.as_mut(), &store, subject_id, &remaining)?;
                let previous = store.replace_embeddings(subject_id, embeddings);
                if let Err(err) = store.persist() {
                    store.replace_embeddings(subject_id, previous);
                    return Err(err);
                }
            }
            BackendKind::Pixel => {
                let (pixel_samples, labels, _) =
                    rebuild_pixel_model(backend.as_mut(), &store, subject_id)?;
                let (prev_samples, prev_labels) = store.replace_pixel_model(pixel_samples, labels);
                if let Err(err) = store.persist() {
                    store.replace_pixel_model(prev_samples, prev_labels);
                    return Err(err);
                }
            }
        }

        tracing::info!(subject = subject_id, sample = %sample, "sample deleted, templates recomputed");
        Ok(())
    }

    /// Remove all samples and templates for a subject. Returns false when
    /// the subject was fully absent.
    pub fn delete_all(&self, subject_id: &str) -> Result<bool, EngineError> {
        let mut store = write_store(&self.store);

        let had_samples = store.delete_subject_samples(subject_id)?;
        let had_templates = store.template_count(subject_id) > 0;
        if !had_samples && !had_templates {
            return Ok(false);
        }

        if had_templates {
            store.remove_subject_templates(subject_id);
            store.persist()?;
        }

        tracing::info!(subject = subject_id, "all training data deleted");
        Ok(true)
    }

    /// Sample refs for a subject in deterministic order.
    pub fn samples(&self, subject_id: &str) -> Result<Vec<SampleRef>, EngineError> {
        read_store(&self.store).sample_refs(subject_id)
    }

    pub fn is_trained(&self, subject_id: &str) -> bool {
        read_store(&self.store).is_trained(subject_id, self.config.min_training_samples)
    }

    /// Number of stored templates for a subject (embeddings, or normalized
    /// crops in fallback mode).
    pub fn template_count(&self, subject_id: &str) -> usize {
        read_store(&self.store).template_count(subject_id)
    }

    pub fn status(&self) -> Result<EngineStatus, EngineError> {
        let store = read_store(&self.store);
        let enrolled = store.enrolled_subjects()?;
        let trained = enrolled
            .iter()
            .filter(|subject| store.is_trained(subject, self.config.min_training_samples))
            .count();
        Ok(EngineStatus {
            backend: self.kind,
            degraded_mode: self.kind == BackendKind::Pixel,
            enrolled_subjects: enrolled.len(),
            trained_subjects: trained,
            load_warning: store.load_warning().map(str::to_string),
        })
    }

    // --- recognition ----------------------------------------------------

    /// Recognize all faces in one frame. Zero detections is a normal empty
    /// result. `max_faces` truncates the detection list before liveness and
    /// matching, preserving detection order; `faces_detected` still reports
    /// the pre-truncation count.
    pub fn recognize(
        &self,
        image: &GrayImage,
        max_faces: Option<usize>,
    ) -> Result<RecognitionResult, EngineError> {
        let start = Instant::now();

        let mut backend = lock(&self.backend);
        let mut faces = backend.detect(image)?;
        let faces_detected = faces.len();
        if let Some(cap) = max_faces {
            faces.truncate(cap);
        }

        let mut probes = Vec::with_capacity(faces.len());
        for face in faces {
            let crop = face.crop(image);
            let embedding = if self.kind == BackendKind::Embedding {
                Some(backend.embed(image, &face)?)
            } else {
                None
            };
            probes.push(Probe { face, crop, embedding });
        }
        drop(backend);

        let store = read_store(&self.store);
        let results: Vec<PerFaceResult> = probes
            .into_iter()
            .map(|probe| {
                let is_live = self.gate.check(&probe.crop);
                let candidates = self.strategy.rank(&probe, &store, self.config.tolerance);
                PerFaceResult {
                    face: probe.face,
                    is_live,
                    candidates,
                }
            })
            .collect();

        Ok(RecognitionResult {
            faces_detected,
            processing_time: start.elapsed(),
            results,
        })
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<Box<T>>) -> std::sync::MutexGuard<'_, Box<T>> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read_store(store: &RwLock<TemplateStore>) -> std::sync::RwLockReadGuard<'_, TemplateStore> {
    store.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_store(store: &RwLock<TemplateStore>) -> std::sync::RwLockWriteGuard<'_, TemplateStore> {
    store.write().unwrap_or_else(PoisonError::into_inner)
}

/// Recompute a subject's embedding set from its stored samples, skipping any
/// sample that no longer yields exactly one detectable face.
fn compute_embeddings(
    backend: &mut dyn FaceBackend,
    store: &TemplateStore,
    subject_id: &str,
    samples: &[SampleRef],
) -> Result<(Vec<Embedding>, usize), EngineError> {
    let mut embeddings = Vec::with_capacity(samples.len());
    for sample in samples {
        let image = store.load_sample(subject_id, sample)?;
        let faces = backend.detect(&image)?;
        if faces.len() != 1 {
            tracing::warn!(
                subject = subject_id,
                sample = %sample,
                faces = faces.len(),
                "skipping sample without exactly one detectable face"
            );
            continue;
        }
        embeddings.push(backend.embed(&image, &faces[0])?);
    }
    let used = embeddings.len();
    Ok((embeddings, used))
}

/// Rebuild the whole flat pixel model from every subject's samples. Labels
/// are assigned in sorted subject order so rebuilds are deterministic.
/// Returns the number of crops contributed by `focus_subject`.
fn rebuild_pixel_model(
    backend: &mut dyn FaceBackend,
    store: &TemplateStore,
    focus_subject: &str,
) -> Result<(Vec<PixelSample>, BTreeMap<u32, String>, usize), EngineError> {
    let mut pixel_samples = Vec::new();
    let mut labels = BTreeMap::new();
    let mut focus_used = 0;
    let mut next_label = 0u32;

    for subject_id in store.enrolled_subjects()? {
        let mut subject_crops = Vec::new();
        for sample in store.sample_refs(&subject_id)? {
            let image = store.load_sample(&subject_id, &sample)?;
            let faces = backend.detect(&image)?;
            if faces.len() != 1 {
                tracing::warn!(
                    subject = %subject_id,
                    sample = %sample,
                    faces = faces.len(),
                    "skipping sample without exactly one detectable face"
                );
                continue;
            }

            let crop = faces[0].crop(&image);
            let normalized = image::imageops::resize(
                &crop,
                PIXEL_CROP_SIZE,
                PIXEL_CROP_SIZE,
                FilterType::Triangle,
            );
            subject_crops.push(normalized);
        }

        if subject_crops.is_empty() {
            continue;
        }

        let label = next_label;
        next_label += 1;
        labels.insert(label, subject_id.clone());
        if subject_id == focus_subject {
            focus_used = subject_crops.len();
        }
        for crop in subject_crops {
            pixel_samples.push(PixelSample {
                label,
                width: PIXEL_CROP_SIZE,
                height: PIXEL_CROP_SIZE,
                data: crop.into_raw(),
            });
        }
    }

    Ok((pixel_samples, labels, focus_used))
}
