//! Enrolled-subject template store.
//!
//! Owns the raw training samples on disk and the in-memory templates derived
//! from them, in one of two representations that are never mixed within a
//! store instance: per-subject embedding sets (primary) or a flat array of
//! label-tagged, size-normalized grayscale crops (pixel fallback).
//!
//! The store is the single writer of persisted template state. The snapshot
//! is written atomically (temp file, then rename), so a crash mid-write
//! leaves the previous snapshot intact. A snapshot that fails to parse, or
//! that was written by the other backend, is treated as an empty store with
//! a queryable warning; the samples on disk remain and a retrain rebuilds
//! the templates.

use crate::backend::BackendKind;
use crate::error::EngineError;
use crate::types::{Embedding, SampleRef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

const SNAPSHOT_VERSION: u32 = 1;

/// One size-normalized grayscale training crop in the pixel fallback model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PixelSample {
    pub label: u32,
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
enum Templates {
    Embedding {
        subjects: BTreeMap<String, Vec<Embedding>>,
    },
    Pixel {
        samples: Vec<PixelSample>,
        #[serde(with = "label_pairs")]
        labels: BTreeMap<u32, String>,
    },
}

/// Persisted form of the label table: an array of `[label, subject]` pairs.
/// JSON object keys are strings, and the tagged snapshot buffers values
/// before dispatching on `backend`, so an integer-keyed map would not
/// survive a reload.
mod label_pairs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(
        labels: &BTreeMap<u32, String>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(labels.iter())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<u32, String>, D::Error> {
        let pairs = Vec::<(u32, String)>::deserialize(deserializer)?;
        Ok(pairs.into_iter().collect())
    }
}

impl Templates {
    fn empty(kind: BackendKind) -> Self {
        match kind {
            BackendKind::Embedding => Templates::Embedding {
                subjects: BTreeMap::new(),
            },
            BackendKind::Pixel => Templates::Pixel {
                samples: Vec::new(),
                labels: BTreeMap::new(),
            },
        }
    }

    fn kind(&self) -> BackendKind {
        match self {
            Templates::Embedding { .. } => BackendKind::Embedding,
            Templates::Pixel { .. } => BackendKind::Pixel,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    #[serde(flatten)]
    templates: Templates,
}

/// Durable store of training samples and matchable templates.
pub struct TemplateStore {
    training_dir: PathBuf,
    snapshot_path: PathBuf,
    templates: Templates,
    load_warning: Option<String>,
}

impl TemplateStore {
    /// Open the store for the given backend kind, loading the persisted
    /// snapshot if one exists.
    pub fn open(
        training_dir: PathBuf,
        snapshot_path: PathBuf,
        kind: BackendKind,
    ) -> Result<Self, EngineError> {
        fs::create_dir_all(&training_dir)?;
        if let Some(parent) = snapshot_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut store = Self {
            training_dir,
            snapshot_path,
            templates: Templates::empty(kind),
            load_warning: None,
        };
        store.load_snapshot(kind);
        Ok(store)
    }

    fn load_snapshot(&mut self, kind: BackendKind) {
        let path = self.snapshot_path.clone();
        if !path.exists() {
            return;
        }

        let parsed = fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|json| serde_json::from_str::<Snapshot>(&json).map_err(|e| e.to_string()));

        match parsed {
            Ok(snapshot) if snapshot.version != SNAPSHOT_VERSION => {
                self.warn_and_reset(
                    kind,
                    format!(
                        "snapshot version {} unsupported (expected {SNAPSHOT_VERSION}); starting empty",
                        snapshot.version
                    ),
                );
            }
            Ok(snapshot) if snapshot.templates.kind() != kind => {
                self.warn_and_reset(
                    kind,
                    format!(
                        "snapshot was written by the {:?} backend but {:?} is active; \
                         a full retrain is required",
                        snapshot.templates.kind(),
                        kind
                    ),
                );
            }
            Ok(snapshot) => {
                self.templates = snapshot.templates;
                tracing::info!(
                    path = %path.display(),
                    subjects = self.subject_ids().len(),
                    "loaded template snapshot"
                );
            }
            Err(reason) => {
                self.warn_and_reset(kind, format!("snapshot unreadable ({reason}); starting empty"));
            }
        }
    }

    fn warn_and_reset(&mut self, kind: BackendKind, warning: String) {
        tracing::warn!(path = %self.snapshot_path.display(), warning, "template snapshot rejected");
        self.templates = Templates::empty(kind);
        self.load_warning = Some(warning);
    }

    /// Warning recorded while loading the persisted snapshot, if any.
    pub fn load_warning(&self) -> Option<&str> {
        self.load_warning.as_deref()
    }

    pub fn kind(&self) -> BackendKind {
        self.templates.kind()
    }

    // --- sample files ---------------------------------------------------

    fn subject_dir(&self, subject_id: &str) -> PathBuf {
        self.training_dir.join(subject_id)
    }

    fn checked_sample_path(
        &self,
        subject_id: &str,
        sample: &SampleRef,
    ) -> Result<PathBuf, EngineError> {
        // Sample refs are bare file names; anything path-like is rejected.
        if sample.0.contains('/') || sample.0.contains('\\') || sample.0.contains("..") {
            return Err(EngineError::SampleNotFound(sample.0.clone()));
        }
        Ok(self.subject_dir(subject_id).join(&sample.0))
    }

    /// Persist a training crop for a subject, returning its sample ref.
    pub fn save_sample(
        &mut self,
        subject_id: &str,
        image: &image::GrayImage,
    ) -> Result<SampleRef, EngineError> {
        let dir = self.subject_dir(subject_id);
        fs::create_dir_all(&dir)?;

        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let suffix = &uuid::Uuid::new_v4().simple().to_string()[..8];
        let name = format!("{subject_id}_{timestamp}_{suffix}.png");
        image.save(dir.join(&name))?;

        tracing::debug!(subject = subject_id, sample = %name, "training sample saved");
        Ok(SampleRef(name))
    }

    /// Sample refs for a subject in deterministic (file name) order. An
    /// unenrolled subject has no samples.
    pub fn sample_refs(&self, subject_id: &str) -> Result<Vec<SampleRef>, EngineError> {
        let dir = self.subject_dir(subject_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut refs = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.to_ascii_lowercase().ends_with(".png")
                || name.to_ascii_lowercase().ends_with(".jpg")
                || name.to_ascii_lowercase().ends_with(".jpeg")
            {
                refs.push(SampleRef(name));
            }
        }
        refs.sort();
        Ok(refs)
    }

    pub fn sample_count(&self, subject_id: &str) -> usize {
        self.sample_refs(subject_id).map(|r| r.len()).unwrap_or(0)
    }

    /// Load a stored sample as grayscale.
    pub fn load_sample(
        &self,
        subject_id: &str,
        sample: &SampleRef,
    ) -> Result<image::GrayImage, EngineError> {
        let path = self.checked_sample_path(subject_id, sample)?;
        if !path.exists() {
            return Err(EngineError::SampleNotFound(sample.0.clone()));
        }
        Ok(image::open(path)?.to_luma8())
    }

    /// Remove one sample file.
    pub fn delete_sample_file(
        &mut self,
        subject_id: &str,
        sample: &SampleRef,
    ) -> Result<(), EngineError> {
        let path = self.checked_sample_path(subject_id, sample)?;
        if !path.exists() {
            return Err(EngineError::SampleNotFound(sample.0.clone()));
        }
        fs::remove_file(path)?;
        tracing::debug!(subject = subject_id, sample = %sample.0, "training sample deleted");
        Ok(())
    }

    /// Remove a subject's sample directory. Returns false if it was absent.
    pub fn delete_subject_samples(&mut self, subject_id: &str) -> Result<bool, EngineError> {
        let dir = self.subject_dir(subject_id);
        if !dir.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(dir)?;
        Ok(true)
    }

    /// Subjects that currently own sample directories, sorted.
    pub fn enrolled_subjects(&self) -> Result<Vec<String>, EngineError> {
        let mut subjects = Vec::new();
        for entry in fs::read_dir(&self.training_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                subjects.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        subjects.sort();
        Ok(subjects)
    }

    // --- templates ------------------------------------------------------

    /// Subjects that currently have matchable templates, sorted.
    pub fn subject_ids(&self) -> Vec<String> {
        match &self.templates {
            Templates::Embedding { subjects } => subjects.keys().cloned().collect(),
            Templates::Pixel { labels, .. } => {
                let mut ids: Vec<String> = labels.values().cloned().collect();
                ids.sort();
                ids.dedup();
                ids
            }
        }
    }

    /// Number of stored templates for a subject.
    pub fn template_count(&self, subject_id: &str) -> usize {
        match &self.templates {
            Templates::Embedding { subjects } => {
                subjects.get(subject_id).map(|set| set.len()).unwrap_or(0)
            }
            Templates::Pixel { samples, labels } => labels
                .iter()
                .find(|(_, id)| id.as_str() == subject_id)
                .map(|(label, _)| samples.iter().filter(|s| s.label == *label).count())
                .unwrap_or(0),
        }
    }

    /// A subject is trained when it has at least one stored template and at
    /// least `min_samples` stored sample files.
    pub fn is_trained(&self, subject_id: &str, min_samples: usize) -> bool {
        self.template_count(subject_id) > 0 && self.sample_count(subject_id) >= min_samples
    }

    /// Per-subject embedding sets, for the embedding matcher. Empty in
    /// pixel mode.
    pub fn embedding_sets(&self) -> Option<&BTreeMap<String, Vec<Embedding>>> {
        match &self.templates {
            Templates::Embedding { subjects } => Some(subjects),
            Templates::Pixel { .. } => None,
        }
    }

    /// Flat crop array plus label table, for the pixel matcher. Empty in
    /// embedding mode.
    pub fn pixel_model(&self) -> Option<(&[PixelSample], &BTreeMap<u32, String>)> {
        match &self.templates {
            Templates::Embedding { .. } => None,
            Templates::Pixel { samples, labels } => Some((samples, labels)),
        }
    }

    /// Append one embedding to a subject's working set. No-op in pixel mode.
    pub fn append_embedding(&mut self, subject_id: &str, embedding: Embedding) {
        if let Templates::Embedding { subjects } = &mut self.templates {
            subjects.entry(subject_id.to_string()).or_default().push(embedding);
        }
    }

    /// Replace a subject's full embedding set, returning the previous set
    /// (for rollback when a subsequent persist fails). An empty new set
    /// removes the subject.
    pub fn replace_embeddings(
        &mut self,
        subject_id: &str,
        embeddings: Vec<Embedding>,
    ) -> Vec<Embedding> {
        match &mut self.templates {
            Templates::Embedding { subjects } => {
                let previous = subjects.remove(subject_id).unwrap_or_default();
                if !embeddings.is_empty() {
                    subjects.insert(subject_id.to_string(), embeddings);
                }
                previous
            }
            Templates::Pixel { .. } => Vec::new(),
        }
    }

    /// Replace the whole pixel model, returning the previous one.
    pub fn replace_pixel_model(
        &mut self,
        samples: Vec<PixelSample>,
        labels: BTreeMap<u32, String>,
    ) -> (Vec<PixelSample>, BTreeMap<u32, String>) {
        match &mut self.templates {
            Templates::Pixel {
                samples: current_samples,
                labels: current_labels,
            } => (
                std::mem::replace(current_samples, samples),
                std::mem::replace(current_labels, labels),
            ),
            Templates::Embedding { .. } => (Vec::new(), BTreeMap::new()),
        }
    }

    /// Drop a subject's templates. In pixel mode this removes the subject's
    /// label and its crops from the flat array.
    pub fn remove_subject_templates(&mut self, subject_id: &str) {
        match &mut self.templates {
            Templates::Embedding { subjects } => {
                subjects.remove(subject_id);
            }
            Templates::Pixel { samples, labels } => {
                let dropped: Vec<u32> = labels
                    .iter()
                    .filter(|(_, id)| id.as_str() == subject_id)
                    .map(|(label, _)| *label)
                    .collect();
                labels.retain(|_, id| id.as_str() != subject_id);
                samples.retain(|s| !dropped.contains(&s.label));
            }
        }
    }

    // --- persistence ----------------------------------------------------

    /// Write the snapshot atomically: serialize to a sibling temp file,
    /// then rename over the target.
    pub fn persist(&self) -> Result<(), EngineError> {
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            templates: match &self.templates {
                Templates::Embedding { subjects } => Templates::Embedding {
                    subjects: subjects.clone(),
                },
                Templates::Pixel { samples, labels } => Templates::Pixel {
                    samples: samples.clone(),
                    labels: labels.clone(),
                },
            },
        };

        let json = serde_json::to_string(&snapshot)
            .map_err(|e| EngineError::PersistenceCorrupt(e.to_string()))?;

        let tmp = self.snapshot_path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.snapshot_path)?;

        tracing::debug!(
            path = %self.snapshot_path.display(),
            subjects = self.subject_ids().len(),
            "template snapshot persisted"
        );
        Ok(())
    }

    /// Location of the persisted snapshot.
    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};
    use tempfile::TempDir;

    fn open_store(dir: &TempDir, kind: BackendKind) -> TemplateStore {
        TemplateStore::open(
            dir.path().join("training"),
            dir.path().join("templates.json"),
            kind,
        )
        .unwrap()
    }

    fn embedding(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    #[test]
    fn test_save_and_list_samples() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir, BackendKind::Embedding);
        let image = GrayImage::from_pixel(10, 10, Luma([42u8]));

        let first = store.save_sample("s1", &image).unwrap();
        let second = store.save_sample("s1", &image).unwrap();
        assert_ne!(first, second);

        let refs = store.sample_refs("s1").unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(store.sample_count("s1"), 2);
        assert_eq!(store.sample_count("nobody"), 0);

        let loaded = store.load_sample("s1", &first).unwrap();
        assert_eq!(loaded.dimensions(), (10, 10));
        assert_eq!(loaded.get_pixel(3, 3)[0], 42);
    }

    #[test]
    fn test_delete_sample_file() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir, BackendKind::Embedding);
        let image = GrayImage::from_pixel(4, 4, Luma([0u8]));

        let sample = store.save_sample("s1", &image).unwrap();
        store.delete_sample_file("s1", &sample).unwrap();
        assert_eq!(store.sample_count("s1"), 0);

        let err = store.delete_sample_file("s1", &sample).unwrap_err();
        assert!(matches!(err, EngineError::SampleNotFound(_)));
    }

    #[test]
    fn test_path_like_sample_ref_rejected() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, BackendKind::Embedding);
        let err = store
            .load_sample("s1", &SampleRef("../../etc/passwd".into()))
            .unwrap_err();
        assert!(matches!(err, EngineError::SampleNotFound(_)));
    }

    #[test]
    fn test_delete_subject_samples_absent_is_noop() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir, BackendKind::Embedding);
        assert!(!store.delete_subject_samples("ghost").unwrap());
    }

    #[test]
    fn test_embedding_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir, BackendKind::Embedding);
        store.append_embedding("s1", embedding(&[0.1, 0.2]));
        store.append_embedding("s1", embedding(&[0.3, 0.4]));
        store.append_embedding("s2", embedding(&[0.9, 0.9]));
        store.persist().unwrap();

        let reloaded = open_store(&dir, BackendKind::Embedding);
        assert!(reloaded.load_warning().is_none());
        assert_eq!(reloaded.subject_ids(), vec!["s1".to_string(), "s2".to_string()]);
        assert_eq!(reloaded.template_count("s1"), 2);
        let sets = reloaded.embedding_sets().unwrap();
        assert_eq!(sets["s1"][1].values, vec![0.3, 0.4]);
    }

    #[test]
    fn test_pixel_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir, BackendKind::Pixel);
        let mut labels = BTreeMap::new();
        labels.insert(0, "s1".to_string());
        labels.insert(1, "s2".to_string());
        let samples = vec![
            PixelSample { label: 0, width: 2, height: 2, data: vec![1, 2, 3, 4] },
            PixelSample { label: 1, width: 1, height: 1, data: vec![9] },
        ];
        store.replace_pixel_model(samples, labels);
        store.persist().unwrap();

        let reloaded = open_store(&dir, BackendKind::Pixel);
        assert!(reloaded.load_warning().is_none());
        let (samples, labels) = reloaded.pixel_model().unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].data, vec![1, 2, 3, 4]);
        assert_eq!(labels[&0], "s1");
        assert_eq!(labels[&1], "s2");
        assert_eq!(reloaded.template_count("s1"), 1);
        assert_eq!(reloaded.subject_ids(), vec!["s1".to_string(), "s2".to_string()]);
    }

    #[test]
    fn test_corrupt_snapshot_recovers_empty_with_warning() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path()).unwrap();
        std::fs::write(dir.path().join("templates.json"), "{not json").unwrap();

        let store = open_store(&dir, BackendKind::Embedding);
        assert!(store.load_warning().is_some());
        assert!(store.subject_ids().is_empty());
    }

    #[test]
    fn test_backend_mismatch_requires_retrain() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir, BackendKind::Embedding);
        store.append_embedding("s1", embedding(&[0.5]));
        store.persist().unwrap();

        let fallback = open_store(&dir, BackendKind::Pixel);
        assert!(fallback.load_warning().unwrap().contains("retrain"));
        assert!(fallback.subject_ids().is_empty());
        assert_eq!(fallback.kind(), BackendKind::Pixel);
    }

    #[test]
    fn test_persist_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir, BackendKind::Embedding);
        store.append_embedding("s1", embedding(&[0.5]));
        store.persist().unwrap();

        assert!(store.snapshot_path().exists());
        assert!(!store.snapshot_path().with_extension("json.tmp").exists());
    }

    #[test]
    fn test_replace_embeddings_returns_previous() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir, BackendKind::Embedding);
        store.append_embedding("s1", embedding(&[0.1]));

        let previous = store.replace_embeddings("s1", vec![embedding(&[0.7]), embedding(&[0.8])]);
        assert_eq!(previous.len(), 1);
        assert_eq!(store.template_count("s1"), 2);

        // Empty replacement removes the subject entirely.
        store.replace_embeddings("s1", Vec::new());
        assert_eq!(store.template_count("s1"), 0);
        assert!(store.subject_ids().is_empty());
    }

    #[test]
    fn test_remove_subject_templates_pixel_mode() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir, BackendKind::Pixel);
        let mut labels = BTreeMap::new();
        labels.insert(0, "s1".to_string());
        labels.insert(1, "s2".to_string());
        let samples = vec![
            PixelSample { label: 0, width: 1, height: 1, data: vec![1] },
            PixelSample { label: 1, width: 1, height: 1, data: vec![2] },
            PixelSample { label: 0, width: 1, height: 1, data: vec![3] },
        ];
        store.replace_pixel_model(samples, labels);

        store.remove_subject_templates("s1");
        let (samples, labels) = store.pixel_model().unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].label, 1);
        assert_eq!(labels.len(), 1);
        assert_eq!(store.subject_ids(), vec!["s2".to_string()]);
    }

    #[test]
    fn test_is_trained_needs_templates_and_samples() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir, BackendKind::Embedding);
        let image = GrayImage::from_pixel(4, 4, Luma([0u8]));

        // Templates without enough samples: not trained.
        for _ in 0..2 {
            store.save_sample("s1", &image).unwrap();
            store.append_embedding("s1", embedding(&[0.1]));
        }
        assert!(!store.is_trained("s1", 3));

        store.save_sample("s1", &image).unwrap();
        store.append_embedding("s1", embedding(&[0.2]));
        assert!(store.is_trained("s1", 3));

        // Samples without templates: not trained either.
        store.replace_embeddings("s1", Vec::new());
        assert!(!store.is_trained("s1", 3));
    }
}
