//! Model registry
//!
//! Per-model metadata keyed by model id, the trained blob of each model, and
//! a cache of decoded quantization states. A model moves out of `TRAINING`
//! exactly once, to `CREATED` or `FAILED`; after that only delete touches it.
//!
//! With a model directory configured, each model is persisted as
//! `<id>.json` (metadata) plus `<id>.blob` (trained bytes), each written to a
//! temp file and renamed into place.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use knn_core::{QuantizationState, SpaceType};

use crate::error::{KnnError, Result};

pub const ENGINE_NAME: &str = "arena";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelState {
    Created,
    Training,
    Failed,
}

/// What a training job fits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "lowercase")]
pub enum TrainingMethod {
    /// Native IVF partitions; the blob is a codebook state of the centroids.
    Ivf {
        nlist: usize,
        #[serde(default = "default_nprobe")]
        nprobe: usize,
    },
    /// Byte scalar quantizer; the blob is the serialized state.
    Sq8,
    /// One-bit quantizer; the blob is the serialized state.
    Binary,
}

fn default_nprobe() -> usize {
    1
}

impl TrainingMethod {
    /// Native memory needed to build the model, beyond the training data.
    pub fn estimate_overhead_bytes(&self, dimension: usize) -> u64 {
        let dim = dimension as u64;
        match *self {
            TrainingMethod::Ivf { nlist, .. } => {
                let nlist = nlist as u64;
                nlist * dim * 4 + nlist * 8
            }
            TrainingMethod::Sq8 => dim * 8 + 64,
            TrainingMethod::Binary => dim * 4 + 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub engine: String,
    pub space_type: SpaceType,
    pub dimension: usize,
    pub method: TrainingMethod,
    pub state: ModelState,
    /// Seconds since the Unix epoch.
    pub timestamp: u64,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub node_id: String,
}

impl ModelMetadata {
    pub fn training(
        space_type: SpaceType,
        dimension: usize,
        method: TrainingMethod,
        description: impl Into<String>,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            engine: ENGINE_NAME.to_string(),
            space_type,
            dimension,
            method,
            state: ModelState::Training,
            timestamp: current_unix_ts(),
            description: description.into(),
            error: None,
            node_id: node_id.into(),
        }
    }
}

#[derive(Debug, Clone)]
struct Model {
    metadata: ModelMetadata,
    blob: Option<Arc<[u8]>>,
}

pub struct ModelRegistry {
    models: RwLock<HashMap<String, Model>>,
    states: RwLock<HashMap<String, Arc<QuantizationState>>>,
    dir: Option<PathBuf>,
}

impl ModelRegistry {
    pub fn in_memory() -> Self {
        Self {
            models: RwLock::new(HashMap::new()),
            states: RwLock::new(HashMap::new()),
            dir: None,
        }
    }

    /// Opens (creating if needed) a persisted registry.
    ///
    /// Models found in `TRAINING` belonged to a job that died with the
    /// process; they are marked `FAILED`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut models = HashMap::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            let mut metadata: ModelMetadata = serde_json::from_slice(&fs::read(&path)?)?;
            let blob_path = dir.join(format!("{id}.blob"));
            let blob = if blob_path.exists() {
                Some(Arc::from(fs::read(&blob_path)?))
            } else {
                None
            };
            if metadata.state == ModelState::Training {
                metadata.state = ModelState::Failed;
                metadata.error = Some("training interrupted by node restart".to_string());
                write_atomic(&path, &serde_json::to_vec_pretty(&metadata)?)?;
            }
            models.insert(id, Model { metadata, blob });
        }

        info!(dir = %dir.display(), models = models.len(), "opened model registry");
        Ok(Self {
            models: RwLock::new(models),
            states: RwLock::new(HashMap::new()),
            dir: Some(dir),
        })
    }

    /// Registers a new model in `TRAINING`.
    pub fn begin_training(&self, model_id: &str, metadata: ModelMetadata) -> Result<()> {
        validate_model_id(model_id)?;
        let mut models = self.models.write();
        if let Some(existing) = models.get(model_id) {
            return Err(match existing.metadata.state {
                ModelState::Training => {
                    KnnError::ConcurrencyConflict(format!("model {model_id} is already training"))
                }
                _ => KnnError::InvalidArgument(format!("model {model_id} already exists")),
            });
        }
        let model = Model {
            metadata: ModelMetadata {
                state: ModelState::Training,
                error: None,
                ..metadata
            },
            blob: None,
        };
        self.persist(model_id, &model.metadata, None)?;
        models.insert(model_id.to_string(), model);
        Ok(())
    }

    /// `TRAINING` → `CREATED` with `blob`. Returns false when the model is not
    /// training (already completed, or deleted).
    pub fn complete_training(&self, model_id: &str, blob: Vec<u8>) -> Result<bool> {
        let mut models = self.models.write();
        let Some(model) = models.get_mut(model_id) else {
            return Ok(false);
        };
        if model.metadata.state != ModelState::Training {
            return Ok(false);
        }
        let metadata = ModelMetadata {
            state: ModelState::Created,
            error: None,
            ..model.metadata.clone()
        };
        self.persist(model_id, &metadata, Some(&blob))?;
        model.metadata = metadata;
        model.blob = Some(Arc::from(blob));
        Ok(true)
    }

    /// `TRAINING` → `FAILED` with `error`. Returns false when the model is not
    /// training. Persisting is best effort; the in-memory transition always
    /// happens.
    pub fn fail_training(&self, model_id: &str, error: &str) -> bool {
        let mut models = self.models.write();
        let Some(model) = models.get_mut(model_id) else {
            return false;
        };
        if model.metadata.state != ModelState::Training {
            return false;
        }
        model.metadata.state = ModelState::Failed;
        model.metadata.error = Some(error.to_string());
        if let Err(err) = self.persist(model_id, &model.metadata, None) {
            warn!(model_id, "failed to persist FAILED model state: {err}");
        }
        true
    }

    pub fn get(&self, model_id: &str) -> Option<ModelMetadata> {
        self.models.read().get(model_id).map(|m| m.metadata.clone())
    }

    pub fn blob(&self, model_id: &str) -> Option<Arc<[u8]>> {
        self.models.read().get(model_id).and_then(|m| m.blob.clone())
    }

    /// All models, sorted by id.
    pub fn list(&self) -> Vec<(String, ModelMetadata)> {
        let mut all: Vec<_> = self
            .models
            .read()
            .iter()
            .map(|(id, m)| (id.clone(), m.metadata.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn len(&self) -> usize {
        self.models.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes a model, its files and its cached state.
    pub fn delete(&self, model_id: &str) -> Result<()> {
        let mut models = self.models.write();
        match models.get(model_id) {
            None => return Err(KnnError::ModelNotFound(model_id.to_string())),
            Some(m) if m.metadata.state == ModelState::Training => {
                return Err(KnnError::ConcurrencyConflict(format!(
                    "model {model_id} is training and cannot be deleted"
                )))
            }
            Some(_) => {}
        }
        if let Some(dir) = &self.dir {
            for ext in ["json", "blob"] {
                let path = dir.join(format!("{model_id}.{ext}"));
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        models.remove(model_id);
        self.states.write().remove(model_id);
        info!(model_id, "deleted model");
        Ok(())
    }

    /// Decoded quantization state of a `CREATED` model, shared across
    /// callers.
    pub fn quantization_state(&self, model_id: &str) -> Result<Arc<QuantizationState>> {
        if let Some(state) = self.states.read().get(model_id) {
            return Ok(Arc::clone(state));
        }

        let (metadata, blob) = {
            let models = self.models.read();
            let model = models
                .get(model_id)
                .ok_or_else(|| KnnError::ModelNotFound(model_id.to_string()))?;
            (model.metadata.clone(), model.blob.clone())
        };
        if metadata.state != ModelState::Created {
            return Err(KnnError::InvalidArgument(format!(
                "model {model_id} is not ready"
            )));
        }
        let blob = blob.ok_or_else(|| {
            KnnError::DataCorruption(format!("model {model_id} has no trained blob"))
        })?;
        let state = Arc::new(QuantizationState::from_bytes(&blob)?);

        let mut states = self.states.write();
        Ok(Arc::clone(
            states.entry(model_id.to_string()).or_insert(state),
        ))
    }

    /// Trained bytes of a `CREATED` IVF model, as passed to the native build.
    pub fn build_template(&self, model_id: &str) -> Result<Vec<u8>> {
        let state = self.quantization_state(model_id)?;
        state.codebook().map(<[u8]>::to_vec).ok_or_else(|| {
            KnnError::InvalidArgument(format!(
                "model {model_id} holds a {} state, not a build template",
                state.params().kind()
            ))
        })
    }

    pub fn cached_state_count(&self) -> usize {
        self.states.read().len()
    }

    fn persist(&self, model_id: &str, metadata: &ModelMetadata, blob: Option<&[u8]>) -> Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        if let Some(blob) = blob {
            write_atomic(&dir.join(format!("{model_id}.blob")), blob)?;
        }
        write_atomic(
            &dir.join(format!("{model_id}.json")),
            &serde_json::to_vec_pretty(metadata)?,
        )
    }
}

fn validate_model_id(model_id: &str) -> Result<()> {
    let ok = !model_id.is_empty()
        && !model_id.starts_with('.')
        && model_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(KnnError::InvalidArgument(format!(
            "invalid model id {model_id:?}"
        )))
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension(format!(
        "{}.tmp",
        path.extension().and_then(|e| e.to_str()).unwrap_or("")
    ));
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub(crate) fn current_unix_ts() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use knn_core::QuantizationParams;

    fn metadata(method: TrainingMethod) -> ModelMetadata {
        ModelMetadata::training(SpaceType::L2, 2, method, "test model", "node-0")
    }

    fn sq8_blob() -> Vec<u8> {
        QuantizationState::new(
            2,
            QuantizationParams::ByteScalar {
                min: vec![0.0, 0.0],
                diff: vec![1.0, 1.0],
            },
        )
        .to_bytes()
    }

    #[test]
    fn single_terminal_transition() {
        let registry = ModelRegistry::in_memory();
        registry.begin_training("m1", metadata(TrainingMethod::Sq8)).unwrap();
        assert!(registry.complete_training("m1", sq8_blob()).unwrap());
        assert!(!registry.complete_training("m1", vec![1]).unwrap());
        assert!(!registry.fail_training("m1", "late failure"));

        let m = registry.get("m1").unwrap();
        assert_eq!(m.state, ModelState::Created);
        assert_eq!(m.error, None);
        assert_eq!(registry.blob("m1").unwrap().as_ref(), sq8_blob().as_slice());
    }

    #[test]
    fn duplicate_registration_conflicts() {
        let registry = ModelRegistry::in_memory();
        registry.begin_training("m1", metadata(TrainingMethod::Sq8)).unwrap();
        assert!(matches!(
            registry.begin_training("m1", metadata(TrainingMethod::Sq8)),
            Err(KnnError::ConcurrencyConflict(_))
        ));
        registry.fail_training("m1", "boom");
        assert!(matches!(
            registry.begin_training("m1", metadata(TrainingMethod::Sq8)),
            Err(KnnError::InvalidArgument(_))
        ));
    }

    #[test]
    fn delete_guards() {
        let registry = ModelRegistry::in_memory();
        assert!(matches!(
            registry.delete("nope"),
            Err(KnnError::ModelNotFound(_))
        ));
        registry.begin_training("m1", metadata(TrainingMethod::Sq8)).unwrap();
        assert!(matches!(
            registry.delete("m1"),
            Err(KnnError::ConcurrencyConflict(_))
        ));
        registry.complete_training("m1", sq8_blob()).unwrap();
        registry.quantization_state("m1").unwrap();
        assert_eq!(registry.cached_state_count(), 1);
        registry.delete("m1").unwrap();
        assert_eq!(registry.cached_state_count(), 0);
        assert!(registry.get("m1").is_none());
    }

    #[test]
    fn quantization_state_is_shared() {
        let registry = ModelRegistry::in_memory();
        registry.begin_training("m1", metadata(TrainingMethod::Sq8)).unwrap();
        registry.complete_training("m1", sq8_blob()).unwrap();
        let a = registry.quantization_state("m1").unwrap();
        let b = registry.quantization_state("m1").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.dimension(), 2);
    }

    #[test]
    fn ivf_templates_are_versioned_codebook_states() {
        let registry = ModelRegistry::in_memory();
        let method = TrainingMethod::Ivf { nlist: 2, nprobe: 1 };
        let centroids = vec![7u8; 16];
        let blob = QuantizationState::new(
            2,
            QuantizationParams::Codebook {
                bytes: centroids.clone(),
            },
        )
        .to_bytes();
        registry.begin_training("ivf", metadata(method)).unwrap();
        registry.complete_training("ivf", blob).unwrap();

        assert_eq!(registry.quantization_state("ivf").unwrap().dimension(), 2);
        assert_eq!(registry.build_template("ivf").unwrap(), centroids);

        registry.begin_training("sq", metadata(TrainingMethod::Sq8)).unwrap();
        registry.complete_training("sq", sq8_blob()).unwrap();
        assert!(matches!(
            registry.build_template("sq"),
            Err(KnnError::InvalidArgument(_))
        ));
    }

    #[test]
    fn raw_ivf_bytes_are_rejected_as_corrupt() {
        let registry = ModelRegistry::in_memory();
        let method = TrainingMethod::Ivf { nlist: 2, nprobe: 1 };
        registry.begin_training("ivf", metadata(method)).unwrap();
        registry.complete_training("ivf", vec![0; 16]).unwrap();
        assert!(registry.build_template("ivf").is_err());
    }

    #[test]
    fn rejects_path_like_ids() {
        let registry = ModelRegistry::in_memory();
        for bad in ["", "../x", "a/b", ".hidden"] {
            assert!(registry.begin_training(bad, metadata(TrainingMethod::Sq8)).is_err());
        }
    }

    #[test]
    fn persisted_models_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let registry = ModelRegistry::open(dir.path()).unwrap();
            registry.begin_training("done", metadata(TrainingMethod::Sq8)).unwrap();
            registry.complete_training("done", sq8_blob()).unwrap();
            registry.begin_training("stuck", metadata(TrainingMethod::Binary)).unwrap();
        }
        assert!(dir.path().join("done.json").exists());
        assert!(dir.path().join("done.blob").exists());

        let registry = ModelRegistry::open(dir.path()).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("done").unwrap().state, ModelState::Created);
        assert_eq!(registry.quantization_state("done").unwrap().dimension(), 2);
        let stuck = registry.get("stuck").unwrap();
        assert_eq!(stuck.state, ModelState::Failed);
        assert!(stuck.error.is_some());

        registry.delete("done").unwrap();
        assert!(!dir.path().join("done.json").exists());
        assert!(!dir.path().join("done.blob").exists());
    }

    #[test]
    fn overhead_estimates() {
        assert_eq!(
            TrainingMethod::Ivf { nlist: 4, nprobe: 1 }.estimate_overhead_bytes(8),
            4 * 8 * 4 + 32
        );
        assert_eq!(TrainingMethod::Sq8.estimate_overhead_bytes(8), 128);
    }

    #[test]
    fn metadata_json_shape() {
        let json = serde_json::to_value(metadata(TrainingMethod::Ivf { nlist: 4, nprobe: 2 }))
            .unwrap();
        assert_eq!(json["state"], "training");
        assert_eq!(json["space_type"], "l2");
        assert_eq!(json["method"]["name"], "ivf");
        assert!(json.get("error").is_none());
    }
}
