use serde::{Deserialize, Serialize};

use knn_core::SpaceType;

/// Structure of a built index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum IndexMethod {
    /// Every vector scanned on query.
    Flat,
    /// Vectors partitioned by nearest centroid; `nprobe` partitions scanned.
    Ivf { nlist: usize, nprobe: usize },
}

impl IndexMethod {
    pub fn requires_training(&self) -> bool {
        matches!(self, IndexMethod::Ivf { .. })
    }
}

/// Parameters for `train_index`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainParams {
    pub nlist: usize,
    #[serde(default = "default_iterations")]
    pub max_iterations: usize,
    #[serde(default)]
    pub seed: u64,
}

fn default_iterations() -> usize {
    25
}

impl TrainParams {
    pub fn ivf(nlist: usize) -> Self {
        Self {
            nlist,
            max_iterations: default_iterations(),
            seed: 0,
        }
    }
}

/// Parameters for `build_index`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BuildParams {
    pub method: IndexMethod,
    pub space: SpaceType,
    pub dimension: usize,
}
