//! Per-node wiring of the engine and its administrative operations.
//!
//! One [`KnnNode`] owns the process-scoped state: the native memory budget
//! shared by the graph cache and training jobs, the cache itself, the model
//! registry and the training runner. Collaborators receive it explicitly.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use knn_core::DocBitSet;
use knn_native::NativeLibrary;

use crate::budget::NativeMemoryBudget;
use crate::cache::{CacheStats, GraphLoader, NativeMemoryCache};
use crate::catalog::{DirectoryCatalog, GraphCatalog};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::model::{ModelMetadata, ModelRegistry};
use crate::search::ann_search;
use crate::training::{
    CompletionListener, TrainingJob, TrainingJobRunner, TrainingStats, TrainingTicket,
};

/// Graph enumeration plus loading, as one collaborator.
pub trait GraphStore: GraphCatalog + GraphLoader {
    fn as_loader(&self) -> &dyn GraphLoader;
}

impl<T: GraphCatalog + GraphLoader> GraphStore for T {
    fn as_loader(&self) -> &dyn GraphLoader {
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeStats {
    pub node_id: String,
    pub cache: CacheStats,
    pub training: TrainingStats,
    pub model_count: usize,
    pub cached_quantization_states: usize,
}

pub struct KnnNode {
    config: EngineConfig,
    library: Arc<dyn NativeLibrary>,
    graphs: Arc<dyn GraphStore>,
    cache: NativeMemoryCache,
    registry: Arc<ModelRegistry>,
    training: Arc<TrainingJobRunner>,
}

impl KnnNode {
    /// Starts a node whose graphs live under `config.data_dir`.
    pub fn initialize(config: EngineConfig, library: Arc<dyn NativeLibrary>) -> Result<Self> {
        let graphs = Arc::new(DirectoryCatalog::new(
            config.data_dir.clone(),
            Arc::clone(&library),
        ));
        Self::with_graphs(config, library, graphs)
    }

    pub fn with_graphs(
        config: EngineConfig,
        library: Arc<dyn NativeLibrary>,
        graphs: Arc<dyn GraphStore>,
    ) -> Result<Self> {
        let budget = NativeMemoryBudget::new(config.cache_capacity_bytes);
        let registry = Arc::new(match &config.model_dir {
            Some(dir) => ModelRegistry::open(dir)?,
            None => ModelRegistry::in_memory(),
        });
        let training = TrainingJobRunner::new(
            &config,
            Arc::clone(&budget),
            Arc::clone(&registry),
            Arc::clone(&library),
        )?;

        info!(
            node_id = %config.node_id,
            capacity = config.cache_capacity_bytes,
            data_dir = %config.data_dir.display(),
            "knn node initialized"
        );
        Ok(Self {
            cache: NativeMemoryCache::new(budget),
            config,
            library,
            graphs,
            registry,
            training,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn library(&self) -> &Arc<dyn NativeLibrary> {
        &self.library
    }

    pub fn budget(&self) -> &Arc<NativeMemoryBudget> {
        self.cache.budget()
    }

    pub fn cache(&self) -> &NativeMemoryCache {
        &self.cache
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// Loads every graph of `indices` into the cache. Returns how many graphs
    /// were warmed.
    pub fn warmup<S: AsRef<str>>(&self, indices: &[S]) -> Result<usize> {
        let mut warmed = 0;
        for index in indices {
            for key in self.graphs.graphs_for_index(index.as_ref())? {
                drop(self.cache.get_or_load(&key, self.graphs.as_loader())?);
                warmed += 1;
            }
            info!(index = index.as_ref(), "warmed up index");
        }
        Ok(warmed)
    }

    /// Evicts every resident graph of `indices`.
    pub fn clear_cache<S: AsRef<str>>(&self, indices: &[S]) -> usize {
        let evicted = self.cache.clear(indices);
        info!(evicted, "cleared graph cache");
        evicted
    }

    pub fn stats(&self) -> NodeStats {
        NodeStats {
            node_id: self.config.node_id.clone(),
            cache: self.cache.stats(),
            training: self.training.stats(),
            model_count: self.registry.len(),
            cached_quantization_states: self.registry.cached_state_count(),
        }
    }

    pub fn train_model(
        &self,
        job: TrainingJob,
        listener: Option<CompletionListener>,
    ) -> Result<TrainingTicket> {
        self.training.execute(job, listener)
    }

    /// Cancels training of `model_id` if it runs on this node.
    pub fn cancel_training(&self, model_id: &str) -> bool {
        self.training.cancel(model_id)
    }

    pub fn get_model(&self, model_id: &str) -> Option<ModelMetadata> {
        self.registry.get(model_id)
    }

    pub fn delete_model(&self, model_id: &str) -> Result<()> {
        self.registry.delete(model_id)
    }

    /// Approximate top `k` over every graph of `index`, loading on demand.
    ///
    /// Segments are pinned one at a time, so an index only needs its largest
    /// segment to fit in the cache.
    pub fn search(
        &self,
        index: &str,
        query: &[f32],
        k: usize,
        filter: Option<&DocBitSet>,
    ) -> Result<Vec<(u32, f32)>> {
        let keys = self.graphs.graphs_for_index(index)?;
        let loader = self.graphs.as_loader();
        ann_search(
            keys.iter().map(|key| self.cache.get_or_load(key, loader)),
            query,
            k,
            filter,
        )
    }

    /// Evicts every resident graph. Pinned graphs are freed when released.
    pub fn shutdown(&self) {
        let indices: Vec<String> = self.cache.stats().graphs_per_index.into_keys().collect();
        let evicted = self.cache.clear(&indices);
        info!(node_id = %self.config.node_id, evicted, "knn node shut down");
    }
}

/// Requests cancellation of `model_id` on every node. Reports, per node id,
/// whether a running job was found.
pub fn cancel_training_on_nodes<'a, I>(nodes: I, model_id: &str) -> Vec<(String, bool)>
where
    I: IntoIterator<Item = &'a KnnNode>,
{
    nodes
        .into_iter()
        .map(|node| (node.node_id().to_string(), node.cancel_training(model_id)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheKey;
    use knn_core::SpaceType;
    use knn_native::{ArenaLibrary, BuildParams, IndexMethod};

    fn node(dir: &std::path::Path, node_id: &str) -> (Arc<ArenaLibrary>, KnnNode) {
        let library = Arc::new(ArenaLibrary::new());
        let config = EngineConfig {
            node_id: node_id.to_string(),
            ..EngineConfig::from_data_dir(dir.to_path_buf())
        };
        let node = KnnNode::initialize(config, library.clone()).unwrap();
        (library, node)
    }

    fn write_segment(node: &KnnNode, index: &str, segment: &str, base: f32) {
        let catalog = DirectoryCatalog::new(node.config().data_dir.clone(), node.library().clone());
        let vectors: Vec<Vec<f32>> = (0..4).map(|i| vec![base + i as f32]).collect();
        let ids: Vec<u32> = (0..4).map(|i| (base as u32) + i).collect();
        let params = BuildParams {
            method: IndexMethod::Flat,
            space: SpaceType::L2,
            dimension: 1,
        };
        catalog
            .build_graph(&CacheKey::new(index, segment), &params, &ids, &vectors, None)
            .unwrap();
    }

    #[test]
    fn warmup_search_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let (library, node) = node(dir.path(), "n0");
        write_segment(&node, "a", "s0", 0.0);
        write_segment(&node, "a", "s1", 100.0);
        write_segment(&node, "b", "s0", 50.0);

        assert_eq!(node.warmup(&["a"]).unwrap(), 2);
        let stats = node.stats();
        assert_eq!(stats.cache.miss_count, 2);
        assert_eq!(stats.cache.graph_count, 2);
        assert_eq!(library.allocation_count(), 2);

        let hits = node.search("a", &[101.2], 2, None).unwrap();
        assert_eq!(hits[0].0, 101);
        assert_eq!(node.stats().cache.hit_count, 2);

        assert_eq!(node.clear_cache(&["a"]), 2);
        assert_eq!(library.allocation_count(), 0);
        assert_eq!(node.budget().committed(), 0);
    }

    #[test]
    fn search_fits_segments_one_at_a_time() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (_, builder) = node(dir.path(), "builder");
            write_segment(&builder, "a", "s0", 0.0);
            write_segment(&builder, "a", "s1", 100.0);
        }
        let segment_bytes = std::fs::metadata(dir.path().join("a").join("s0.knn"))
            .unwrap()
            .len();

        // Room for one segment and a half.
        let library = Arc::new(ArenaLibrary::new());
        let config = EngineConfig {
            cache_capacity_bytes: segment_bytes + segment_bytes / 2,
            ..EngineConfig::from_data_dir(dir.path().to_path_buf())
        };
        let node = KnnNode::initialize(config, library.clone()).unwrap();

        assert_eq!(node.warmup(&["a"]).unwrap(), 2);
        let hits = node.search("a", &[50.0], 8, None).unwrap();
        assert_eq!(hits.len(), 8);
        assert!(hits.iter().any(|h| h.0 < 100));
        assert!(hits.iter().any(|h| h.0 >= 100));

        let stats = node.stats();
        assert!(stats.cache.eviction_count >= 2);
        assert!(stats.cache.committed_bytes <= stats.cache.capacity_bytes);
        assert_eq!(library.allocation_count(), 1);
    }

    #[test]
    fn shutdown_releases_everything() {
        let dir = tempfile::tempdir().unwrap();
        let (library, node) = node(dir.path(), "n0");
        write_segment(&node, "a", "s0", 0.0);
        write_segment(&node, "b", "s0", 10.0);
        node.warmup(&["a", "b"]).unwrap();
        node.shutdown();
        assert_eq!(node.cache().total_graph_count(), 0);
        assert_eq!(library.allocation_count(), 0);
    }

    #[test]
    fn cancel_reports_per_node() {
        let dir = tempfile::tempdir().unwrap();
        let (_, first) = node(&dir.path().join("n1"), "n1");
        let (_, second) = node(&dir.path().join("n2"), "n2");
        let report = cancel_training_on_nodes([&first, &second], "nothing");
        assert_eq!(
            report,
            vec![("n1".to_string(), false), ("n2".to_string(), false)]
        );
    }
}
