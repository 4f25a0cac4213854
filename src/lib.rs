//! knn-engine: native memory management, quantization and exact scoring for
//! k-NN search
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          KnnNode                            │
//! │   warmup · clear_cache · stats · train · cancel · delete    │
//! └─────────────────────────────────────────────────────────────┘
//!        │                     │                     │
//!        ▼                     ▼                     ▼
//! ┌──────────────┐   ┌───────────────────┐   ┌───────────────┐
//! │ NativeMemory │   │ TrainingJobRunner │──▶│ ModelRegistry │
//! │    Cache     │   │   (knn-train-*)   │   │  + states     │
//! └──────────────┘   └───────────────────┘   └───────────────┘
//!        │     shared NativeMemoryBudget     │
//!        └─────────────────┬─────────────────┘
//!                          ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │               NativeLibrary (knn-native)                    │
//! │      store_vector_data · train · build · load · query       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Exact search over a segment goes through the candidate iterators of
//! `knn-core` and the [`TopKCollector`].

pub mod budget;
pub mod cache;
pub mod catalog;
pub mod collector;
pub mod config;
pub mod error;
pub mod handle;
pub mod model;
pub mod node;
pub mod search;
pub mod training;

pub use budget::{NativeMemoryBudget, Reservation};
pub use cache::{CacheKey, CacheStats, GraphLoader, NativeMemoryCache, PinnedGraph};
pub use catalog::{DirectoryCatalog, GraphCatalog};
pub use collector::TopKCollector;
pub use config::EngineConfig;
pub use error::{KnnError, Result};
pub use handle::NativeHandle;
pub use model::{ModelMetadata, ModelRegistry, ModelState, TrainingMethod};
pub use node::{cancel_training_on_nodes, GraphStore, KnnNode, NodeStats};
pub use search::{ann_search, exact_search, exact_search_nested, NestedHit};
pub use training::{
    CompletionListener, InMemoryTrainingData, JobCompletion, TrainingDataSource, TrainingJob,
    TrainingJobRunner, TrainingOutcome, TrainingStats, TrainingTicket,
};
