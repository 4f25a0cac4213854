//! # knn-native
//!
//! The boundary between the engine and the library that owns index memory.
//!
//! The engine only ever sees [`NativeAddress`] integers. It hands them back to
//! the same [`NativeLibrary`] to query or free them and never interprets them.
//! Every call returns a `Result`: panics inside the library are caught at the
//! boundary by [`guard::guarded`] and reported as [`NativeError::Panicked`].
//!
//! [`ArenaLibrary`] is the in-process implementation: a flat exact index and an
//! IVF index whose partitions are trained with k-means.

pub mod arena;
pub mod error;
pub mod format;
pub mod guard;
pub mod ivf;
pub mod method;

use std::fmt;

use serde::{Deserialize, Serialize};

use knn_core::DocBitSet;

pub use arena::ArenaLibrary;
pub use error::NativeError;
pub use format::{IndexData, IndexFormatError, IndexHeader};
pub use method::{BuildParams, IndexMethod, TrainParams};

/// Opaque handle to memory owned by a [`NativeLibrary`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NativeAddress(pub u64);

impl fmt::Display for NativeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Train, build, load, query and free native index structures.
///
/// Implementations must be callable from any thread.
pub trait NativeLibrary: Send + Sync {
    /// Copies `vectors` into native memory. With `Some(address)` they are
    /// appended to that allocation, otherwise a new one is created.
    fn store_vector_data(
        &self,
        address: Option<NativeAddress>,
        vectors: &[Vec<f32>],
    ) -> Result<NativeAddress, NativeError>;

    /// Trains over the vectors stored at `address` and returns the template
    /// bytes later passed to [`build_index`](Self::build_index).
    fn train_index(
        &self,
        params: &TrainParams,
        dimension: usize,
        address: NativeAddress,
    ) -> Result<Vec<u8>, NativeError>;

    /// Builds a serialized index over the vectors at `address`, one id per row.
    fn build_index(
        &self,
        params: &BuildParams,
        ids: &[u32],
        address: NativeAddress,
        template: Option<&[u8]>,
    ) -> Result<Vec<u8>, NativeError>;

    /// Loads serialized index bytes into native memory.
    fn load_index(&self, bytes: &[u8]) -> Result<NativeAddress, NativeError>;

    /// Top `k` `(id, score)` pairs, best first. With a filter only ids in it
    /// are returned.
    fn query_index(
        &self,
        address: NativeAddress,
        query: &[f32],
        k: usize,
        filter: Option<&DocBitSet>,
    ) -> Result<Vec<(u32, f32)>, NativeError>;

    /// Bytes held at `address`.
    fn index_size_bytes(&self, address: NativeAddress) -> Result<usize, NativeError>;

    fn free(&self, address: NativeAddress) -> Result<(), NativeError>;
}
