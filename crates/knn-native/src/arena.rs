use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use knn_core::{DocBitSet, VectorDataType};

use crate::format::{IndexData, IndexHeader};
use crate::guard::guarded;
use crate::ivf;
use crate::method::{BuildParams, IndexMethod, TrainParams};
use crate::{NativeAddress, NativeError, NativeLibrary};

enum Allocation {
    Vectors { dimension: usize, data: Vec<f32> },
    Index(Arc<LoadedIndex>),
}

impl Allocation {
    fn size_bytes(&self) -> usize {
        match self {
            Allocation::Vectors { data, .. } => data.len() * std::mem::size_of::<f32>(),
            Allocation::Index(index) => index.data.header.encoded_len(),
        }
    }
}

struct LoadedIndex {
    data: IndexData,
    // Rows of each IVF partition; empty for flat.
    partitions: Vec<Vec<usize>>,
}

impl LoadedIndex {
    fn new(data: IndexData) -> Self {
        let mut partitions = Vec::new();
        if let IndexMethod::Ivf { nlist, .. } = data.header.method {
            partitions = vec![Vec::new(); nlist];
            for (row, &p) in data.assignments.iter().enumerate() {
                partitions[p as usize].push(row);
            }
        }
        Self { data, partitions }
    }

    fn search(&self, query: &[f32], k: usize, filter: Option<&DocBitSet>) -> Vec<(u32, f32)> {
        let header = &self.data.header;
        let dim = header.dimension as usize;
        let space = header.space;

        let score_row = |row: usize| -> Option<(u32, f32)> {
            let id = self.data.ids[row];
            if filter.is_some_and(|f| !f.contains(id)) {
                return None;
            }
            Some((id, space.score_f32(query, self.data.vector(row))))
        };

        let mut hits: Vec<(u32, f32)> = match header.method {
            IndexMethod::Flat => (0..header.count as usize).filter_map(score_row).collect(),
            IndexMethod::Ivf { nprobe, .. } => {
                ivf::probe_order(query, &self.data.centroids, dim, nprobe.max(1))
                    .into_iter()
                    .flat_map(|p| self.partitions[p].iter().copied())
                    .filter_map(score_row)
                    .collect()
            }
        };

        hits.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        hits.truncate(k);
        hits
    }
}

/// In-process [`NativeLibrary`]: allocations live in a locked map keyed by a
/// monotonically increasing address.
pub struct ArenaLibrary {
    next_address: AtomicU64,
    allocations: Mutex<HashMap<NativeAddress, Allocation>>,
}

impl Default for ArenaLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl ArenaLibrary {
    pub fn new() -> Self {
        Self {
            next_address: AtomicU64::new(1),
            allocations: Mutex::new(HashMap::new()),
        }
    }

    /// Number of live allocations.
    pub fn allocation_count(&self) -> usize {
        self.allocations.lock().len()
    }

    /// Bytes held by all live allocations.
    pub fn allocated_bytes(&self) -> usize {
        self.allocations.lock().values().map(Allocation::size_bytes).sum()
    }

    fn insert(&self, allocation: Allocation) -> NativeAddress {
        let address = NativeAddress(self.next_address.fetch_add(1, Ordering::Relaxed));
        self.allocations.lock().insert(address, allocation);
        address
    }

    /// Copies the rows stored at `address`.
    fn stored_vectors(&self, address: NativeAddress) -> Result<(usize, Vec<f32>), NativeError> {
        match self.allocations.lock().get(&address) {
            Some(Allocation::Vectors { dimension, data }) => Ok((*dimension, data.clone())),
            Some(Allocation::Index(_)) => Err(NativeError::WrongAllocation {
                address,
                expected: "vector data",
            }),
            None => Err(NativeError::InvalidAddress(address)),
        }
    }

    fn index(&self, address: NativeAddress) -> Result<Arc<LoadedIndex>, NativeError> {
        match self.allocations.lock().get(&address) {
            Some(Allocation::Index(index)) => Ok(Arc::clone(index)),
            Some(Allocation::Vectors { .. }) => Err(NativeError::WrongAllocation {
                address,
                expected: "an index",
            }),
            None => Err(NativeError::InvalidAddress(address)),
        }
    }
}

fn check_dimension(expected: usize, actual: usize) -> Result<(), NativeError> {
    if expected != actual {
        return Err(NativeError::InvalidArgument(format!(
            "dimension mismatch: expected {expected}, got {actual}"
        )));
    }
    Ok(())
}

impl NativeLibrary for ArenaLibrary {
    fn store_vector_data(
        &self,
        address: Option<NativeAddress>,
        vectors: &[Vec<f32>],
    ) -> Result<NativeAddress, NativeError> {
        guarded("store_vector_data", || {
            let Some(address) = address else {
                let dimension = vectors.first().map(Vec::len).ok_or_else(|| {
                    NativeError::InvalidArgument("no vectors to store".to_string())
                })?;
                let mut data = Vec::with_capacity(vectors.len() * dimension);
                for v in vectors {
                    check_dimension(dimension, v.len())?;
                    data.extend_from_slice(v);
                }
                return Ok(self.insert(Allocation::Vectors { dimension, data }));
            };

            let mut allocations = self.allocations.lock();
            match allocations.get_mut(&address) {
                Some(Allocation::Vectors { dimension, data }) => {
                    for v in vectors {
                        check_dimension(*dimension, v.len())?;
                    }
                    data.reserve(vectors.len() * *dimension);
                    for v in vectors {
                        data.extend_from_slice(v);
                    }
                    Ok(address)
                }
                Some(Allocation::Index(_)) => Err(NativeError::WrongAllocation {
                    address,
                    expected: "vector data",
                }),
                None => Err(NativeError::InvalidAddress(address)),
            }
        })
    }

    fn train_index(
        &self,
        params: &TrainParams,
        dimension: usize,
        address: NativeAddress,
    ) -> Result<Vec<u8>, NativeError> {
        guarded("train_index", || {
            let (stored_dim, data) = self.stored_vectors(address)?;
            check_dimension(dimension, stored_dim)?;
            if params.nlist == 0 {
                return Err(NativeError::InvalidArgument("nlist must be positive".into()));
            }
            if data.is_empty() {
                return Err(NativeError::Training("no training vectors".into()));
            }

            let centroids = ivf::train_centroids(
                &data,
                dimension,
                params.nlist,
                params.max_iterations,
                params.seed,
            );
            debug!(
                rows = data.len() / dimension,
                nlist = centroids.len() / dimension,
                "trained ivf centroids"
            );
            Ok(bytemuck::cast_slice(&centroids).to_vec())
        })
    }

    fn build_index(
        &self,
        params: &BuildParams,
        ids: &[u32],
        address: NativeAddress,
        template: Option<&[u8]>,
    ) -> Result<Vec<u8>, NativeError> {
        guarded("build_index", || {
            if !params.space.supports(VectorDataType::Float) {
                return Err(NativeError::InvalidArgument(format!(
                    "space {} cannot index float vectors",
                    params.space
                )));
            }
            let (stored_dim, vectors) = self.stored_vectors(address)?;
            let dim = params.dimension;
            check_dimension(dim, stored_dim)?;
            let rows = vectors.len() / dim.max(1);
            if ids.len() != rows {
                return Err(NativeError::InvalidArgument(format!(
                    "{} ids for {rows} vectors",
                    ids.len()
                )));
            }

            let (method, centroids, assignments) = match params.method {
                IndexMethod::Flat => (IndexMethod::Flat, Vec::new(), Vec::new()),
                IndexMethod::Ivf { nprobe, .. } => {
                    let template = template.ok_or_else(|| {
                        NativeError::InvalidArgument("ivf index requires a trained template".into())
                    })?;
                    if template.is_empty() || template.len() % (dim * 4) != 0 {
                        return Err(NativeError::InvalidArgument(format!(
                            "template of {} bytes does not hold {dim}-dimensional centroids",
                            template.len()
                        )));
                    }
                    let centroids: Vec<f32> = bytemuck::pod_collect_to_vec(template);
                    let nlist = centroids.len() / dim;
                    let assignments = vectors
                        .chunks_exact(dim)
                        .map(|v| ivf::nearest_centroid(v, &centroids, dim) as u32)
                        .collect();
                    let method = IndexMethod::Ivf {
                        nlist,
                        nprobe: nprobe.clamp(1, nlist),
                    };
                    (method, centroids, assignments)
                }
            };

            let index = IndexData {
                header: IndexHeader {
                    method,
                    space: params.space,
                    dimension: dim as u32,
                    count: rows as u32,
                },
                ids: ids.to_vec(),
                vectors,
                centroids,
                assignments,
            };
            Ok(index.encode())
        })
    }

    fn load_index(&self, bytes: &[u8]) -> Result<NativeAddress, NativeError> {
        guarded("load_index", || {
            let data = IndexData::decode(bytes)?;
            Ok(self.insert(Allocation::Index(Arc::new(LoadedIndex::new(data)))))
        })
    }

    fn query_index(
        &self,
        address: NativeAddress,
        query: &[f32],
        k: usize,
        filter: Option<&DocBitSet>,
    ) -> Result<Vec<(u32, f32)>, NativeError> {
        guarded("query_index", || {
            let index = self.index(address)?;
            check_dimension(index.data.header.dimension as usize, query.len())?;
            Ok(index.search(query, k, filter))
        })
    }

    fn index_size_bytes(&self, address: NativeAddress) -> Result<usize, NativeError> {
        guarded("index_size_bytes", || {
            self.allocations
                .lock()
                .get(&address)
                .map(Allocation::size_bytes)
                .ok_or(NativeError::InvalidAddress(address))
        })
    }

    fn free(&self, address: NativeAddress) -> Result<(), NativeError> {
        guarded("free", || {
            self.allocations
                .lock()
                .remove(&address)
                .map(|_| ())
                .ok_or(NativeError::InvalidAddress(address))
        })
    }
}
