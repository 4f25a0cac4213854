//! Graph files on disk
//!
//! Each segment's graph lives at `<root>/<index>/<segment>.knn`, in the
//! native index format. Files are written to a temp path and renamed into
//! place, then memory-mapped when loaded into native memory.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;
use tracing::{debug, info};

use knn_native::{BuildParams, NativeLibrary};

use crate::cache::{CacheKey, GraphLoader};
use crate::error::{KnnError, Result};
use crate::handle::NativeHandle;

pub const GRAPH_EXTENSION: &str = "knn";

/// Which graphs an index has.
pub trait GraphCatalog: Send + Sync {
    /// Keys of every graph of `index`, sorted by segment.
    fn graphs_for_index(&self, index: &str) -> Result<Vec<CacheKey>>;
}

pub struct DirectoryCatalog {
    root: PathBuf,
    library: Arc<dyn NativeLibrary>,
}

impl DirectoryCatalog {
    pub fn new(root: impl Into<PathBuf>, library: Arc<dyn NativeLibrary>) -> Self {
        Self {
            root: root.into(),
            library,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn graph_path(&self, key: &CacheKey) -> Result<PathBuf> {
        check_name(&key.index)?;
        check_name(&key.segment)?;
        Ok(self
            .root
            .join(&key.index)
            .join(format!("{}.{GRAPH_EXTENSION}", key.segment)))
    }

    /// Atomically writes serialized graph bytes for `key`.
    pub fn write_graph(&self, key: &CacheKey, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.graph_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension(format!("{GRAPH_EXTENSION}.tmp"));
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;
        debug!(key = %key, bytes = bytes.len(), "wrote graph file");
        Ok(path)
    }

    /// Builds a graph over `vectors` in native memory and writes it for `key`.
    ///
    /// `template` is the trained blob of an IVF model, when `params` asks for
    /// one.
    pub fn build_graph(
        &self,
        key: &CacheKey,
        params: &BuildParams,
        ids: &[u32],
        vectors: &[Vec<f32>],
        template: Option<&[u8]>,
    ) -> Result<PathBuf> {
        if ids.len() != vectors.len() {
            return Err(KnnError::InvalidArgument(format!(
                "{} ids for {} vectors",
                ids.len(),
                vectors.len()
            )));
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != params.dimension) {
            return Err(KnnError::DimensionMismatch {
                expected: params.dimension,
                actual: bad.len(),
            });
        }

        let address = self.library.store_vector_data(None, vectors)?;
        let staged = NativeHandle::new(
            Arc::clone(&self.library),
            address,
            vectors.len() * params.dimension * std::mem::size_of::<f32>(),
        );
        let bytes = self
            .library
            .build_index(params, ids, staged.address(), template)?;
        drop(staged);

        let path = self.write_graph(key, &bytes)?;
        info!(key = %key, vectors = ids.len(), method = ?params.method, "built graph");
        Ok(path)
    }
}

impl GraphCatalog for DirectoryCatalog {
    fn graphs_for_index(&self, index: &str) -> Result<Vec<CacheKey>> {
        check_name(index)?;
        let dir = self.root.join(index);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(GRAPH_EXTENSION) {
                continue;
            }
            if let Some(segment) = path.file_stem().and_then(|s| s.to_str()) {
                keys.push(CacheKey::new(index, segment));
            }
        }
        keys.sort_by(|a, b| a.segment.cmp(&b.segment));
        Ok(keys)
    }
}

impl GraphLoader for DirectoryCatalog {
    fn estimated_size(&self, key: &CacheKey) -> Result<u64> {
        let path = self.graph_path(key)?;
        Ok(fs::metadata(&path)
            .map_err(|e| KnnError::Io(format!("{}: {e}", path.display())))?
            .len())
    }

    fn load(&self, key: &CacheKey) -> Result<NativeHandle> {
        let path = self.graph_path(key)?;
        let file = File::open(&path).map_err(|e| KnnError::Io(format!("{}: {e}", path.display())))?;
        // SAFETY: graph files are only replaced by rename, never written in place.
        let mmap = unsafe { Mmap::map(&file)? };
        let address = self.library.load_index(&mmap)?;
        // Owned from here on so every early return frees it.
        let loaded = NativeHandle::new(Arc::clone(&self.library), address, mmap.len());
        let size = self.library.index_size_bytes(address)?;
        Ok(loaded.with_size(size))
    }
}

fn check_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(KnnError::InvalidArgument(format!(
            "invalid index or segment name {name:?}"
        )))
    }
}
