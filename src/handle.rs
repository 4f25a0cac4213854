use std::fmt;
use std::sync::Arc;

use knn_native::{NativeAddress, NativeLibrary};
use tracing::warn;

/// Owns one native allocation and frees it exactly once, on drop.
pub struct NativeHandle {
    library: Arc<dyn NativeLibrary>,
    address: NativeAddress,
    size_bytes: usize,
}

impl NativeHandle {
    pub fn new(library: Arc<dyn NativeLibrary>, address: NativeAddress, size_bytes: usize) -> Self {
        Self {
            library,
            address,
            size_bytes,
        }
    }

    pub fn address(&self) -> NativeAddress {
        self.address
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn library(&self) -> &Arc<dyn NativeLibrary> {
        &self.library
    }

    /// Replaces the size estimate once the library reports the real one.
    pub fn with_size(mut self, size_bytes: usize) -> Self {
        self.size_bytes = size_bytes;
        self
    }
}

impl fmt::Debug for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeHandle")
            .field("address", &self.address)
            .field("size_bytes", &self.size_bytes)
            .finish()
    }
}

impl Drop for NativeHandle {
    fn drop(&mut self) {
        if let Err(err) = self.library.free(self.address) {
            warn!(address = %self.address, "failed to free native memory: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use knn_native::ArenaLibrary;

    #[test]
    fn drop_frees_once() {
        let arena = Arc::new(ArenaLibrary::new());
        let library: Arc<dyn NativeLibrary> = arena.clone();
        let address = library.store_vector_data(None, &[vec![1.0, 2.0]]).unwrap();
        let handle = NativeHandle::new(library, address, 8);
        assert_eq!(arena.allocation_count(), 1);
        drop(handle);
        assert_eq!(arena.allocation_count(), 0);
    }
}
