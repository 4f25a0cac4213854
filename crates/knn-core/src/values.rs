//! Per-document vector storage read by the candidate iterators.

/// Random access to the vector of a document, if it has one.
pub trait VectorValues<T> {
    fn dimension(&self) -> usize;

    /// Coordinates for `doc`, or `None` when the document has no vector.
    ///
    /// For bit-packed vectors the slice holds `dimension / 8` bytes.
    fn vector(&self, doc: u32) -> Option<&[T]>;
}

/// Vectors packed contiguously, addressed by document id.
#[derive(Debug, Clone)]
pub struct DenseVectors<T> {
    width: usize,
    dimension: usize,
    data: Vec<T>,
    // Slot of each doc in `data`, u32::MAX when absent.
    slots: Vec<u32>,
}

const ABSENT: u32 = u32::MAX;

impl<T: Copy> DenseVectors<T> {
    /// `width` is the number of `T` elements per vector. It equals the
    /// dimension except for bit-packed vectors.
    pub fn new(dimension: usize, width: usize) -> Self {
        Self {
            width,
            dimension,
            data: Vec::new(),
            slots: Vec::new(),
        }
    }

    /// Stores `vector` for `doc`, replacing any previous one.
    ///
    /// # Panics
    /// If `vector.len()` differs from the configured width.
    pub fn insert(&mut self, doc: u32, vector: &[T]) {
        assert_eq!(vector.len(), self.width, "vector width mismatch");
        let doc = doc as usize;
        if doc >= self.slots.len() {
            self.slots.resize(doc + 1, ABSENT);
        }
        match self.slots[doc] {
            ABSENT => {
                self.slots[doc] = (self.data.len() / self.width.max(1)) as u32;
                self.data.extend_from_slice(vector);
            }
            slot => {
                let start = slot as usize * self.width;
                self.data[start..start + self.width].copy_from_slice(vector);
            }
        }
    }

    /// Number of documents with a vector.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|&&s| s != ABSENT).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Exclusive upper bound on document ids stored so far.
    pub fn max_doc(&self) -> u32 {
        self.slots.len() as u32
    }
}

impl DenseVectors<f32> {
    pub fn floats(dimension: usize) -> Self {
        Self::new(dimension, dimension)
    }
}

impl DenseVectors<i8> {
    pub fn bytes(dimension: usize) -> Self {
        Self::new(dimension, dimension)
    }
}

impl DenseVectors<u8> {
    pub fn binary(dimension: usize) -> Self {
        Self::new(dimension, dimension.div_ceil(8))
    }
}

impl<T: Copy> VectorValues<T> for DenseVectors<T> {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn vector(&self, doc: u32) -> Option<&[T]> {
        match self.slots.get(doc as usize).copied() {
            None | Some(ABSENT) => None,
            Some(slot) => {
                let start = slot as usize * self.width;
                Some(&self.data[start..start + self.width])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_docs_have_no_vector() {
        let mut values = DenseVectors::floats(2);
        values.insert(3, &[1.0, 2.0]);
        assert_eq!(values.vector(3), Some(&[1.0, 2.0][..]));
        assert_eq!(values.vector(0), None);
        assert_eq!(values.vector(99), None);
        assert_eq!(values.len(), 1);
        assert_eq!(values.max_doc(), 4);
    }

    #[test]
    fn insert_replaces_in_place() {
        let mut values = DenseVectors::bytes(2);
        values.insert(0, &[1, 2]);
        values.insert(1, &[3, 4]);
        values.insert(0, &[5, 6]);
        assert_eq!(values.vector(0), Some(&[5i8, 6][..]));
        assert_eq!(values.vector(1), Some(&[3i8, 4][..]));
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn binary_width_is_packed() {
        let mut values = DenseVectors::binary(12);
        values.insert(0, &[0xFF, 0x0F]);
        assert_eq!(values.dimension(), 12);
        assert_eq!(values.vector(0).map(|v| v.len()), Some(2));
    }
}
