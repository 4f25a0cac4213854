//! Dense document-id bit sets.
//!
//! Used both for candidate sets (ids that survived the non-vector filter) and
//! for parent bit sets in nested documents, where the parent of a child is the
//! first set bit at or after the child's id.

const WORD_BITS: usize = 64;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocBitSet {
    words: Vec<u64>,
    len: usize,
    cardinality: usize,
}

impl DocBitSet {
    /// An empty set able to hold ids in `0..len`.
    pub fn with_len(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(WORD_BITS)],
            len,
            cardinality: 0,
        }
    }

    /// Builds a set sized to the largest id. Duplicates are ignored.
    pub fn from_ids<I>(ids: I) -> Self
    where
        I: IntoIterator<Item = u32>,
    {
        let ids: Vec<u32> = ids.into_iter().collect();
        let len = ids.iter().max().map(|&m| m as usize + 1).unwrap_or(0);
        let mut set = Self::with_len(len);
        for id in ids {
            set.insert(id);
        }
        set
    }

    /// All ids in `0..len`.
    pub fn full(len: usize) -> Self {
        let mut set = Self::with_len(len);
        for id in 0..len as u32 {
            set.insert(id);
        }
        set
    }

    /// Exclusive upper bound on ids this set can hold.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.cardinality == 0
    }

    /// Number of set bits.
    pub fn cardinality(&self) -> usize {
        self.cardinality
    }

    /// Sets `id`, growing the set if needed. Returns true if it was newly set.
    pub fn insert(&mut self, id: u32) -> bool {
        let id = id as usize;
        if id >= self.len {
            self.len = id + 1;
            self.words.resize(self.len.div_ceil(WORD_BITS), 0);
        }
        let word = id / WORD_BITS;
        let mask = 1u64 << (id % WORD_BITS);
        if self.words[word] & mask != 0 {
            return false;
        }
        self.words[word] |= mask;
        self.cardinality += 1;
        true
    }

    pub fn contains(&self, id: u32) -> bool {
        let id = id as usize;
        if id >= self.len {
            return false;
        }
        self.words[id / WORD_BITS] & (1u64 << (id % WORD_BITS)) != 0
    }

    /// The smallest set id `>= from`, if any.
    pub fn next_set_bit(&self, from: u32) -> Option<u32> {
        let from = from as usize;
        if from >= self.len {
            return None;
        }
        let mut word_idx = from / WORD_BITS;
        let mut w = self.words[word_idx] & (!0u64 << (from % WORD_BITS));
        loop {
            if w != 0 {
                let id = word_idx * WORD_BITS + w.trailing_zeros() as usize;
                return (id < self.len).then_some(id as u32);
            }
            word_idx += 1;
            if word_idx >= self.words.len() {
                return None;
            }
            w = self.words[word_idx];
        }
    }

    /// Set ids in ascending order.
    pub fn iter(&self) -> Ones<'_> {
        Ones {
            words: &self.words,
            word_idx: 0,
            current: self.words.first().copied().unwrap_or(0),
        }
    }

    pub fn intersect(&self, other: &DocBitSet) -> DocBitSet {
        let len = self.len.min(other.len);
        let mut words: Vec<u64> = self
            .words
            .iter()
            .zip(&other.words)
            .map(|(a, b)| a & b)
            .collect();
        words.truncate(len.div_ceil(WORD_BITS));
        let cardinality = words.iter().map(|w| w.count_ones() as usize).sum();
        DocBitSet {
            words,
            len,
            cardinality,
        }
    }
}

impl FromIterator<u32> for DocBitSet {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        Self::from_ids(iter)
    }
}

/// Iterator over set bits, lowest first.
pub struct Ones<'a> {
    words: &'a [u64],
    word_idx: usize,
    current: u64,
}

impl Iterator for Ones<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        loop {
            if self.current != 0 {
                let tz = self.current.trailing_zeros() as usize;
                self.current &= self.current - 1;
                return Some((self.word_idx * WORD_BITS + tz) as u32);
            }
            self.word_idx += 1;
            if self.word_idx >= self.words.len() {
                return None;
            }
            self.current = self.words[self.word_idx];
        }
    }
}
