use std::cmp::Ordering;
use std::collections::BinaryHeap;

#[derive(Clone, Copy)]
struct MinScore {
    doc: u32,
    score: f32,
}

impl PartialEq for MinScore {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MinScore {}

impl PartialOrd for MinScore {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MinScore {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the heap top is the worst kept hit; ties keep lower ids.
        other
            .score
            .total_cmp(&self.score)
            .then(self.doc.cmp(&other.doc))
    }
}

/// Keeps the `k` highest-scoring documents seen.
pub struct TopKCollector {
    k: usize,
    heap: BinaryHeap<MinScore>,
}

impl TopKCollector {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            heap: BinaryHeap::with_capacity(k + 1),
        }
    }

    pub fn collect(&mut self, doc: u32, score: f32) {
        if self.k == 0 || score.is_nan() {
            return;
        }
        let candidate = MinScore { doc, score };
        if self.heap.len() < self.k {
            self.heap.push(candidate);
        } else if let Some(worst) = self.heap.peek() {
            if candidate < *worst {
                self.heap.pop();
                self.heap.push(candidate);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Lowest score still kept, once `k` hits have been collected.
    pub fn threshold(&self) -> Option<f32> {
        (self.heap.len() == self.k)
            .then(|| self.heap.peek().map(|m| m.score))
            .flatten()
    }

    /// Hits best first.
    pub fn into_sorted(self) -> Vec<(u32, f32)> {
        self.heap
            .into_sorted_vec()
            .into_iter()
            .map(|m| (m.doc, m.score))
            .collect()
    }
}

impl Extend<(u32, f32)> for TopKCollector {
    fn extend<I: IntoIterator<Item = (u32, f32)>>(&mut self, iter: I) {
        for (doc, score) in iter {
            self.collect(doc, score);
        }
    }
}
