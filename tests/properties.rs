use std::collections::BTreeMap;
use std::sync::Arc;

use proptest::prelude::*;

use knn_core::{
    ByteScalarQuantizer, CandidateIterator, DenseVectors, DocBitSet, IteratorRequest, QueryVector,
    Quantizer, SpaceType, VectorSource,
};
use knn_engine::{
    exact_search_nested, CacheKey, GraphLoader, NativeHandle, NativeMemoryBudget,
    NativeMemoryCache, PinnedGraph, Result,
};
use knn_native::{ArenaLibrary, NativeLibrary};

const CAPACITY: u64 = 1_000;

/// Every key has a fixed size derived from its segment number.
struct SizedByKey {
    arena: Arc<ArenaLibrary>,
}

fn size_of_segment(segment: u8) -> u64 {
    50 + (segment as u64 % 7) * 75
}

impl GraphLoader for SizedByKey {
    fn estimated_size(&self, key: &CacheKey) -> Result<u64> {
        let segment: u8 = key.segment.parse().unwrap_or(0);
        Ok(size_of_segment(segment))
    }

    fn load(&self, key: &CacheKey) -> Result<NativeHandle> {
        let library: Arc<dyn NativeLibrary> = self.arena.clone();
        let address = library.store_vector_data(None, &[vec![0.0]])?;
        Ok(NativeHandle::new(
            library,
            address,
            self.estimated_size(key)? as usize,
        ))
    }
}

#[derive(Debug, Clone)]
enum CacheOp {
    /// Load and keep the pin.
    Pin(u8),
    /// Load and release at once.
    Touch(u8),
    /// Release the oldest held pin.
    Unpin,
    Evict(u8),
}

fn cache_op() -> impl Strategy<Value = CacheOp> {
    prop_oneof![
        (0..12u8).prop_map(CacheOp::Pin),
        (0..12u8).prop_map(CacheOp::Touch),
        Just(CacheOp::Unpin),
        (0..12u8).prop_map(CacheOp::Evict),
    ]
}

/// Children are docs with a vector; parents are docs without one that
/// follow their children.
fn nested_segment() -> impl Strategy<Value = (Vec<(u32, f32)>, Vec<u32>, f32)> {
    (
        proptest::collection::vec((1..4usize, proptest::collection::vec(-10.0..10.0f32, 3)), 1..12),
        -10.0..10.0f32,
    )
        .prop_map(|(blocks, query)| {
            let mut children = Vec::new();
            let mut parents = Vec::new();
            let mut doc = 0u32;
            for (n_children, values) in blocks {
                for value in values.into_iter().take(n_children) {
                    children.push((doc, value));
                    doc += 1;
                }
                parents.push(doc);
                doc += 1;
            }
            (children, parents, query)
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Committed bytes never exceed capacity, and everything is released at the end.
    #[test]
    fn prop_cache_respects_capacity(ops in proptest::collection::vec(cache_op(), 1..60)) {
        let arena = Arc::new(ArenaLibrary::new());
        let cache = NativeMemoryCache::new(NativeMemoryBudget::new(CAPACITY));
        let loader = SizedByKey { arena: arena.clone() };
        let mut held: Vec<PinnedGraph> = Vec::new();

        for op in ops {
            match op {
                CacheOp::Pin(s) => {
                    if let Ok(pin) = cache.get_or_load(&CacheKey::new("idx", s.to_string()), &loader) {
                        held.push(pin);
                    }
                }
                CacheOp::Touch(s) => {
                    let _ = cache.get_or_load(&CacheKey::new("idx", s.to_string()), &loader);
                }
                CacheOp::Unpin => {
                    if !held.is_empty() {
                        held.remove(0);
                    }
                }
                CacheOp::Evict(s) => {
                    cache.evict(&CacheKey::new("idx", s.to_string()));
                }
            }
            let stats = cache.stats();
            prop_assert!(stats.committed_bytes <= CAPACITY);
            // Pinned graphs are never freed underneath their holders.
            for pin in &held {
                prop_assert!(arena.index_size_bytes(pin.address()).is_ok());
            }
        }

        drop(held);
        cache.clear(&["idx"]);
        prop_assert_eq!(cache.budget().committed(), 0);
        prop_assert_eq!(arena.allocation_count(), 0);
    }

    /// Vectors inside the trained range decode to within half a step.
    #[test]
    fn prop_sq8_round_trip_error_is_bounded(
        vectors in proptest::collection::vec(proptest::collection::vec(-100.0..100.0f32, 4), 2..40)
    ) {
        let quantizer = ByteScalarQuantizer::default();
        let state = quantizer.train(&vectors).unwrap();
        let knn_core::QuantizationParams::ByteScalar { diff, .. } = state.params().clone() else {
            panic!("expected byte scalar params");
        };

        for v in &vectors {
            let codes = quantizer.encode(v, &state).unwrap();
            let decoded = quantizer.decode(&codes, &state).unwrap();
            for d in 0..4 {
                let bound = diff[d] / 255.0 / 2.0 + diff[d].abs() * 1e-5 + 1e-4;
                prop_assert!(
                    (decoded[d] - v[d]).abs() <= bound,
                    "dim {} value {} decoded {} bound {}", d, v[d], decoded[d], bound
                );
            }
        }
    }

    /// Nested iteration equals grouping children by parent and taking the max.
    #[test]
    fn prop_nested_matches_reference((children, parent_ids, query) in nested_segment()) {
        let mut values = DenseVectors::floats(1);
        for &(doc, value) in &children {
            values.insert(doc, &[value]);
        }
        let candidates = DocBitSet::from_ids(children.iter().map(|&(doc, _)| doc));
        let parents = DocBitSet::from_ids(parent_ids.iter().copied());
        let q = [query];
        let request = || IteratorRequest {
            candidates: &candidates,
            values: VectorSource::Float(&values),
            query: QueryVector::Float(&q),
            space: SpaceType::InnerProduct,
            quantization: None,
            parents: Some(&parents),
        };

        let mut reference: BTreeMap<u32, f32> = BTreeMap::new();
        for &(doc, value) in &children {
            let parent = *parent_ids.iter().find(|&&p| p > doc).unwrap();
            let score = SpaceType::InnerProduct.score_f32(&[value], &q);
            let best = reference.entry(parent).or_insert(f32::NEG_INFINITY);
            *best = best.max(score);
        }

        let emitted: Vec<(u32, f32)> = CandidateIterator::new(request()).unwrap().collect();
        prop_assert_eq!(emitted.len(), reference.len());
        for ((parent, score), (ref_parent, ref_score)) in emitted.iter().zip(&reference) {
            prop_assert_eq!(parent, ref_parent);
            prop_assert!((score - ref_score).abs() <= 1e-5);
        }

        let hits = exact_search_nested(request(), reference.len()).unwrap();
        prop_assert_eq!(hits.len(), reference.len());
        for hit in &hits {
            let child_value = children.iter().find(|(doc, _)| *doc == hit.child).unwrap().1;
            let child_score = SpaceType::InnerProduct.score_f32(&[child_value], &q);
            prop_assert!((child_score - hit.score).abs() <= 1e-5);
            prop_assert!(hit.child < hit.parent);
        }
    }
}
