//! Segment search: exact scoring through the candidate iterator, and
//! approximate search through pinned native graphs.

use knn_core::{CandidateIterator, DocBitSet, IteratorRequest};

use crate::cache::PinnedGraph;
use crate::collector::TopKCollector;
use crate::error::Result;

/// Top `k` `(doc, score)` pairs over the request's candidates, best first.
pub fn exact_search(request: IteratorRequest<'_>, k: usize) -> Result<Vec<(u32, f32)>> {
    let mut collector = TopKCollector::new(k);
    collector.extend(CandidateIterator::new(request)?);
    Ok(collector.into_sorted())
}

/// A parent document ranked by its best child.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NestedHit {
    pub parent: u32,
    pub child: u32,
    pub score: f32,
}

/// Like [`exact_search`] for nested fields: one hit per parent.
///
/// `request.parents` must be set.
pub fn exact_search_nested(request: IteratorRequest<'_>, k: usize) -> Result<Vec<NestedHit>> {
    let mut iter = CandidateIterator::new(request)?;
    let mut collector = TopKCollector::new(k);
    let mut best_child = std::collections::HashMap::new();
    while let Some((parent, score)) = iter.next() {
        if let Some(child) = iter.best_child() {
            best_child.insert(parent, child);
        }
        collector.collect(parent, score);
    }
    Ok(collector
        .into_sorted()
        .into_iter()
        .map(|(parent, score)| NestedHit {
            parent,
            child: best_child.get(&parent).copied().unwrap_or(parent),
            score,
        })
        .collect())
}

/// Queries graphs one after another and merges their hits into one top `k`.
///
/// Each graph is unpinned before the next one is pulled from `graphs`, so a
/// lazy iterator of cache loads never holds more than one segment resident.
pub fn ann_search<I>(
    graphs: I,
    query: &[f32],
    k: usize,
    filter: Option<&DocBitSet>,
) -> Result<Vec<(u32, f32)>>
where
    I: IntoIterator<Item = Result<PinnedGraph>>,
{
    let mut collector = TopKCollector::new(k);
    for graph in graphs {
        let graph = graph?;
        collector.extend(graph.query(query, k, filter)?);
    }
    Ok(collector.into_sorted())
}
