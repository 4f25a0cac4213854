//! IVF partition training
//!
//! Lloyd's k-means with k-means++ seeding over row-major float data. The
//! trained centroids become the template that `build_index` assigns vectors
//! against, and `query_index` probes the `nprobe` closest partitions.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use knn_core::simd;

/// Max centroid movement (not squared) treated as converged.
const TOLERANCE: f32 = 1e-4;

/// Trains `k` centroids over `data` (`n * dim` floats).
///
/// `k` is capped at the number of rows. Deterministic for a given `seed`.
pub fn train_centroids(
    data: &[f32],
    dim: usize,
    k: usize,
    max_iters: usize,
    seed: u64,
) -> Vec<f32> {
    let n = if dim == 0 { 0 } else { data.len() / dim };
    let k = k.min(n);
    if k == 0 {
        return Vec::new();
    }
    let row = |i: usize| &data[i * dim..(i + 1) * dim];

    let mut rng = StdRng::seed_from_u64(seed);
    let mut centroids = kmeans_plus_plus_init(data, dim, k, &mut rng);
    let mut new_centroids = vec![0.0f32; k * dim];
    let mut counts = vec![0usize; k];

    for iter in 0..max_iters {
        new_centroids.fill(0.0);
        counts.fill(0);

        for i in 0..n {
            let c = nearest_centroid(row(i), &centroids, dim);
            counts[c] += 1;
            for (acc, &v) in new_centroids[c * dim..(c + 1) * dim].iter_mut().zip(row(i)) {
                *acc += v;
            }
        }

        for c in 0..k {
            let slot = &mut new_centroids[c * dim..(c + 1) * dim];
            if counts[c] > 0 {
                let count = counts[c] as f32;
                slot.iter_mut().for_each(|v| *v /= count);
            } else {
                // Dead centroid: reseed from a random row
                slot.copy_from_slice(row(rng.gen_range(0..n)));
            }
        }

        let max_movement = (0..k)
            .map(|c| {
                simd::l2_distance_squared(
                    &centroids[c * dim..(c + 1) * dim],
                    &new_centroids[c * dim..(c + 1) * dim],
                )
            })
            .fold(0.0f32, f32::max);

        std::mem::swap(&mut centroids, &mut new_centroids);

        if max_movement < TOLERANCE * TOLERANCE {
            tracing::debug!(iterations = iter + 1, k, "k-means converged");
            break;
        }
    }

    centroids
}

fn kmeans_plus_plus_init(data: &[f32], dim: usize, k: usize, rng: &mut StdRng) -> Vec<f32> {
    let n = data.len() / dim;
    let row = |i: usize| &data[i * dim..(i + 1) * dim];
    let mut centroids = vec![0.0f32; k * dim];

    centroids[0..dim].copy_from_slice(row(rng.gen_range(0..n)));

    // Distance from each row to its nearest chosen centroid
    let mut min_dists = vec![f32::MAX; n];

    for c in 1..k {
        let last = &centroids[(c - 1) * dim..c * dim];
        for (i, min) in min_dists.iter_mut().enumerate() {
            *min = min.min(simd::l2_distance_squared(row(i), last));
        }

        let total: f64 = min_dists.iter().map(|&d| d as f64).sum();
        let chosen = if total <= 0.0 {
            rng.gen_range(0..n)
        } else {
            let threshold = rng.gen::<f64>() * total;
            let mut cumulative = 0.0f64;
            min_dists
                .iter()
                .position(|&d| {
                    cumulative += d as f64;
                    cumulative >= threshold
                })
                .unwrap_or(n - 1)
        };

        centroids[c * dim..(c + 1) * dim].copy_from_slice(row(chosen));
    }

    centroids
}

/// Index of the centroid closest to `v` by squared L2.
pub fn nearest_centroid(v: &[f32], centroids: &[f32], dim: usize) -> usize {
    centroids
        .chunks_exact(dim)
        .enumerate()
        .map(|(c, centroid)| (c, simd::l2_distance_squared(v, centroid)))
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(c, _)| c)
        .unwrap_or(0)
}

/// The `nprobe` centroids closest to `query`, nearest first.
pub fn probe_order(query: &[f32], centroids: &[f32], dim: usize, nprobe: usize) -> Vec<usize> {
    let mut dists: Vec<(usize, f32)> = centroids
        .chunks_exact(dim)
        .enumerate()
        .map(|(c, centroid)| (c, simd::l2_distance_squared(query, centroid)))
        .collect();
    dists.sort_by(|a, b| a.1.total_cmp(&b.1));
    dists.into_iter().take(nprobe).map(|(c, _)| c).collect()
}
