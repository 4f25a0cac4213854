//! Reservoir sampling over vector positions.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Picks `min(sample_size, total)` distinct positions from `0..total`,
/// uniformly at random, returned in ascending order.
///
/// Uses Algorithm R with a seeded `StdRng`, so the same `(total, sample_size,
/// seed)` always yields the same sample. When the population fits in the
/// reservoir every position is returned.
pub fn reservoir_sample(total: usize, sample_size: usize, seed: u64) -> Vec<usize> {
    if total <= sample_size {
        return (0..total).collect();
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut reservoir: Vec<usize> = (0..sample_size).collect();
    for i in sample_size..total {
        let j = rng.gen_range(0..=i);
        if j < sample_size {
            reservoir[j] = i;
        }
    }
    reservoir.sort_unstable();
    reservoir
}
