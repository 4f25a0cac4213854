//! Distance kernels
//!
//! Explicit SIMD for the two hot float kernels (inner product and squared L2)
//! on aarch64 (NEON) and x86_64 (AVX2+FMA, detected at runtime). Everything
//! else is a plain iterator loop that LLVM vectorizes on its own.
//!
//! | Kernel              | Inputs            | NEON | AVX2 | Scalar |
//! |---------------------|-------------------|------|------|--------|
//! | `dot_product`       | `f32`             | yes  | yes  | yes    |
//! | `l2_distance_squared` | `f32`           | yes  | yes  | yes    |
//! | `l1_distance`, `linf_distance` | `f32`  |      |      | yes    |
//! | `*_i8`              | signed bytes      |      |      | yes    |
//! | `hamming_distance`  | packed bits       |      |      | popcnt |
//!
//! All functions require equal-length inputs; this is checked in debug builds
//! only. Callers validate dimensions once per query, not per vector.

// ============================================================================
// aarch64 NEON
// ============================================================================

#[cfg(target_arch = "aarch64")]
#[inline(always)]
unsafe fn dot_product_neon(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::aarch64::*;

    let chunks = a.len() / 4;
    let mut acc = vdupq_n_f32(0.0);
    for i in 0..chunks {
        let va = vld1q_f32(a.as_ptr().add(i * 4));
        let vb = vld1q_f32(b.as_ptr().add(i * 4));
        acc = vfmaq_f32(acc, va, vb);
    }

    let mut sum = vaddvq_f32(acc);
    for i in chunks * 4..a.len() {
        sum += a[i] * b[i];
    }
    sum
}

#[cfg(target_arch = "aarch64")]
#[inline(always)]
unsafe fn l2_distance_squared_neon(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::aarch64::*;

    let chunks = a.len() / 4;
    let mut acc = vdupq_n_f32(0.0);
    for i in 0..chunks {
        let va = vld1q_f32(a.as_ptr().add(i * 4));
        let vb = vld1q_f32(b.as_ptr().add(i * 4));
        let diff = vsubq_f32(va, vb);
        acc = vfmaq_f32(acc, diff, diff);
    }

    let mut sum = vaddvq_f32(acc);
    for i in chunks * 4..a.len() {
        let d = a[i] - b[i];
        sum += d * d;
    }
    sum
}

// ============================================================================
// x86_64 AVX2 (runtime feature detection)
// ============================================================================

/// Horizontal sum of the eight lanes of a 256-bit register.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
#[inline]
unsafe fn hsum256(acc: std::arch::x86_64::__m256) -> f32 {
    use std::arch::x86_64::*;

    let hi = _mm256_extractf128_ps(acc, 1);
    let lo = _mm256_castps256_ps128(acc);
    let sum128 = _mm_add_ps(lo, hi);
    let shuf = _mm_movehdup_ps(sum128);
    let sums = _mm_add_ps(sum128, shuf);
    let shuf2 = _mm_movehl_ps(sums, sums);
    _mm_cvtss_f32(_mm_add_ss(sums, shuf2))
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
#[inline]
unsafe fn dot_product_avx2(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::x86_64::*;

    let chunks = a.len() / 8;
    let mut acc = _mm256_setzero_ps();
    for i in 0..chunks {
        let va = _mm256_loadu_ps(a.as_ptr().add(i * 8));
        let vb = _mm256_loadu_ps(b.as_ptr().add(i * 8));
        acc = _mm256_fmadd_ps(va, vb, acc);
    }

    let mut sum = hsum256(acc);
    for i in chunks * 8..a.len() {
        sum += a[i] * b[i];
    }
    sum
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
#[inline]
unsafe fn l2_distance_squared_avx2(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::x86_64::*;

    let chunks = a.len() / 8;
    let mut acc = _mm256_setzero_ps();
    for i in 0..chunks {
        let va = _mm256_loadu_ps(a.as_ptr().add(i * 8));
        let vb = _mm256_loadu_ps(b.as_ptr().add(i * 8));
        let diff = _mm256_sub_ps(va, vb);
        acc = _mm256_fmadd_ps(diff, diff, acc);
    }

    let mut sum = hsum256(acc);
    for i in chunks * 8..a.len() {
        let d = a[i] - b[i];
        sum += d * d;
    }
    sum
}

// ============================================================================
// Scalar fallbacks
// ============================================================================

#[inline(always)]
fn dot_product_scalar(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[inline(always)]
fn l2_distance_squared_scalar(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

// ============================================================================
// Float kernels
// ============================================================================

/// Inner product of two float vectors.
#[inline(always)]
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vector length mismatch");

    #[cfg(target_arch = "aarch64")]
    {
        return unsafe { dot_product_neon(a, b) };
    }

    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
            return unsafe { dot_product_avx2(a, b) };
        }
    }

    #[allow(unreachable_code)]
    dot_product_scalar(a, b)
}

/// Squared Euclidean distance, `||a - b||²`.
#[inline(always)]
pub fn l2_distance_squared(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vector length mismatch");

    #[cfg(target_arch = "aarch64")]
    {
        return unsafe { l2_distance_squared_neon(a, b) };
    }

    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
            return unsafe { l2_distance_squared_avx2(a, b) };
        }
    }

    #[allow(unreachable_code)]
    l2_distance_squared_scalar(a, b)
}

/// Manhattan distance, `Σ|aᵢ - bᵢ|`.
#[inline]
pub fn l1_distance(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vector length mismatch");
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum()
}

/// Chebyshev distance, `max |aᵢ - bᵢ|`.
#[inline]
pub fn linf_distance(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vector length mismatch");
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).abs())
        .fold(0.0f32, f32::max)
}

/// Cosine similarity in `[-1, 1]`. Returns 0 when either vector has zero norm.
#[inline]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot = dot_product(a, b);
    let norms = dot_product(a, a) * dot_product(b, b);
    if norms <= f32::EPSILON {
        return 0.0;
    }
    dot / norms.sqrt()
}

/// Returns a unit-length copy of `v` (zero vectors are returned unchanged).
pub fn l2_normalized(v: &[f32]) -> Vec<f32> {
    let norm = dot_product(v, v).sqrt();
    if norm > f32::EPSILON {
        v.iter().map(|x| x / norm).collect()
    } else {
        v.to_vec()
    }
}

// ============================================================================
// Signed byte kernels (i32 accumulation, no overflow below 2^16 dimensions)
// ============================================================================

#[inline]
pub fn dot_product_i8(a: &[i8], b: &[i8]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vector length mismatch");
    a.iter()
        .zip(b)
        .map(|(&x, &y)| x as i32 * y as i32)
        .sum::<i32>() as f32
}

#[inline]
pub fn l2_distance_squared_i8(a: &[i8], b: &[i8]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vector length mismatch");
    a.iter()
        .zip(b)
        .map(|(&x, &y)| {
            let d = x as i32 - y as i32;
            d * d
        })
        .sum::<i32>() as f32
}

#[inline]
pub fn l1_distance_i8(a: &[i8], b: &[i8]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vector length mismatch");
    a.iter()
        .zip(b)
        .map(|(&x, &y)| (x as i32 - y as i32).abs())
        .sum::<i32>() as f32
}

#[inline]
pub fn linf_distance_i8(a: &[i8], b: &[i8]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vector length mismatch");
    a.iter()
        .zip(b)
        .map(|(&x, &y)| (x as i32 - y as i32).abs())
        .max()
        .unwrap_or(0) as f32
}

#[inline]
pub fn cosine_similarity_i8(a: &[i8], b: &[i8]) -> f32 {
    let dot = dot_product_i8(a, b);
    let norms = dot_product_i8(a, a) * dot_product_i8(b, b);
    if norms <= 0.0 {
        return 0.0;
    }
    dot / norms.sqrt()
}

// ============================================================================
// Packed bits
// ============================================================================

/// Number of differing bits between two packed bit vectors.
///
/// Works a word at a time so the popcount instruction does the heavy lifting.
#[inline]
pub fn hamming_distance(a: &[u8], b: &[u8]) -> u32 {
    debug_assert_eq!(a.len(), b.len(), "Vector length mismatch");

    let words = a.len() / 8;
    let mut bits = 0u32;
    for i in 0..words {
        let wa = u64::from_le_bytes(word(a, i));
        let wb = u64::from_le_bytes(word(b, i));
        bits += (wa ^ wb).count_ones();
    }
    for i in words * 8..a.len() {
        bits += (a[i] ^ b[i]).count_ones();
    }
    bits
}

#[inline(always)]
fn word(bytes: &[u8], index: usize) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&bytes[index * 8..index * 8 + 8]);
    out
}
