//! Signed byte scalar quantization.
//!
//! Training records each dimension's min and range over the sample. Encoding
//! maps `[min, min + diff]` linearly onto `[-128, 127]`, clamping anything
//! outside the trained range.

use tracing::debug;

use super::{
    collect_sample, QuantizationError, QuantizationParams, QuantizationState, Quantizer,
    TrainingSource, DEFAULT_SAMPLE_SIZE,
};

/// Code for a dimension whose trained range is empty.
const FLAT_DIMENSION_CODE: i8 = -128;

#[derive(Debug, Clone)]
pub struct ByteScalarQuantizer {
    pub sample_size: usize,
    pub seed: u64,
}

impl Default for ByteScalarQuantizer {
    fn default() -> Self {
        Self {
            sample_size: DEFAULT_SAMPLE_SIZE,
            seed: 42,
        }
    }
}

impl ByteScalarQuantizer {
    pub fn new(sample_size: usize, seed: u64) -> Self {
        Self { sample_size, seed }
    }

    /// Approximate inverse of [`Quantizer::encode`].
    pub fn decode(
        &self,
        codes: &[i8],
        state: &QuantizationState,
    ) -> Result<Vec<f32>, QuantizationError> {
        state.check_dimension(codes.len())?;
        let (min, diff) = ranges(state)?;
        Ok(codes
            .iter()
            .zip(min.iter().zip(diff))
            .map(|(&c, (&lo, &d))| lo + (c as f32 + 128.0) / 255.0 * d)
            .collect())
    }
}

impl Quantizer for ByteScalarQuantizer {
    type Code = i8;

    fn train(&self, source: &dyn TrainingSource) -> Result<QuantizationState, QuantizationError> {
        let (dimension, sample) = collect_sample(source, self.sample_size, self.seed)?;

        let mut min = vec![f32::INFINITY; dimension];
        let mut max = vec![f32::NEG_INFINITY; dimension];
        for vector in &sample {
            for (d, &v) in vector.iter().enumerate() {
                min[d] = min[d].min(v);
                max[d] = max[d].max(v);
            }
        }
        let diff: Vec<f32> = max.iter().zip(&min).map(|(hi, lo)| hi - lo).collect();

        debug!(
            dimension,
            sampled = sample.len(),
            "trained byte scalar quantizer"
        );
        Ok(QuantizationState::new(
            dimension,
            QuantizationParams::ByteScalar { min, diff },
        ))
    }

    fn encode(
        &self,
        vector: &[f32],
        state: &QuantizationState,
    ) -> Result<Vec<i8>, QuantizationError> {
        encode_with(state, vector)
    }
}

pub(crate) fn encode_with(
    state: &QuantizationState,
    vector: &[f32],
) -> Result<Vec<i8>, QuantizationError> {
    state.check_dimension(vector.len())?;
    let (min, diff) = ranges(state)?;
    Ok(vector
        .iter()
        .zip(min.iter().zip(diff))
        .map(|(&v, (&lo, &d))| quantize_one(v, lo, d))
        .collect())
}

#[inline]
fn quantize_one(value: f32, min: f32, diff: f32) -> i8 {
    if diff <= 0.0 || !diff.is_finite() {
        return FLAT_DIMENSION_CODE;
    }
    let x = ((value - min) / diff).clamp(0.0, 1.0);
    // NaN input falls through clamp; map it to the bottom of the range.
    if x.is_nan() {
        return FLAT_DIMENSION_CODE;
    }
    ((x * 255.0).round() as i32 - 128).clamp(-128, 127) as i8
}

fn ranges(state: &QuantizationState) -> Result<(&[f32], &[f32]), QuantizationError> {
    match state.params() {
        QuantizationParams::ByteScalar { min, diff } => Ok((min, diff)),
        other => Err(QuantizationError::UnsupportedState { kind: other.kind() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trained(vectors: Vec<Vec<f32>>) -> (ByteScalarQuantizer, QuantizationState) {
        let quantizer = ByteScalarQuantizer::new(1000, 1);
        let state = quantizer.train(&vectors).unwrap();
        (quantizer, state)
    }

    #[test]
    fn midpoint_encodes_to_zero() {
        let (q, state) = trained(vec![vec![0.0, 0.0], vec![10.0, 10.0]]);
        assert_eq!(q.encode(&[5.0, 5.0], &state).unwrap(), vec![0, 0]);
    }

    #[test]
    fn extremes_hit_the_byte_range() {
        let (q, state) = trained(vec![vec![0.0], vec![10.0]]);
        assert_eq!(q.encode(&[0.0], &state).unwrap(), vec![-128]);
        assert_eq!(q.encode(&[10.0], &state).unwrap(), vec![127]);
    }

    #[test]
    fn out_of_range_values_clamp() {
        let (q, state) = trained(vec![vec![0.0], vec![10.0]]);
        assert_eq!(q.encode(&[-50.0], &state).unwrap(), vec![-128]);
        assert_eq!(q.encode(&[1e9], &state).unwrap(), vec![127]);
    }

    #[test]
    fn flat_dimension_does_not_divide_by_zero() {
        let (q, state) = trained(vec![vec![3.0, 1.0], vec![3.0, 2.0]]);
        let codes = q.encode(&[3.0, 1.5], &state).unwrap();
        assert_eq!(codes[0], FLAT_DIMENSION_CODE);
        assert_eq!(q.decode(&codes, &state).unwrap()[0], 3.0);
    }

    #[test]
    fn encode_rejects_wrong_dimension() {
        let (q, state) = trained(vec![vec![0.0, 0.0], vec![1.0, 1.0]]);
        assert_eq!(
            q.encode(&[1.0], &state).unwrap_err(),
            QuantizationError::DimensionMismatch {
                expected: 2,
                actual: 1
            }
        );
    }

    #[test]
    fn decode_is_within_one_step() {
        let (q, state) = trained(vec![vec![-4.0, 0.0], vec![4.0, 100.0]]);
        let v = [1.234, 67.8];
        let back = q.decode(&q.encode(&v, &state).unwrap(), &state).unwrap();
        assert!((back[0] - v[0]).abs() <= 8.0 / 255.0);
        assert!((back[1] - v[1]).abs() <= 100.0 / 255.0);
    }

    #[test]
    fn train_is_deterministic_for_a_seed() {
        let vectors: Vec<Vec<f32>> = (0..500).map(|i| vec![i as f32, -(i as f32)]).collect();
        let q = ByteScalarQuantizer::new(50, 11);
        assert_eq!(q.train(&vectors).unwrap(), q.train(&vectors).unwrap());
    }

    #[test]
    fn one_bit_state_is_rejected() {
        let state = QuantizationState::new(1, QuantizationParams::OneBit { thresholds: vec![0.0] });
        let err = ByteScalarQuantizer::default().encode(&[1.0], &state).unwrap_err();
        assert!(matches!(err, QuantizationError::UnsupportedState { .. }));
    }
}
