//! One-bit quantization: one bit per dimension, set when the value exceeds
//! that dimension's threshold (the sample mean). Bits are packed MSB first.

use tracing::debug;

use super::{
    collect_sample, QuantizationError, QuantizationParams, QuantizationState, Quantizer,
    TrainingSource, DEFAULT_SAMPLE_SIZE,
};

#[derive(Debug, Clone)]
pub struct OneBitQuantizer {
    pub sample_size: usize,
    pub seed: u64,
}

impl Default for OneBitQuantizer {
    fn default() -> Self {
        Self {
            sample_size: DEFAULT_SAMPLE_SIZE,
            seed: 42,
        }
    }
}

impl OneBitQuantizer {
    pub fn new(sample_size: usize, seed: u64) -> Self {
        Self { sample_size, seed }
    }
}

impl Quantizer for OneBitQuantizer {
    type Code = u8;

    fn train(&self, source: &dyn TrainingSource) -> Result<QuantizationState, QuantizationError> {
        let (dimension, sample) = collect_sample(source, self.sample_size, self.seed)?;

        let mut sums = vec![0.0f64; dimension];
        for vector in &sample {
            for (sum, &v) in sums.iter_mut().zip(vector) {
                *sum += v as f64;
            }
        }
        let n = sample.len() as f64;
        let thresholds = sums.into_iter().map(|s| (s / n) as f32).collect();

        debug!(dimension, sampled = sample.len(), "trained one-bit quantizer");
        Ok(QuantizationState::new(
            dimension,
            QuantizationParams::OneBit { thresholds },
        ))
    }

    fn encode(
        &self,
        vector: &[f32],
        state: &QuantizationState,
    ) -> Result<Vec<u8>, QuantizationError> {
        encode_with(state, vector)
    }
}

pub(crate) fn encode_with(
    state: &QuantizationState,
    vector: &[f32],
) -> Result<Vec<u8>, QuantizationError> {
    state.check_dimension(vector.len())?;
    let thresholds = match state.params() {
        QuantizationParams::OneBit { thresholds } => thresholds,
        other => return Err(QuantizationError::UnsupportedState { kind: other.kind() }),
    };

    let mut packed = vec![0u8; vector.len().div_ceil(8)];
    for (d, (&v, &t)) in vector.iter().zip(thresholds).enumerate() {
        if v > t {
            packed[d / 8] |= 0x80 >> (d % 8);
        }
    }
    Ok(packed)
}
