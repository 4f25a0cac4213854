//! Quantization framework
//!
//! A quantizer is stateless: `train` draws a bounded reservoir sample from a
//! [`TrainingSource`] and returns an immutable [`QuantizationState`];
//! `encode` is a pure function of a vector and that state.
//!
//! ```text
//! TrainingSource ──sample──▶ Quantizer::train ──▶ QuantizationState (write-once)
//!                                                     │
//! float vector ─────────────▶ Quantizer::encode ◀─────┘ ──▶ codes
//! ```

pub mod binary;
pub mod sampler;
pub mod scalar;
pub mod state;

use std::borrow::Cow;

pub use binary::OneBitQuantizer;
pub use sampler::reservoir_sample;
pub use scalar::ByteScalarQuantizer;
pub use state::{QuantizationParams, QuantizationState, StateFormatError};

/// Reservoir size used when the caller does not pick one.
pub const DEFAULT_SAMPLE_SIZE: usize = 25_000;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QuantizationError {
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// A sampled position had no vector.
    #[error("sampled vector at index {index} is missing")]
    MissingSample { index: usize },

    #[error("no training vectors available")]
    EmptySample,

    #[error("state of kind {kind} cannot encode vectors")]
    UnsupportedState { kind: &'static str },
}

/// Indexed access to the vector population a quantizer trains on.
pub trait TrainingSource {
    /// Number of addressable vectors.
    fn total(&self) -> usize;

    /// Vector at `index`, or `None` when the slot is empty.
    fn vector(&self, index: usize) -> Option<Cow<'_, [f32]>>;
}

impl TrainingSource for [Vec<f32>] {
    fn total(&self) -> usize {
        self.len()
    }

    fn vector(&self, index: usize) -> Option<Cow<'_, [f32]>> {
        self.get(index).map(|v| Cow::Borrowed(v.as_slice()))
    }
}

impl TrainingSource for Vec<Vec<f32>> {
    fn total(&self) -> usize {
        self.len()
    }

    fn vector(&self, index: usize) -> Option<Cow<'_, [f32]>> {
        self.as_slice().vector(index)
    }
}

impl TrainingSource for [Option<Vec<f32>>] {
    fn total(&self) -> usize {
        self.len()
    }

    fn vector(&self, index: usize) -> Option<Cow<'_, [f32]>> {
        self.get(index)
            .and_then(|v| v.as_deref())
            .map(Cow::Borrowed)
    }
}

impl TrainingSource for Vec<Option<Vec<f32>>> {
    fn total(&self) -> usize {
        self.len()
    }

    fn vector(&self, index: usize) -> Option<Cow<'_, [f32]>> {
        self.as_slice().vector(index)
    }
}

/// Trains a compact encoding and applies it to float vectors.
pub trait Quantizer {
    /// Element type of an encoded vector.
    type Code;

    fn train(&self, source: &dyn TrainingSource) -> Result<QuantizationState, QuantizationError>;

    fn encode(
        &self,
        vector: &[f32],
        state: &QuantizationState,
    ) -> Result<Vec<Self::Code>, QuantizationError>;
}

/// Pulls the reservoir sample out of `source`, checking that every sampled
/// vector exists and has the dimension of the first one.
///
/// Returns the dimension and the sampled vectors in ascending index order.
pub(crate) fn collect_sample(
    source: &dyn TrainingSource,
    sample_size: usize,
    seed: u64,
) -> Result<(usize, Vec<Vec<f32>>), QuantizationError> {
    let indices = reservoir_sample(source.total(), sample_size, seed);
    if indices.is_empty() {
        return Err(QuantizationError::EmptySample);
    }

    let mut dimension = None;
    let mut sample = Vec::with_capacity(indices.len());
    for index in indices {
        let vector = source
            .vector(index)
            .ok_or(QuantizationError::MissingSample { index })?;
        let expected = *dimension.get_or_insert(vector.len());
        if vector.len() != expected {
            return Err(QuantizationError::DimensionMismatch {
                expected,
                actual: vector.len(),
            });
        }
        sample.push(vector.into_owned());
    }
    Ok((dimension.unwrap_or(0), sample))
}
