//! # knn-core
//!
//! Numeric building blocks for exact and quantized k-NN scoring. Nothing in
//! this crate spawns threads or takes locks; resource management lives in the
//! engine crate.
//!
//! - [`simd`]: distance kernels (NEON / AVX2 / scalar)
//! - [`space`]: space types, vector encodings and score conversion
//! - [`bitset`]: candidate and parent document sets
//! - [`values`]: per-document vector storage
//! - [`quantization`]: byte scalar and one-bit quantizers with their persisted state
//! - [`iterator`]: the candidate iterator family

pub mod bitset;
pub mod iterator;
pub mod quantization;
pub mod simd;
pub mod space;
pub mod values;

pub use bitset::DocBitSet;
pub use iterator::{
    CandidateIterator, IteratorError, IteratorRequest, QueryVector, SegmentQuantization,
    VectorSource,
};
pub use quantization::{
    ByteScalarQuantizer, OneBitQuantizer, QuantizationError, QuantizationParams,
    QuantizationState, Quantizer, StateFormatError, TrainingSource,
};
pub use space::{SpaceType, VectorDataType};
pub use values::{DenseVectors, VectorValues};
