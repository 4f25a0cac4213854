//! Trained quantization parameters and their persisted layout.
//!
//! # Layout (little-endian)
//!
//! ```text
//! ┌──────────┬─────────┬──────┬───────────┬─────────────────────────────┐
//! │ "KNNQ"   │ version │ kind │ dimension │ payload                     │
//! │ 4 bytes  │ u32     │ u8   │ u32       │ kind-specific               │
//! └──────────┴─────────┴──────┴───────────┴─────────────────────────────┘
//!
//! kind 1 (byte scalar): min[dim] f32, diff[dim] f32
//! kind 2 (one bit):     thresholds[dim] f32
//! kind 3 (codebook):    len u32, bytes[len]
//! ```

use crate::quantization::QuantizationError;

pub const STATE_MAGIC: &[u8; 4] = b"KNNQ";
pub const STATE_VERSION: u32 = 1;
const HEADER_SIZE: usize = 4 + 4 + 1 + 4;

const KIND_BYTE_SCALAR: u8 = 1;
const KIND_ONE_BIT: u8 = 2;
const KIND_CODEBOOK: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateFormatError {
    #[error("invalid magic bytes")]
    InvalidMagic,
    #[error("unsupported state version {0}")]
    UnsupportedVersion(u32),
    #[error("unknown quantization kind {0}")]
    UnknownKind(u8),
    #[error("truncated state: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("{0} trailing bytes after state payload")]
    TrailingBytes(usize),
}

/// Parameters produced by a training run.
#[derive(Debug, Clone, PartialEq)]
pub enum QuantizationParams {
    /// Per-dimension range for signed byte codes.
    ByteScalar { min: Vec<f32>, diff: Vec<f32> },
    /// Per-dimension thresholds for one-bit codes.
    OneBit { thresholds: Vec<f32> },
    /// Opaque bytes trained by the native library (e.g. IVF centroids).
    Codebook { bytes: Vec<u8> },
}

impl QuantizationParams {
    pub fn kind(&self) -> &'static str {
        match self {
            QuantizationParams::ByteScalar { .. } => "byte_scalar",
            QuantizationParams::OneBit { .. } => "one_bit",
            QuantizationParams::Codebook { .. } => "codebook",
        }
    }
}

/// Immutable result of training; shared read-only across threads.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizationState {
    dimension: usize,
    params: QuantizationParams,
}

impl QuantizationState {
    /// # Panics
    /// If per-dimension arrays do not match `dimension`.
    pub fn new(dimension: usize, params: QuantizationParams) -> Self {
        match &params {
            QuantizationParams::ByteScalar { min, diff } => {
                assert_eq!(min.len(), dimension, "min length mismatch");
                assert_eq!(diff.len(), dimension, "diff length mismatch");
            }
            QuantizationParams::OneBit { thresholds } => {
                assert_eq!(thresholds.len(), dimension, "thresholds length mismatch");
            }
            QuantizationParams::Codebook { .. } => {}
        }
        Self { dimension, params }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn params(&self) -> &QuantizationParams {
        &self.params
    }

    /// Trained native bytes, for codebook states.
    pub fn codebook(&self) -> Option<&[u8]> {
        match &self.params {
            QuantizationParams::Codebook { bytes } => Some(bytes),
            _ => None,
        }
    }

    pub(crate) fn check_dimension(&self, actual: usize) -> Result<(), QuantizationError> {
        if actual != self.dimension {
            return Err(QuantizationError::DimensionMismatch {
                expected: self.dimension,
                actual,
            });
        }
        Ok(())
    }

    /// Encodes `vector` as packed bits comparable by hamming distance.
    ///
    /// Only one-bit states qualify: byte-scalar codes that differ by one step
    /// can be many bits apart.
    pub fn quantize_bytes(&self, vector: &[f32]) -> Result<Vec<u8>, QuantizationError> {
        match &self.params {
            QuantizationParams::OneBit { .. } => super::binary::encode_with(self, vector),
            other => Err(QuantizationError::UnsupportedState { kind: other.kind() }),
        }
    }

    /// Size of the serialized form.
    pub fn serialized_len(&self) -> usize {
        HEADER_SIZE
            + match &self.params {
                QuantizationParams::ByteScalar { .. } => self.dimension * 8,
                QuantizationParams::OneBit { .. } => self.dimension * 4,
                QuantizationParams::Codebook { bytes } => 4 + bytes.len(),
            }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.serialized_len());
        out.extend_from_slice(STATE_MAGIC);
        out.extend_from_slice(&STATE_VERSION.to_le_bytes());
        match &self.params {
            QuantizationParams::ByteScalar { min, diff } => {
                out.push(KIND_BYTE_SCALAR);
                out.extend_from_slice(&(self.dimension as u32).to_le_bytes());
                write_f32s(&mut out, min);
                write_f32s(&mut out, diff);
            }
            QuantizationParams::OneBit { thresholds } => {
                out.push(KIND_ONE_BIT);
                out.extend_from_slice(&(self.dimension as u32).to_le_bytes());
                write_f32s(&mut out, thresholds);
            }
            QuantizationParams::Codebook { bytes } => {
                out.push(KIND_CODEBOOK);
                out.extend_from_slice(&(self.dimension as u32).to_le_bytes());
                out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                out.extend_from_slice(bytes);
            }
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StateFormatError> {
        let mut reader = Reader { bytes, pos: 0 };
        if reader.take(4)? != STATE_MAGIC {
            return Err(StateFormatError::InvalidMagic);
        }
        let version = reader.u32()?;
        if version != STATE_VERSION {
            return Err(StateFormatError::UnsupportedVersion(version));
        }
        let kind = reader.take(1)?[0];
        let dimension = reader.u32()? as usize;

        let params = match kind {
            KIND_BYTE_SCALAR => {
                let min = reader.f32s(dimension)?;
                let diff = reader.f32s(dimension)?;
                QuantizationParams::ByteScalar { min, diff }
            }
            KIND_ONE_BIT => QuantizationParams::OneBit {
                thresholds: reader.f32s(dimension)?,
            },
            KIND_CODEBOOK => {
                let len = reader.u32()? as usize;
                QuantizationParams::Codebook {
                    bytes: reader.take(len)?.to_vec(),
                }
            }
            other => return Err(StateFormatError::UnknownKind(other)),
        };

        let rest = bytes.len() - reader.pos;
        if rest != 0 {
            return Err(StateFormatError::TrailingBytes(rest));
        }
        Ok(Self { dimension, params })
    }
}

fn write_f32s(out: &mut Vec<u8>, values: &[f32]) {
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], StateFormatError> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.bytes.len()).ok_or(
            StateFormatError::Truncated {
                needed: self.pos.saturating_add(n),
                available: self.bytes.len(),
            },
        )?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32, StateFormatError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn f32s(&mut self, n: usize) -> Result<Vec<f32>, StateFormatError> {
        let byte_len = n.checked_mul(4).ok_or(StateFormatError::Truncated {
            needed: usize::MAX,
            available: self.bytes.len(),
        })?;
        let raw = self.take(byte_len)?;
        Ok(raw
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}
