//! Space types, vector encodings, and the distance → score conversion.
//!
//! Every space type maps its raw distance (or similarity) to a score where
//! larger means more similar, so a single max-heap collector ranks them all.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::simd;

/// How a vector's coordinates are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorDataType {
    Float,
    Byte,
    /// Bit-packed, eight dimensions per byte.
    Binary,
}

impl VectorDataType {
    /// Bytes needed to store one vector of `dimension` coordinates.
    pub fn vector_bytes(self, dimension: usize) -> usize {
        match self {
            VectorDataType::Float => dimension * std::mem::size_of::<f32>(),
            VectorDataType::Byte => dimension,
            VectorDataType::Binary => dimension.div_ceil(8),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VectorDataType::Float => "float",
            VectorDataType::Byte => "byte",
            VectorDataType::Binary => "binary",
        }
    }
}

impl fmt::Display for VectorDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VectorDataType {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "float" => Ok(VectorDataType::Float),
            "byte" => Ok(VectorDataType::Byte),
            "binary" => Ok(VectorDataType::Binary),
            other => Err(UnknownName {
                kind: "vector data type",
                name: other.to_string(),
            }),
        }
    }
}

/// Distance or similarity function used to rank vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpaceType {
    #[serde(rename = "l1")]
    L1,
    #[serde(rename = "l2")]
    L2,
    #[serde(rename = "linf")]
    LInf,
    #[serde(rename = "innerproduct")]
    InnerProduct,
    #[serde(rename = "cosinesimil")]
    Cosine,
    #[serde(rename = "hamming")]
    Hamming,
}

impl SpaceType {
    pub const ALL: [SpaceType; 6] = [
        SpaceType::L1,
        SpaceType::L2,
        SpaceType::LInf,
        SpaceType::InnerProduct,
        SpaceType::Cosine,
        SpaceType::Hamming,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SpaceType::L1 => "l1",
            SpaceType::L2 => "l2",
            SpaceType::LInf => "linf",
            SpaceType::InnerProduct => "innerproduct",
            SpaceType::Cosine => "cosinesimil",
            SpaceType::Hamming => "hamming",
        }
    }

    /// Whether this space can rank vectors stored as `data_type`.
    ///
    /// Binary vectors only support hamming; hamming only applies to binary.
    pub fn supports(self, data_type: VectorDataType) -> bool {
        match (self, data_type) {
            (SpaceType::Hamming, VectorDataType::Binary) => true,
            (SpaceType::Hamming, _) | (_, VectorDataType::Binary) => false,
            _ => true,
        }
    }

    /// Converts this space's raw value to a "larger is better" score.
    ///
    /// `raw` is the squared distance for L2, the distance for L1/L∞/hamming,
    /// the inner product, or the cosine similarity.
    #[inline]
    pub fn score_from_raw(self, raw: f32) -> f32 {
        match self {
            SpaceType::L2 | SpaceType::L1 | SpaceType::LInf | SpaceType::Hamming => {
                1.0 / (1.0 + raw)
            }
            SpaceType::InnerProduct => {
                if raw >= 0.0 {
                    raw + 1.0
                } else {
                    1.0 / (1.0 - raw)
                }
            }
            SpaceType::Cosine => (1.0 + raw) / 2.0,
        }
    }

    /// Raw value between two float vectors. Hamming is not defined for floats
    /// and yields `f32::NAN`; callers reject that pairing up front.
    #[inline]
    pub fn raw_f32(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            SpaceType::L2 => simd::l2_distance_squared(a, b),
            SpaceType::L1 => simd::l1_distance(a, b),
            SpaceType::LInf => simd::linf_distance(a, b),
            SpaceType::InnerProduct => simd::dot_product(a, b),
            SpaceType::Cosine => simd::cosine_similarity(a, b),
            SpaceType::Hamming => f32::NAN,
        }
    }

    #[inline]
    pub fn raw_i8(self, a: &[i8], b: &[i8]) -> f32 {
        match self {
            SpaceType::L2 => simd::l2_distance_squared_i8(a, b),
            SpaceType::L1 => simd::l1_distance_i8(a, b),
            SpaceType::LInf => simd::linf_distance_i8(a, b),
            SpaceType::InnerProduct => simd::dot_product_i8(a, b),
            SpaceType::Cosine => simd::cosine_similarity_i8(a, b),
            SpaceType::Hamming => f32::NAN,
        }
    }

    #[inline]
    pub fn score_f32(self, a: &[f32], b: &[f32]) -> f32 {
        self.score_from_raw(self.raw_f32(a, b))
    }

    #[inline]
    pub fn score_i8(self, a: &[i8], b: &[i8]) -> f32 {
        self.score_from_raw(self.raw_i8(a, b))
    }
}

/// Hamming similarity between packed bit vectors.
#[inline]
pub fn hamming_score(a: &[u8], b: &[u8]) -> f32 {
    SpaceType::Hamming.score_from_raw(simd::hamming_distance(a, b) as f32)
}

impl fmt::Display for SpaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SpaceType {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SpaceType::ALL
            .into_iter()
            .find(|space| space.as_str() == s)
            .ok_or_else(|| UnknownName {
                kind: "space type",
                name: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {name:?}")]
pub struct UnknownName {
    pub kind: &'static str,
    pub name: String,
}
