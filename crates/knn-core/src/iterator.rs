//! Exact scoring over a candidate set.
//!
//! A [`CandidateIterator`] walks a [`DocBitSet`] in ascending id order, scores
//! every candidate that has a stored vector against the query, and yields
//! `(doc, score)` pairs with "larger is more similar" scores. It does not sort;
//! ranking into a top-K belongs to the caller's collector.
//!
//! The scorer is picked once per query from the vector encoding and space type,
//! then the per-document loop is a single match on that scorer.
//!
//! With a parent bit set the iterator runs in nested mode: candidates are child
//! documents, the parent of a child is the next set bit at or after it, and
//! only the best child score per parent is emitted, keyed by the parent id.

use crate::bitset::{DocBitSet, Ones};
use crate::quantization::{QuantizationError, QuantizationParams, QuantizationState};
use crate::space::{hamming_score, SpaceType, VectorDataType};
use crate::values::VectorValues;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IteratorError {
    #[error("query has dimension {actual}, vectors have {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("{query} query cannot score {values} vectors")]
    EncodingMismatch {
        values: VectorDataType,
        query: VectorDataType,
    },

    #[error("space {space} is not supported for {data_type} vectors")]
    UnsupportedSpace {
        space: SpaceType,
        data_type: VectorDataType,
    },

    #[error(transparent)]
    Quantization(#[from] QuantizationError),
}

/// Stored vectors of one segment, by encoding.
#[derive(Clone, Copy)]
pub enum VectorSource<'a> {
    Float(&'a dyn VectorValues<f32>),
    Byte(&'a dyn VectorValues<i8>),
    Binary(&'a dyn VectorValues<u8>),
}

impl VectorSource<'_> {
    pub fn data_type(&self) -> VectorDataType {
        match self {
            VectorSource::Float(_) => VectorDataType::Float,
            VectorSource::Byte(_) => VectorDataType::Byte,
            VectorSource::Binary(_) => VectorDataType::Binary,
        }
    }

    pub fn dimension(&self) -> usize {
        match self {
            VectorSource::Float(v) => v.dimension(),
            VectorSource::Byte(v) => v.dimension(),
            VectorSource::Binary(v) => v.dimension(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum QueryVector<'a> {
    Float(&'a [f32]),
    Byte(&'a [i8]),
    /// Packed bits, `dimension / 8` bytes.
    Binary(&'a [u8]),
}

impl QueryVector<'_> {
    pub fn data_type(&self) -> VectorDataType {
        match self {
            QueryVector::Float(_) => VectorDataType::Float,
            QueryVector::Byte(_) => VectorDataType::Byte,
            QueryVector::Binary(_) => VectorDataType::Binary,
        }
    }
}

/// Quantization applied to float vectors of a segment at search time.
#[derive(Debug, Clone, Copy)]
pub struct SegmentQuantization<'a> {
    pub state: &'a QuantizationState,
    /// The query already encoded with `state`.
    pub query: &'a [u8],
}

/// Everything needed to build an iterator for one segment and one query.
pub struct IteratorRequest<'a> {
    pub candidates: &'a DocBitSet,
    pub values: VectorSource<'a>,
    pub query: QueryVector<'a>,
    pub space: SpaceType,
    pub quantization: Option<SegmentQuantization<'a>>,
    /// Present for nested fields.
    pub parents: Option<&'a DocBitSet>,
}

enum Scorer<'a> {
    Float {
        values: &'a dyn VectorValues<f32>,
        query: &'a [f32],
        space: SpaceType,
    },
    QuantizedFloat {
        values: &'a dyn VectorValues<f32>,
        state: &'a QuantizationState,
        query: &'a [u8],
    },
    Byte {
        values: &'a dyn VectorValues<i8>,
        query: &'a [i8],
        space: SpaceType,
    },
    Binary {
        values: &'a dyn VectorValues<u8>,
        query: &'a [u8],
    },
}

impl<'a> Scorer<'a> {
    fn resolve(request: &IteratorRequest<'a>) -> Result<Self, IteratorError> {
        let data_type = request.values.data_type();
        if request.query.data_type() != data_type {
            return Err(IteratorError::EncodingMismatch {
                values: data_type,
                query: request.query.data_type(),
            });
        }
        if !request.space.supports(data_type) {
            return Err(IteratorError::UnsupportedSpace {
                space: request.space,
                data_type,
            });
        }

        let expected = request.values.dimension();
        let check = |actual: usize| {
            if actual == expected {
                Ok(())
            } else {
                Err(IteratorError::DimensionMismatch { expected, actual })
            }
        };

        let scorer = match (request.values, request.query, request.quantization) {
            (VectorSource::Float(values), QueryVector::Float(_), Some(quant)) => {
                check(quant.state.dimension())?;
                // Hamming distance only ranks one-bit codes meaningfully.
                let code_len = match quant.state.params() {
                    QuantizationParams::OneBit { .. } => expected.div_ceil(8),
                    other => {
                        return Err(QuantizationError::UnsupportedState { kind: other.kind() }.into())
                    }
                };
                if quant.query.len() != code_len {
                    return Err(IteratorError::DimensionMismatch {
                        expected: code_len,
                        actual: quant.query.len(),
                    });
                }
                Scorer::QuantizedFloat {
                    values,
                    state: quant.state,
                    query: quant.query,
                }
            }
            (VectorSource::Float(values), QueryVector::Float(query), None) => {
                check(query.len())?;
                Scorer::Float {
                    values,
                    query,
                    space: request.space,
                }
            }
            (VectorSource::Byte(values), QueryVector::Byte(query), _) => {
                check(query.len())?;
                Scorer::Byte {
                    values,
                    query,
                    space: request.space,
                }
            }
            (VectorSource::Binary(values), QueryVector::Binary(query), _) => {
                if query.len() != expected.div_ceil(8) {
                    return Err(IteratorError::DimensionMismatch {
                        expected,
                        actual: query.len() * 8,
                    });
                }
                Scorer::Binary { values, query }
            }
            (values, query, _) => {
                return Err(IteratorError::EncodingMismatch {
                    values: values.data_type(),
                    query: query.data_type(),
                })
            }
        };
        Ok(scorer)
    }

    /// Score for `doc`, or `None` when it has no vector.
    #[inline]
    fn score(&self, doc: u32) -> Option<f32> {
        match self {
            Scorer::Float {
                values,
                query,
                space,
            } => values.vector(doc).map(|v| space.score_f32(query, v)),
            Scorer::QuantizedFloat {
                values,
                state,
                query,
            } => {
                let stored = state.quantize_bytes(values.vector(doc)?).ok()?;
                Some(hamming_score(query, &stored))
            }
            Scorer::Byte {
                values,
                query,
                space,
            } => values.vector(doc).map(|v| space.score_i8(query, v)),
            Scorer::Binary { values, query } => {
                values.vector(doc).map(|v| hamming_score(query, v))
            }
        }
    }
}

enum Mode<'a> {
    Plain,
    Nested {
        parents: &'a DocBitSet,
        // Next scored child already pulled from the candidate stream.
        pending: Option<(u32, u32, f32)>,
        best_child: Option<u32>,
    },
}

/// Lazy `(doc, score)` stream over a candidate set.
pub struct CandidateIterator<'a> {
    docs: Ones<'a>,
    scorer: Scorer<'a>,
    mode: Mode<'a>,
}

impl<'a> CandidateIterator<'a> {
    pub fn new(request: IteratorRequest<'a>) -> Result<Self, IteratorError> {
        let scorer = Scorer::resolve(&request)?;
        let mode = match request.parents {
            Some(parents) => Mode::Nested {
                parents,
                pending: None,
                best_child: None,
            },
            None => Mode::Plain,
        };
        Ok(Self {
            docs: request.candidates.iter(),
            scorer,
            mode,
        })
    }

    pub fn is_nested(&self) -> bool {
        matches!(self.mode, Mode::Nested { .. })
    }

    /// In nested mode, the child that produced the most recent parent score.
    pub fn best_child(&self) -> Option<u32> {
        match &self.mode {
            Mode::Nested { best_child, .. } => *best_child,
            Mode::Plain => None,
        }
    }

    fn next_scored(&mut self) -> Option<(u32, f32)> {
        for doc in self.docs.by_ref() {
            if let Some(score) = self.scorer.score(doc) {
                return Some((doc, score));
            }
        }
        None
    }

    /// Next scored child that has a parent, with that parent.
    fn next_child(&mut self, parents: &DocBitSet) -> Option<(u32, u32, f32)> {
        while let Some((child, score)) = self.next_scored() {
            if let Some(parent) = parents.next_set_bit(child) {
                return Some((child, parent, score));
            }
        }
        None
    }
}

impl Iterator for CandidateIterator<'_> {
    type Item = (u32, f32);

    fn next(&mut self) -> Option<(u32, f32)> {
        let (parents, pending) = match &mut self.mode {
            Mode::Plain => return self.next_scored(),
            Mode::Nested {
                parents, pending, ..
            } => (*parents, pending.take()),
        };

        let (mut best, parent, mut best_score) = match pending {
            Some(first) => first,
            None => self.next_child(parents)?,
        };

        let mut lookahead = None;
        while let Some((child, next_parent, score)) = self.next_child(parents) {
            if next_parent != parent {
                lookahead = Some((child, next_parent, score));
                break;
            }
            if score > best_score {
                best = child;
                best_score = score;
            }
        }

        if let Mode::Nested {
            pending,
            best_child,
            ..
        } = &mut self.mode
        {
            *pending = lookahead;
            *best_child = Some(best);
        }
        Some((parent, best_score))
    }
}
