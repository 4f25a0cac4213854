//! Persisted index layout
//!
//! # File Structure
//!
//! ```text
//! Offset   Size        Type        Description
//! ──────────────────────────────────────────────────────────
//! 0x00     8           [u8; 8]     Magic: "KNNIDX01"
//! 0x08     1           u8          Method (0 = flat, 1 = ivf)
//! 0x09     1           u8          Space type
//! 0x0A     2           -           Reserved
//! 0x0C     4           u32 LE      D: dimension
//! 0x10     4           u32 LE      N: vector count
//! 0x14     4           u32 LE      nlist (0 for flat)
//! 0x18     4           u32 LE      nprobe (0 for flat)
//! 0x1C     4           -           Reserved
//! 0x20     N*4         [u32]       Document ids
//! ...      N*D*4       [f32]       Vectors
//! ...      nlist*D*4   [f32]       Centroids (ivf only)
//! ...      N*4         [u32]       Partition of each vector (ivf only)
//! ```

use thiserror::Error;

use knn_core::SpaceType;

use crate::method::IndexMethod;

pub const MAGIC: [u8; 8] = *b"KNNIDX01";

pub const HEADER_SIZE: usize = 32;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IndexFormatError {
    #[error("invalid magic bytes: expected KNNIDX01")]
    InvalidMagic,

    #[error("truncated index: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("unknown index method tag {0}")]
    UnknownMethod(u8),

    #[error("unknown space type tag {0}")]
    UnknownSpace(u8),

    #[error("inconsistent index: {0}")]
    Inconsistent(String),
}

/// Parsed index header.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexHeader {
    pub method: IndexMethod,
    pub space: SpaceType,
    pub dimension: u32,
    pub count: u32,
}

impl IndexHeader {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IndexFormatError> {
        if bytes.len() < HEADER_SIZE {
            return Err(IndexFormatError::Truncated {
                needed: HEADER_SIZE,
                available: bytes.len(),
            });
        }
        if bytes[0..8] != MAGIC {
            return Err(IndexFormatError::InvalidMagic);
        }

        let space = *SpaceType::ALL
            .get(bytes[9] as usize)
            .ok_or(IndexFormatError::UnknownSpace(bytes[9]))?;
        let dimension = read_u32(bytes, 0x0C);
        let count = read_u32(bytes, 0x10);
        let nlist = read_u32(bytes, 0x14) as usize;
        let nprobe = read_u32(bytes, 0x18) as usize;
        let method = match bytes[8] {
            0 => IndexMethod::Flat,
            1 => IndexMethod::Ivf { nlist, nprobe },
            other => return Err(IndexFormatError::UnknownMethod(other)),
        };

        Ok(Self {
            method,
            space,
            dimension,
            count,
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&MAGIC);
        let (tag, nlist, nprobe) = match self.method {
            IndexMethod::Flat => (0u8, 0u32, 0u32),
            IndexMethod::Ivf { nlist, nprobe } => (1u8, nlist as u32, nprobe as u32),
        };
        buf[8] = tag;
        buf[9] = space_tag(self.space);
        buf[0x0C..0x10].copy_from_slice(&self.dimension.to_le_bytes());
        buf[0x10..0x14].copy_from_slice(&self.count.to_le_bytes());
        buf[0x14..0x18].copy_from_slice(&nlist.to_le_bytes());
        buf[0x18..0x1C].copy_from_slice(&nprobe.to_le_bytes());
        buf
    }

    fn nlist(&self) -> usize {
        match self.method {
            IndexMethod::Flat => 0,
            IndexMethod::Ivf { nlist, .. } => nlist,
        }
    }

    /// Total encoded size implied by this header. Saturates on absurd headers.
    pub fn encoded_len(&self) -> usize {
        let n = self.count as usize;
        let d = self.dimension as usize;
        let vectors = n.saturating_mul(d).saturating_mul(4);
        let mut len = HEADER_SIZE
            .saturating_add(n.saturating_mul(4))
            .saturating_add(vectors);
        if let IndexMethod::Ivf { nlist, .. } = self.method {
            len = len
                .saturating_add(nlist.saturating_mul(d).saturating_mul(4))
                .saturating_add(n.saturating_mul(4));
        }
        len
    }
}

fn space_tag(space: SpaceType) -> u8 {
    SpaceType::ALL
        .iter()
        .position(|s| *s == space)
        .unwrap_or_default() as u8
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// A fully decoded index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexData {
    pub header: IndexHeader,
    pub ids: Vec<u32>,
    /// `count * dimension` floats, row-major.
    pub vectors: Vec<f32>,
    /// `nlist * dimension` floats; empty for flat.
    pub centroids: Vec<f32>,
    /// Partition of each vector; empty for flat.
    pub assignments: Vec<u32>,
}

impl IndexData {
    pub fn vector(&self, row: usize) -> &[f32] {
        let d = self.header.dimension as usize;
        &self.vectors[row * d..(row + 1) * d]
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header.encoded_len());
        out.extend_from_slice(&self.header.to_bytes());
        for id in &self.ids {
            out.extend_from_slice(&id.to_le_bytes());
        }
        out.extend_from_slice(bytemuck::cast_slice(&self.vectors));
        out.extend_from_slice(bytemuck::cast_slice(&self.centroids));
        for a in &self.assignments {
            out.extend_from_slice(&a.to_le_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, IndexFormatError> {
        let header = IndexHeader::from_bytes(bytes)?;
        let needed = header.encoded_len();
        if bytes.len() < needed {
            return Err(IndexFormatError::Truncated {
                needed,
                available: bytes.len(),
            });
        }
        if bytes.len() > needed {
            return Err(IndexFormatError::Inconsistent(format!(
                "{} trailing bytes",
                bytes.len() - needed
            )));
        }

        let n = header.count as usize;
        let d = header.dimension as usize;
        let nlist = header.nlist();

        let mut pos = HEADER_SIZE;
        let ids = read_u32s(&bytes[pos..pos + n * 4]);
        pos += n * 4;
        // Offsets are not guaranteed to be 4-aligned in the source buffer.
        let vectors: Vec<f32> = bytemuck::pod_collect_to_vec(&bytes[pos..pos + n * d * 4]);
        pos += n * d * 4;

        let (centroids, assignments) = if nlist > 0 {
            let centroids: Vec<f32> =
                bytemuck::pod_collect_to_vec(&bytes[pos..pos + nlist * d * 4]);
            pos += nlist * d * 4;
            let assignments = read_u32s(&bytes[pos..pos + n * 4]);
            if let Some(bad) = assignments.iter().find(|&&a| a as usize >= nlist) {
                return Err(IndexFormatError::Inconsistent(format!(
                    "partition {bad} out of range for nlist {nlist}"
                )));
            }
            (centroids, assignments)
        } else {
            (Vec::new(), Vec::new())
        };

        Ok(Self {
            header,
            ids,
            vectors,
            centroids,
            assignments,
        })
    }
}

fn read_u32s(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat(count: u32, dimension: u32) -> IndexData {
        IndexData {
            header: IndexHeader {
                method: IndexMethod::Flat,
                space: SpaceType::L2,
                dimension,
                count,
            },
            ids: (0..count).map(|i| i * 10).collect(),
            vectors: (0..count * dimension).map(|i| i as f32).collect(),
            centroids: Vec::new(),
            assignments: Vec::new(),
        }
    }

    #[test]
    fn test_header_roundtrip() {
        let header = IndexHeader {
            method: IndexMethod::Ivf { nlist: 8, nprobe: 2 },
            space: SpaceType::Cosine,
            dimension: 128,
            count: 1000,
        };
        let parsed = IndexHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_flat_index_decodes() {
        let index = flat(3, 2);
        let bytes = index.encode();
        assert_eq!(bytes.len(), index.header.encoded_len());
        assert_eq!(&bytes[0..8], b"KNNIDX01");

        let decoded = IndexData::decode(&bytes).unwrap();
        assert_eq!(decoded.ids, vec![0, 10, 20]);
        assert_eq!(decoded.vector(2), &[4.0, 5.0]);
    }

    #[test]
    fn test_unaligned_buffer_decodes() {
        let bytes = flat(2, 3).encode();
        let mut shifted = vec![0u8];
        shifted.extend_from_slice(&bytes);
        let decoded = IndexData::decode(&shifted[1..]).unwrap();
        assert_eq!(decoded, flat(2, 3));
    }

    #[test]
    fn test_invalid_magic() {
        let mut bytes = flat(1, 1).encode();
        bytes[0] = b'X';
        assert_eq!(IndexData::decode(&bytes), Err(IndexFormatError::InvalidMagic));
    }

    #[test]
    fn test_truncated_body() {
        let bytes = flat(4, 4).encode();
        assert!(matches!(
            IndexData::decode(&bytes[..bytes.len() - 3]),
            Err(IndexFormatError::Truncated { .. })
        ));
        assert!(matches!(
            IndexHeader::from_bytes(&bytes[..10]),
            Err(IndexFormatError::Truncated { .. })
        ));
    }

    #[test]
    fn test_partition_out_of_range() {
        let mut index = flat(2, 1);
        index.header.method = IndexMethod::Ivf { nlist: 1, nprobe: 1 };
        index.centroids = vec![0.0];
        index.assignments = vec![0, 5];
        assert!(matches!(
            IndexData::decode(&index.encode()),
            Err(IndexFormatError::Inconsistent(_))
        ));
    }

    #[test]
    fn test_unknown_tags() {
        let mut bytes = flat(1, 1).encode();
        bytes[8] = 9;
        assert_eq!(IndexData::decode(&bytes), Err(IndexFormatError::UnknownMethod(9)));

        let mut bytes = flat(1, 1).encode();
        bytes[9] = 200;
        assert_eq!(IndexData::decode(&bytes), Err(IndexFormatError::UnknownSpace(200)));
    }
}
