//! Chunk descriptors.
//!
//! A file's content is the concatenation of its descriptors, in order.
//! Descriptor `i` covers `[sum(len[0..i]), sum(len[0..=i]))`. The sequence
//! must tile `[0, size)` exactly; [`check_tiling`] is the single place that
//! enforces it.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::RemoteId;

/// BLAKE3 digest of a chunk payload.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checksum(#[serde(with = "hex::serde")] [u8; 32]);

impl Checksum {
    /// Hash a payload.
    pub fn of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Returns true if `data` hashes to this checksum.
    pub fn verify(&self, data: &[u8]) -> bool {
        Self::of(data) == *self
    }

    /// Full lowercase hex form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The raw digest.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", &self.to_hex()[..12])
    }
}

/// Where a chunk's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkSource {
    /// Stored remotely under `id`; `checksum` guards the download.
    Remote { id: RemoteId, checksum: Checksum },
    /// Implicit zeros left by a growing truncate or a write past EOF.
    /// Never stored remotely; materialized on the next overlapping write.
    ZeroFill,
}

/// One segment of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    /// Byte length; `0 < length <= max_chunk_size`.
    pub length: u32,
    pub source: ChunkSource,
}

impl ChunkDescriptor {
    /// Describe a chunk that has been uploaded.
    pub fn remote(id: RemoteId, length: u32, checksum: Checksum) -> Self {
        Self {
            length,
            source: ChunkSource::Remote { id, checksum },
        }
    }

    /// Describe a run of implicit zeros.
    pub fn zero_fill(length: u32) -> Self {
        Self {
            length,
            source: ChunkSource::ZeroFill,
        }
    }

    /// The remote handle, if this chunk is stored remotely.
    pub fn remote_id(&self) -> Option<&RemoteId> {
        match &self.source {
            ChunkSource::Remote { id, .. } => Some(id),
            ChunkSource::ZeroFill => None,
        }
    }

    /// The payload checksum, if this chunk is stored remotely.
    pub fn checksum(&self) -> Option<&Checksum> {
        match &self.source {
            ChunkSource::Remote { checksum, .. } => Some(checksum),
            ChunkSource::ZeroFill => None,
        }
    }

    pub fn is_zero_fill(&self) -> bool {
        matches!(self.source, ChunkSource::ZeroFill)
    }
}

/// Describe `len` zero bytes as a run of zero-fill descriptors, each at most
/// `max_chunk_size` long.
pub fn zero_fill_run(mut len: u64, max_chunk_size: u32) -> Vec<ChunkDescriptor> {
    let mut out = Vec::new();
    let max = u64::from(max_chunk_size.max(1));
    while len > 0 {
        let take = len.min(max);
        out.push(ChunkDescriptor::zero_fill(take as u32));
        len -= take;
    }
    out
}

/// Sum of descriptor lengths.
pub fn tiled_len(chunks: &[ChunkDescriptor]) -> u64 {
    chunks.iter().map(|c| u64::from(c.length)).sum()
}

/// Remote handles owned by a descriptor sequence, in order.
pub fn remote_ids(chunks: &[ChunkDescriptor]) -> Vec<RemoteId> {
    chunks.iter().filter_map(|c| c.remote_id().cloned()).collect()
}

/// Descriptor-sequence invariant violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TilingError {
    #[error("chunk {index} is empty")]
    EmptyChunk { index: usize },

    #[error("chunk {index} is {length} bytes, limit is {max}")]
    Oversized { index: usize, length: u32, max: u32 },

    #[error("chunks cover {covered} bytes but size is {size}")]
    SizeMismatch { covered: u64, size: u64 },
}

/// Verify that `chunks` tile `[0, size)` with every length in `(0, max]`.
pub fn check_tiling(chunks: &[ChunkDescriptor], size: u64, max: u32) -> Result<(), TilingError> {
    for (index, chunk) in chunks.iter().enumerate() {
        if chunk.length == 0 {
            return Err(TilingError::EmptyChunk { index });
        }
        if chunk.length > max {
            return Err(TilingError::Oversized {
                index,
                length: chunk.length,
                max,
            });
        }
    }
    let covered = tiled_len(chunks);
    if covered != size {
        return Err(TilingError::SizeMismatch { covered, size });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_verify() {
        let sum = Checksum::of(b"hello");
        assert!(sum.verify(b"hello"));
        assert!(!sum.verify(b"hellO"));
        assert_eq!(sum.to_hex().len(), 64);
    }

    #[test]
    fn test_checksum_serializes_as_hex() {
        let sum = Checksum::of(b"abc");
        let json = serde_json::to_string(&sum).unwrap();
        assert_eq!(json, format!("\"{}\"", sum.to_hex()));
        let back: Checksum = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sum);
    }

    #[test]
    fn test_zero_fill_run_respects_max() {
        let run = zero_fill_run(10, 4);
        let lengths: Vec<u32> = run.iter().map(|c| c.length).collect();
        assert_eq!(lengths, vec![4, 4, 2]);
        assert!(run.iter().all(ChunkDescriptor::is_zero_fill));
        assert!(zero_fill_run(0, 4).is_empty());
    }

    #[test]
    fn test_check_tiling() {
        let sum = Checksum::of(b"x");
        let chunks = vec![
            ChunkDescriptor::remote(RemoteId::new("a"), 4, sum),
            ChunkDescriptor::zero_fill(3),
        ];
        assert!(check_tiling(&chunks, 7, 4).is_ok());
        assert_eq!(
            check_tiling(&chunks, 8, 4),
            Err(TilingError::SizeMismatch { covered: 7, size: 8 })
        );
        assert_eq!(
            check_tiling(&chunks, 7, 3),
            Err(TilingError::Oversized { index: 0, length: 4, max: 3 })
        );
        let empty = vec![ChunkDescriptor::zero_fill(0)];
        assert_eq!(
            check_tiling(&empty, 0, 4),
            Err(TilingError::EmptyChunk { index: 0 })
        );
    }

    #[test]
    fn test_remote_ids_skip_zero_fill() {
        let sum = Checksum::of(b"x");
        let chunks = vec![
            ChunkDescriptor::zero_fill(2),
            ChunkDescriptor::remote(RemoteId::new("r1"), 1, sum),
        ];
        assert_eq!(remote_ids(&chunks), vec![RemoteId::new("r1")]);
    }

    #[test]
    fn test_descriptor_postcard() {
        let desc = ChunkDescriptor::remote(RemoteId::new("doc-1"), 20, Checksum::of(b"payload"));
        let bytes = postcard::to_stdvec(&desc).unwrap();
        let back: ChunkDescriptor = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(back, desc);
    }
}
