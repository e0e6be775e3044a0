//! Chunk codec.
//!
//! Pure arithmetic between byte ranges of a logical file and its ordered
//! chunk list. No I/O, no allocation of payloads beyond slicing.

use thiserror::Error;

/// Codec argument errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// `offset + length` does not fit in a `u64`.
    #[error("invalid range: offset {offset} length {length}")]
    InvalidRange { offset: u64, length: u64 },

    /// A zero maximum chunk size can never make progress.
    #[error("max chunk size must be non-zero")]
    ZeroChunkSize,
}

/// The part of one chunk that intersects a requested range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    /// Position in the chunk list.
    pub index: usize,
    /// Offset inside the chunk.
    pub start: u32,
    /// Bytes taken from the chunk.
    pub len: u32,
}

/// Split `data` into consecutive slices of at most `max_chunk_size` bytes.
///
/// Every slice but the last is exactly `max_chunk_size` long. Empty input
/// yields no slices.
pub fn split(data: &[u8], max_chunk_size: u32) -> Result<Vec<&[u8]>, CodecError> {
    if max_chunk_size == 0 {
        return Err(CodecError::ZeroChunkSize);
    }
    Ok(data.chunks(max_chunk_size as usize).collect())
}

/// Absolute start offset of every chunk.
pub fn chunk_starts(chunk_lengths: &[u32]) -> Vec<u64> {
    let mut acc = 0u64;
    chunk_lengths
        .iter()
        .map(|len| {
            let start = acc;
            acc += u64::from(*len);
            start
        })
        .collect()
}

/// Identify which chunks intersect `[offset, offset + length)`.
///
/// The result is ordered by chunk index. Portions of the range past the end
/// of the chunk list are silently dropped, so a read past EOF yields a
/// shorter (possibly empty) span list rather than an error.
pub fn locate(offset: u64, length: u64, chunk_lengths: &[u32]) -> Result<Vec<ChunkSpan>, CodecError> {
    let end = offset
        .checked_add(length)
        .ok_or(CodecError::InvalidRange { offset, length })?;

    let mut spans = Vec::new();
    if length == 0 {
        return Ok(spans);
    }

    let mut chunk_start = 0u64;
    for (index, len) in chunk_lengths.iter().enumerate() {
        let chunk_end = chunk_start + u64::from(*len);
        if chunk_end <= offset {
            chunk_start = chunk_end;
            continue;
        }
        if chunk_start >= end {
            break;
        }
        let from = offset.max(chunk_start);
        let to = end.min(chunk_end);
        spans.push(ChunkSpan {
            index,
            start: (from - chunk_start) as u32,
            len: (to - from) as u32,
        });
        chunk_start = chunk_end;
    }
    Ok(spans)
}
