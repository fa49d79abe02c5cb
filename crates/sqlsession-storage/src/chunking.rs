//! Payload tiering, block splitting and chunk reassembly
//!
//! Encoded payloads travel to the backing store in one of three shapes picked
//! purely from their length:
//!
//! | Tier   | Length                | Wire shape                                   |
//! |--------|-----------------------|----------------------------------------------|
//! | Small  | `<= 7000`             | one binary parameter                          |
//! | Medium | `7001 ..= 63000`      | nine binary parameters, unused ones null      |
//! | Large  | `> 63000`             | one argument carrying `(sequence_id, block)`  |
//!
//! Reads may come back as unordered chunk rows; they are sorted by
//! `sequence_id` before concatenation.

use crate::buffer_pool::BlockPool;
use crate::error::{StorageError, StorageResult};

/// Size of one payload block
pub const ITEM_BLOCK_LENGTH: usize = 7000;

/// Number of block parameters of the medium-tier call
pub const ITEM_BLOCK_MAX_PARAMS: usize = 9;

/// Largest payload that fits the medium tier
pub const ITEM_MEDIUM_LENGTH: usize = ITEM_BLOCK_LENGTH * ITEM_BLOCK_MAX_PARAMS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadTier {
    Small,
    Medium,
    Large,
}

impl PayloadTier {
    /// Select the tier for an encoded payload of `length` bytes
    pub fn for_length(length: usize) -> Self {
        if length <= ITEM_BLOCK_LENGTH {
            PayloadTier::Small
        } else if length <= ITEM_MEDIUM_LENGTH {
            PayloadTier::Medium
        } else {
            PayloadTier::Large
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadTier::Small => "small",
            PayloadTier::Medium => "medium",
            PayloadTier::Large => "large",
        }
    }
}

/// One block of an outgoing large-tier payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRecord<'a> {
    /// 1-based position of the block
    pub sequence_id: i32,
    pub block: &'a [u8],
}

/// One block of an incoming payload, backed by a pooled buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub sequence_id: i32,
    pub block: Vec<u8>,
}

/// Split a medium-tier payload into the nine block parameters.
///
/// Trailing parameters beyond the payload are `None`.
pub fn medium_parameters(buffer: &[u8]) -> StorageResult<[Option<&[u8]>; ITEM_BLOCK_MAX_PARAMS]> {
    if buffer.len() > ITEM_MEDIUM_LENGTH {
        return Err(StorageError::InvalidData(format!(
            "{} bytes does not fit {} block parameters",
            buffer.len(),
            ITEM_BLOCK_MAX_PARAMS
        )));
    }

    let mut params = [None; ITEM_BLOCK_MAX_PARAMS];
    for (slot, block) in params.iter_mut().zip(buffer.chunks(ITEM_BLOCK_LENGTH)) {
        *slot = Some(block);
    }
    Ok(params)
}

/// Split a large-tier payload into sequenced block records
pub fn large_records(buffer: &[u8]) -> Vec<BlockRecord<'_>> {
    buffer
        .chunks(ITEM_BLOCK_LENGTH)
        .zip(1..)
        .map(|(block, sequence_id)| BlockRecord { sequence_id, block })
        .collect()
}

/// Concatenate chunks in `sequence_id` order and hand their blocks back to `pool`.
///
/// The chunk set must be 1-based and contiguous once sorted; anything else is
/// reported as invalid data rather than silently stitched together.
pub fn reassemble(mut chunks: Vec<Chunk>, pool: &BlockPool) -> StorageResult<Vec<u8>> {
    // Rows come back unordered
    chunks.sort_unstable_by_key(|chunk| chunk.sequence_id);

    let gap = chunks
        .iter()
        .zip(1..)
        .find(|(chunk, expected)| chunk.sequence_id != *expected)
        .map(|(chunk, expected)| (chunk.sequence_id, expected));

    if let Some((found, expected)) = gap {
        tracing::warn!(
            chunks = chunks.len(),
            "Chunk sequence broken: expected {} but found {}",
            expected,
            found
        );
        for chunk in chunks {
            pool.release(chunk.block);
        }
        return Err(StorageError::InvalidData(format!(
            "chunk sequence broken: expected {} but found {}",
            expected, found
        )));
    }

    let total: usize = chunks.iter().map(|chunk| chunk.block.len()).sum();
    let mut buffer = Vec::with_capacity(total);
    for chunk in chunks {
        buffer.extend_from_slice(&chunk.block);
        pool.release(chunk.block);
    }
    Ok(buffer)
}
