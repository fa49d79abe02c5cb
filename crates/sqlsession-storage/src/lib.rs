//! sqlsession Storage Primitives
//!
//! Byte-level building blocks used by the session-state engine:
//! - Payload codec (session record <-> sentinel-terminated buffer)
//! - Deflate stream filter for optional payload compression
//! - Fixed-size block look-aside pool
//! - Payload tiering, block splitting and chunk reassembly

pub mod buffer_pool;
pub mod chunking;
pub mod codec;
pub mod compression;
pub mod error;

pub use buffer_pool::BlockPool;
pub use chunking::{
    BlockRecord, Chunk, ITEM_BLOCK_LENGTH, ITEM_BLOCK_MAX_PARAMS, ITEM_MEDIUM_LENGTH,
    PayloadTier, large_records, medium_parameters, reassemble,
};
pub use codec::{DEFAULT_MAX_PAYLOAD_BYTES, END_OF_STREAM, EncodedPayload, PayloadCodec};
pub use error::{StorageError, StorageResult};
