//! Compression filter for session payloads

use crate::error::{StorageError, StorageResult};
use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use std::io::{Read, Write};

/// Deflate `data` into a raw stream
pub fn compress(data: &[u8]) -> StorageResult<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(data.len() / 2), Compression::fast());

    encoder
        .write_all(data)
        .map_err(|e| StorageError::Compression(format!("Deflate write error: {}", e)))?;

    encoder
        .finish()
        .map_err(|e| StorageError::Compression(format!("Deflate finish error: {}", e)))
}

/// Inflate a raw deflate stream
pub fn decompress(data: &[u8]) -> StorageResult<Vec<u8>> {
    let mut decoder = DeflateDecoder::new(data);

    let mut decompressed = Vec::with_capacity(data.len() * 2);
    decoder
        .read_to_end(&mut decompressed)
        .map_err(|e| StorageError::Compression(format!("Deflate read error: {}", e)))?;

    Ok(decompressed)
}
