//! Session payload codec
//!
//! Layout of an uncompressed payload:
//!
//! ```text
//! timeout: i32 LE | has_items: u8 | has_static_objects: u8
//! [items]            u32 count, then per entry: u32 key len, key, u32 value len, JSON value
//! [static objects]   u32 len, bytes
//! 0xFF
//! ```
//!
//! With compression the whole buffer above is deflated and one more `0xFF` is
//! appended outside the compressed stream, so a truncated row is detected
//! before decompression is even attempted.

use bytes::{Buf, BufMut};
use serde_json::Value;
use sqlsession_core::{Error, Result, SessionItems, SessionRecord, StaticObjects};

use crate::compression;

/// Trailing marker that survives backing stores trimming trailing zeros
pub const END_OF_STREAM: u8 = 0xFF;

/// Default ceiling on encoded payload size
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 64 * 1024 * 1024;

/// Encoded session payload, always ending in [`END_OF_STREAM`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPayload {
    bytes: Vec<u8>,
}

impl EncodedPayload {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.bytes
    }
}

impl AsRef<[u8]> for EncodedPayload {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

/// Encodes and decodes session records
#[derive(Debug, Clone, Copy)]
pub struct PayloadCodec {
    compression_enabled: bool,
    max_payload_bytes: usize,
}

impl PayloadCodec {
    pub fn new(compression_enabled: bool) -> Self {
        Self {
            compression_enabled,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }

    /// Set the largest encoded payload accepted by [`PayloadCodec::encode`]
    pub fn with_max_payload_bytes(mut self, max_payload_bytes: usize) -> Self {
        self.max_payload_bytes = max_payload_bytes;
        self
    }

    pub fn compression_enabled(&self) -> bool {
        self.compression_enabled
    }

    /// Encode a record
    ///
    /// # Errors
    /// - `Error::PayloadTooLarge` if the encoded payload exceeds the ceiling
    pub fn encode(&self, record: &SessionRecord) -> Result<EncodedPayload> {
        let mut buffer = Vec::with_capacity(256);
        write_record(record, &mut buffer)?;

        if self.compression_enabled {
            buffer = compression::compress(&buffer)?;
            buffer.put_u8(END_OF_STREAM);
        }

        if buffer.len() > self.max_payload_bytes {
            return Err(Error::PayloadTooLarge {
                size: buffer.len(),
                limit: self.max_payload_bytes,
            });
        }

        Ok(EncodedPayload { bytes: buffer })
    }

    /// Decode a record
    ///
    /// # Errors
    /// - `Error::InvalidSessionState` for a missing marker, a truncated
    ///   stream, trailing bytes or an undecodable value
    pub fn decode(&self, buffer: &[u8]) -> Result<SessionRecord> {
        if !self.compression_enabled {
            return read_record(buffer);
        }

        let Some((&marker, compressed)) = buffer.split_last() else {
            return Err(invalid("empty payload"));
        };
        if marker != END_OF_STREAM {
            return Err(invalid("missing end-of-stream marker"));
        }

        let inflated = compression::decompress(compressed)?;
        read_record(&inflated)
    }
}

fn invalid(reason: impl Into<String>) -> Error {
    Error::InvalidSessionState(reason.into())
}

fn length_prefix(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::PayloadTooLarge {
        size: len,
        limit: u32::MAX as usize,
    })
}

fn write_record(record: &SessionRecord, out: &mut Vec<u8>) -> Result<()> {
    let has_items = !record.items.is_empty();
    let static_objects = record.static_objects.bytes();

    out.put_i32_le(record.timeout_minutes);
    out.put_u8(u8::from(has_items));
    out.put_u8(u8::from(static_objects.is_some()));

    if has_items {
        out.put_u32_le(length_prefix(record.items.len())?);
        for (key, value) in record.items.iter() {
            out.put_u32_le(length_prefix(key.len())?);
            out.put_slice(key.as_bytes());

            let json = serde_json::to_vec(value)
                .map_err(|e| invalid(format!("item '{}' cannot be serialized: {}", key, e)))?;
            out.put_u32_le(length_prefix(json.len())?);
            out.put_slice(&json);
        }
    }

    if let Some(bytes) = static_objects {
        out.put_u32_le(length_prefix(bytes.len())?);
        out.put_slice(bytes);
    }

    out.put_u8(END_OF_STREAM);
    Ok(())
}

fn read_record(buffer: &[u8]) -> Result<SessionRecord> {
    let mut reader = Reader { buf: buffer };

    let timeout_minutes = reader.i32()?;
    let has_items = reader.flag()?;
    let has_static_objects = reader.flag()?;

    let mut items = SessionItems::new();
    if has_items {
        let count = reader.u32()?;
        for _ in 0..count {
            let key = reader.bytes()?;
            let key = std::str::from_utf8(key).map_err(|_| invalid("item key is not UTF-8"))?;
            let value: Value = serde_json::from_slice(reader.bytes()?)
                .map_err(|e| invalid(format!("item '{}' is not valid JSON: {}", key, e)))?;
            items.insert(key, value);
        }
    }

    let static_objects = if has_static_objects {
        StaticObjects::from_bytes(reader.bytes()?.to_vec())
    } else {
        StaticObjects::untouched()
    };

    if reader.u8()? != END_OF_STREAM {
        return Err(invalid("missing end-of-stream marker"));
    }
    if reader.buf.has_remaining() {
        return Err(invalid(format!(
            "{} unexpected bytes after end-of-stream marker",
            reader.buf.remaining()
        )));
    }

    Ok(SessionRecord {
        timeout_minutes,
        items,
        static_objects,
    })
}

/// Bounds-checked cursor; every short read is an invalid payload
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn need(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(invalid("unexpected end of stream"));
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn flag(&mut self) -> Result<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(invalid(format!("invalid flag byte {:#04x}", other))),
        }
    }

    fn i32(&mut self) -> Result<i32> {
        self.need(4)?;
        Ok(self.buf.get_i32_le())
    }

    fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    fn bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.u32()? as usize;
        self.need(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }
}
