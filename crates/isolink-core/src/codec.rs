//! Binary codec for channel values
//!
//! A value is encoded as a flat byte stream plus a side table of attachments.
//! Handles and native buffers never enter the byte stream; the stream carries
//! a `u32` index into the side table instead, and the attachments travel next
//! to the bytes so the receiver gets the very same resources.
//!
//! Layout (all fixed-width fields little-endian):
//!
//! | Tag | Kind    | Payload                                   |
//! |-----|---------|-------------------------------------------|
//! | 0   | Null    | -                                         |
//! | 1   | False   | -                                         |
//! | 2   | True    | -                                         |
//! | 3   | I64     | 8 bytes                                   |
//! | 4   | F64     | 8 bytes                                   |
//! | 5   | String  | u32 length + UTF-8 bytes                  |
//! | 6   | Bytes   | u32 length + raw bytes                    |
//! | 7   | List    | u32 count + values                        |
//! | 8   | Map     | u32 count + key/value pairs in order      |
//! | 9   | Handle  | u32 attachment index                      |
//! | 10  | Buffer  | u32 attachment index                      |
//!
//! Unknown tags are rejected.

use crate::handle::HandleRef;
use crate::value::{BufferRef, Value, ValueMap};
use thiserror::Error;

/// Default nesting limit for lists and maps
pub const DEFAULT_MAX_DEPTH: usize = 64;

/// Value tags
mod tag {
    pub const NULL: u8 = 0;
    pub const FALSE: u8 = 1;
    pub const TRUE: u8 = 2;
    pub const I64: u8 = 3;
    pub const F64: u8 = 4;
    pub const STRING: u8 = 5;
    pub const BYTES: u8 = 6;
    pub const LIST: u8 = 7;
    pub const MAP: u8 = 8;
    pub const HANDLE: u8 = 9;
    pub const BUFFER: u8 = 10;
}

/// Errors that can occur while encoding or decoding a value
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    /// Unexpected end of input
    #[error("Unexpected end of input at offset {0}")]
    UnexpectedEnd(usize),

    /// Tag byte not known to this codec version
    #[error("Unknown value tag {0} at offset {1}")]
    UnknownTag(u8, usize),

    /// String payload is not valid UTF-8
    #[error("Invalid UTF-8 string at offset {0}")]
    InvalidUtf8(usize),

    /// Attachment index out of range or of the wrong kind
    #[error("Invalid {expected} attachment index {index}")]
    InvalidAttachment {
        /// Index read from the stream
        index: u32,
        /// Attachment kind the tag asked for
        expected: &'static str,
    },

    /// Nesting deeper than the configured limit
    #[error("Maximum nesting depth exceeded: {0}")]
    MaxDepthExceeded(usize),

    /// Length or count does not fit the u32 wire field
    #[error("Length {0} exceeds the wire limit")]
    TooLarge(usize),

    /// Bytes left over after a complete value
    #[error("Trailing bytes after value at offset {0}")]
    TrailingBytes(usize),
}

/// Codec configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecOptions {
    /// Maximum list/map nesting accepted on encode and decode
    pub max_depth: usize,
}

impl Default for CodecOptions {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl CodecOptions {
    /// Set the maximum nesting depth
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }
}

/// Out-of-band resource accompanying an encoded byte stream
#[derive(Debug, Clone, PartialEq)]
pub enum Attachment {
    /// Native handle proxy
    Handle(HandleRef),
    /// Shared native buffer
    Buffer(BufferRef),
}

/// Encoded value: primary byte stream plus its side table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Encoded {
    /// Primary byte stream
    pub bytes: Vec<u8>,
    /// Side table referenced by handle/buffer tags
    pub attachments: Vec<Attachment>,
}

impl Encoded {
    /// Wrap raw bytes that carry no attachments
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            attachments: Vec::new(),
        }
    }

    /// Check whether the side table is empty
    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }
}

/// Serialize a value
pub fn serialize(value: &Value, options: &CodecOptions) -> Result<Encoded, CodecError> {
    let mut writer = ValueWriter::new(options.max_depth);
    writer.write_value(value)?;
    Ok(writer.finish())
}

/// Deserialize a value from bytes and the side table that came with them
pub fn deserialize(
    bytes: &[u8],
    attachments: &[Attachment],
    options: &CodecOptions,
) -> Result<Value, CodecError> {
    let mut reader = ValueReader::new(bytes, attachments, options.max_depth);
    let value = reader.read_value()?;
    if reader.has_more() {
        return Err(CodecError::TrailingBytes(reader.position()));
    }
    Ok(value)
}

// ============================================================================
// Writer
// ============================================================================

/// Value writer
///
/// Emits values into a byte buffer and collects attachments on the side.
pub struct ValueWriter {
    buffer: Vec<u8>,
    attachments: Vec<Attachment>,
    max_depth: usize,
    depth: usize,
}

impl ValueWriter {
    /// Create a new writer
    pub fn new(max_depth: usize) -> Self {
        Self {
            buffer: Vec::new(),
            attachments: Vec::new(),
            max_depth,
            depth: 0,
        }
    }

    /// Consume the writer and return the encoded value
    pub fn finish(self) -> Encoded {
        Encoded {
            bytes: self.buffer,
            attachments: self.attachments,
        }
    }

    // ===== Basic Emission =====

    fn emit_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    fn emit_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    fn emit_i64(&mut self, value: i64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    fn emit_f64(&mut self, value: f64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    fn emit_len(&mut self, len: usize) -> Result<(), CodecError> {
        let len = u32::try_from(len).map_err(|_| CodecError::TooLarge(len))?;
        self.emit_u32(len);
        Ok(())
    }

    fn emit_bytes(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        self.emit_len(bytes.len())?;
        self.buffer.extend_from_slice(bytes);
        Ok(())
    }

    fn emit_attachment(&mut self, attachment: Attachment) -> Result<(), CodecError> {
        let index = self.attachments.len();
        self.emit_len(index)?;
        self.attachments.push(attachment);
        Ok(())
    }

    // ===== Values =====

    /// Write a single value
    pub fn write_value(&mut self, value: &Value) -> Result<(), CodecError> {
        match value {
            Value::Null => self.emit_u8(tag::NULL),
            Value::Bool(false) => self.emit_u8(tag::FALSE),
            Value::Bool(true) => self.emit_u8(tag::TRUE),
            Value::I64(i) => {
                self.emit_u8(tag::I64);
                self.emit_i64(*i);
            }
            Value::F64(f) => {
                self.emit_u8(tag::F64);
                self.emit_f64(*f);
            }
            Value::String(s) => {
                self.emit_u8(tag::STRING);
                self.emit_bytes(s.as_bytes())?;
            }
            Value::Bytes(bytes) => {
                self.emit_u8(tag::BYTES);
                self.emit_bytes(bytes)?;
            }
            Value::List(items) => {
                self.enter()?;
                self.emit_u8(tag::LIST);
                self.emit_len(items.len())?;
                for item in items {
                    self.write_value(item)?;
                }
                self.depth -= 1;
            }
            Value::Map(map) => {
                self.enter()?;
                self.emit_u8(tag::MAP);
                self.emit_len(map.len())?;
                for (key, value) in map.iter() {
                    self.write_value(key)?;
                    self.write_value(value)?;
                }
                self.depth -= 1;
            }
            Value::Handle(handle) => {
                self.emit_u8(tag::HANDLE);
                self.emit_attachment(Attachment::Handle(handle.clone()))?;
            }
            Value::Buffer(buffer) => {
                self.emit_u8(tag::BUFFER);
                self.emit_attachment(Attachment::Buffer(buffer.clone()))?;
            }
        }
        Ok(())
    }

    fn enter(&mut self) -> Result<(), CodecError> {
        if self.depth >= self.max_depth {
            return Err(CodecError::MaxDepthExceeded(self.max_depth));
        }
        self.depth += 1;
        Ok(())
    }
}

// ============================================================================
// Reader
// ============================================================================

/// Value reader
pub struct ValueReader<'a> {
    buffer: &'a [u8],
    attachments: &'a [Attachment],
    position: usize,
    max_depth: usize,
    depth: usize,
}

impl<'a> ValueReader<'a> {
    /// Create a new reader over bytes and their side table
    pub fn new(buffer: &'a [u8], attachments: &'a [Attachment], max_depth: usize) -> Self {
        Self {
            buffer,
            attachments,
            position: 0,
            max_depth,
            depth: 0,
        }
    }

    /// Get the current position in the buffer
    pub fn position(&self) -> usize {
        self.position
    }

    /// Check if there are more bytes to read
    pub fn has_more(&self) -> bool {
        self.position < self.buffer.len()
    }

    fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.position)
    }

    // ===== Basic Reading =====

    fn read_slice(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if len > self.remaining() {
            return Err(CodecError::UnexpectedEnd(self.position));
        }
        let slice = &self.buffer[self.position..self.position + len];
        self.position += len;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.read_slice(1)?[0])
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(self.read_slice(N)?);
        Ok(bytes)
    }

    fn read_u32(&mut self) -> Result<u32, CodecError> {
        self.read_array().map(u32::from_le_bytes)
    }

    fn read_i64(&mut self) -> Result<i64, CodecError> {
        self.read_array().map(i64::from_le_bytes)
    }

    fn read_f64(&mut self) -> Result<f64, CodecError> {
        self.read_array().map(f64::from_le_bytes)
    }

    fn read_bytes(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.read_u32()? as usize;
        self.read_slice(len)
    }

    fn read_handle(&mut self) -> Result<HandleRef, CodecError> {
        let index = self.read_u32()?;
        match self.attachments.get(index as usize) {
            Some(Attachment::Handle(handle)) => Ok(handle.clone()),
            _ => Err(CodecError::InvalidAttachment {
                index,
                expected: "handle",
            }),
        }
    }

    fn read_buffer(&mut self) -> Result<BufferRef, CodecError> {
        let index = self.read_u32()?;
        match self.attachments.get(index as usize) {
            Some(Attachment::Buffer(buffer)) => Ok(buffer.clone()),
            _ => Err(CodecError::InvalidAttachment {
                index,
                expected: "buffer",
            }),
        }
    }

    // ===== Values =====

    /// Read a single value
    pub fn read_value(&mut self) -> Result<Value, CodecError> {
        let offset = self.position;
        let tag = self.read_u8()?;
        let value = match tag {
            tag::NULL => Value::Null,
            tag::FALSE => Value::Bool(false),
            tag::TRUE => Value::Bool(true),
            tag::I64 => Value::I64(self.read_i64()?),
            tag::F64 => Value::F64(self.read_f64()?),
            tag::STRING => {
                let start = self.position;
                let bytes = self.read_bytes()?;
                let s = std::str::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8(start))?;
                Value::String(s.to_owned())
            }
            tag::BYTES => Value::Bytes(self.read_bytes()?.to_vec()),
            tag::LIST => {
                self.enter()?;
                let count = self.read_u32()? as usize;
                // Every element takes at least one byte
                let mut items = Vec::with_capacity(count.min(self.remaining()));
                for _ in 0..count {
                    items.push(self.read_value()?);
                }
                self.depth -= 1;
                Value::List(items)
            }
            tag::MAP => {
                self.enter()?;
                let count = self.read_u32()? as usize;
                let mut map = ValueMap::with_capacity(count.min(self.remaining() / 2));
                for _ in 0..count {
                    let key = self.read_value()?;
                    let value = self.read_value()?;
                    map.insert(key, value);
                }
                self.depth -= 1;
                Value::Map(map)
            }
            tag::HANDLE => Value::Handle(self.read_handle()?),
            tag::BUFFER => Value::Buffer(self.read_buffer()?),
            other => return Err(CodecError::UnknownTag(other, offset)),
        };
        Ok(value)
    }

    fn enter(&mut self) -> Result<(), CodecError> {
        if self.depth >= self.max_depth {
            return Err(CodecError::MaxDepthExceeded(self.max_depth));
        }
        self.depth += 1;
        Ok(())
    }
}
