//! Wire framing
//!
//! Every event travels as `[varint header][payload]`. The header is the unsigned
//! LEB128 encoding of `(length << 1) | transformed`, and the payload is the
//! little-endian `i32` type id followed by the serialized event. When the
//! transformed bit is set the whole payload went through the session's channel
//! transform.

use smallvec::SmallVec;

use crate::errors::WireError;
use crate::event::Event;
use crate::factory::EventFactory;
use crate::Result;

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Longest varint accepted for a `u64`
pub const MAX_VARINT_LEN: usize = 10;

/// Size of the type id that starts every payload
pub const TYPE_ID_LEN: usize = 4;

// ----------------------------------------------------------------------------
// Varint
// ----------------------------------------------------------------------------

/// Least-significant-group-first variable length integers
pub mod varint {
    use super::MAX_VARINT_LEN;
    use crate::errors::WireError;
    use crate::Result;

    /// Append `value` to `out`
    pub fn write_u64(out: &mut impl Extend<u8>, mut value: u64) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                out.extend(core::iter::once(byte));
                return;
            }
            out.extend(core::iter::once(byte | 0x80));
        }
    }

    /// Number of bytes `value` occupies
    pub fn encoded_len(mut value: u64) -> usize {
        let mut len = 1;
        while value >= 0x80 {
            value >>= 7;
            len += 1;
        }
        len
    }

    /// Decode from the front of `bytes` without consuming.
    ///
    /// Returns `Ok(None)` when `bytes` ends before the terminating byte.
    pub fn peek_u64(bytes: &[u8]) -> Result<Option<(u64, usize)>> {
        let mut value = 0u64;
        for (index, byte) in bytes.iter().enumerate() {
            if index >= MAX_VARINT_LEN {
                break;
            }
            let group = (byte & 0x7f) as u64;
            if index == MAX_VARINT_LEN - 1 && group > 1 {
                return Err(WireError::MalformedHeader {
                    reason: "varint overflows u64".to_string(),
                }
                .into());
            }
            value |= group << (7 * index);
            if byte & 0x80 == 0 {
                return Ok(Some((value, index + 1)));
            }
        }
        if bytes.len() >= MAX_VARINT_LEN {
            return Err(WireError::MalformedHeader {
                reason: "varint longer than 10 bytes".to_string(),
            }
            .into());
        }
        Ok(None)
    }

    /// Decode from the front of `input`, advancing it
    pub fn read_u64(input: &mut &[u8]) -> Result<u64> {
        match peek_u64(input)? {
            Some((value, consumed)) => {
                *input = &input[consumed..];
                Ok(value)
            }
            None => Err(WireError::MalformedHeader {
                reason: "truncated varint".to_string(),
            }
            .into()),
        }
    }
}

// ----------------------------------------------------------------------------
// Frame Header
// ----------------------------------------------------------------------------

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Payload length in bytes
    pub length: usize,
    /// Whether the payload went through the channel transform
    pub transformed: bool,
}

impl FrameHeader {
    pub fn new(length: usize, transformed: bool) -> Self {
        Self {
            length,
            transformed,
        }
    }

    /// Encoded header bytes
    pub fn encode(&self) -> SmallVec<[u8; MAX_VARINT_LEN]> {
        let mut out = SmallVec::new();
        let word = ((self.length as u64) << 1) | self.transformed as u64;
        varint::write_u64(&mut out, word);
        out
    }

    /// Parse a header from the front of `bytes` without consuming.
    ///
    /// Returns the header and its encoded size, or `None` if more bytes are needed.
    pub fn peek(bytes: &[u8], max_len: usize) -> Result<Option<(FrameHeader, usize)>> {
        let Some((word, consumed)) = varint::peek_u64(bytes)? else {
            return Ok(None);
        };
        let length = (word >> 1) as usize;
        if length > max_len {
            return Err(WireError::FrameTooLarge {
                length,
                max: max_len,
            }
            .into());
        }
        Ok(Some((FrameHeader::new(length, word & 1 == 1), consumed)))
    }
}

// ----------------------------------------------------------------------------
// Wire Buffer
// ----------------------------------------------------------------------------

/// One framed event ready for the transport
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WireBuffer {
    pub header: SmallVec<[u8; MAX_VARINT_LEN]>,
    pub body: Vec<u8>,
}

impl WireBuffer {
    /// Frame `body`, which has already been transformed if `transformed` is set
    pub fn new(body: Vec<u8>, transformed: bool) -> Self {
        let header = FrameHeader::new(body.len(), transformed).encode();
        Self { header, body }
    }

    /// Total bytes on the wire
    pub fn len(&self) -> usize {
        self.header.len() + self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append the framed bytes to `out`
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.header);
        out.extend_from_slice(&self.body);
    }

    /// Give the body allocation back for reuse
    pub fn into_body(self) -> Vec<u8> {
        self.body
    }
}

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// A complete frame cut out of the receive stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub transformed: bool,
    pub payload: Vec<u8>,
}

// ----------------------------------------------------------------------------
// Frame Codec
// ----------------------------------------------------------------------------

/// Event <-> payload conversion
pub struct FrameCodec;

impl FrameCodec {
    /// Serialize `event` as `[i32 type id][fields]` into `out`
    pub fn encode_payload(event: &dyn Event, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&event.event_type().to_le_bytes());
        event.serialize(out)
    }

    /// Read the type id at the front of a payload
    pub fn peek_type_id(payload: &[u8]) -> Result<i32> {
        if payload.len() < TYPE_ID_LEN {
            return Err(WireError::PayloadTooShort {
                expected: TYPE_ID_LEN,
                actual: payload.len(),
            }
            .into());
        }
        let mut id = [0u8; TYPE_ID_LEN];
        id.copy_from_slice(&payload[..TYPE_ID_LEN]);
        Ok(i32::from_le_bytes(id))
    }

    /// Decode a payload into a fresh event created by `factory`
    pub fn decode_payload(payload: &[u8], factory: &EventFactory) -> Result<Box<dyn Event>> {
        let type_id = Self::peek_type_id(payload)?;
        let mut event = factory
            .create(type_id)
            .ok_or(WireError::UnknownType { type_id })?;
        let mut input = &payload[TYPE_ID_LEN..];
        event.deserialize(&mut input)?;
        Ok(event)
    }

    /// Encode and frame `event` without any transform
    pub fn encode_frame(event: &dyn Event) -> Result<WireBuffer> {
        let mut body = Vec::new();
        Self::encode_payload(event, &mut body)?;
        Ok(WireBuffer::new(body, false))
    }
}

// ----------------------------------------------------------------------------
// Reassembly Buffer
// ----------------------------------------------------------------------------

/// Receive-side buffer that cuts complete frames out of a byte stream.
///
/// Parsing is speculative: a partial header or body leaves the read position
/// untouched so the next read can complete it.
#[derive(Debug, Default)]
pub struct ReassemblyBuffer {
    bytes: Vec<u8>,
    position: usize,
}

impl ReassemblyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes received from the transport
    pub fn extend(&mut self, data: &[u8]) {
        if self.position > 0 && self.position == self.bytes.len() {
            self.bytes.clear();
            self.position = 0;
        }
        self.bytes.extend_from_slice(data);
    }

    /// Bytes buffered but not yet consumed
    pub fn pending(&self) -> usize {
        self.bytes.len() - self.position
    }

    /// Cut the next complete frame, or `None` if more bytes are needed
    pub fn next_frame(&mut self, max_len: usize) -> Result<Option<Frame>> {
        let available = &self.bytes[self.position..];
        let Some((header, header_len)) = FrameHeader::peek(available, max_len)? else {
            return Ok(None);
        };
        if available.len() < header_len + header.length {
            return Ok(None);
        }
        let start = header_len;
        let payload = available[start..start + header.length].to_vec();
        self.position += header_len + header.length;
        self.compact();
        Ok(Some(Frame {
            transformed: header.transformed,
            payload,
        }))
    }

    /// Drop everything buffered
    pub fn clear(&mut self) {
        self.bytes.clear();
        self.position = 0;
    }

    fn compact(&mut self) {
        if self.position == self.bytes.len() {
            self.bytes.clear();
            self.position = 0;
        } else if self.position > 4096 && self.position * 2 > self.bytes.len() {
            self.bytes.drain(..self.position);
            self.position = 0;
        }
    }
}
