use crate::error::TransportError;
use bytes::BufMut;
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use std::fmt::{Debug, Formatter};

pub const HEADER_SIZE: usize = 16;

const SEQ_ID_OFFSET: usize = 0;
const PAYLOAD_SIZE_OFFSET: usize = 4;
const IS_EOF_OFFSET: usize = 8;
const PAYLOAD_OFFSET: usize = HEADER_SIZE;

const MARKER_NOT_EOF: u8 = 0x00;
const MARKER_EOF: u8 = 0x01;

/// The wire unit exchanged over the raw stream: a fixed 16-byte header followed
/// by `payload_size` bytes of payload.
///
/// ```ascii
/// bytes[0..4)   seq_id       i32 BE, >= 0, starts at 0 per message
/// bytes[4..8)   payload_size i32 BE, >= 0
/// bytes[8]      is_eof       0x00 = more chunks follow, 0x01 = last chunk
/// bytes[9..16)  reserved     present on the wire, ignored by the decoder
/// bytes[16..)   payload
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct Chunk {
    bytes: Vec<u8>,
}

impl Chunk {
    /// Creates a chunk carrying `content[start_idx..start_idx + payload_size]`
    /// with the header prefixed.
    pub fn new(content: &[u8], start_idx: usize, payload_size: usize, is_eof: bool, seq_id: i32) -> Chunk {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + payload_size);
        bytes.put_i32(seq_id);
        bytes.put_i32(prechecked_i32(payload_size));
        bytes.put_u8(if is_eof { MARKER_EOF } else { MARKER_NOT_EOF });
        bytes.put_bytes(0, HEADER_SIZE - IS_EOF_OFFSET - 1);
        bytes.put_slice(&content[start_idx..start_idx + payload_size]);
        Chunk { bytes }
    }

    /// The synthetic end-of-message chunk: no payload, `is_eof` set.
    pub fn empty(seq_id: i32) -> Chunk {
        Chunk::new(&[], 0, 0, true, seq_id)
    }

    /// Reconstructs a chunk from wire bytes, rejecting anything that does not
    /// hold a complete, sane header plus the payload it declares.
    pub fn from_raw_bytes(bytes: Vec<u8>) -> Result<Chunk, TransportError> {
        if bytes.len() < HEADER_SIZE {
            return Err(TransportError::MalformedChunk(format!(
                "at least {} bytes needed to create a chunk, got {}",
                HEADER_SIZE,
                bytes.len()
            )));
        }
        let chunk = Chunk { bytes };
        chunk.sanity_check()?;
        Ok(chunk)
    }

    fn sanity_check(&self) -> Result<(), TransportError> {
        let payload_size = self.payload_size();
        if payload_size < 0 {
            return Err(TransportError::MalformedChunk(format!(
                "negative payload size {}",
                payload_size
            )));
        }
        let expected_min_len = HEADER_SIZE as u64 + payload_size as u64;
        if (self.bytes.len() as u64) < expected_min_len {
            return Err(TransportError::MalformedChunk(format!(
                "{} bytes is shorter than the {} bytes implied by the header",
                self.bytes.len(),
                expected_min_len
            )));
        }
        if self.seq_id() < 0 {
            return Err(TransportError::MalformedChunk(format!(
                "negative seq id {}",
                self.seq_id()
            )));
        }
        Ok(())
    }

    pub fn seq_id(&self) -> i32 {
        read_i32(&self.bytes[SEQ_ID_OFFSET..SEQ_ID_OFFSET + 4])
    }

    pub fn payload_size(&self) -> i32 {
        read_i32(&self.bytes[PAYLOAD_SIZE_OFFSET..PAYLOAD_SIZE_OFFSET + 4])
    }

    pub fn is_eof(&self) -> bool {
        self.bytes[IS_EOF_OFFSET] == MARKER_EOF
    }

    /// True when the chunk carries no payload at all.
    pub fn is_empty(&self) -> bool {
        self.bytes.len() <= HEADER_SIZE
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[PAYLOAD_OFFSET..PAYLOAD_OFFSET + self.payload_size() as usize]
    }

    /// The full wire representation, header included.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Debug for Chunk {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Chunk{{seq:{} len:{} eof:{}}}",
            self.seq_id(),
            self.payload_size(),
            self.is_eof()
        )
    }
}

/// Reads the declared payload size out of a (possibly partial) buffer that
/// holds at least the first 8 header bytes.
pub(crate) fn peek_payload_size(header: &[u8]) -> Result<i32, TransportError> {
    let mut buf = header.get(PAYLOAD_SIZE_OFFSET..).ok_or_else(|| {
        TransportError::MalformedChunk(format!(
            "{} bytes is too short to hold the payload size field",
            header.len()
        ))
    })?;
    buf.try_get_u32()
        .map(|v| v as i32)
        .map_err(|e| TransportError::MalformedChunk(format!("truncated payload size field: {}", e)))
}

fn read_i32(bytes: &[u8]) -> i32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[..4]);
    i32::from_be_bytes(raw)
}

fn prechecked_i32(val: usize) -> i32 {
    val.try_into()
        .expect("this is a bug: chunk sizes are bounded by the configured chunk size")
}
