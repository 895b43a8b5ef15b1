use crate::chunk::Chunk;
use crate::error::TransportError;

/// Send-side scratch state: the message currently being sliced into chunks.
///
/// A loaded zero-length message is different from "no message": it still emits
/// its single empty EOF chunk so the receiver sees the message boundary.
pub struct OutboundWorkspace {
    message: Option<Vec<u8>>,
    start_idx: usize,
    seq_id: i32,
}

impl OutboundWorkspace {
    pub fn new() -> OutboundWorkspace {
        OutboundWorkspace {
            message: None,
            start_idx: 0,
            seq_id: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.message.is_none()
    }

    /// Loads the next message. Callers must drain the workspace first.
    pub fn load(&mut self, message: Vec<u8>) {
        debug_assert!(self.message.is_none());
        self.message = Some(message);
        self.start_idx = 0;
        self.seq_id = 0;
    }

    /// Slices off the next chunk with at most `max_payload` payload bytes, or
    /// `None` if no message is loaded. The chunk completing the message carries
    /// the EOF marker, and emitting it resets the workspace.
    pub fn emit_chunk(&mut self, max_payload: usize) -> Option<Chunk> {
        let message = self.message.as_ref()?;

        let remaining = message.len() - self.start_idx;
        let payload_size = remaining.min(max_payload);
        let is_eof = remaining <= max_payload;
        let chunk = Chunk::new(message, self.start_idx, payload_size, is_eof, self.seq_id);

        if is_eof {
            self.message = None;
            self.start_idx = 0;
            self.seq_id = 0;
        }
        else {
            self.start_idx += payload_size;
            self.seq_id += 1;
        }
        Some(chunk)
    }

    /// Abandons the rest of the current message, e.g. after a write error.
    pub fn clear(&mut self) {
        self.message = None;
        self.start_idx = 0;
        self.seq_id = 0;
    }
}

/// Receive-side scratch state: payloads accumulated for the message currently
/// in flight, plus the chunk seq id expected next.
///
/// There is no resync protocol: a chunk with an unexpected seq id is dropped
/// and the accumulated bytes are kept, so a chunk that is genuinely lost by the
/// underlying stream stalls the current message permanently. The underlying
/// stream is assumed reliable, making loss a peer bug rather than a network
/// condition.
pub struct MessageAssembler {
    buf: Vec<u8>,
    initial_capacity: usize,
    expected_seq_id: i32,
    max_message_size: usize,
}

impl MessageAssembler {
    pub fn new(initial_capacity: usize, max_message_size: usize) -> MessageAssembler {
        MessageAssembler {
            buf: Vec::with_capacity(initial_capacity),
            initial_capacity,
            expected_seq_id: 0,
            max_message_size,
        }
    }

    /// Folds one chunk into the message under assembly. Returns the completed
    /// message on an EOF chunk, `None` while more chunks are needed.
    ///
    /// `SequenceMismatch` leaves the accumulated state untouched (the chunk is
    /// simply dropped); `MessageTooLarge` discards the accumulated message and
    /// resets for the next one.
    pub fn absorb(&mut self, chunk: &Chunk) -> Result<Option<Vec<u8>>, TransportError> {
        if chunk.seq_id() != self.expected_seq_id {
            return Err(TransportError::SequenceMismatch {
                expected: self.expected_seq_id,
                actual: chunk.seq_id(),
            });
        }

        let new_size = self.buf.len() + chunk.payload().len();
        if new_size > self.max_message_size {
            self.reset();
            return Err(TransportError::MessageTooLarge {
                size: new_size,
                max: self.max_message_size,
            });
        }

        self.buf.extend_from_slice(chunk.payload());
        self.expected_seq_id += 1;

        if chunk.is_eof() {
            let message = std::mem::replace(&mut self.buf, Vec::with_capacity(self.initial_capacity));
            self.expected_seq_id = 0;
            Ok(Some(message))
        }
        else {
            Ok(None)
        }
    }

    fn reset(&mut self) {
        self.buf = Vec::with_capacity(self.initial_capacity);
        self.expected_seq_id = 0;
    }
}
