//! Message-oriented transport over a reliable duplex byte stream.
//!
//! The underlying stream (TCP, Unix socket, an in-memory duplex for tests)
//! delivers an undifferentiated sequence of bytes; this crate turns it into a
//! carrier of discrete, arbitrarily long *messages*. Each message is sliced
//! into chunks of bounded size, the chunks are framed with a fixed header and
//! written sequentially, and the receiver re-cuts the byte stream into chunks
//! and reassembles the original message.
//!
//! ## Wire format
//!
//! A chunk is a fixed 16-byte header followed by its payload, all numbers in
//! network byte order (BE):
//!
//! ```ascii
//!  0: seq_id (i32) - position of this chunk within its message, starting
//!      at 0 for every message
//!  4: payload_size (i32) - number of payload bytes following the header
//!  8: is_eof (u8) - 0x01 on the last chunk of a message, 0x00 otherwise
//!  9: reserved (7 bytes) - transmitted, ignored by the decoder
//! 16: payload
//! ```
//!
//! A zero-length message is transmitted as a single chunk with
//! `payload_size = 0` and `is_eof = 1`, so empty messages survive the round
//! trip like any other.
//!
//! ## Architecture
//!
//! [BufferedStream] is the main entry point. It owns the raw stream
//! exclusively and pairs a [SendBuffer] with a [RecvBuffer], each running one
//! dedicated worker task:
//!
//! * the send worker drains a bounded message queue (capacity 1 by default,
//!   which makes `write()` the backpressure point), slices each message into
//!   chunks and writes them in batches, paced by a [RateMonitor];
//! * the receive worker does rate-limited reads, stitches chunks back
//!   together across arbitrary read boundaries and parks completed messages
//!   in a bounded queue for `read()`.
//!
//! Fatal conditions (I/O errors, the peer closing the stream, a worker
//! panic) stop the affected worker permanently and are reported through an
//! [ErrorHandler] callback; reconnecting is the owner's business, a stopped
//! stream is simply discarded.
//!
//! For multiplexing several logical lanes over one carrier, [Channel] and
//! [ChannelGroup] provide per-channel queues and reassembly state plus fair
//! round-robin selection of the next channel to transmit from. Channels do no
//! I/O themselves; the carrier's owner moves chunks between the group and the
//! stream.
//!
//! ## Scope
//!
//! This layer assumes the byte stream is reliable and ordered and adds no
//! retransmission or resynchronization of its own. A chunk arriving with an
//! unexpected seq id is dropped with a warning. Encryption, authentication
//! and peer management live in other layers.

mod buffer_pool;
mod buffered_stream;
mod channel;
mod chunk;
mod config;
mod error;
mod rate_monitor;
mod raw_stream;
mod recv_buffer;
mod send_buffer;
mod workspace;

pub use buffer_pool::BufferPool;
pub use buffered_stream::BufferedStream;
pub use channel::{Channel, ChannelGroup, ChannelId};
pub use chunk::{Chunk, HEADER_SIZE};
pub use config::{
    ChannelConfig, RecvBufferConfig, SendBufferConfig, TransportConfig, DEFAULT_RATE_LIMIT,
    MAX_BLOCK_MESSAGE_SIZE, MAX_CHUNK_SIZE, MAX_NORMAL_MESSAGE_SIZE,
};
pub use error::{ErrorHandler, TransportError};
pub use rate_monitor::RateMonitor;
pub use raw_stream::{RawStream, StreamTransport};
pub use recv_buffer::RecvBuffer;
pub use send_buffer::SendBuffer;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor(unsafe)]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
