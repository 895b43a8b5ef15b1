use crate::buffer_pool::BufferPool;
use crate::config::TransportConfig;
use crate::error::{ErrorHandler, TransportError};
use crate::raw_stream::RawStream;
use crate::recv_buffer::RecvBuffer;
use crate::send_buffer::SendBuffer;
use bytes::BytesMut;
use std::sync::Arc;
use tracing::debug;

/// Message-level façade over one exclusively owned raw byte stream: one
/// [SendBuffer] and one [RecvBuffer] sharing the stream, with this type being
/// the only writer and the only reader.
///
/// Lifecycle is `Created -> Started -> Stopped`, with `Stopped` terminal: a
/// stopped stream is discarded and its owner reconnects with a fresh one.
/// Fatal conditions in either worker (I/O errors, the peer closing the
/// stream, a panic) are reported through the error handler.
pub struct BufferedStream {
    raw_stream: Arc<dyn RawStream>,
    send_buffer: SendBuffer,
    recv_buffer: RecvBuffer,
    on_error: ErrorHandler,
    started: bool,
    stopped: bool,
}

impl BufferedStream {
    pub fn new(
        raw_stream: Arc<dyn RawStream>,
        config: &TransportConfig,
        on_error: ErrorHandler,
    ) -> BufferedStream {
        BufferedStream {
            raw_stream,
            send_buffer: SendBuffer::new(config.effective_send()),
            recv_buffer: RecvBuffer::new(config.effective_recv()),
            on_error,
            started: false,
            stopped: false,
        }
    }

    /// Spawns the send and receive workers. Fails on a stopped stream; calling
    /// it twice is a no-op.
    pub fn start(&mut self) -> Result<(), TransportError> {
        if self.stopped {
            return Err(TransportError::Stopped);
        }
        if self.started {
            debug!("stream already started");
            return Ok(());
        }
        self.started = true;

        self.send_buffer.start(self.raw_stream.clone(), self.on_error.clone());
        self.recv_buffer.start(self.raw_stream.clone(), self.on_error.clone());
        Ok(())
    }

    /// Aborts both workers and closes the raw stream. Idempotent; in-flight
    /// messages are abandoned.
    pub async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        self.send_buffer.stop();
        self.recv_buffer.stop();
        if let Err(e) = self.raw_stream.close().await {
            debug!("error closing raw stream: {}", e);
        }
    }

    /// Enqueues one message for transmission, returning its length. Blocks
    /// while the previous message still occupies the queue and fails with
    /// `EnqueueTimeout` after the configured timeout.
    pub async fn write(&self, message: Vec<u8>) -> Result<usize, TransportError> {
        if self.stopped || !self.started {
            return Err(TransportError::Stopped);
        }

        let len = message.len();
        if self.send_buffer.write(message).await {
            Ok(len)
        }
        else if self.send_buffer.is_stopped() {
            Err(TransportError::Stopped)
        }
        else {
            Err(TransportError::EnqueueTimeout)
        }
    }

    /// Blocks until one complete message has been received.
    pub async fn read(&mut self) -> Result<Vec<u8>, TransportError> {
        if !self.started {
            return Err(TransportError::Stopped);
        }
        self.recv_buffer.read().await
    }

    /// Like [read](Self::read), but the message is handed out in a buffer from
    /// `pool`, together with its length. A message longer than the pool's
    /// buffer size fails with `ShortBuffer` and is discarded: a truncated
    /// message is of no use to anyone.
    pub async fn read_pooled(&mut self, pool: &BufferPool) -> Result<(BytesMut, usize), TransportError> {
        let message = self.read().await?;
        if message.len() > pool.buf_size() {
            return Err(TransportError::ShortBuffer {
                message_len: message.len(),
                buf_size: pool.buf_size(),
            });
        }

        let mut buffer = pool.get_from_pool();
        buffer.extend_from_slice(&message);
        let len = message.len();
        Ok((buffer, len))
    }
}
