use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Classification of everything that can go wrong in the transport layer.
///
/// Only `Io`, `StreamClosed` and `WorkerPanic` are fatal to the worker that
/// encounters them; the other kinds are recovered locally or surfaced to the
/// caller of the operation that triggered them.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("malformed chunk: {0}")]
    MalformedChunk(String),

    #[error("chunk seq id mismatch: expected {expected}, actual {actual}")]
    SequenceMismatch { expected: i32, actual: i32 },

    #[error("message of {size} bytes exceeds the configured maximum of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    #[error("raw stream i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("raw stream closed by peer")]
    StreamClosed,

    #[error("timed out enqueueing a message")]
    EnqueueTimeout,

    #[error("transport is stopped")]
    Stopped,

    #[error("channel {0} already exists in the group")]
    DuplicateChannel(u8),

    #[error("no channel {0} in the group")]
    UnknownChannel(u8),

    #[error("message of {message_len} bytes does not fit a pooled buffer of {buf_size} bytes")]
    ShortBuffer { message_len: usize, buf_size: usize },

    #[error("worker panicked: {0}")]
    WorkerPanic(String),
}

/// Callback invoked when a send or receive worker dies. Retry or reconnection
/// is the responsibility of whoever owns the stream, strictly outside this layer.
pub type ErrorHandler = Arc<dyn Fn(&TransportError) + Send + Sync>;

/// Awaits a worker task and routes fatal outcomes to the configured error
/// handler: worker errors as-is, panics converted to `WorkerPanic`. An aborted
/// worker is a regular `stop()` and is not reported.
pub(crate) async fn supervise_worker(
    name: &'static str,
    handle: JoinHandle<Result<(), TransportError>>,
    stopped: Arc<AtomicBool>,
    on_error: ErrorHandler,
) {
    match handle.await {
        Ok(Ok(())) => {
            debug!("{} worker finished", name);
        }
        Ok(Err(e)) => {
            stopped.store(true, Ordering::SeqCst);
            error!("{} worker died: {}", name, e);
            on_error(&e);
        }
        Err(join_error) => {
            if join_error.is_panic() {
                let payload = join_error.into_panic();
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                let e = TransportError::WorkerPanic(msg);
                stopped.store(true, Ordering::SeqCst);
                error!("{} worker died: {}", name, e);
                on_error(&e);
            }
        }
    }
}
