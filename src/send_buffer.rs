use crate::chunk::Chunk;
use crate::config::EffectiveSendConfig;
use crate::error::{supervise_worker, ErrorHandler, TransportError};
use crate::rate_monitor::RateMonitor;
use crate::raw_stream::RawStream;
use crate::workspace::OutboundWorkspace;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

/// A worker that hits this many raw write errors in a row gives up for good
/// and reports through the error handler.
const MAX_ERRORS_IN_A_ROW: u32 = 3;

/// Send side of a buffered stream: a bounded queue of outgoing messages and a
/// dedicated worker that slices them into chunks and writes them to the raw
/// stream, paced by a [RateMonitor].
///
/// The queue capacity (1 by default) is the backpressure mechanism: `write()`
/// blocks while the slot is taken and gives up after the configured timeout.
pub struct SendBuffer {
    config: EffectiveSendConfig,
    queue_tx: mpsc::Sender<Vec<u8>>,
    queue_rx: Option<mpsc::Receiver<Vec<u8>>>,
    stopped: Arc<AtomicBool>,
    abort_handle: Option<AbortHandle>,
}

impl Drop for SendBuffer {
    fn drop(&mut self) {
        if let Some(handle) = &self.abort_handle {
            handle.abort();
        }
    }
}

impl SendBuffer {
    pub fn new(config: EffectiveSendConfig) -> SendBuffer {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity);
        SendBuffer {
            config,
            queue_tx,
            queue_rx: Some(queue_rx),
            stopped: Arc::new(AtomicBool::new(true)),
            abort_handle: None,
        }
    }

    /// Spawns the send worker plus a supervisor task that reports worker death
    /// (errors and panics, not regular `stop()`) through `on_error`.
    pub fn start(&mut self, raw_stream: Arc<dyn RawStream>, on_error: ErrorHandler) {
        let Some(queue_rx) = self.queue_rx.take() else {
            warn!("send worker already started");
            return;
        };
        self.stopped.store(false, Ordering::SeqCst);

        let worker = SendWorker {
            config: self.config.clone(),
            queue_rx,
            raw_stream,
            workspace: OutboundWorkspace::new(),
            monitor: RateMonitor::new(),
            consecutive_errors: 0,
        };
        let worker_handle = tokio::spawn(worker.run());
        self.abort_handle = Some(worker_handle.abort_handle());
        tokio::spawn(supervise_worker("send", worker_handle, self.stopped.clone(), on_error));
    }

    /// Idempotent. Abandons whatever message is in flight.
    pub fn stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(handle) = self.abort_handle.take() {
            handle.abort();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Enqueues one message for transmission. Returns `false` if the queue
    /// stayed full for the configured timeout or the buffer is stopped.
    pub async fn write(&self, message: Vec<u8>) -> bool {
        if self.is_stopped() {
            debug!("write on a stopped send buffer");
            return false;
        }

        match tokio::time::timeout(self.config.enqueue_timeout, self.queue_tx.send(message)).await {
            Ok(Ok(())) => true,
            Ok(Err(_)) => {
                debug!("send worker is gone, dropping message");
                false
            }
            Err(_) => {
                debug!("timed out enqueueing message after {:?}", self.config.enqueue_timeout);
                false
            }
        }
    }
}

struct SendWorker {
    config: EffectiveSendConfig,
    queue_rx: mpsc::Receiver<Vec<u8>>,
    raw_stream: Arc<dyn RawStream>,
    workspace: OutboundWorkspace,
    monitor: RateMonitor,
    consecutive_errors: u32,
}

impl SendWorker {
    async fn run(mut self) -> Result<(), TransportError> {
        loop {
            match self.queue_rx.recv().await {
                Some(message) => {
                    trace!("dequeued message of {} bytes", message.len());
                    self.workspace.load(message);
                    self.drain_workspace().await?;
                }
                None => {
                    // the owning SendBuffer was dropped
                    return Ok(());
                }
            }
        }
    }

    /// Sends the loaded message as a sequence of chunk batches, asking the
    /// rate monitor for a time slot before each batch.
    async fn drain_workspace(&mut self) -> Result<(), TransportError> {
        while !self.workspace.is_empty() {
            self.monitor
                .limit(self.config.max_payload_size, self.config.rate_limit, true)
                .await;

            let mut bytes_sent = 0;
            for _ in 0..self.config.chunk_batch_size {
                match self.workspace.emit_chunk(self.config.max_payload_size) {
                    Some(chunk) => bytes_sent += self.send_chunk(&chunk).await?,
                    None => break,
                }
            }
            self.monitor.update(bytes_sent);
        }
        Ok(())
    }

    async fn send_chunk(&mut self, chunk: &Chunk) -> Result<usize, TransportError> {
        match self.raw_stream.write(chunk.bytes()).await {
            Ok(n) => {
                trace!("sent {:?}", chunk);
                self.consecutive_errors = 0;
                Ok(n)
            }
            Err(e) => {
                self.consecutive_errors += 1;
                if self.consecutive_errors >= MAX_ERRORS_IN_A_ROW {
                    return Err(TransportError::Io(e));
                }
                warn!(
                    "error writing to the raw stream ({} in a row), abandoning the current message: {}",
                    self.consecutive_errors, e
                );
                self.workspace.clear();
                Ok(0)
            }
        }
    }
}
