use crate::chunk::{self, Chunk, HEADER_SIZE};
use crate::config::EffectiveRecvConfig;
use crate::error::{supervise_worker, ErrorHandler, TransportError};
use crate::rate_monitor::RateMonitor;
use crate::raw_stream::RawStream;
use crate::workspace::MessageAssembler;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{trace, warn};

/// Number of leading header bytes needed before the chunk's total size is
/// known (seq id + payload size).
const SIZED_PREFIX: usize = 8;

/// Receive side of a buffered stream: a dedicated worker does rate-limited
/// reads from the raw stream, re-cuts the byte soup into chunks and assembles
/// them into messages, which `read()` consumes through a bounded queue.
pub struct RecvBuffer {
    queue_rx: mpsc::Receiver<Vec<u8>>,
    queue_tx: Option<mpsc::Sender<Vec<u8>>>,
    config: EffectiveRecvConfig,
    stopped: Arc<AtomicBool>,
    abort_handle: Option<AbortHandle>,
}

impl Drop for RecvBuffer {
    fn drop(&mut self) {
        if let Some(handle) = &self.abort_handle {
            handle.abort();
        }
    }
}

impl RecvBuffer {
    pub fn new(config: EffectiveRecvConfig) -> RecvBuffer {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity);
        RecvBuffer {
            queue_rx,
            queue_tx: Some(queue_tx),
            config,
            stopped: Arc::new(AtomicBool::new(true)),
            abort_handle: None,
        }
    }

    /// Spawns the receive worker plus a supervisor reporting worker death
    /// (including a peer closing the stream) through `on_error`.
    pub fn start(&mut self, raw_stream: Arc<dyn RawStream>, on_error: ErrorHandler) {
        let Some(queue_tx) = self.queue_tx.take() else {
            warn!("receive worker already started");
            return;
        };
        self.stopped.store(false, Ordering::SeqCst);

        let worker = RecvWorker {
            config: self.config.clone(),
            queue_tx,
            raw_stream,
            extractor: ChunkExtractor::new(self.config.max_chunk_size),
            assembler: MessageAssembler::new(
                self.config.workspace_capacity,
                self.config.max_message_size,
            ),
            monitor: RateMonitor::new(),
        };
        let worker_handle = tokio::spawn(worker.run());
        self.abort_handle = Some(worker_handle.abort_handle());
        tokio::spawn(supervise_worker("receive", worker_handle, self.stopped.clone(), on_error));
    }

    /// Idempotent.
    pub fn stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(handle) = self.abort_handle.take() {
            handle.abort();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Blocks until one complete message is available. Messages already
    /// assembled are still handed out after the worker died; after that the
    /// call fails with `Stopped`.
    pub async fn read(&mut self) -> Result<Vec<u8>, TransportError> {
        match self.queue_rx.recv().await {
            Some(message) => Ok(message),
            None => Err(TransportError::Stopped),
        }
    }
}

struct RecvWorker {
    config: EffectiveRecvConfig,
    queue_tx: mpsc::Sender<Vec<u8>>,
    raw_stream: Arc<dyn RawStream>,
    extractor: ChunkExtractor,
    assembler: MessageAssembler,
    monitor: RateMonitor,
}

impl RecvWorker {
    async fn run(mut self) -> Result<(), TransportError> {
        let mut read_buf = vec![0u8; self.config.max_chunk_size];
        loop {
            self.monitor
                .limit(self.config.max_chunk_size, self.config.rate_limit, true)
                .await;

            let n = self.raw_stream.read(&mut read_buf).await?;
            if n == 0 {
                return Err(TransportError::StreamClosed);
            }
            self.monitor.update(n);
            trace!("read {} raw bytes", n);

            for chunk in self.extractor.extract(&read_buf[..n]) {
                match self.assembler.absorb(&chunk) {
                    Ok(Some(message)) => {
                        if self.queue_tx.send(message).await.is_err() {
                            // the owning RecvBuffer was dropped
                            return Ok(());
                        }
                    }
                    Ok(None) => {}
                    Err(e @ TransportError::SequenceMismatch { .. }) => {
                        warn!("dropping chunk: {}", e);
                    }
                    Err(e @ TransportError::MessageTooLarge { .. }) => {
                        warn!("dropping message under assembly: {}", e);
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }
}

/// Re-cuts the raw byte stream into chunks, stitching across read boundaries:
/// a read may end in the middle of a header (fewer than 16 buffered bytes) or
/// in the middle of a declared payload, and may also contain several complete
/// chunks at once.
pub(crate) struct ChunkExtractor {
    /// bytes of the chunk currently being accumulated
    pending: Vec<u8>,
    /// bytes still to be thrown away after a malformed header
    discard_remaining: usize,
    max_payload_size: usize,
}

impl ChunkExtractor {
    pub fn new(max_chunk_size: usize) -> ChunkExtractor {
        ChunkExtractor {
            pending: Vec::with_capacity(HEADER_SIZE),
            discard_remaining: 0,
            max_payload_size: max_chunk_size - HEADER_SIZE,
        }
    }

    /// Consumes one raw read and returns every chunk it completes, in order.
    /// A header declaring a negative or oversized payload is dropped and
    /// scanning continues right after it.
    pub fn extract(&mut self, mut data: &[u8]) -> Vec<Chunk> {
        let mut chunks = Vec::new();

        while !data.is_empty() {
            if self.discard_remaining > 0 {
                let n = self.discard_remaining.min(data.len());
                data = &data[n..];
                self.discard_remaining -= n;
                continue;
            }

            if self.pending.len() < SIZED_PREFIX {
                let n = (SIZED_PREFIX - self.pending.len()).min(data.len());
                self.pending.extend_from_slice(&data[..n]);
                data = &data[n..];
                if self.pending.len() < SIZED_PREFIX {
                    break;
                }
            }

            let total_size = match chunk::peek_payload_size(&self.pending) {
                Ok(size) if size >= 0 && size as usize <= self.max_payload_size => {
                    HEADER_SIZE + size as usize
                }
                Ok(size) => {
                    warn!(
                        "chunk header declares a payload of {} bytes (max {}): skipping the header",
                        size, self.max_payload_size
                    );
                    self.skip_current_header();
                    continue;
                }
                Err(e) => {
                    warn!("unreadable chunk header, skipping it: {}", e);
                    self.skip_current_header();
                    continue;
                }
            };

            let n = (total_size - self.pending.len()).min(data.len());
            self.pending.extend_from_slice(&data[..n]);
            data = &data[n..];
            if self.pending.len() < total_size {
                break;
            }

            match Chunk::from_raw_bytes(std::mem::take(&mut self.pending)) {
                Ok(chunk) => chunks.push(chunk),
                Err(e) => warn!("dropping malformed chunk: {}", e),
            }
        }

        chunks
    }

    fn skip_current_header(&mut self) {
        self.discard_remaining = HEADER_SIZE - self.pending.len();
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::raw_stream::MockRawStream;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn test_config(max_chunk_size: usize) -> EffectiveRecvConfig {
        let mut config = TransportConfig::default();
        config.max_chunk_size = max_chunk_size;
        config.recv.rate_limit = 0;
        config.recv.workspace_capacity = max_chunk_size;
        config.effective_recv()
    }

    fn chunk_bytes(payload: &[u8], is_eof: bool, seq_id: i32) -> Vec<u8> {
        Chunk::new(payload, 0, payload.len(), is_eof, seq_id).bytes().to_vec()
    }

    mod extractor {
        use super::*;

        #[test]
        fn test_single_complete_chunk() {
            let mut extractor = ChunkExtractor::new(HEADER_SIZE + 16);

            let chunks = extractor.extract(&chunk_bytes(&[1, 2, 3], true, 0));
            assert_eq!(chunks.len(), 1);
            assert_eq!(chunks[0].payload(), &[1, 2, 3]);
        }

        #[test]
        fn test_several_chunks_in_one_read() {
            let mut extractor = ChunkExtractor::new(HEADER_SIZE + 16);

            let mut data = chunk_bytes(&[1], false, 0);
            data.extend(chunk_bytes(&[2], false, 1));
            data.extend(chunk_bytes(&[3], true, 2));

            let chunks = extractor.extract(&data);
            assert_eq!(chunks.len(), 3);
            assert_eq!(chunks[2].payload(), &[3]);
            assert!(chunks[2].is_eof());
        }

        #[test]
        fn test_one_byte_feeds() {
            let mut extractor = ChunkExtractor::new(HEADER_SIZE + 16);

            let mut data = chunk_bytes(&[1, 2, 3], false, 0);
            data.extend(chunk_bytes(&[4, 5], true, 1));

            let mut chunks = Vec::new();
            for byte in &data {
                chunks.extend(extractor.extract(std::slice::from_ref(byte)));
            }

            assert_eq!(chunks.len(), 2);
            assert_eq!(chunks[0].payload(), &[1, 2, 3]);
            assert_eq!(chunks[1].payload(), &[4, 5]);
        }

        #[rstest::rstest]
        #[case::inside_sized_prefix(5)]
        #[case::at_sized_prefix(8)]
        #[case::inside_header(12)]
        #[case::at_header_end(HEADER_SIZE)]
        #[case::inside_payload(HEADER_SIZE + 2)]
        fn test_split_at_boundary(#[case] split: usize) {
            let mut extractor = ChunkExtractor::new(HEADER_SIZE + 16);
            let data = chunk_bytes(&[1, 2, 3, 4], true, 0);

            assert!(extractor.extract(&data[..split]).is_empty());
            let chunks = extractor.extract(&data[split..]);

            assert_eq!(chunks.len(), 1);
            assert_eq!(chunks[0].payload(), &[1, 2, 3, 4]);
        }

        #[test]
        fn test_oversized_declared_payload_is_skipped() {
            let mut extractor = ChunkExtractor::new(HEADER_SIZE + 4);

            // declares 100 payload bytes where at most 4 are allowed
            let mut data = chunk_bytes(&[0; 4], false, 0);
            data[4..8].copy_from_slice(&100i32.to_be_bytes());
            data.truncate(HEADER_SIZE);
            data.extend(chunk_bytes(&[7, 8], true, 0));

            let chunks = extractor.extract(&data);
            assert_eq!(chunks.len(), 1);
            assert_eq!(chunks[0].payload(), &[7, 8]);
        }

        #[test]
        fn test_negative_declared_payload_is_skipped() {
            let mut extractor = ChunkExtractor::new(HEADER_SIZE + 4);

            let mut data = vec![0u8; HEADER_SIZE];
            data[4..8].copy_from_slice(&(-1i32).to_be_bytes());
            data.extend(chunk_bytes(&[9], true, 0));

            let chunks = extractor.extract(&data);
            assert_eq!(chunks.len(), 1);
            assert_eq!(chunks[0].payload(), &[9]);
        }

        #[test]
        fn test_malformed_header_split_across_reads() {
            let mut extractor = ChunkExtractor::new(HEADER_SIZE + 4);

            let mut bad = vec![0u8; HEADER_SIZE];
            bad[4..8].copy_from_slice(&1000i32.to_be_bytes());

            assert!(extractor.extract(&bad[..6]).is_empty());
            assert!(extractor.extract(&bad[6..]).is_empty());

            let chunks = extractor.extract(&chunk_bytes(&[5], true, 0));
            assert_eq!(chunks.len(), 1);
            assert_eq!(chunks[0].payload(), &[5]);
        }

        #[test]
        fn test_negative_seq_id_chunk_is_dropped() {
            let mut extractor = ChunkExtractor::new(HEADER_SIZE + 4);

            let mut data = chunk_bytes(&[1], true, 0);
            data[0..4].copy_from_slice(&(-5i32).to_be_bytes());
            data.extend(chunk_bytes(&[2], true, 0));

            let chunks = extractor.extract(&data);
            assert_eq!(chunks.len(), 1);
            assert_eq!(chunks[0].payload(), &[2]);
        }
    }

    /// Mock raw stream replaying a script of reads, then EOF.
    fn scripted_stream(reads: Vec<Vec<u8>>) -> Arc<MockRawStream> {
        let script = Arc::new(Mutex::new(VecDeque::from(reads)));
        let mut mock = MockRawStream::new();
        mock.expect_read().returning(move |buf| {
            let mut script = script.lock().unwrap();
            match script.pop_front() {
                Some(bytes) => {
                    let n = bytes.len().min(buf.len());
                    buf[..n].copy_from_slice(&bytes[..n]);
                    if n < bytes.len() {
                        script.push_front(bytes[n..].to_vec());
                    }
                    Ok(n)
                }
                None => Ok(0),
            }
        });
        Arc::new(mock)
    }

    fn noop_handler() -> ErrorHandler {
        Arc::new(|_| {})
    }

    #[tokio::test]
    async fn test_read_single_message() {
        let stream = scripted_stream(vec![chunk_bytes(&[1, 2, 3], true, 0)]);
        let mut recv_buffer = RecvBuffer::new(test_config(HEADER_SIZE + 16));
        recv_buffer.start(stream, noop_handler());

        assert_eq!(recv_buffer.read().await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_message_fragmented_across_reads() {
        let mut wire = chunk_bytes(&[1, 2, 3], false, 0);
        wire.extend(chunk_bytes(&[4, 5], true, 1));
        let reads = wire.chunks(3).map(|c| c.to_vec()).collect();

        let mut recv_buffer = RecvBuffer::new(test_config(HEADER_SIZE + 16));
        recv_buffer.start(scripted_stream(reads), noop_handler());

        assert_eq!(recv_buffer.read().await.unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_sequence_mismatch_drops_chunk_and_continues() {
        let mut wire = chunk_bytes(&[1, 2], false, 0);
        wire.extend(chunk_bytes(&[9, 9], false, 5)); // dropped
        wire.extend(chunk_bytes(&[3, 4], true, 1));

        let mut recv_buffer = RecvBuffer::new(test_config(HEADER_SIZE + 16));
        recv_buffer.start(scripted_stream(vec![wire]), noop_handler());

        assert_eq!(recv_buffer.read().await.unwrap(), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_oversized_message_is_dropped() {
        let mut config = test_config(HEADER_SIZE + 16);
        config.max_message_size = 4;

        let mut wire = chunk_bytes(&[0; 5], true, 0); // above the cap
        wire.extend(chunk_bytes(&[1, 2], true, 0));

        let mut recv_buffer = RecvBuffer::new(config);
        recv_buffer.start(scripted_stream(vec![wire]), noop_handler());

        assert_eq!(recv_buffer.read().await.unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_empty_message_round_trip() {
        let stream = scripted_stream(vec![Chunk::empty(0).bytes().to_vec()]);
        let mut recv_buffer = RecvBuffer::new(test_config(HEADER_SIZE + 16));
        recv_buffer.start(stream, noop_handler());

        assert_eq!(recv_buffer.read().await.unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn test_peer_close_reports_stream_closed() {
        let (error_tx, mut error_rx) = mpsc::unbounded_channel();
        let handler: ErrorHandler = Arc::new(move |e| {
            error_tx.send(e.to_string()).ok();
        });

        let mut recv_buffer = RecvBuffer::new(test_config(HEADER_SIZE + 16));
        recv_buffer.start(scripted_stream(vec![]), handler);

        let reported = error_rx.recv().await.unwrap();
        assert!(reported.contains("closed"), "unexpected error: {}", reported);

        assert!(matches!(recv_buffer.read().await, Err(TransportError::Stopped)));
        assert!(recv_buffer.is_stopped());
    }

    #[tokio::test]
    async fn test_read_error_is_fatal() {
        let mut mock = MockRawStream::new();
        mock.expect_read()
            .returning(|_| Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")));

        let (error_tx, mut error_rx) = mpsc::unbounded_channel();
        let handler: ErrorHandler = Arc::new(move |e| {
            error_tx.send(e.to_string()).ok();
        });

        let mut recv_buffer = RecvBuffer::new(test_config(HEADER_SIZE + 16));
        recv_buffer.start(Arc::new(mock), handler);

        let reported = error_rx.recv().await.unwrap();
        assert!(reported.contains("reset"), "unexpected error: {}", reported);
    }

    #[tokio::test]
    async fn test_messages_received_before_stop_are_still_delivered() {
        let mut wire = chunk_bytes(&[1], true, 0);
        wire.extend(chunk_bytes(&[2], true, 0));

        let mut recv_buffer = RecvBuffer::new(test_config(HEADER_SIZE + 16));
        recv_buffer.start(scripted_stream(vec![wire]), noop_handler());

        assert_eq!(recv_buffer.read().await.unwrap(), vec![1]);
        assert_eq!(recv_buffer.read().await.unwrap(), vec![2]);
    }
}
