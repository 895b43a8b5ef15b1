use crate::chunk::Chunk;
use crate::config::ChannelConfig;
use crate::error::TransportError;
use crate::workspace::{MessageAssembler, OutboundWorkspace};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

pub type ChannelId = u8;

/// Cloneable handle to a channel's outbound queue, so enqueueing can await
/// without holding the group registry lock.
#[derive(Clone)]
struct OutboundQueue {
    tx: mpsc::Sender<Vec<u8>>,
    size: Arc<AtomicI32>,
    enqueue_timeout: std::time::Duration,
}

impl OutboundQueue {
    /// Blocks until a queue slot frees up, `false` on timeout.
    async fn enqueue(&self, message: Vec<u8>) -> bool {
        match tokio::time::timeout(self.enqueue_timeout, self.tx.send(message)).await {
            Ok(Ok(())) => {
                self.size.fetch_add(1, Ordering::SeqCst);
                true
            }
            _ => false,
        }
    }

    /// Never blocks, `false` when the queue is full.
    fn attempt_enqueue(&self, message: Vec<u8>) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => {
                self.size.fetch_add(1, Ordering::SeqCst);
                true
            }
            Err(_) => false,
        }
    }
}

/// One multiplexed lane over a shared carrier stream: its own outbound queue
/// and slicing state, and its own reassembly state for inbound chunks.
///
/// Channels do no I/O themselves. The owner of the carrier polls
/// `emit_chunk` (via the group's round-robin) and routes each inbound chunk to
/// `receive_chunk` of the channel it belongs to.
pub struct Channel {
    id: ChannelId,
    config: ChannelConfig,
    queue: OutboundQueue,
    queue_rx: mpsc::Receiver<Vec<u8>>,
    outbound: OutboundWorkspace,
    assembler: MessageAssembler,
}

impl Channel {
    pub fn new(id: ChannelId, config: ChannelConfig) -> Channel {
        let (tx, queue_rx) = mpsc::channel(config.queue_capacity);
        let queue = OutboundQueue {
            tx,
            size: Arc::new(AtomicI32::new(0)),
            enqueue_timeout: config.enqueue_timeout,
        };
        Channel {
            id,
            config: config.clone(),
            queue,
            queue_rx,
            outbound: OutboundWorkspace::new(),
            assembler: MessageAssembler::new(config.workspace_capacity, config.max_message_size),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub async fn enqueue_message(&self, message: Vec<u8>) -> bool {
        self.queue.enqueue(message).await
    }

    pub fn attempt_enqueue_message(&self, message: Vec<u8>) -> bool {
        self.queue.attempt_enqueue(message)
    }

    /// True when a chunk is available: a message is mid-slicing or one is
    /// waiting in the queue.
    pub fn has_packet_to_send(&self) -> bool {
        !self.outbound.is_empty() || self.queue.size.load(Ordering::SeqCst) > 0
    }

    /// Slices off the channel's next chunk, pulling the next queued message
    /// into the workspace when the previous one is fully emitted.
    pub fn emit_chunk(&mut self) -> Option<Chunk> {
        if self.outbound.is_empty() {
            if let Ok(message) = self.queue_rx.try_recv() {
                self.queue.size.fetch_sub(1, Ordering::SeqCst);
                self.outbound.load(message);
            }
        }
        self.outbound.emit_chunk(self.config.max_payload_size)
    }

    /// Feeds one inbound chunk to the channel's reassembly, returning the
    /// completed message if this chunk finished one. Sequence mismatches and
    /// oversized messages are dropped with a warning.
    pub fn receive_chunk(&mut self, chunk: &Chunk) -> Option<Vec<u8>> {
        match self.assembler.absorb(chunk) {
            Ok(completed) => completed,
            Err(e @ TransportError::SequenceMismatch { .. }) => {
                warn!("channel {}: dropping chunk: {}", self.id, e);
                None
            }
            Err(e) => {
                warn!("channel {}: dropping message under assembly: {}", self.id, e);
                None
            }
        }
    }
}

struct ChannelGroupInner {
    /// insertion order, which is also the round-robin order
    channels: Vec<Channel>,
    index_by_id: FxHashMap<ChannelId, usize>,
    last_used_index: Option<usize>,
}

impl ChannelGroupInner {
    fn channel_mut(&mut self, id: ChannelId) -> Result<&mut Channel, TransportError> {
        let idx = *self.index_by_id.get(&id).ok_or(TransportError::UnknownChannel(id))?;
        Ok(&mut self.channels[idx])
    }

    fn next_channel_index(&mut self) -> Option<usize> {
        if self.channels.is_empty() {
            return None;
        }

        // wrap-around also clamps a cursor gone stale through deletions
        let start = self.last_used_index.map(|i| i + 1).unwrap_or(0) % self.channels.len();
        for offset in 0..self.channels.len() {
            let idx = (start + offset) % self.channels.len();
            if self.channels[idx].has_packet_to_send() {
                self.last_used_index = Some(idx);
                return Some(idx);
            }
        }
        None
    }
}

/// Registry of the channels multiplexed over one carrier, with fair
/// round-robin selection of the next channel to transmit from.
pub struct ChannelGroup {
    inner: Mutex<ChannelGroupInner>,
}

impl ChannelGroup {
    pub fn new() -> ChannelGroup {
        ChannelGroup {
            inner: Mutex::new(ChannelGroupInner {
                channels: Vec::new(),
                index_by_id: FxHashMap::default(),
                last_used_index: None,
            }),
        }
    }

    pub async fn add_channel(&self, channel: Channel) -> Result<(), TransportError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if inner.index_by_id.contains_key(&channel.id()) {
            return Err(TransportError::DuplicateChannel(channel.id()));
        }
        inner.index_by_id.insert(channel.id(), inner.channels.len());
        inner.channels.push(channel);
        Ok(())
    }

    /// Removes a channel; the relative round-robin order of the remaining
    /// channels is preserved. Returns `false` for an unknown id.
    pub async fn delete_channel(&self, id: ChannelId) -> bool {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let Some(removed_idx) = inner.index_by_id.remove(&id) else {
            return false;
        };
        inner.channels.remove(removed_idx);
        for (pos, channel) in inner.channels.iter().enumerate() {
            inner.index_by_id.insert(channel.id(), pos);
        }
        inner.last_used_index = match inner.last_used_index {
            Some(last) if last > removed_idx => Some(last - 1),
            Some(last) if last == removed_idx => removed_idx.checked_sub(1),
            other => other,
        };
        true
    }

    pub async fn channel_exists(&self, id: ChannelId) -> bool {
        self.inner.lock().await.index_by_id.contains_key(&id)
    }

    /// Blocking enqueue into one channel's queue. The registry lock is not
    /// held while waiting for a queue slot.
    pub async fn enqueue_message(&self, id: ChannelId, message: Vec<u8>) -> Result<bool, TransportError> {
        let queue = {
            let mut inner = self.inner.lock().await;
            inner.channel_mut(id)?.queue.clone()
        };
        Ok(queue.enqueue(message).await)
    }

    pub async fn attempt_enqueue_message(&self, id: ChannelId, message: Vec<u8>) -> Result<bool, TransportError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.channel_mut(id)?.attempt_enqueue_message(message))
    }

    pub async fn emit_chunk(&self, id: ChannelId) -> Result<Option<Chunk>, TransportError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.channel_mut(id)?.emit_chunk())
    }

    pub async fn receive_chunk(&self, id: ChannelId, chunk: &Chunk) -> Result<Option<Vec<u8>>, TransportError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.channel_mut(id)?.receive_chunk(chunk))
    }

    /// Round-robin pick of the next channel with pending outbound data,
    /// starting after the channel picked last time. `None` when nothing is
    /// pending.
    pub async fn next_channel_to_send_packet(&self) -> Option<ChannelId> {
        let mut inner = self.inner.lock().await;
        inner.next_channel_index().map(|idx| inner.channels[idx].id())
    }

    /// Convenience combining selection and emission into one step.
    pub async fn next_packet_to_send(&self) -> Option<(ChannelId, Chunk)> {
        let mut inner = self.inner.lock().await;
        let idx = inner.next_channel_index()?;
        let channel = &mut inner.channels[idx];
        let id = channel.id();
        channel.emit_chunk().map(|chunk| (id, chunk))
    }
}
