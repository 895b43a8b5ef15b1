use crate::chunk::HEADER_SIZE;
use anyhow::bail;
use std::time::Duration;

/// Total size of a chunk on the wire, header included.
pub const MAX_CHUNK_SIZE: usize = 16 * 1024;

/// Size cap for regular peer-to-peer messages.
pub const MAX_NORMAL_MESSAGE_SIZE: usize = 1024 * 1024;

/// Size cap for block payloads, which are far larger than anything else.
pub const MAX_BLOCK_MESSAGE_SIZE: usize = 12 * 1024 * 1024;

/// Default throughput cap per stream and direction, in bytes/sec.
pub const DEFAULT_RATE_LIMIT: i64 = 128 * 1024 * 1024;

const DEFAULT_QUEUE_CAPACITY: usize = 1;
const DEFAULT_ENQUEUE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_CHUNK_BATCH_SIZE: usize = 10;

#[derive(Debug, Clone)]
pub struct SendBufferConfig {
    /// Pending-message slots between `write()` and the send worker. The
    /// default of 1 is what makes `write()` a backpressure point.
    pub queue_capacity: usize,
    pub enqueue_timeout: Duration,

    /// Number of chunks written to the raw stream per rate-limiter grant.
    pub chunk_batch_size: usize,

    /// Bytes/sec; zero or negative disables rate limiting.
    pub rate_limit: i64,
}

impl Default for SendBufferConfig {
    fn default() -> SendBufferConfig {
        SendBufferConfig {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            enqueue_timeout: DEFAULT_ENQUEUE_TIMEOUT,
            chunk_batch_size: DEFAULT_CHUNK_BATCH_SIZE,
            rate_limit: DEFAULT_RATE_LIMIT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecvBufferConfig {
    /// Completed-message slots between the receive worker and `read()`.
    pub queue_capacity: usize,

    /// Bytes/sec; zero or negative disables rate limiting.
    pub rate_limit: i64,

    /// Reassembled messages above this size are dropped with a warning, so a
    /// misbehaving peer cannot make us buffer without bound.
    pub max_message_size: usize,

    /// Initial capacity of the reassembly buffer.
    pub workspace_capacity: usize,
}

impl Default for RecvBufferConfig {
    fn default() -> RecvBufferConfig {
        RecvBufferConfig {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            rate_limit: DEFAULT_RATE_LIMIT,
            max_message_size: MAX_NORMAL_MESSAGE_SIZE,
            workspace_capacity: MAX_CHUNK_SIZE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Total chunk size on the wire; the payload per chunk is this minus the
    /// 16-byte header. Both peers must agree on it only insofar as the
    /// receiver's value bounds the declared payload sizes it accepts.
    pub max_chunk_size: usize,

    pub send: SendBufferConfig,
    pub recv: RecvBufferConfig,
}

impl Default for TransportConfig {
    fn default() -> TransportConfig {
        TransportConfig {
            max_chunk_size: MAX_CHUNK_SIZE,
            send: SendBufferConfig::default(),
            recv: RecvBufferConfig::default(),
        }
    }
}

impl TransportConfig {
    /// Configuration for streams carrying block payloads.
    pub fn for_blocks() -> TransportConfig {
        TransportConfig {
            recv: RecvBufferConfig {
                max_message_size: MAX_BLOCK_MESSAGE_SIZE,
                ..RecvBufferConfig::default()
            },
            ..TransportConfig::default()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_chunk_size <= HEADER_SIZE {
            bail!("chunk size of {} bytes leaves no room for payload after the {} byte header",
                self.max_chunk_size, HEADER_SIZE);
        }
        if self.send.queue_capacity == 0 || self.recv.queue_capacity == 0 {
            bail!("queue capacity must be at least 1");
        }
        if self.send.enqueue_timeout.is_zero() {
            bail!("enqueue timeout must be positive");
        }
        if self.send.chunk_batch_size == 0 {
            bail!("chunk batch size must be at least 1");
        }
        if self.recv.max_message_size == 0 {
            bail!("max message size must be positive");
        }
        Ok(())
    }

    /// Payload bytes available per chunk once the header is accounted for.
    pub fn max_payload_size(&self) -> usize {
        self.max_chunk_size - HEADER_SIZE
    }

    pub fn effective_send(&self) -> EffectiveSendConfig {
        EffectiveSendConfig {
            max_payload_size: self.max_payload_size(),
            queue_capacity: self.send.queue_capacity,
            enqueue_timeout: self.send.enqueue_timeout,
            chunk_batch_size: self.send.chunk_batch_size,
            rate_limit: self.send.rate_limit,
        }
    }

    pub fn effective_recv(&self) -> EffectiveRecvConfig {
        EffectiveRecvConfig {
            max_chunk_size: self.max_chunk_size,
            queue_capacity: self.recv.queue_capacity,
            rate_limit: self.recv.rate_limit,
            max_message_size: self.recv.max_message_size,
            workspace_capacity: self.recv.workspace_capacity,
        }
    }

    /// The per-channel view for multiplexed use: channels slice and reassemble
    /// but the shared carrier does the I/O and pacing.
    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            max_payload_size: self.max_payload_size(),
            queue_capacity: self.send.queue_capacity,
            enqueue_timeout: self.send.enqueue_timeout,
            max_message_size: self.recv.max_message_size,
            workspace_capacity: self.recv.workspace_capacity,
        }
    }
}

/// Resolved settings consumed by the send worker.
#[derive(Debug, Clone)]
pub struct EffectiveSendConfig {
    pub max_payload_size: usize,
    pub queue_capacity: usize,
    pub enqueue_timeout: Duration,
    pub chunk_batch_size: usize,
    pub rate_limit: i64,
}

/// Resolved settings consumed by the receive worker.
#[derive(Debug, Clone)]
pub struct EffectiveRecvConfig {
    pub max_chunk_size: usize,
    pub queue_capacity: usize,
    pub rate_limit: i64,
    pub max_message_size: usize,
    pub workspace_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub max_payload_size: usize,
    pub queue_capacity: usize,
    pub enqueue_timeout: Duration,
    pub max_message_size: usize,
    pub workspace_capacity: usize,
}
