use bytes::BytesMut;
use std::sync::Mutex;
use tracing::{debug, trace, warn};

/// Pool of reusable buffers for the pooled read path, bounding allocation
/// churn on hot receive loops.
pub struct BufferPool {
    buf_size: usize,
    buffers: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    pub fn new(buf_size: usize, max_pool_size: usize) -> BufferPool {
        BufferPool {
            buf_size,
            buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
        }
    }

    /// Size of the buffers this pool hands out, and the upper bound on message
    /// length for pooled reads.
    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    pub fn get_from_pool(&self) -> BytesMut {
        {
            let mut buffers = self.buffers.lock().unwrap();
            if let Some(buffer) = buffers.pop() {
                trace!("returning buffer from pool");
                return buffer;
            }
        }

        debug!("no buffer in pool: creating new buffer");
        BytesMut::with_capacity(self.buf_size)
    }

    pub fn return_to_pool(&self, mut buffer: BytesMut) {
        if buffer.capacity() != self.buf_size {
            // a buffer that grew past the pool size would leak its extra
            // capacity into later reads
            warn!("returned buffer has capacity {} instead of {}: discarding it",
                buffer.capacity(), self.buf_size);
            return;
        }

        buffer.clear();

        let mut buffers = self.buffers.lock().unwrap();
        if buffers.capacity() > buffers.len() {
            trace!("returning buffer to pool");
            buffers.push(buffer);
        }
        else {
            debug!("pool is full: discarding returned buffer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[test]
    fn test_returned_buffer_is_cleared() {
        let pool = BufferPool::new(10, 10);

        let mut buf = BytesMut::with_capacity(10);
        buf.put_u8(1);

        pool.return_to_pool(buf);

        assert!(pool.get_from_pool().is_empty());
    }

    #[test]
    fn test_oversized_buffer_is_discarded() {
        let pool = BufferPool::new(10, 10);

        pool.return_to_pool(BytesMut::with_capacity(64));

        let buf = pool.get_from_pool();
        assert_eq!(buf.capacity(), 10);
    }

    #[test]
    fn test_full_pool_discards_returns() {
        let pool = BufferPool::new(10, 1);

        pool.return_to_pool(BytesMut::with_capacity(10));
        pool.return_to_pool(BytesMut::with_capacity(10));

        assert_eq!(pool.get_from_pool().capacity(), 10);
    }
}
