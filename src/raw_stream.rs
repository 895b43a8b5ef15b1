use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

/// This is an abstraction for the reliable duplex byte stream the transport
/// runs on, introduced to facilitate mocking the I/O part away for testing.
///
/// The transport owns its stream exclusively: the send worker is the only
/// writer and the receive worker is the only reader.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RawStream: Send + Sync + 'static {
    /// Reads up to `buf.len()` bytes. `Ok(0)` means the peer closed the stream.
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes the whole buffer, returning the number of bytes written.
    async fn write(&self, buf: &[u8]) -> io::Result<usize>;

    async fn close(&self) -> io::Result<()>;
}

/// Adapter making any tokio duplex stream (TCP, Unix socket, in-memory duplex)
/// usable as a [RawStream].
///
/// The two halves sit behind separate locks so a blocked read never delays a
/// write.
pub struct StreamTransport<S> {
    read_half: Mutex<ReadHalf<S>>,
    write_half: Mutex<WriteHalf<S>>,
}

impl<S: AsyncRead + AsyncWrite + Send + 'static> StreamTransport<S> {
    pub fn new(stream: S) -> StreamTransport<S> {
        let (read_half, write_half) = tokio::io::split(stream);
        StreamTransport {
            read_half: Mutex::new(read_half),
            write_half: Mutex::new(write_half),
        }
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Send + 'static> RawStream for StreamTransport<S> {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_half.lock().await.read(buf).await
    }

    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.write_half.lock().await.write_all(buf).await?;
        Ok(buf.len())
    }

    async fn close(&self) -> io::Result<()> {
        self.write_half.lock().await.shutdown().await
    }
}
