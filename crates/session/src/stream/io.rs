//! Adapters from tokio I/O types to the stream halves.

use super::READ_CHUNK;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use wisp_platform::{ByteStream, ReadOutcome, StreamKind, StreamReader, StreamWriter, WispResult};

/// Read half over any [`AsyncRead`].
#[derive(Debug)]
pub struct IoReader<R> {
    inner: R,
}

impl<R> IoReader<R> {
    /// Wraps `inner`.
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<R> StreamReader for IoReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn read(&mut self, max_bytes: usize) -> WispResult<ReadOutcome> {
        let mut buf = vec![0u8; max_bytes.clamp(1, READ_CHUNK)];
        let n = self.inner.read(&mut buf).await?;
        if n == 0 {
            return Ok(ReadOutcome::EndOfStream);
        }
        buf.truncate(n);
        Ok(ReadOutcome::Data(buf))
    }
}

/// Write half over any [`AsyncWrite`].
#[derive(Debug)]
pub struct IoWriter<W> {
    inner: W,
    closed: bool,
}

impl<W> IoWriter<W> {
    /// Wraps `inner`.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            closed: false,
        }
    }
}

#[async_trait]
impl<W> StreamWriter for IoWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write(&mut self, data: &[u8]) -> WispResult<usize> {
        let n = self.inner.write(data).await?;
        self.inner.flush().await?;
        Ok(n)
    }

    async fn close(&mut self) -> WispResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Splits a duplex I/O object into a [`ByteStream`].
pub fn from_io<T>(kind: StreamKind, label: impl Into<String>, io: T) -> ByteStream
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(io);
    ByteStream::new(
        kind,
        label,
        Box::new(IoReader::new(reader)),
        Box::new(IoWriter::new(writer)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplex_roundtrip() {
        let (a, b) = tokio::io::duplex(64);
        let mut left = from_io(StreamKind::Memory, "left", a);
        let mut right = from_io(StreamKind::Memory, "right", b);

        left.write_all(b"hello").await.unwrap();
        assert_eq!(
            right.read(16).await.unwrap(),
            ReadOutcome::Data(b"hello".to_vec())
        );

        left.close().await.unwrap();
        left.close().await.unwrap();
        assert_eq!(right.read(16).await.unwrap(), ReadOutcome::EndOfStream);
    }

    #[tokio::test]
    async fn test_read_respects_max_bytes() {
        let (a, b) = tokio::io::duplex(64);
        let mut left = from_io(StreamKind::Memory, "left", a);
        let mut right = from_io(StreamKind::Memory, "right", b);

        left.write_all(b"abcdef").await.unwrap();
        assert_eq!(right.read(4).await.unwrap(), ReadOutcome::Data(b"abcd".to_vec()));
        assert_eq!(right.read(4).await.unwrap(), ReadOutcome::Data(b"ef".to_vec()));
    }

    #[tokio::test]
    async fn test_huge_reads_use_a_bounded_buffer() {
        let (a, b) = tokio::io::duplex(2 * READ_CHUNK);
        let mut left = from_io(StreamKind::Memory, "left", a);
        let mut right = from_io(StreamKind::Memory, "right", b);

        left.write_all(&vec![7u8; READ_CHUNK + 10]).await.unwrap();
        match right.read(usize::MAX).await.unwrap() {
            ReadOutcome::Data(bytes) => assert!(bytes.len() <= READ_CHUNK),
            ReadOutcome::EndOfStream => panic!("stream ended early"),
        }
    }
}
