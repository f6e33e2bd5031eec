//! Core stream traits shared by the protocol engine and the session layer
//!
//! Every transport the engine can run over (TCP, a relay, a host-proxied
//! socket, a local file or the random device) is expressed as a pair of
//! independent halves so that a pending read never blocks a write.

use crate::WispResult;
use std::fmt;

/// Kind of backing transport for a [`ByteStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Directly dialed TCP socket
    Socket,
    /// Socket proxied by a relay or by the host
    RelayedSocket,
    /// Infinite pseudo-random byte source
    RandomSource,
    /// File in a local storage backend
    LocalFile,
    /// In-memory pipe (tests and embedding)
    Memory,
}

impl StreamKind {
    /// Returns true for socket-like kinds, whose end-of-stream means the peer closed.
    pub fn is_socket(&self) -> bool {
        matches!(self, StreamKind::Socket | StreamKind::RelayedSocket)
    }
}

/// Outcome of a single read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes were read (never empty)
    Data(Vec<u8>),
    /// The stream has no more data
    EndOfStream,
}

/// Read half of a byte stream.
#[async_trait::async_trait]
pub trait StreamReader: Send {
    /// Reads at most `max_bytes` bytes.
    ///
    /// Implementations must be cancel-safe: dropping the returned future
    /// before it completes must not lose data.
    ///
    /// # Errors
    ///
    /// Returns a typed stream error if the transport fails
    async fn read(&mut self, max_bytes: usize) -> WispResult<ReadOutcome>;
}

/// Write half of a byte stream.
#[async_trait::async_trait]
pub trait StreamWriter: Send {
    /// Writes `data`, returning how many bytes the stream accepted.
    ///
    /// # Errors
    ///
    /// Returns a typed stream error if the transport fails
    async fn write(&mut self, data: &[u8]) -> WispResult<usize>;

    /// Closes the stream. Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails while shutting down
    async fn close(&mut self) -> WispResult<()>;
}

/// A bidirectional byte stream assembled from a reader and a writer half.
pub struct ByteStream {
    kind: StreamKind,
    label: String,
    reader: Box<dyn StreamReader>,
    writer: Box<dyn StreamWriter>,
}

impl ByteStream {
    /// Creates a stream from its two halves.
    pub fn new(
        kind: StreamKind,
        label: impl Into<String>,
        reader: Box<dyn StreamReader>,
        writer: Box<dyn StreamWriter>,
    ) -> Self {
        Self {
            kind,
            label: label.into(),
            reader,
            writer,
        }
    }

    /// Returns the transport kind.
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Returns a human-readable label (e.g. `host:port` or a path).
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Reads at most `max_bytes` bytes.
    ///
    /// # Errors
    ///
    /// Propagates the reader's error
    pub async fn read(&mut self, max_bytes: usize) -> WispResult<ReadOutcome> {
        self.reader.read(max_bytes).await
    }

    /// Writes all of `data`, looping until every byte was accepted.
    ///
    /// # Errors
    ///
    /// Propagates the writer's error
    pub async fn write_all(&mut self, mut data: &[u8]) -> WispResult<()> {
        while !data.is_empty() {
            let accepted = self.writer.write(data).await?;
            if accepted == 0 {
                return Err(crate::WispError::ConnectionFailed(format!(
                    "{} stopped accepting data",
                    self.label
                )));
            }
            data = &data[accepted..];
        }
        Ok(())
    }

    /// Writes `data`, returning how many bytes were accepted.
    ///
    /// # Errors
    ///
    /// Propagates the writer's error
    pub async fn write(&mut self, data: &[u8]) -> WispResult<usize> {
        self.writer.write(data).await
    }

    /// Closes the stream.
    ///
    /// # Errors
    ///
    /// Propagates the writer's error
    pub async fn close(&mut self) -> WispResult<()> {
        self.writer.close().await
    }

    /// Splits the stream into independently owned halves.
    pub fn into_split(self) -> (Box<dyn StreamReader>, Box<dyn StreamWriter>) {
        (self.reader, self.writer)
    }
}

impl fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteStream")
            .field("kind", &self.kind)
            .field("label", &self.label)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    struct ScriptedReader(VecDeque<Vec<u8>>);

    #[async_trait::async_trait]
    impl StreamReader for ScriptedReader {
        async fn read(&mut self, max_bytes: usize) -> WispResult<ReadOutcome> {
            match self.0.pop_front() {
                Some(mut chunk) => {
                    if chunk.len() > max_bytes {
                        let rest = chunk.split_off(max_bytes);
                        self.0.push_front(rest);
                    }
                    Ok(ReadOutcome::Data(chunk))
                }
                None => Ok(ReadOutcome::EndOfStream),
            }
        }
    }

    /// Accepts at most three bytes per call.
    struct TrickleWriter(Arc<Mutex<Vec<u8>>>);

    #[async_trait::async_trait]
    impl StreamWriter for TrickleWriter {
        async fn write(&mut self, data: &[u8]) -> WispResult<usize> {
            let n = data.len().min(3);
            self.0.lock().unwrap().extend_from_slice(&data[..n]);
            Ok(n)
        }

        async fn close(&mut self) -> WispResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_write_all_loops_over_partial_writes() {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let mut stream = ByteStream::new(
            StreamKind::Memory,
            "test",
            Box::new(ScriptedReader(VecDeque::new())),
            Box::new(TrickleWriter(Arc::clone(&sink))),
        );

        stream.write_all(b"hello world").await.unwrap();
        assert_eq!(sink.lock().unwrap().as_slice(), b"hello world");
    }

    #[tokio::test]
    async fn test_read_respects_max_bytes() {
        let mut stream = ByteStream::new(
            StreamKind::Memory,
            "test",
            Box::new(ScriptedReader(VecDeque::from(vec![b"abcdef".to_vec()]))),
            Box::new(TrickleWriter(Arc::new(Mutex::new(Vec::new())))),
        );

        assert_eq!(stream.read(4).await.unwrap(), ReadOutcome::Data(b"abcd".to_vec()));
        assert_eq!(stream.read(4).await.unwrap(), ReadOutcome::Data(b"ef".to_vec()));
        assert_eq!(stream.read(4).await.unwrap(), ReadOutcome::EndOfStream);
    }

    #[test]
    fn test_stream_kind_is_socket() {
        assert!(StreamKind::Socket.is_socket());
        assert!(StreamKind::RelayedSocket.is_socket());
        assert!(!StreamKind::LocalFile.is_socket());
        assert!(!StreamKind::RandomSource.is_socket());
    }
}
