//! The random-device stream behind `/dev/random` and `/dev/urandom`.

use super::READ_CHUNK;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use wisp_platform::{ByteStream, ReadOutcome, StreamKind, StreamReader, StreamWriter, WispResult};

/// Paths served by [`random_stream`] instead of the file store.
pub const RANDOM_DEVICES: [&str; 2] = ["/dev/random", "/dev/urandom"];

/// Returns true when `path` names a random device.
pub fn is_random_device(path: &str) -> bool {
    RANDOM_DEVICES.contains(&path)
}

/// Never-ending source of random bytes. Every read returns exactly the
/// requested count, up to [`READ_CHUNK`].
#[derive(Debug)]
pub struct RandomReader {
    rng: StdRng,
}

impl RandomReader {
    /// Creates a reader seeded from the operating system.
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }
}

impl Default for RandomReader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamReader for RandomReader {
    async fn read(&mut self, max_bytes: usize) -> WispResult<ReadOutcome> {
        let mut buf = vec![0u8; max_bytes.clamp(1, READ_CHUNK)];
        self.rng.fill_bytes(&mut buf);
        Ok(ReadOutcome::Data(buf))
    }
}

/// Accepts and discards everything.
#[derive(Debug, Default)]
pub struct DiscardWriter;

#[async_trait]
impl StreamWriter for DiscardWriter {
    async fn write(&mut self, data: &[u8]) -> WispResult<usize> {
        Ok(data.len())
    }

    async fn close(&mut self) -> WispResult<()> {
        Ok(())
    }
}

/// Opens a random-device stream labelled with `path`.
pub fn random_stream(path: &str) -> ByteStream {
    ByteStream::new(
        StreamKind::RandomSource,
        path,
        Box::new(RandomReader::new()),
        Box::new(DiscardWriter),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_paths() {
        assert!(is_random_device("/dev/random"));
        assert!(is_random_device("/dev/urandom"));
        assert!(!is_random_device("/dev/zero"));
        assert!(!is_random_device("dev/random"));
    }

    #[tokio::test]
    async fn test_reads_exact_counts() {
        let mut stream = random_stream("/dev/urandom");
        assert_eq!(stream.kind(), StreamKind::RandomSource);

        for size in [1usize, 32, 4096] {
            match stream.read(size).await.unwrap() {
                ReadOutcome::Data(bytes) => assert_eq!(bytes.len(), size),
                ReadOutcome::EndOfStream => panic!("random stream ended"),
            }
        }
    }

    #[tokio::test]
    async fn test_huge_reads_are_chunked() {
        let mut stream = random_stream("/dev/random");
        match stream.read(u32::MAX as usize).await.unwrap() {
            ReadOutcome::Data(bytes) => assert_eq!(bytes.len(), READ_CHUNK),
            ReadOutcome::EndOfStream => panic!("random stream ended"),
        }
    }

    #[tokio::test]
    async fn test_writes_are_discarded() {
        let mut stream = random_stream("/dev/random");
        assert_eq!(stream.write(b"seed").await.unwrap(), 4);
        stream.close().await.unwrap();
        assert!(matches!(stream.read(8).await.unwrap(), ReadOutcome::Data(_)));
    }
}
