//! Sockets tunnelled through a WebSocket relay.
//!
//! The relay is dialed as `<url>?host=<host>&port=<port>` and carries the
//! socket's bytes in binary frames, one direction per half.

use super::socket::Relay;
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};
use wisp_platform::{ByteStream, ReadOutcome, StreamKind, StreamReader, StreamWriter, WispError, WispResult};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A [`Relay`] that reaches hosts through a WebSocket endpoint.
#[derive(Debug, Clone)]
pub struct WebSocketRelay {
    url: String,
}

impl WebSocketRelay {
    /// Creates a relay for the endpoint at `url` (`ws://` or `wss://`).
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Returns the relay endpoint.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Builds the URL dialed for `host:port`.
    pub fn target_url(&self, host: &str, port: u16) -> String {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!(
            "{}{}host={}&port={}",
            self.url,
            separator,
            encode_query_value(host),
            port
        )
    }
}

fn encode_query_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b':' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

#[async_trait]
impl Relay for WebSocketRelay {
    async fn open_socket(&self, host: &str, port: u16) -> WispResult<ByteStream> {
        let url = self.target_url(host, port);
        let (ws, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| WispError::ConnectionFailed(format!("relay {}: {}", self.url, e)))?;
        info!(relay = %self.url, host, port, "relay connected");

        let (sink, stream) = ws.split();
        Ok(ByteStream::new(
            StreamKind::RelayedSocket,
            format!("{}:{}", host, port),
            Box::new(WsReader {
                stream,
                pending: Vec::new(),
                finished: false,
            }),
            Box::new(WsWriter {
                sink,
                closed: false,
            }),
        ))
    }
}

struct WsReader {
    stream: SplitStream<WsStream>,
    pending: Vec<u8>,
    finished: bool,
}

impl WsReader {
    fn take_pending(&mut self, max_bytes: usize) -> Vec<u8> {
        let n = self.pending.len().min(max_bytes.max(1));
        let rest = self.pending.split_off(n);
        std::mem::replace(&mut self.pending, rest)
    }
}

#[async_trait]
impl StreamReader for WsReader {
    async fn read(&mut self, max_bytes: usize) -> WispResult<ReadOutcome> {
        loop {
            if !self.pending.is_empty() {
                return Ok(ReadOutcome::Data(self.take_pending(max_bytes)));
            }
            if self.finished {
                return Ok(ReadOutcome::EndOfStream);
            }
            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => self.pending = data,
                Some(Ok(Message::Text(text))) => self.pending = text.into_bytes(),
                Some(Ok(Message::Close(_))) | None => {
                    debug!("relay closed");
                    self.finished = true;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    self.finished = true;
                    return Err(WispError::ConnectionFailed(format!("relay read: {}", e)));
                }
            }
        }
    }
}

struct WsWriter {
    sink: SplitSink<WsStream, Message>,
    closed: bool,
}

#[async_trait]
impl StreamWriter for WsWriter {
    async fn write(&mut self, data: &[u8]) -> WispResult<usize> {
        if self.closed {
            return Err(WispError::ConnectionFailed("relay closed".into()));
        }
        self.sink
            .send(Message::Binary(data.to_vec()))
            .await
            .map_err(|e| WispError::ConnectionFailed(format!("relay write: {}", e)))?;
        Ok(data.len())
    }

    async fn close(&mut self) -> WispResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        // The relay may already be gone.
        let _ = self.sink.send(Message::Close(None)).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_target_url() {
        let relay = WebSocketRelay::new("wss://relay.example.net/connect");
        assert_eq!(
            relay.target_url("10.0.0.5", 22),
            "wss://relay.example.net/connect?host=10.0.0.5&port=22"
        );

        let relay = WebSocketRelay::new("ws://relay/c?token=abc");
        assert_eq!(
            relay.target_url("fe80::1", 2222),
            "ws://relay/c?token=abc&host=fe80::1&port=2222"
        );
        assert_eq!(
            WebSocketRelay::new("ws://r").target_url("a b", 1),
            "ws://r?host=a%20b&port=1"
        );
    }

    #[tokio::test]
    async fn test_relay_echo() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                match msg {
                    Message::Binary(data) => ws.send(Message::Binary(data)).await.unwrap(),
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        });

        let relay = WebSocketRelay::new(format!("ws://{}/", addr));
        let mut stream = relay.open_socket("10.0.0.5", 22).await.unwrap();
        assert_eq!(stream.kind(), StreamKind::RelayedSocket);
        assert_eq!(stream.label(), "10.0.0.5:22");

        stream.write_all(b"SSH-2.0-test\r\n").await.unwrap();
        assert_eq!(
            stream.read(4).await.unwrap(),
            ReadOutcome::Data(b"SSH-".to_vec())
        );
        assert_eq!(
            stream.read(64).await.unwrap(),
            ReadOutcome::Data(b"2.0-test\r\n".to_vec())
        );

        stream.close().await.unwrap();
        server.await.unwrap();
    }
}
