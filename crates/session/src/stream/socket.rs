//! Socket streams and the relay seam.
//!
//! Every way of reaching `host:port` is a [`Relay`]: a direct TCP dial, a
//! WebSocket relay, or a socket the host proxies over control messages.

use super::io::from_io;
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;
use wisp_platform::{ByteStream, StreamKind, WispError, WispResult};

/// Default time allowed for a TCP connect.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Opens sockets on behalf of a session.
#[async_trait]
pub trait Relay: Send + Sync {
    /// Opens a byte stream to `host:port`.
    ///
    /// # Errors
    ///
    /// Returns [`WispError::ConnectionRefused`], [`WispError::HostUnreachable`]
    /// or [`WispError::ConnectionFailed`] depending on how the dial failed.
    async fn open_socket(&self, host: &str, port: u16) -> WispResult<ByteStream>;
}

/// Dials TCP directly.
#[derive(Debug, Clone)]
pub struct DirectRelay {
    connect_timeout: Duration,
}

impl Default for DirectRelay {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl DirectRelay {
    /// Creates a dialer with the given connect timeout.
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Relay for DirectRelay {
    async fn open_socket(&self, host: &str, port: u16) -> WispResult<ByteStream> {
        connect_tcp(host, port, self.connect_timeout).await
    }
}

/// Dials `host:port` over TCP with a timeout.
///
/// A timeout is reported as [`WispError::HostUnreachable`].
pub async fn connect_tcp(host: &str, port: u16, timeout: Duration) -> WispResult<ByteStream> {
    let label = format!("{}:{}", host, port);
    let stream = match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            debug!(target_addr = %label, error = %e, "TCP connect failed");
            return Err(classify_connect_error(&label, e));
        }
        Err(_) => {
            return Err(WispError::HostUnreachable(format!(
                "{}: connect timed out after {:?}",
                label, timeout
            )))
        }
    };
    stream.set_nodelay(true)?;
    debug!(peer = %label, "TCP connected");
    Ok(from_io(StreamKind::Socket, label, stream))
}

fn classify_connect_error(label: &str, error: std::io::Error) -> WispError {
    match WispError::from(error) {
        WispError::Io(e) => WispError::ConnectionFailed(format!("{}: {}", label, e)),
        WispError::ConnectionRefused(msg) => {
            WispError::ConnectionRefused(format!("{}: {}", label, msg))
        }
        WispError::HostUnreachable(msg) => WispError::HostUnreachable(format!("{}: {}", label, msg)),
        other => other,
    }
}
