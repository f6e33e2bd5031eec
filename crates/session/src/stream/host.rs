//! Sockets proxied by the host over control messages.
//!
//! The engine asks for `openSocket [fd, host, port]` and then speaks through
//! `write`/`close`. The host answers with `onOpenSocket`, pushes received
//! bytes as `onRead`, acknowledges writes with `onWriteAcknowledge` and
//! reports `onClose`. [`HostRouter`] matches those completions to the
//! engine-side streams by descriptor.

use super::socket::Relay;
use crate::gateway::{CloseReason, EngineInput, EngineOutput, Outbound};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, trace, warn};
use wisp_platform::{ByteStream, ReadOutcome, StreamKind, StreamReader, StreamWriter, WispError, WispResult};

/// First descriptor the engine allocates. 0-2 are the terminal.
pub const FIRST_SOCKET_FD: u32 = 3;

/// Unacknowledged bytes a proxied socket may have in flight.
pub const HOST_SOCKET_WINDOW: u64 = 64 * 1024;

#[derive(Debug)]
enum RouteEvent {
    Data(Vec<u8>),
    Closed(CloseReason),
}

struct Route {
    events: mpsc::UnboundedSender<RouteEvent>,
    acked: watch::Sender<u64>,
    opened: Option<oneshot::Sender<bool>>,
}

struct RouterInner {
    outbound: Outbound<EngineOutput>,
    routes: Mutex<HashMap<u32, Route>>,
    next_fd: AtomicU32,
}

/// Routes host completions to the proxied sockets they belong to.
///
/// Cloning shares the routing table.
#[derive(Clone)]
pub struct HostRouter {
    inner: Arc<RouterInner>,
}

impl std::fmt::Debug for HostRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostRouter")
            .field("next_fd", &self.inner.next_fd.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl HostRouter {
    /// Creates a router that sends its requests through `outbound`.
    pub fn new(outbound: Outbound<EngineOutput>) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                outbound,
                routes: Mutex::new(HashMap::new()),
                next_fd: AtomicU32::new(FIRST_SOCKET_FD),
            }),
        }
    }

    /// Returns the number of registered sockets.
    pub async fn open_count(&self) -> usize {
        self.inner.routes.lock().await.len()
    }

    /// Delivers a completion.
    ///
    /// Returns the message back when it is not a socket completion, i.e.
    /// it concerns the terminal descriptors or is not a completion at all.
    /// Completions for descriptors that are no longer registered are
    /// dropped.
    pub async fn dispatch(&self, input: EngineInput) -> Option<EngineInput> {
        let fd = match input.fd() {
            Some(fd) if fd >= FIRST_SOCKET_FD => fd,
            _ => return Some(input),
        };

        let mut routes = self.inner.routes.lock().await;
        let Some(route) = routes.get_mut(&fd) else {
            debug!(fd, message = ?input, "Dropping completion for unregistered descriptor");
            return None;
        };

        match input {
            EngineInput::OnOpenSocket { success, .. } => {
                if let Some(opened) = route.opened.take() {
                    // The opener may have given up waiting.
                    let _ = opened.send(success);
                }
                if !success {
                    routes.remove(&fd);
                }
            }
            EngineInput::OnRead { data, .. } => {
                trace!(fd, len = data.len(), "Socket data");
                let _ = route.events.send(RouteEvent::Data(data));
            }
            EngineInput::OnWriteAcknowledge { total, .. } => {
                route.acked.send_if_modified(|acked| {
                    if total > *acked {
                        *acked = total;
                        true
                    } else {
                        false
                    }
                });
            }
            EngineInput::OnClose { reason, .. } => {
                debug!(fd, %reason, "Host closed socket");
                let _ = route.events.send(RouteEvent::Closed(reason));
                routes.remove(&fd);
            }
            EngineInput::OnOpenFile { .. } => {
                warn!(fd, "Unexpected onOpenFile for a socket descriptor");
            }
            EngineInput::StartSession(_)
            | EngineInput::OnResize { .. }
            | EngineInput::OnExitAcknowledge => {}
        }
        None
    }

    /// Forgets every socket. Pending opens fail and readers see end of
    /// stream; later completions for these descriptors are dropped.
    pub async fn clear(&self) {
        let dropped = std::mem::take(&mut *self.inner.routes.lock().await);
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "Dropping proxied sockets");
        }
    }

    /// Removes `fd`, returning whether it was registered.
    async fn unregister(&self, fd: u32) -> bool {
        self.inner.routes.lock().await.remove(&fd).is_some()
    }
}

#[async_trait]
impl Relay for HostRouter {
    async fn open_socket(&self, host: &str, port: u16) -> WispResult<ByteStream> {
        let fd = self.inner.next_fd.fetch_add(1, Ordering::Relaxed);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (acked_tx, acked_rx) = watch::channel(0u64);
        let (opened_tx, opened_rx) = oneshot::channel();

        self.inner.routes.lock().await.insert(
            fd,
            Route {
                events: events_tx,
                acked: acked_tx,
                opened: Some(opened_tx),
            },
        );
        debug!(fd, host, port, "Requesting host socket");
        if let Err(e) = self.inner.outbound.send(EngineOutput::OpenSocket {
            fd,
            host: host.to_string(),
            port,
        }) {
            self.unregister(fd).await;
            return Err(e);
        }

        match opened_rx.await {
            Ok(true) => {}
            Ok(false) => {
                return Err(WispError::ConnectionFailed(format!(
                    "host could not open {}:{}",
                    host, port
                )))
            }
            Err(_) => {
                self.unregister(fd).await;
                return Err(WispError::ConnectionFailed(format!(
                    "socket to {}:{} abandoned",
                    host, port
                )));
            }
        }

        Ok(ByteStream::new(
            StreamKind::RelayedSocket,
            format!("{}:{}", host, port),
            Box::new(HostReader {
                fd,
                events: events_rx,
                pending: Vec::new(),
                finished: false,
            }),
            Box::new(HostWriter {
                fd,
                router: self.clone(),
                acked: acked_rx,
                sent: 0,
                closed: false,
            }),
        ))
    }
}

struct HostReader {
    fd: u32,
    events: mpsc::UnboundedReceiver<RouteEvent>,
    pending: Vec<u8>,
    finished: bool,
}

#[async_trait]
impl StreamReader for HostReader {
    async fn read(&mut self, max_bytes: usize) -> WispResult<ReadOutcome> {
        loop {
            if !self.pending.is_empty() {
                let n = self.pending.len().min(max_bytes.max(1));
                let rest = self.pending.split_off(n);
                return Ok(ReadOutcome::Data(std::mem::replace(&mut self.pending, rest)));
            }
            if self.finished {
                return Ok(ReadOutcome::EndOfStream);
            }
            match self.events.recv().await {
                Some(RouteEvent::Data(data)) => self.pending = data,
                Some(RouteEvent::Closed(CloseReason::Error)) => {
                    self.finished = true;
                    return Err(WispError::ConnectionFailed(format!(
                        "host socket {} failed",
                        self.fd
                    )));
                }
                Some(RouteEvent::Closed(_)) | None => self.finished = true,
            }
        }
    }
}

struct HostWriter {
    fd: u32,
    router: HostRouter,
    acked: watch::Receiver<u64>,
    sent: u64,
    closed: bool,
}

#[async_trait]
impl StreamWriter for HostWriter {
    async fn write(&mut self, data: &[u8]) -> WispResult<usize> {
        if self.closed {
            return Err(WispError::ConnectionFailed(format!(
                "host socket {} is closed",
                self.fd
            )));
        }
        if data.is_empty() {
            return Ok(0);
        }

        let fd = self.fd;
        let sent = self.sent;
        let acked = *self
            .acked
            .wait_for(|acked| sent.saturating_sub(*acked) < HOST_SOCKET_WINDOW)
            .await
            .map_err(|_| WispError::ConnectionFailed(format!("host socket {} went away", fd)))?;

        let room = HOST_SOCKET_WINDOW - sent.saturating_sub(acked);
        let n = data.len().min(usize::try_from(room).unwrap_or(usize::MAX));
        self.router.inner.outbound.send(EngineOutput::Write {
            fd: self.fd,
            data: data[..n].to_vec(),
        })?;
        self.sent += n as u64;
        Ok(n)
    }

    async fn close(&mut self) -> WispResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.router.unregister(self.fd).await {
            self.router
                .inner
                .outbound
                .send(EngineOutput::Close { fd: self.fd })?;
        }
        Ok(())
    }
}
