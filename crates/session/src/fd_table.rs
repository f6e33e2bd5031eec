//! The host-side descriptor table.
//!
//! Serves the engine's `openFile`, `openSocket`, `read`, `write` and `close`
//! requests for descriptors 3 and up, answering with `onOpenFile`,
//! `onOpenSocket`, `onRead`, `onWriteAcknowledge` and `onClose`.
//!
//! Each open descriptor runs two tasks: one serving reads (or pushing
//! socket data as it arrives) and one serving writes in order through a
//! [`Pacer`]. That keeps at most one read and one write in flight per
//! descriptor.

use crate::gateway::{CloseReason, EngineInput, Outbound};
use crate::stream::{is_random_device, random_stream, FileStore, OpenMode, Relay, READ_CHUNK};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use wisp_platform::{ByteStream, ReadOutcome, StreamKind, StreamReader, StreamWriter, WispError, WispResult};

/// Length of one pacing window.
pub const PACING_WINDOW: Duration = Duration::from_millis(100);

/// Write-rate limiter: at most `budget` bytes per [`PACING_WINDOW`].
#[derive(Debug)]
pub struct Pacer {
    budget: usize,
    window_start: Instant,
    used: usize,
}

impl Pacer {
    /// Creates a limiter. A zero budget is treated as one byte.
    pub fn new(budget: usize) -> Self {
        Self {
            budget: budget.max(1),
            window_start: Instant::now(),
            used: 0,
        }
    }

    /// Returns the per-window budget.
    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Waits until `bytes` (at most the budget) fit in the current window,
    /// then accounts for them.
    pub async fn reserve(&mut self, bytes: usize) {
        let now = Instant::now();
        if now.duration_since(self.window_start) >= PACING_WINDOW {
            self.window_start = now;
            self.used = 0;
        }
        if self.used > 0 && self.used + bytes > self.budget {
            tokio::time::sleep_until(self.window_start + PACING_WINDOW).await;
            self.window_start = Instant::now();
            self.used = 0;
        }
        self.used += bytes;
    }
}

enum WriteOp {
    Data(Vec<u8>),
    Close,
}

struct Descriptor {
    kind: StreamKind,
    label: String,
    reads: Option<mpsc::UnboundedSender<u32>>,
    writes: mpsc::UnboundedSender<WriteOp>,
    tasks: [AbortHandle; 2],
}

impl Descriptor {
    fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

enum Slot {
    Opening(AbortHandle),
    Open(Descriptor),
    /// `close` was requested; the writer task is draining. The fd stays
    /// taken until `onClose` is sent.
    Closing(AbortHandle),
}

impl Slot {
    fn abort(&self) {
        match self {
            Slot::Opening(task) | Slot::Closing(task) => task.abort(),
            Slot::Open(descriptor) => descriptor.abort(),
        }
    }
}

/// Descriptors the engine opened through the host.
///
/// Cloning shares the table.
#[derive(Clone)]
pub struct DescriptorTable {
    outbound: Outbound<EngineInput>,
    files: Option<Arc<dyn FileStore>>,
    relay: Option<Arc<dyn Relay>>,
    pacing_bytes: usize,
    slots: Arc<Mutex<HashMap<u32, Slot>>>,
}

impl fmt::Debug for DescriptorTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorTable")
            .field("files", &self.files.is_some())
            .field("relay", &self.relay.is_some())
            .field("pacing_bytes", &self.pacing_bytes)
            .finish_non_exhaustive()
    }
}

impl DescriptorTable {
    /// Creates a table that answers through `outbound`.
    ///
    /// Without a file store only the random devices can be opened; without
    /// a relay every socket open fails.
    pub fn new(outbound: Outbound<EngineInput>) -> Self {
        Self {
            outbound,
            files: None,
            relay: None,
            pacing_bytes: crate::config::DEFAULT_WRITE_PACING_BYTES,
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Serves `openFile` from `store`.
    pub fn with_file_store(mut self, store: Arc<dyn FileStore>) -> Self {
        self.files = Some(store);
        self
    }

    /// Serves `openSocket` through `relay`.
    pub fn with_relay(mut self, relay: Arc<dyn Relay>) -> Self {
        self.relay = Some(relay);
        self
    }

    /// Sets the bytes each descriptor may write per pacing window.
    pub fn with_pacing_bytes(mut self, bytes: usize) -> Self {
        self.pacing_bytes = bytes.max(1);
        self
    }

    /// Returns the number of descriptors that are opening, open or closing.
    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }

    /// Returns true when no descriptor is open.
    pub async fn is_empty(&self) -> bool {
        self.slots.lock().await.is_empty()
    }

    /// Returns the kind and label of an open descriptor.
    pub async fn describe(&self, fd: u32) -> Option<(StreamKind, String)> {
        match self.slots.lock().await.get(&fd) {
            Some(Slot::Open(descriptor)) => Some((descriptor.kind, descriptor.label.clone())),
            _ => None,
        }
    }

    fn reply(&self, message: EngineInput) {
        if self.outbound.send(message).is_err() {
            trace!("Engine gone; dropping completion");
        }
    }

    /// Handles `openFile [fd, path, mode]`. Answers `onOpenFile`.
    pub async fn open_file(&self, fd: u32, path: String, mode: String) {
        let mut slots = self.slots.lock().await;
        if slots.contains_key(&fd) {
            warn!(fd, path = %path, "Descriptor already open");
            self.reply(EngineInput::OnOpenFile { fd, success: false });
            return;
        }

        if is_random_device(&path) {
            debug!(fd, path = %path, "Opened random device");
            let descriptor = self.start(fd, random_stream(&path));
            slots.insert(fd, Slot::Open(descriptor));
            self.reply(EngineInput::OnOpenFile { fd, success: true });
            return;
        }

        let mode = match mode.parse::<OpenMode>() {
            Ok(mode) => mode,
            Err(e) => {
                warn!(fd, error = %e, "Refusing open");
                self.reply(EngineInput::OnOpenFile { fd, success: false });
                return;
            }
        };
        let Some(store) = self.files.clone() else {
            debug!(fd, path = %path, "No file store configured");
            self.reply(EngineInput::OnOpenFile { fd, success: false });
            return;
        };

        let table = self.clone();
        let task = tokio::spawn(async move {
            let opened = store.open(&path, mode).await;
            if let Err(e) = &opened {
                debug!(fd, path = %path, error = %e, "Open failed");
            }
            table
                .finish_open(fd, opened, |fd, success| EngineInput::OnOpenFile { fd, success })
                .await;
        });
        slots.insert(fd, Slot::Opening(task.abort_handle()));
    }

    /// Handles `openSocket [fd, host, port]`. Answers `onOpenSocket`.
    pub async fn open_socket(&self, fd: u32, host: String, port: u16) {
        let mut slots = self.slots.lock().await;
        if slots.contains_key(&fd) {
            warn!(fd, host = %host, port, "Descriptor already open");
            self.reply(EngineInput::OnOpenSocket { fd, success: false });
            return;
        }
        let Some(relay) = self.relay.clone() else {
            warn!(fd, host = %host, port, "No socket relay configured");
            self.reply(EngineInput::OnOpenSocket { fd, success: false });
            return;
        };

        let table = self.clone();
        let task = tokio::spawn(async move {
            let opened = relay.open_socket(&host, port).await;
            if let Err(e) = &opened {
                debug!(fd, host = %host, port, error = %e, "Socket open failed");
            }
            table
                .finish_open(fd, opened, |fd, success| EngineInput::OnOpenSocket { fd, success })
                .await;
        });
        slots.insert(fd, Slot::Opening(task.abort_handle()));
    }

    async fn finish_open(
        &self,
        fd: u32,
        opened: WispResult<ByteStream>,
        reply: fn(u32, bool) -> EngineInput,
    ) {
        let mut slots = self.slots.lock().await;
        if !matches!(slots.get(&fd), Some(Slot::Opening(_))) {
            // Closed or cleared while opening.
            return;
        }
        match opened {
            Ok(stream) => {
                debug!(fd, label = %stream.label(), "Descriptor open");
                let descriptor = self.start(fd, stream);
                slots.insert(fd, Slot::Open(descriptor));
                self.reply(reply(fd, true));
            }
            Err(_) => {
                slots.remove(&fd);
                self.reply(reply(fd, false));
            }
        }
    }

    /// Spawns the read and write tasks for a freshly opened stream.
    fn start(&self, fd: u32, stream: ByteStream) -> Descriptor {
        let kind = stream.kind();
        let label = stream.label().to_string();
        let (reader, writer) = stream.into_split();

        let (writes_tx, writes_rx) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(serve_writes(
            self.clone(),
            fd,
            writer,
            writes_rx,
            Pacer::new(self.pacing_bytes),
        ));

        let (reads, reader_task) = if kind.is_socket() {
            (None, tokio::spawn(pump_socket(self.clone(), fd, reader)))
        } else {
            let (reads_tx, reads_rx) = mpsc::unbounded_channel();
            (
                Some(reads_tx),
                tokio::spawn(serve_reads(self.clone(), fd, reader, reads_rx)),
            )
        };

        Descriptor {
            kind,
            label,
            reads,
            writes: writes_tx,
            tasks: [reader_task.abort_handle(), writer_task.abort_handle()],
        }
    }

    /// Handles `read [fd, size]`. Answers with one or more `onRead` pieces
    /// of at most [`READ_CHUNK`] bytes; an empty `onRead` means end of
    /// file. Socket data is pushed without being asked for.
    ///
    /// # Errors
    ///
    /// Returns [`WispError::DescriptorNotFound`] if `fd` is not open.
    pub async fn read(&self, fd: u32, size: u32) -> WispResult<()> {
        let slots = self.slots.lock().await;
        let Some(Slot::Open(descriptor)) = slots.get(&fd) else {
            return Err(WispError::DescriptorNotFound(fd));
        };
        match &descriptor.reads {
            Some(reads) => {
                // The read task only stops once the slot is gone.
                let _ = reads.send(size);
            }
            None => trace!(fd, "Socket data is pushed; ignoring read request"),
        }
        Ok(())
    }

    /// Handles `write [fd, data]`. Answers `onWriteAcknowledge` with the
    /// running total once the bytes are written.
    ///
    /// # Errors
    ///
    /// Returns [`WispError::DescriptorNotFound`] if `fd` is not open.
    pub async fn write(&self, fd: u32, data: Vec<u8>) -> WispResult<()> {
        let slots = self.slots.lock().await;
        let Some(Slot::Open(descriptor)) = slots.get(&fd) else {
            return Err(WispError::DescriptorNotFound(fd));
        };
        let _ = descriptor.writes.send(WriteOp::Data(data));
        Ok(())
    }

    /// Handles `close [fd]`. Queued writes are finished first, then
    /// `onClose [fd, "closed"]` is sent. The fd can be opened again only
    /// after that.
    ///
    /// # Errors
    ///
    /// Returns [`WispError::DescriptorNotFound`] if `fd` is not open.
    pub async fn close(&self, fd: u32) -> WispResult<()> {
        let mut slots = self.slots.lock().await;
        match slots.remove(&fd) {
            None => return Err(WispError::DescriptorNotFound(fd)),
            Some(Slot::Closing(task)) => {
                slots.insert(fd, Slot::Closing(task));
                debug!(fd, "Descriptor already closing");
                return Ok(());
            }
            Some(Slot::Opening(task)) => {
                task.abort();
                self.reply(EngineInput::OnClose {
                    fd,
                    reason: CloseReason::Closed,
                });
            }
            Some(Slot::Open(Descriptor {
                writes,
                tasks: [reader, writer],
                ..
            })) => {
                reader.abort();
                if writes.send(WriteOp::Close).is_ok() {
                    slots.insert(fd, Slot::Closing(writer));
                } else {
                    self.reply(EngineInput::OnClose {
                        fd,
                        reason: CloseReason::Closed,
                    });
                }
            }
        }
        debug!(fd, "Descriptor closing");
        Ok(())
    }

    /// Drops every descriptor without sending completions.
    pub async fn clear(&self) {
        let slots = std::mem::take(&mut *self.slots.lock().await);
        for slot in slots.values() {
            slot.abort();
        }
        if !slots.is_empty() {
            debug!(count = slots.len(), "Descriptor table cleared");
        }
    }

    /// Frees `fd` once its writer drained after `close`, then answers.
    async fn finish_close(&self, fd: u32) {
        let mut slots = self.slots.lock().await;
        if matches!(slots.get(&fd), Some(Slot::Closing(_))) {
            slots.remove(&fd);
            self.reply(EngineInput::OnClose {
                fd,
                reason: CloseReason::Closed,
            });
        }
    }

    /// Ends `fd` after its stream finished or failed.
    async fn finish(&self, fd: u32, reason: CloseReason) {
        let Some(slot) = self.slots.lock().await.remove(&fd) else {
            return;
        };
        self.reply(EngineInput::OnClose { fd, reason });
        slot.abort();
    }
}

async fn serve_reads(
    table: DescriptorTable,
    fd: u32,
    mut reader: Box<dyn StreamReader>,
    mut requests: mpsc::UnboundedReceiver<u32>,
) {
    while let Some(size) = requests.recv().await {
        let mut remaining = (size as usize).max(1);
        let mut delivered = 0usize;
        while remaining > 0 {
            let want = remaining.min(READ_CHUNK);
            match reader.read(want).await {
                Ok(ReadOutcome::Data(data)) => {
                    let len = data.len();
                    trace!(fd, len, "Read");
                    table.reply(EngineInput::OnRead { fd, data });
                    delivered += len;
                    remaining = remaining.saturating_sub(len);
                    // A short piece means the stream has nothing more right now.
                    if len < want {
                        break;
                    }
                }
                Ok(ReadOutcome::EndOfStream) => {
                    if delivered == 0 {
                        table.reply(EngineInput::OnRead {
                            fd,
                            data: Vec::new(),
                        });
                    }
                    break;
                }
                Err(e) => {
                    warn!(fd, error = %e, "Read failed");
                    table.finish(fd, CloseReason::Error).await;
                    return;
                }
            }
        }
    }
}

async fn pump_socket(table: DescriptorTable, fd: u32, mut reader: Box<dyn StreamReader>) {
    loop {
        match reader.read(READ_CHUNK).await {
            Ok(ReadOutcome::Data(data)) => {
                trace!(fd, len = data.len(), "Socket data");
                table.reply(EngineInput::OnRead { fd, data });
            }
            Ok(ReadOutcome::EndOfStream) => {
                debug!(fd, "Socket peer closed");
                table.finish(fd, CloseReason::Eof).await;
                return;
            }
            Err(e) => {
                warn!(fd, error = %e, "Socket read failed");
                table.finish(fd, CloseReason::Error).await;
                return;
            }
        }
    }
}

async fn serve_writes(
    table: DescriptorTable,
    fd: u32,
    mut writer: Box<dyn StreamWriter>,
    mut ops: mpsc::UnboundedReceiver<WriteOp>,
    mut pacer: Pacer,
) {
    let mut total: u64 = 0;
    while let Some(op) = ops.recv().await {
        match op {
            WriteOp::Data(data) => {
                for piece in data.chunks(pacer.budget()) {
                    pacer.reserve(piece.len()).await;
                    if let Err(e) = write_all(writer.as_mut(), piece).await {
                        warn!(fd, error = %e, "Write failed");
                        table.finish(fd, CloseReason::Error).await;
                        return;
                    }
                    total += piece.len() as u64;
                    table.reply(EngineInput::OnWriteAcknowledge { fd, total });
                }
            }
            WriteOp::Close => {
                if let Err(e) = writer.close().await {
                    debug!(fd, error = %e, "Close failed");
                }
                table.finish_close(fd).await;
                return;
            }
        }
    }
}

async fn write_all(writer: &mut dyn StreamWriter, mut data: &[u8]) -> WispResult<()> {
    while !data.is_empty() {
        let n = writer.write(data).await?;
        if n == 0 {
            return Err(WispError::ConnectionFailed("stream stopped accepting data".into()));
        }
        data = &data[n..];
    }
    Ok(())
}
