//! The terminal side of the control-message boundary.
//!
//! [`HostBridge`] plays the role a browser terminal plays for the engine: it
//! acknowledges terminal writes, serves descriptors from a
//! [`DescriptorTable`] and acknowledges the exit. What is left for the
//! caller comes out as [`HostEvent`]s.

use crate::fd_table::DescriptorTable;
use crate::gateway::{EngineInput, EngineOutput, HostEnd, Outbound};
use crate::params::StartSessionArgs;
use crate::stream::{FileStore, Relay};
use std::sync::Arc;
use tracing::{debug, info, warn};
use wisp_platform::{WispError, WispResult};

/// Descriptor the engine reads keystrokes from.
pub const STDIN_FD: u32 = 0;
/// Descriptor for terminal output.
pub const STDOUT_FD: u32 = 1;
/// Descriptor for terminal error output.
pub const STDERR_FD: u32 = 2;

/// Something the terminal has to show or act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// Bytes for the terminal.
    Stdout(Vec<u8>),
    /// Error bytes for the terminal.
    Stderr(Vec<u8>),
    /// A diagnostic line from the engine.
    Log(String),
    /// The session ended with this code. Already acknowledged.
    Exit(i32),
}

/// Drives the host end of a [`Gateway`](crate::gateway::Gateway) pair.
#[derive(Debug)]
pub struct HostBridge {
    end: HostEnd,
    table: DescriptorTable,
    written: [u64; 2],
}

impl HostBridge {
    /// Wraps the host end. The descriptor table starts with no file store
    /// and no relay.
    pub fn new(end: HostEnd) -> Self {
        let table = DescriptorTable::new(end.sender());
        Self {
            end,
            table,
            written: [0; 2],
        }
    }

    /// Serves `openFile` from `store`.
    pub fn with_file_store(mut self, store: Arc<dyn FileStore>) -> Self {
        self.table = self.table.with_file_store(store);
        self
    }

    /// Serves `openSocket` through `relay`.
    pub fn with_relay(mut self, relay: Arc<dyn Relay>) -> Self {
        self.table = self.table.with_relay(relay);
        self
    }

    /// Sets the descriptor write pacing budget.
    pub fn with_pacing_bytes(mut self, bytes: usize) -> Self {
        self.table = self.table.with_pacing_bytes(bytes);
        self
    }

    /// Returns a sender for engine input, for callers feeding it from
    /// another task.
    pub fn input(&self) -> Outbound<EngineInput> {
        self.end.sender()
    }

    /// Returns the descriptor table.
    pub fn table(&self) -> &DescriptorTable {
        &self.table
    }

    /// Sends `startSession`.
    ///
    /// # Errors
    ///
    /// Returns [`WispError::ConnectionFailed`] if the engine is gone.
    pub fn start_session(&mut self, args: StartSessionArgs) -> WispResult<()> {
        self.written = [0; 2];
        self.end.send(EngineInput::StartSession(args))
    }

    /// Sends keystrokes as `onRead` on descriptor 0.
    ///
    /// # Errors
    ///
    /// Returns [`WispError::ConnectionFailed`] if the engine is gone.
    pub fn send_input(&self, data: impl Into<Vec<u8>>) -> WispResult<()> {
        self.end.send(EngineInput::OnRead {
            fd: STDIN_FD,
            data: data.into(),
        })
    }

    /// Sends `onResize`.
    ///
    /// # Errors
    ///
    /// Returns [`WispError::ConnectionFailed`] if the engine is gone.
    pub fn resize(&self, width: u32, height: u32) -> WispResult<()> {
        self.end.send(EngineInput::OnResize { width, height })
    }

    /// Waits for the next event, serving everything else along the way.
    ///
    /// Returns `None` once the engine end is gone.
    pub async fn next_event(&mut self) -> Option<HostEvent> {
        loop {
            let output = self.end.recv().await?;
            if let Some(event) = self.handle(output).await {
                return Some(event);
            }
        }
    }

    /// Handles one engine output.
    pub async fn handle(&mut self, output: EngineOutput) -> Option<HostEvent> {
        match output {
            EngineOutput::PrintLog(text) => {
                info!(target: "wisp::engine", "{}", text);
                Some(HostEvent::Log(text))
            }
            EngineOutput::Write { fd, data } if fd == STDOUT_FD || fd == STDERR_FD => {
                let slot = &mut self.written[(fd - STDOUT_FD) as usize];
                *slot += data.len() as u64;
                let total = *slot;
                self.reply(EngineInput::OnWriteAcknowledge { fd, total });
                Some(if fd == STDOUT_FD {
                    HostEvent::Stdout(data)
                } else {
                    HostEvent::Stderr(data)
                })
            }
            EngineOutput::Exit(code) => {
                debug!(code, "Engine exited");
                self.reply(EngineInput::OnExitAcknowledge);
                self.table.clear().await;
                Some(HostEvent::Exit(code))
            }
            other => {
                self.serve_descriptor(other).await;
                None
            }
        }
    }

    async fn serve_descriptor(&mut self, output: EngineOutput) {
        let result = match output {
            EngineOutput::OpenFile { fd, path, mode } => {
                self.table.open_file(fd, path, mode).await;
                Ok(())
            }
            EngineOutput::OpenSocket { fd, host, port } => {
                self.table.open_socket(fd, host, port).await;
                Ok(())
            }
            EngineOutput::Read { fd, .. } | EngineOutput::Write { fd, .. } | EngineOutput::Close { fd }
                if fd == STDIN_FD =>
            {
                warn!("Engine addressed the keyboard descriptor; ignoring");
                Ok(())
            }
            EngineOutput::Read { fd, size } => self.table.read(fd, size).await,
            EngineOutput::Write { fd, data } => self.table.write(fd, data).await,
            EngineOutput::Close { fd } => self.table.close(fd).await,
            EngineOutput::PrintLog(_) | EngineOutput::Exit(_) => Ok(()),
        };

        match result {
            Err(WispError::DescriptorNotFound(fd)) => warn!(fd, "Unknown descriptor"),
            Err(e) => warn!(error = %e, "Descriptor request failed"),
            Ok(()) => {}
        }
    }

    fn reply(&self, message: EngineInput) {
        if self.end.send(message).is_err() {
            debug!("Engine gone; dropping reply");
        }
    }
}
