//! Flow-control bookkeeping for one channel.
//!
//! Two windows are tracked. The send window is the peer's advertised budget;
//! data beyond it stays queued until a WINDOW_ADJUST arrives. The receive
//! window is ours; it shrinks as data arrives and grows again only when the
//! consumer releases bytes it has finished with.

use super::packet::MAX_PACKET_SIZE;
use std::collections::VecDeque;
use tracing::{debug, warn};
use wisp_platform::{WispError, WispResult};

/// Room left in a packet for the CHANNEL_DATA header, padding length byte
/// and worst-case padding.
const DATA_PACKET_OVERHEAD: usize = 64;

/// Largest data chunk our own packet encoder accepts.
pub const MAX_DATA_CHUNK: usize = MAX_PACKET_SIZE - DATA_PACKET_OVERHEAD;

/// Channel lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// CHANNEL_OPEN sent, waiting for confirmation.
    Opening,
    /// Confirmed by the peer.
    Open,
    /// CHANNEL_CLOSE sent, waiting for the peer's.
    Closing,
    /// Both sides closed.
    Closed,
}

/// Window and queue state of a channel.
#[derive(Debug)]
pub struct SshChannel {
    local_id: u32,
    remote_id: u32,
    state: ChannelState,

    send_window: u32,
    peer_max_packet: u32,
    outbound: VecDeque<Vec<u8>>,
    queued_bytes: usize,

    recv_window: u32,
    recv_window_max: u32,
    unreleased: u32,
    pending_adjust: u32,

    eof_sent: bool,
    eof_received: bool,
    close_sent: bool,
}

impl SshChannel {
    /// Creates a channel in `Opening` with our receive window.
    pub fn new(local_id: u32, recv_window: u32) -> Self {
        Self {
            local_id,
            remote_id: 0,
            state: ChannelState::Opening,
            send_window: 0,
            peer_max_packet: 0,
            outbound: VecDeque::new(),
            queued_bytes: 0,
            recv_window,
            recv_window_max: recv_window,
            unreleased: 0,
            pending_adjust: 0,
            eof_sent: false,
            eof_received: false,
            close_sent: false,
        }
    }

    /// Applies CHANNEL_OPEN_CONFIRMATION.
    pub fn confirm(&mut self, remote_id: u32, send_window: u32, peer_max_packet: u32) -> WispResult<()> {
        if self.state != ChannelState::Opening {
            return Err(WispError::ProtocolViolation(format!(
                "Channel {} confirmed twice",
                self.local_id
            )));
        }
        if peer_max_packet == 0 {
            return Err(WispError::ProtocolViolation(
                "Peer advertised a zero maximum packet size".to_string(),
            ));
        }
        self.remote_id = remote_id;
        self.send_window = send_window;
        self.peer_max_packet = peer_max_packet;
        self.state = ChannelState::Open;
        Ok(())
    }

    /// Returns our channel number.
    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    /// Returns the peer's channel number.
    pub fn remote_id(&self) -> u32 {
        self.remote_id
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Returns the bytes we may still send.
    pub fn send_window(&self) -> u32 {
        self.send_window
    }

    /// Returns the bytes the peer may still send us.
    pub fn recv_window(&self) -> u32 {
        self.recv_window
    }

    /// Returns the bytes waiting for send window.
    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// Returns true once the peer sent EOF.
    pub fn eof_received(&self) -> bool {
        self.eof_received
    }

    /// Appends data to the outbound queue.
    pub fn queue(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.queued_bytes += data.len();
        self.outbound.push_back(data.to_vec());
    }

    /// Takes as many queued chunks as the send window allows.
    ///
    /// Each returned chunk fits both the peer's maximum packet size and
    /// [`MAX_DATA_CHUNK`]. The send window is charged for everything returned.
    pub fn take_sendable(&mut self) -> Vec<Vec<u8>> {
        let mut chunks = Vec::new();
        if self.state != ChannelState::Open || self.eof_sent {
            return chunks;
        }

        while self.send_window > 0 {
            let Some(front) = self.outbound.front_mut() else {
                break;
            };
            let limit = (self.send_window.min(self.peer_max_packet) as usize).min(MAX_DATA_CHUNK);
            let chunk = if front.len() <= limit {
                self.outbound.pop_front().unwrap_or_default()
            } else {
                let rest = front.split_off(limit);
                std::mem::replace(front, rest)
            };

            self.send_window -= chunk.len() as u32;
            self.queued_bytes -= chunk.len();
            chunks.push(chunk);
        }

        if self.queued_bytes > 0 && self.send_window == 0 {
            debug!(
                channel = self.local_id,
                queued = self.queued_bytes,
                "Send window exhausted, holding data"
            );
        }
        chunks
    }

    /// Applies CHANNEL_WINDOW_ADJUST.
    pub fn add_send_window(&mut self, bytes: u32) {
        match self.send_window.checked_add(bytes) {
            Some(window) => self.send_window = window,
            None => {
                warn!(channel = self.local_id, "Window adjust overflow, clamping");
                self.send_window = u32::MAX;
            }
        }
    }

    /// Charges the receive window for incoming data.
    ///
    /// # Errors
    ///
    /// Returns [`WispError::ProtocolViolation`] if the peer overran the window.
    pub fn on_data_received(&mut self, len: usize) -> WispResult<()> {
        let len = u32::try_from(len)
            .ok()
            .filter(|&len| len <= self.recv_window)
            .ok_or_else(|| {
                WispError::ProtocolViolation(format!(
                    "Peer sent {} bytes with only {} bytes of window",
                    len, self.recv_window
                ))
            })?;
        self.recv_window -= len;
        self.unreleased += len;
        Ok(())
    }

    /// Returns consumed bytes to the receive window.
    ///
    /// Returns the WINDOW_ADJUST amount to send, if one is due. Adjusts are
    /// batched until the window has fallen below half its size.
    pub fn release(&mut self, bytes: u32) -> Option<u32> {
        let bytes = bytes.min(self.unreleased);
        self.unreleased -= bytes;
        self.pending_adjust += bytes;

        if self.pending_adjust > 0
            && self.recv_window < self.recv_window_max / 2
            && matches!(self.state, ChannelState::Open)
        {
            let adjust = std::mem::take(&mut self.pending_adjust);
            self.recv_window += adjust;
            Some(adjust)
        } else {
            None
        }
    }

    /// Records the peer's EOF.
    pub fn mark_eof_received(&mut self) {
        self.eof_received = true;
    }

    /// Returns true if EOF should be sent now: once, and only after the queue
    /// has drained.
    pub fn take_eof(&mut self) -> bool {
        if self.eof_sent || self.queued_bytes > 0 || self.state != ChannelState::Open {
            return false;
        }
        self.eof_sent = true;
        true
    }

    /// Starts our side of the close. Returns true if CHANNEL_CLOSE must be sent.
    pub fn begin_close(&mut self) -> bool {
        if self.close_sent || self.state == ChannelState::Closed {
            return false;
        }
        self.close_sent = true;
        self.outbound.clear();
        self.queued_bytes = 0;
        self.state = ChannelState::Closing;
        true
    }

    /// Handles the peer's CHANNEL_CLOSE. Returns true if we still owe ours.
    pub fn on_close_received(&mut self) -> bool {
        let owe_close = !self.close_sent;
        self.close_sent = true;
        self.outbound.clear();
        self.queued_bytes = 0;
        self.state = ChannelState::Closed;
        owe_close
    }
}
