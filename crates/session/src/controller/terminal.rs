//! Terminal-side state of a session: output flow control and input.

use crate::gateway::{EngineInput, EngineOutput, Outbound};
use crate::host::{STDERR_FD, STDIN_FD, STDOUT_FD};
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use wisp_platform::WispResult;
use wisp_proto::ssh::PtySize;

/// Engine input not claimed by the host socket router.
#[derive(Debug)]
pub(crate) struct Inbox {
    rx: mpsc::UnboundedReceiver<EngineInput>,
    closed: bool,
}

impl Inbox {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<EngineInput>) -> Self {
        Self { rx, closed: false }
    }

    /// Cancel safe.
    pub(crate) async fn recv(&mut self) -> Option<EngineInput> {
        if self.closed {
            return None;
        }
        let input = self.rx.recv().await;
        if input.is_none() {
            self.closed = true;
        }
        input
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }
}

#[derive(Debug)]
struct Held {
    fd: u32,
    data: Vec<u8>,
    from_channel: bool,
}

/// Bytes written on behalf of the channel, released once acknowledged.
#[derive(Debug)]
struct Unreleased {
    fd: u32,
    end: u64,
    len: usize,
}

/// Output window, input buffer and terminal size of one session.
#[derive(Debug)]
pub(crate) struct Terminal {
    outbound: Outbound<EngineOutput>,
    size: PtySize,
    resize_due: bool,
    write_window: u64,
    sent: [u64; 2],
    acked: [u64; 2],
    held: VecDeque<Held>,
    unreleased: VecDeque<Unreleased>,
    release_due: usize,
    typeahead: Vec<u8>,
}

impl Terminal {
    pub(crate) fn new(outbound: Outbound<EngineOutput>, size: PtySize, write_window: u64) -> Self {
        Self {
            outbound,
            size,
            resize_due: false,
            write_window: write_window.max(1),
            sent: [0; 2],
            acked: [0; 2],
            held: VecDeque::new(),
            unreleased: VecDeque::new(),
            release_due: 0,
            typeahead: Vec::new(),
        }
    }

    pub(crate) fn size(&self) -> PtySize {
        self.size
    }

    /// Sends a `printLog`.
    pub(crate) fn log(&self, text: impl Into<String>) -> WispResult<()> {
        let text = text.into();
        debug!(log = %text, "printLog");
        self.outbound.send(EngineOutput::PrintLog(text))
    }

    /// Queues bytes for the terminal and writes as much as the window allows.
    pub(crate) fn emit(&mut self, fd: u32, data: Vec<u8>, from_channel: bool) -> WispResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.held.push_back(Held {
            fd,
            data,
            from_channel,
        });
        self.pump()
    }

    /// Writes locally generated text to stdout, turning bare `\n` into `\r\n`.
    pub(crate) fn print(&mut self, text: &str) -> WispResult<()> {
        self.emit(STDOUT_FD, crlf(text).into_bytes(), false)
    }

    /// Bytes written but not yet acknowledged.
    pub(crate) fn in_flight(&self) -> u64 {
        (0..2).map(|i| self.sent[i] - self.acked[i]).sum()
    }

    /// Bytes waiting for room in the window.
    pub(crate) fn held_bytes(&self) -> usize {
        self.held.iter().map(|held| held.data.len()).sum()
    }

    fn pump(&mut self) -> WispResult<()> {
        loop {
            let room = self.write_window.saturating_sub(self.in_flight());
            if room == 0 {
                return Ok(());
            }
            let Some(front) = self.held.front_mut() else {
                return Ok(());
            };

            let n = front.data.len().min(usize::try_from(room).unwrap_or(usize::MAX));
            let (fd, from_channel) = (front.fd, front.from_channel);
            let data = if n == front.data.len() {
                self.held.pop_front().map(|held| held.data).unwrap_or_default()
            } else {
                let rest = front.data.split_off(n);
                std::mem::replace(&mut front.data, rest)
            };

            let slot = (fd - STDOUT_FD) as usize;
            self.sent[slot] += n as u64;
            if from_channel {
                self.unreleased.push_back(Unreleased {
                    fd,
                    end: self.sent[slot],
                    len: n,
                });
            }
            trace!(fd, len = n, "Terminal write");
            self.outbound.send(EngineOutput::Write { fd, data })?;
        }
    }

    fn acknowledge(&mut self, fd: u32, total: u64) -> WispResult<()> {
        if fd != STDOUT_FD && fd != STDERR_FD {
            debug!(fd, "Acknowledgement for an unknown descriptor");
            return Ok(());
        }
        let slot = (fd - STDOUT_FD) as usize;
        if total <= self.acked[slot] {
            if total < self.acked[slot] {
                warn!(fd, total, acked = self.acked[slot], "Acknowledgement went backwards");
            }
            return Ok(());
        }
        let total = if total > self.sent[slot] {
            warn!(fd, total, sent = self.sent[slot], "Acknowledged more than was written");
            self.sent[slot]
        } else {
            total
        };
        self.acked[slot] = total;

        let mut released = 0;
        self.unreleased.retain(|entry| {
            if entry.fd == fd && entry.end <= total {
                released += entry.len;
                false
            } else {
                true
            }
        });
        self.release_due += released;
        self.pump()
    }

    /// Applies one engine input that does not need the SSH client.
    ///
    /// Returns keystrokes for descriptor 0.
    pub(crate) fn absorb(&mut self, input: EngineInput) -> WispResult<Option<Vec<u8>>> {
        match input {
            EngineInput::OnRead { fd, data } if fd == STDIN_FD => return Ok(Some(data)),
            EngineInput::OnResize { width, height } => {
                let size = PtySize::new(width, height);
                if size != self.size {
                    debug!(width, height, "Terminal resized");
                    self.size = size;
                    self.resize_due = true;
                }
            }
            EngineInput::OnWriteAcknowledge { fd, total } => self.acknowledge(fd, total)?,
            EngineInput::OnExitAcknowledge => warn!("Exit acknowledged without an exit"),
            EngineInput::StartSession(_) => warn!("Session already running; ignoring startSession"),
            other => debug!(fd = ?other.fd(), "Unexpected engine input; ignoring"),
        }
        Ok(None)
    }

    /// Takes the channel bytes the terminal has acknowledged since last call.
    pub(crate) fn take_release(&mut self) -> usize {
        std::mem::take(&mut self.release_due)
    }

    /// Returns the new size if it changed since last call.
    pub(crate) fn take_resize(&mut self) -> Option<PtySize> {
        std::mem::take(&mut self.resize_due).then_some(self.size)
    }

    pub(crate) fn buffer_input(&mut self, data: &[u8]) {
        self.typeahead.extend_from_slice(data);
    }

    pub(crate) fn take_typeahead(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.typeahead)
    }
}

fn crlf(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + text.len() / 16);
    let mut prev = None;
    for c in text.chars() {
        if c == '\n' && prev != Some('\r') {
            out.push('\r');
        }
        out.push(c);
        prev = Some(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{EngineEnd, Gateway};

    fn terminal(window: u64) -> (Terminal, crate::gateway::HostEnd, EngineEnd) {
        let (engine, host) = Gateway::pair();
        (Terminal::new(engine.sender(), PtySize::default(), window), host, engine)
    }

    fn ack(fd: u32, total: u64) -> EngineInput {
        EngineInput::OnWriteAcknowledge { fd, total }
    }

    #[tokio::test]
    async fn test_output_is_held_beyond_the_window() {
        let (mut term, mut host, _engine) = terminal(4);

        term.emit(1, b"abcdef".to_vec(), true).unwrap();
        assert_eq!(
            host.recv().await,
            Some(EngineOutput::Write {
                fd: 1,
                data: b"abcd".to_vec()
            })
        );
        assert_eq!(term.held_bytes(), 2);
        assert_eq!(term.in_flight(), 4);

        term.absorb(ack(1, 4)).unwrap();
        assert_eq!(
            host.recv().await,
            Some(EngineOutput::Write {
                fd: 1,
                data: b"ef".to_vec()
            })
        );
        assert_eq!(term.held_bytes(), 0);
        assert_eq!(term.take_release(), 4);
    }

    #[tokio::test]
    async fn test_window_spans_both_descriptors() {
        let (mut term, mut host, _engine) = terminal(4);

        term.emit(2, b"err".to_vec(), true).unwrap();
        term.emit(1, b"out".to_vec(), true).unwrap();
        assert_eq!(
            host.recv().await,
            Some(EngineOutput::Write {
                fd: 2,
                data: b"err".to_vec()
            })
        );
        assert_eq!(
            host.recv().await,
            Some(EngineOutput::Write {
                fd: 1,
                data: b"o".to_vec()
            })
        );

        term.absorb(ack(2, 3)).unwrap();
        assert_eq!(term.take_release(), 3);
        assert_eq!(
            host.recv().await,
            Some(EngineOutput::Write {
                fd: 1,
                data: b"ut".to_vec()
            })
        );
    }

    #[tokio::test]
    async fn test_local_output_is_not_released_to_the_channel() {
        let (mut term, _host, _engine) = terminal(64);

        term.print("password: \n").unwrap();
        term.emit(1, b"shell".to_vec(), true).unwrap();
        term.absorb(ack(1, 12)).unwrap();
        assert_eq!(term.take_release(), 0);
        term.absorb(ack(1, 17)).unwrap();
        assert_eq!(term.take_release(), 5);
    }

    #[tokio::test]
    async fn test_stale_and_excess_acknowledgements() {
        let (mut term, _host, _engine) = terminal(64);

        term.emit(1, b"abc".to_vec(), true).unwrap();
        term.absorb(ack(1, 2)).unwrap();
        term.absorb(ack(1, 1)).unwrap();
        assert_eq!(term.in_flight(), 1);
        term.absorb(ack(1, 100)).unwrap();
        assert_eq!(term.in_flight(), 0);
        assert_eq!(term.take_release(), 3);
    }

    #[tokio::test]
    async fn test_absorb_returns_keystrokes_and_tracks_size() {
        let (mut term, _host, _engine) = terminal(64);

        let keys = term
            .absorb(EngineInput::OnRead {
                fd: 0,
                data: b"ls\n".to_vec(),
            })
            .unwrap();
        assert_eq!(keys, Some(b"ls\n".to_vec()));

        term.absorb(EngineInput::OnResize {
            width: 80,
            height: 24,
        })
        .unwrap();
        assert_eq!(term.take_resize(), None);
        term.absorb(EngineInput::OnResize {
            width: 120,
            height: 40,
        })
        .unwrap();
        assert_eq!(term.take_resize(), Some(PtySize::new(120, 40)));
        assert_eq!(term.take_resize(), None);
        assert_eq!(term.size(), PtySize::new(120, 40));
    }

    #[test]
    fn test_crlf_only_touches_bare_newlines() {
        assert_eq!(crlf("a\r\nb\n"), "a\r\nb\r\n");
        assert_eq!(crlf("\n\n"), "\r\n\r\n");
        assert_eq!(crlf("no newline"), "no newline");
    }
}
