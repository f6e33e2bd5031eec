//! Transport layer: connection state machine, packet codec and rekey policy.
//!
//! # Connection states
//!
//! ```text
//! VersionExchange -> KeyExchange -> Authenticating -> ChannelOpen -> Interactive
//!                                                                       |
//!                      any state -> Closing -> Closed  <----------------+
//! ```
//!
//! Rekeying does not leave `Interactive`; it is tracked separately so the
//! session layer never sees it.
//!
//! # Example
//!
//! ```rust
//! use wisp_proto::ssh::transport::{State, TransportState};
//!
//! let mut state = TransportState::new();
//! state.transition(State::KeyExchange).unwrap();
//! assert!(state.transition(State::Interactive).is_err());
//! state.transition(State::Closing).unwrap();
//! ```

use crate::ssh::cipher::{PacketOpener, PacketSealer, Role};
use crate::ssh::message::MessageType;
use crate::ssh::packet::Packet;
use crate::ssh::version::{BannerScanner, ScannedBanner, Version};
use crate::ssh::wire::{put_string, read_string, read_u32};
use bytes::{BufMut, BytesMut};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, trace};
use wisp_platform::{ReadOutcome, StreamReader, StreamWriter, WispError, WispResult};

/// Default rekey threshold in bytes (1 GiB).
pub const DEFAULT_REKEY_BYTES: u64 = 1 << 30;

/// Default rekey threshold in time (one hour).
pub const DEFAULT_REKEY_INTERVAL: Duration = Duration::from_secs(3600);

const READ_CHUNK: usize = 16 * 1024;

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Identification strings being exchanged.
    VersionExchange,
    /// First key exchange in progress.
    KeyExchange,
    /// User authentication in progress.
    Authenticating,
    /// Session channel being opened and configured.
    ChannelOpen,
    /// Shell running; data flows.
    Interactive,
    /// Teardown started.
    Closing,
    /// Connection gone.
    Closed,
}

/// Validated state holder.
#[derive(Debug, Clone)]
pub struct TransportState {
    state: State,
}

impl Default for TransportState {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportState {
    /// Starts in `VersionExchange`.
    pub fn new() -> Self {
        Self {
            state: State::VersionExchange,
        }
    }

    /// Returns the current state.
    pub fn current(&self) -> State {
        self.state
    }

    /// Moves to `next`.
    ///
    /// # Errors
    ///
    /// Returns [`WispError::ProtocolViolation`] for any move off the
    /// forward path other than to `Closing` or `Closed`.
    pub fn transition(&mut self, next: State) -> WispResult<()> {
        use State::*;

        let valid = match (self.state, next) {
            (a, b) if a == b => true,
            (Closed, _) => false,
            (_, Closing) | (_, Closed) => true,
            (VersionExchange, KeyExchange)
            | (KeyExchange, Authenticating)
            | (Authenticating, ChannelOpen)
            | (ChannelOpen, Interactive) => true,
            _ => false,
        };

        if !valid {
            return Err(WispError::ProtocolViolation(format!(
                "Invalid state transition: {:?} -> {:?}",
                self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }
}

/// Decides when keys must be renewed.
#[derive(Debug, Clone)]
pub struct RekeyTracker {
    bytes_limit: u64,
    time_limit: Duration,
    bytes: u64,
    since: Instant,
}

impl RekeyTracker {
    /// Creates a tracker with the given thresholds.
    pub fn new(bytes_limit: u64, time_limit: Duration) -> Self {
        Self {
            bytes_limit,
            time_limit,
            bytes: 0,
            since: Instant::now(),
        }
    }

    /// Counts bytes sent or received.
    pub fn add(&mut self, bytes: usize) {
        self.bytes = self.bytes.saturating_add(bytes as u64);
    }

    /// Returns the bytes counted since the last reset.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Returns true once either threshold is reached.
    pub fn needs_rekey(&self, now: Instant) -> bool {
        self.bytes >= self.bytes_limit || now.duration_since(self.since) >= self.time_limit
    }

    /// Restarts both counters after a completed exchange.
    pub fn reset(&mut self, now: Instant) {
        self.bytes = 0;
        self.since = now;
    }
}

impl Default for RekeyTracker {
    fn default() -> Self {
        Self::new(DEFAULT_REKEY_BYTES, DEFAULT_REKEY_INTERVAL)
    }
}

/// Binary packet codec for one direction pair.
///
/// Keeps both sequence numbers and the active sealer and opener. New keys are
/// installed per direction when the matching NEWKEYS is sent or received.
#[derive(Debug)]
pub struct PacketCodec {
    role: Role,
    sealer: PacketSealer,
    opener: PacketOpener,
    send_seq: u32,
    recv_seq: u32,
}

impl PacketCodec {
    /// Creates a codec with no encryption.
    pub fn new(role: Role) -> Self {
        Self {
            role,
            sealer: PacketSealer::Clear,
            opener: PacketOpener::Clear,
            send_seq: 0,
            recv_seq: 0,
        }
    }

    /// Returns which side this codec speaks for.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Returns the next outgoing sequence number.
    pub fn send_sequence(&self) -> u32 {
        self.send_seq
    }

    /// Returns the next incoming sequence number.
    pub fn recv_sequence(&self) -> u32 {
        self.recv_seq
    }

    /// Installs outgoing keys. Strict kex restarts the sequence at zero.
    pub fn install_sealer(&mut self, sealer: PacketSealer, reset_sequence: bool) {
        self.sealer = sealer;
        if reset_sequence {
            self.send_seq = 0;
        }
    }

    /// Installs incoming keys. Strict kex restarts the sequence at zero.
    pub fn install_opener(&mut self, opener: PacketOpener, reset_sequence: bool) {
        self.opener = opener;
        if reset_sequence {
            self.recv_seq = 0;
        }
    }

    /// Frames and seals one payload.
    pub fn encode(&mut self, payload: &[u8]) -> WispResult<Vec<u8>> {
        let packet = Packet::aligned(payload.to_vec(), self.sealer.alignment())?;
        let wire = self.sealer.seal(self.send_seq, &packet)?;
        self.send_seq = self.send_seq.wrapping_add(1);
        Ok(wire)
    }

    /// Takes one complete packet off the front of `buffer`.
    ///
    /// Returns `Ok(None)` without consuming anything while the packet is
    /// incomplete, so it can be called again after more bytes arrive.
    pub fn decode(&mut self, buffer: &mut BytesMut) -> WispResult<Option<Vec<u8>>> {
        if buffer.len() < 4 {
            return Ok(None);
        }
        let header = [buffer[0], buffer[1], buffer[2], buffer[3]];
        let length = self.opener.packet_length(self.recv_seq, header);
        Packet::check_length(length)?;

        let total = 4 + length + self.opener.tag_len();
        if buffer.len() < total {
            return Ok(None);
        }

        let wire = buffer.split_to(total).to_vec();
        let packet = self.opener.open(self.recv_seq, wire)?;
        self.recv_seq = self.recv_seq.wrapping_add(1);
        Ok(Some(packet.into_payload()))
    }
}

/// Packet I/O over a split byte stream.
pub struct Transport {
    reader: Box<dyn StreamReader>,
    writer: Box<dyn StreamWriter>,
    codec: PacketCodec,
    inbound: BytesMut,
    deferred: VecDeque<Vec<u8>>,
    rekey: RekeyTracker,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("codec", &self.codec)
            .field("buffered", &self.inbound.len())
            .field("deferred", &self.deferred.len())
            .field("rekey_bytes", &self.rekey.bytes())
            .finish()
    }
}

impl Transport {
    /// Wraps the two halves of a stream.
    pub fn new(
        reader: Box<dyn StreamReader>,
        writer: Box<dyn StreamWriter>,
        role: Role,
        rekey: RekeyTracker,
    ) -> Self {
        Self {
            reader,
            writer,
            codec: PacketCodec::new(role),
            inbound: BytesMut::with_capacity(READ_CHUNK),
            deferred: VecDeque::new(),
            rekey,
        }
    }

    /// Returns the codec.
    pub fn codec_mut(&mut self) -> &mut PacketCodec {
        &mut self.codec
    }

    /// Returns the rekey tracker.
    pub fn rekey_mut(&mut self) -> &mut RekeyTracker {
        &mut self.rekey
    }

    /// Sends `ours` and reads the peer's identification.
    pub async fn exchange_versions(&mut self, ours: &Version) -> WispResult<ScannedBanner> {
        self.write_raw(&ours.to_wire_format()).await?;

        let mut scanner = BannerScanner::new();
        let leftover = std::mem::take(&mut self.inbound);
        let mut found = scanner.feed(&leftover)?;
        while found.is_none() {
            let data = self.fill().await?;
            found = scanner.feed(&data)?;
        }

        let banner = found.ok_or_else(|| {
            WispError::ProtocolViolation("identification exchange ended early".to_string())
        })?;
        for line in &banner.preamble {
            debug!(line = %line, "Pre-identification line");
        }
        self.inbound.extend_from_slice(&banner.remainder);
        debug!(peer = %banner.line, "Peer identification");
        Ok(banner)
    }

    async fn fill(&mut self) -> WispResult<Vec<u8>> {
        match self.reader.read(READ_CHUNK).await? {
            ReadOutcome::Data(data) => Ok(data),
            ReadOutcome::EndOfStream => Err(WispError::ConnectionFailed(
                "Connection closed by peer".to_string(),
            )),
        }
    }

    async fn write_raw(&mut self, data: &[u8]) -> WispResult<()> {
        let mut rest = data;
        while !rest.is_empty() {
            let n = self.writer.write(rest).await?;
            if n == 0 {
                return Err(WispError::ConnectionFailed(
                    "Stream accepted no bytes".to_string(),
                ));
            }
            rest = &rest[n..];
        }
        Ok(())
    }

    /// Seals and sends one payload.
    pub async fn write_payload(&mut self, payload: &[u8]) -> WispResult<()> {
        let wire = self.codec.encode(payload)?;
        self.rekey.add(wire.len());
        trace!(
            msg = payload.first().copied().unwrap_or_default(),
            bytes = wire.len(),
            "Sending packet"
        );
        self.write_raw(&wire).await
    }

    /// Reads the next payload, deferred packets first.
    ///
    /// Cancel safe: bytes read before cancellation stay buffered and no
    /// packet is consumed until it is complete.
    pub async fn read_payload(&mut self) -> WispResult<Vec<u8>> {
        if let Some(payload) = self.deferred.pop_front() {
            return Ok(payload);
        }
        self.read_wire_payload().await
    }

    /// Reads the next payload from the wire, bypassing deferred packets.
    pub async fn read_wire_payload(&mut self) -> WispResult<Vec<u8>> {
        loop {
            if let Some(payload) = self.codec.decode(&mut self.inbound)? {
                self.rekey.add(payload.len());
                return Ok(payload);
            }
            let data = self.fill().await?;
            self.inbound.extend_from_slice(&data);
        }
    }

    /// Holds a payload that arrived during key exchange.
    pub fn defer(&mut self, payload: Vec<u8>) {
        self.deferred.push_back(payload);
    }

    /// Puts payloads back at the head of the queue, keeping their order.
    pub fn requeue(&mut self, payloads: Vec<Vec<u8>>) {
        for payload in payloads.into_iter().rev() {
            self.deferred.push_front(payload);
        }
    }

    /// Returns the number of deferred payloads.
    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// Closes the write half.
    pub async fn shutdown(&mut self) -> WispResult<()> {
        self.writer.close().await
    }
}

/// Builds SSH_MSG_DISCONNECT.
pub fn disconnect(reason: u32, description: &str) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(MessageType::Disconnect as u8);
    buf.put_u32(reason);
    put_string(&mut buf, description.as_bytes());
    put_string(&mut buf, b"");
    buf.to_vec()
}

/// Parses SSH_MSG_DISCONNECT into reason code and description.
pub fn parse_disconnect(data: &[u8]) -> WispResult<(u32, String)> {
    let mut offset = 1;
    let reason = read_u32(data, &mut offset)?;
    let description = String::from_utf8_lossy(read_string(data, &mut offset)?).into_owned();
    Ok((reason, description))
}

/// Builds SSH_MSG_IGNORE carrying `data`.
pub fn ignore(data: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(MessageType::Ignore as u8);
    put_string(&mut buf, data);
    buf.to_vec()
}

/// Builds SSH_MSG_UNIMPLEMENTED for the rejected packet's sequence number.
pub fn unimplemented(sequence: u32) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(MessageType::Unimplemented as u8);
    buf.put_u32(sequence);
    buf.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::cipher::{CipherAlgorithm, DirectionKeys};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_forward_path() {
        let mut state = TransportState::new();
        for next in [
            State::KeyExchange,
            State::Authenticating,
            State::ChannelOpen,
            State::Interactive,
            State::Closing,
            State::Closed,
        ] {
            state.transition(next).unwrap();
        }
        assert_eq!(state.current(), State::Closed);
        assert!(state.transition(State::Closing).is_err());
    }

    #[test]
    fn test_invalid_transitions() {
        let mut state = TransportState::new();
        assert!(matches!(
            state.transition(State::Authenticating),
            Err(WispError::ProtocolViolation(_))
        ));

        state.transition(State::KeyExchange).unwrap();
        state.transition(State::Authenticating).unwrap();
        assert!(state.transition(State::KeyExchange).is_err());
        assert!(state.transition(State::Interactive).is_err());

        // Early teardown is always allowed.
        state.transition(State::Closed).unwrap();
    }

    #[test]
    fn test_rekey_thresholds() {
        let start = Instant::now();
        let mut tracker = RekeyTracker::new(1000, Duration::from_secs(60));
        tracker.reset(start);

        tracker.add(999);
        assert!(!tracker.needs_rekey(start));
        tracker.add(1);
        assert!(tracker.needs_rekey(start));

        tracker.reset(start);
        assert!(!tracker.needs_rekey(start + Duration::from_secs(59)));
        assert!(tracker.needs_rekey(start + Duration::from_secs(60)));
    }

    fn gcm_keys() -> DirectionKeys {
        DirectionKeys {
            algorithm: CipherAlgorithm::Aes128Gcm,
            key: vec![7; 16],
            iv: vec![9; 12],
        }
    }

    #[test]
    fn test_codec_clear_partial_input() {
        let mut client = PacketCodec::new(Role::Client);
        let mut server = PacketCodec::new(Role::Server);

        let wire = client.encode(b"\x05hello").unwrap();
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&wire[..3]);
        assert_eq!(server.decode(&mut buffer).unwrap(), None);
        buffer.extend_from_slice(&wire[3..wire.len() - 1]);
        assert_eq!(server.decode(&mut buffer).unwrap(), None);
        assert_eq!(buffer.len(), wire.len() - 1);

        buffer.extend_from_slice(&wire[wire.len() - 1..]);
        buffer.extend_from_slice(&client.encode(b"\x06second").unwrap());
        assert_eq!(server.decode(&mut buffer).unwrap().unwrap(), b"\x05hello");
        assert_eq!(server.decode(&mut buffer).unwrap().unwrap(), b"\x06second");
        assert!(buffer.is_empty());
        assert_eq!(client.send_sequence(), 2);
        assert_eq!(server.recv_sequence(), 2);
    }

    #[test]
    fn test_codec_encrypted_with_sequence_reset() {
        let mut client = PacketCodec::new(Role::Client);
        let mut server = PacketCodec::new(Role::Server);

        // Three clear packets before NEWKEYS.
        let mut buffer = BytesMut::new();
        for _ in 0..3 {
            buffer.extend_from_slice(&client.encode(b"\x02noise").unwrap());
            server.decode(&mut buffer).unwrap().unwrap();
        }

        client.install_sealer(PacketSealer::new(&gcm_keys()).unwrap(), true);
        server.install_opener(PacketOpener::new(&gcm_keys()).unwrap(), true);

        buffer.extend_from_slice(&client.encode(b"\x5esecret").unwrap());
        assert_eq!(server.decode(&mut buffer).unwrap().unwrap(), b"\x5esecret");
        assert_eq!(server.recv_sequence(), 1);
    }

    #[test]
    fn test_codec_rejects_tampering_and_oversize() {
        let mut client = PacketCodec::new(Role::Client);
        let mut server = PacketCodec::new(Role::Server);
        client.install_sealer(PacketSealer::new(&gcm_keys()).unwrap(), false);
        server.install_opener(PacketOpener::new(&gcm_keys()).unwrap(), false);

        let mut wire = client.encode(b"\x5epayload").unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 1;
        let mut buffer = BytesMut::from(&wire[..]);
        assert!(matches!(
            server.decode(&mut buffer),
            Err(WispError::ProtocolViolation(_))
        ));

        let mut clear = PacketCodec::new(Role::Server);
        let mut buffer = BytesMut::from(&[0x00, 0x10, 0x00, 0x00][..]);
        assert!(clear.decode(&mut buffer).is_err());
    }

    #[test]
    fn test_message_builders() {
        let bytes = disconnect(11, "bye");
        assert_eq!(bytes[0], 1);
        assert_eq!(parse_disconnect(&bytes).unwrap(), (11, "bye".to_string()));
        assert_eq!(ignore(b"x"), vec![2, 0, 0, 0, 1, b'x']);
        assert_eq!(unimplemented(5), vec![3, 0, 0, 0, 5]);
    }

    struct ScriptedReader {
        chunks: VecDeque<Vec<u8>>,
    }

    #[async_trait]
    impl StreamReader for ScriptedReader {
        async fn read(&mut self, _max_bytes: usize) -> WispResult<ReadOutcome> {
            Ok(match self.chunks.pop_front() {
                Some(chunk) => ReadOutcome::Data(chunk),
                None => ReadOutcome::EndOfStream,
            })
        }
    }

    #[derive(Clone, Default)]
    struct SharedWriter(Arc<Mutex<Vec<u8>>>);

    #[async_trait]
    impl StreamWriter for SharedWriter {
        async fn write(&mut self, data: &[u8]) -> WispResult<usize> {
            self.0.lock().unwrap().extend_from_slice(data);
            Ok(data.len())
        }

        async fn close(&mut self) -> WispResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_transport_versions_then_packets() {
        let mut peer = PacketCodec::new(Role::Server);
        let mut script = b"SSH-2.0-Test_1.0\r\n".to_vec();
        script.extend_from_slice(&peer.encode(b"\x14kexinit").unwrap());
        let first_packet = peer.encode(b"\x02ignored").unwrap();

        let reader = ScriptedReader {
            chunks: VecDeque::from(vec![
                b"hello\r\n".to_vec(),
                script,
                first_packet[..6].to_vec(),
                first_packet[6..].to_vec(),
            ]),
        };
        let written = SharedWriter::default();
        let mut transport = Transport::new(
            Box::new(reader),
            Box::new(written.clone()),
            Role::Client,
            RekeyTracker::default(),
        );

        let banner = transport
            .exchange_versions(&Version::new("wisp_test", None))
            .await
            .unwrap();
        assert_eq!(banner.version.software(), "Test_1.0");
        assert_eq!(banner.preamble, vec!["hello".to_string()]);
        assert!(written.0.lock().unwrap().starts_with(b"SSH-2.0-wisp_test\r\n"));

        transport.defer(b"\x5edeferred".to_vec());
        assert_eq!(transport.read_payload().await.unwrap(), b"\x5edeferred");
        assert_eq!(transport.read_payload().await.unwrap(), b"\x14kexinit");
        assert_eq!(transport.read_payload().await.unwrap(), b"\x02ignored");
        assert!(matches!(
            transport.read_payload().await,
            Err(WispError::ConnectionFailed(_))
        ));
    }
}
