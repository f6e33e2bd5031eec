//! SSH binary packet protocol (RFC 4253 Section 6).
//!
//! # Packet Format
//!
//! ```text
//! uint32    packet_length
//! byte      padding_length
//! byte[n1]  payload (n1 = packet_length - padding_length - 1)
//! byte[n2]  random padding (n2 = padding_length)
//! byte[m]   authentication tag (AEAD ciphers only)
//! ```
//!
//! # Alignment
//!
//! Without a cipher the whole packet, length field included, is a multiple of
//! 8 bytes. With the AEAD ciphers the length field travels as associated data
//! and only `packet_length` has to be a multiple of the cipher block size
//! (8 for chacha20-poly1305, 16 for AES-GCM). [`Alignment`] captures both.
//!
//! The authentication tag is owned by [`crate::ssh::cipher`]; a [`Packet`]
//! only ever holds plaintext.
//!
//! # Example
//!
//! ```rust
//! use wisp_proto::ssh::Packet;
//!
//! let packet = Packet::new(b"SSH-MSG-KEXINIT payload".to_vec()).unwrap();
//! let bytes = packet.to_bytes();
//!
//! let parsed = Packet::from_bytes(&bytes).unwrap();
//! assert_eq!(parsed.payload(), b"SSH-MSG-KEXINIT payload");
//! ```

use bytes::{Buf, BufMut, BytesMut};
use rand::RngCore;
use wisp_platform::{WispError, WispResult};

/// Maximum packet size in bytes (RFC 4253 Section 6.1).
pub const MAX_PACKET_SIZE: usize = 35000;

/// Minimum padding length in bytes (RFC 4253 Section 6).
pub const MIN_PADDING_LEN: usize = 4;

/// Maximum padding length in bytes (fits in u8).
pub const MAX_PADDING_LEN: usize = 255;

/// How a packet must be padded for the active cipher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alignment {
    /// Cipher block size (at least 8)
    pub block_size: usize,
    /// Whether the 4-byte length field counts towards the alignment
    pub include_length: bool,
}

impl Alignment {
    /// Alignment used before the first NEWKEYS.
    pub const CLEAR: Alignment = Alignment {
        block_size: 8,
        include_length: true,
    };

    /// Alignment for an AEAD cipher whose length field is associated data.
    pub const fn aead(block_size: usize) -> Self {
        Alignment {
            block_size,
            include_length: false,
        }
    }

    fn padding_for(&self, payload_len: usize) -> usize {
        let block = self.block_size.max(8);
        let covered = if self.include_length { 5 } else { 1 } + payload_len;
        let mut padding = block - covered % block;
        if padding < MIN_PADDING_LEN {
            padding += block;
        }
        padding
    }
}

/// SSH binary packet (plaintext form).
///
/// # Invariants
///
/// - Padding length is between 4 and 255 bytes
/// - `packet_length` never exceeds 35000 bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    payload: Vec<u8>,
    padding: Vec<u8>,
}

impl Packet {
    /// Creates a packet padded for the unencrypted transport.
    ///
    /// # Errors
    ///
    /// Returns [`WispError::ProtocolViolation`] if the payload does not fit in
    /// a single packet.
    pub fn new(payload: Vec<u8>) -> WispResult<Self> {
        Self::aligned(payload, Alignment::CLEAR)
    }

    /// Creates a packet padded with random bytes for the given alignment.
    ///
    /// # Errors
    ///
    /// Returns [`WispError::ProtocolViolation`] if the payload does not fit in
    /// a single packet.
    pub fn aligned(payload: Vec<u8>, alignment: Alignment) -> WispResult<Self> {
        let padding_len = alignment.padding_for(payload.len());
        let packet_length = 1 + payload.len() + padding_len;
        if packet_length > MAX_PACKET_SIZE {
            return Err(WispError::ProtocolViolation(format!(
                "Packet size {} exceeds maximum {}",
                packet_length, MAX_PACKET_SIZE
            )));
        }

        let mut padding = vec![0u8; padding_len];
        rand::thread_rng().fill_bytes(&mut padding);

        Ok(Self { payload, padding })
    }

    /// Returns the payload of this packet.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consumes the packet and returns its payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Returns the padding of this packet.
    pub fn padding(&self) -> &[u8] {
        &self.padding
    }

    /// Returns the value of the `packet_length` field.
    pub fn packet_length(&self) -> usize {
        1 + self.payload.len() + self.padding.len()
    }

    /// Serializes this packet (length field included, no tag).
    pub fn to_bytes(&self) -> Vec<u8> {
        let packet_length = self.packet_length();
        let mut buf = BytesMut::with_capacity(4 + packet_length);

        buf.put_u32(packet_length as u32);
        buf.put_u8(self.padding.len() as u8);
        buf.put_slice(&self.payload);
        buf.put_slice(&self.padding);

        buf.to_vec()
    }

    /// Checks a decoded `packet_length` before buffering the rest of the packet.
    ///
    /// # Errors
    ///
    /// Returns [`WispError::ProtocolViolation`] if the length is out of range.
    pub fn check_length(packet_length: usize) -> WispResult<()> {
        if packet_length > MAX_PACKET_SIZE {
            return Err(WispError::ProtocolViolation(format!(
                "Packet too large: {} bytes (maximum {})",
                packet_length, MAX_PACKET_SIZE
            )));
        }
        if packet_length < 1 + MIN_PADDING_LEN {
            return Err(WispError::ProtocolViolation(format!(
                "Packet too small: {} bytes",
                packet_length
            )));
        }
        Ok(())
    }

    /// Parses exactly one plaintext packet (length field included).
    ///
    /// # Errors
    ///
    /// Returns [`WispError::ProtocolViolation`] if:
    /// - Data is shorter than the declared length, or has trailing bytes
    /// - Packet size exceeds 35000 bytes
    /// - Padding length is invalid
    pub fn from_bytes(data: &[u8]) -> WispResult<Self> {
        if data.len() < 5 {
            return Err(WispError::ProtocolViolation(format!(
                "Packet too short: {} bytes (minimum 5)",
                data.len()
            )));
        }

        let mut buf = data;
        let packet_length = buf.get_u32() as usize;
        Self::check_length(packet_length)?;

        if buf.len() != packet_length {
            return Err(WispError::ProtocolViolation(format!(
                "Packet length mismatch: declared {} bytes, got {} bytes",
                packet_length,
                buf.len()
            )));
        }

        let padding_length = buf.get_u8() as usize;
        if padding_length < MIN_PADDING_LEN {
            return Err(WispError::ProtocolViolation(format!(
                "Padding too short: {} bytes (minimum {})",
                padding_length, MIN_PADDING_LEN
            )));
        }
        if packet_length < 1 + padding_length {
            return Err(WispError::ProtocolViolation(format!(
                "Padding length {} exceeds packet length {}",
                padding_length, packet_length
            )));
        }

        let payload_length = packet_length - 1 - padding_length;
        let payload = buf[..payload_length].to_vec();
        buf.advance(payload_length);
        let padding = buf.to_vec();

        Ok(Self { payload, padding })
    }
}
