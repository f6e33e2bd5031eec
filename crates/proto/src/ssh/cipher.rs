//! SSH packet ciphers.
//!
//! Only AEAD ciphers are negotiated, so there is no separate MAC stage:
//! - `chacha20-poly1305@openssh.com` (OpenSSH PROTOCOL.chacha20poly1305)
//! - `aes256-gcm@openssh.com`, `aes128-gcm@openssh.com` (RFC 5647)
//!
//! A [`PacketSealer`] encrypts outgoing packets and a [`PacketOpener`]
//! decrypts incoming ones. Both start out as `Clear` and are replaced on
//! every NEWKEYS. Keys are derived with the letters of RFC 4253 Section 7.2;
//! [`Role`] picks which direction's letters a side seals and opens with.
//!
//! Any authentication-tag failure is a [`WispError::ProtocolViolation`].

use crate::ssh::packet::{Alignment, Packet};
use ring::aead::chacha20_poly1305_openssh::{
    OpeningKey as ChaChaOpeningKey, SealingKey as ChaChaSealingKey,
};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM, AES_256_GCM};
use wisp_platform::{WispError, WispResult};
use zeroize::Zeroize;

/// Length of every AEAD tag used here.
pub const TAG_LEN: usize = 16;

/// Which end of the connection a codec serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Seals with the client-to-server keys
    Client,
    /// Seals with the server-to-client keys
    Server,
}

/// Negotiable cipher algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
    /// chacha20-poly1305@openssh.com
    ChaCha20Poly1305,
    /// aes256-gcm@openssh.com
    Aes256Gcm,
    /// aes128-gcm@openssh.com
    Aes128Gcm,
}

impl CipherAlgorithm {
    /// Looks up a negotiated algorithm name.
    ///
    /// # Errors
    ///
    /// Returns [`WispError::ProtocolViolation`] for unsupported names.
    pub fn from_name(name: &str) -> WispResult<Self> {
        match name {
            "chacha20-poly1305@openssh.com" => Ok(CipherAlgorithm::ChaCha20Poly1305),
            "aes256-gcm@openssh.com" => Ok(CipherAlgorithm::Aes256Gcm),
            "aes128-gcm@openssh.com" => Ok(CipherAlgorithm::Aes128Gcm),
            other => Err(WispError::ProtocolViolation(format!(
                "Unsupported cipher: {}",
                other
            ))),
        }
    }

    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            CipherAlgorithm::ChaCha20Poly1305 => "chacha20-poly1305@openssh.com",
            CipherAlgorithm::Aes256Gcm => "aes256-gcm@openssh.com",
            CipherAlgorithm::Aes128Gcm => "aes128-gcm@openssh.com",
        }
    }

    /// Returns the derived key length in bytes.
    pub fn key_len(&self) -> usize {
        match self {
            CipherAlgorithm::ChaCha20Poly1305 => 64,
            CipherAlgorithm::Aes256Gcm => 32,
            CipherAlgorithm::Aes128Gcm => 16,
        }
    }

    /// Returns the derived IV length in bytes.
    pub fn iv_len(&self) -> usize {
        match self {
            CipherAlgorithm::ChaCha20Poly1305 => 0,
            CipherAlgorithm::Aes256Gcm | CipherAlgorithm::Aes128Gcm => 12,
        }
    }

    /// Returns the padding alignment for packets sealed with this cipher.
    pub fn alignment(&self) -> Alignment {
        match self {
            CipherAlgorithm::ChaCha20Poly1305 => Alignment::aead(8),
            CipherAlgorithm::Aes256Gcm | CipherAlgorithm::Aes128Gcm => Alignment::aead(16),
        }
    }
}

/// Key material for one direction.
pub struct DirectionKeys {
    /// Cipher for this direction
    pub algorithm: CipherAlgorithm,
    /// Encryption key (letter C or D)
    pub key: Vec<u8>,
    /// Initial IV (letter A or B)
    pub iv: Vec<u8>,
}

impl Drop for DirectionKeys {
    fn drop(&mut self) {
        self.key.zeroize();
        self.iv.zeroize();
    }
}

impl std::fmt::Debug for DirectionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectionKeys")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// AES-GCM key with the RFC 5647 invocation counter.
pub struct GcmState {
    key: LessSafeKey,
    fixed: [u8; 4],
    invocation: u64,
}

impl GcmState {
    fn new(algorithm: CipherAlgorithm, key: &[u8], iv: &[u8]) -> WispResult<Self> {
        let aead = match algorithm {
            CipherAlgorithm::Aes256Gcm => &AES_256_GCM,
            _ => &AES_128_GCM,
        };
        if iv.len() != 12 {
            return Err(WispError::ProtocolViolation(format!(
                "AES-GCM needs a 12-byte IV, got {}",
                iv.len()
            )));
        }
        let unbound = UnboundKey::new(aead, key).map_err(|_| {
            WispError::ProtocolViolation(format!("Invalid {} key length", algorithm.name()))
        })?;

        let mut fixed = [0u8; 4];
        fixed.copy_from_slice(&iv[..4]);
        let mut counter = [0u8; 8];
        counter.copy_from_slice(&iv[4..]);

        Ok(Self {
            key: LessSafeKey::new(unbound),
            fixed,
            invocation: u64::from_be_bytes(counter),
        })
    }

    fn next_nonce(&mut self) -> Nonce {
        let mut nonce = [0u8; 12];
        nonce[..4].copy_from_slice(&self.fixed);
        nonce[4..].copy_from_slice(&self.invocation.to_be_bytes());
        self.invocation = self.invocation.wrapping_add(1);
        Nonce::assume_unique_for_key(nonce)
    }
}

fn chacha_key(key: &[u8]) -> WispResult<[u8; 64]> {
    key.try_into().map_err(|_| {
        WispError::ProtocolViolation(format!(
            "chacha20-poly1305 needs a 64-byte key, got {}",
            key.len()
        ))
    })
}

/// Outgoing half of the packet cipher.
pub enum PacketSealer {
    /// No encryption (before the first NEWKEYS)
    Clear,
    /// chacha20-poly1305@openssh.com
    ChaCha(ChaChaSealingKey),
    /// aes*-gcm@openssh.com
    Gcm(GcmState),
}

impl PacketSealer {
    /// Builds a sealer from derived key material.
    ///
    /// # Errors
    ///
    /// Returns an error if the key or IV has the wrong length.
    pub fn new(keys: &DirectionKeys) -> WispResult<Self> {
        match keys.algorithm {
            CipherAlgorithm::ChaCha20Poly1305 => {
                let mut key = chacha_key(&keys.key)?;
                let sealer = ChaChaSealingKey::new(&key);
                key.zeroize();
                Ok(PacketSealer::ChaCha(sealer))
            }
            algorithm => Ok(PacketSealer::Gcm(GcmState::new(
                algorithm, &keys.key, &keys.iv,
            )?)),
        }
    }

    /// Padding alignment for the next packet.
    pub fn alignment(&self) -> Alignment {
        match self {
            PacketSealer::Clear => Alignment::CLEAR,
            PacketSealer::ChaCha(_) => Alignment::aead(8),
            PacketSealer::Gcm(_) => Alignment::aead(16),
        }
    }

    /// Encrypts `packet` for the wire, appending the tag.
    ///
    /// # Errors
    ///
    /// Returns an error if the AEAD implementation rejects the input.
    pub fn seal(&mut self, sequence: u32, packet: &Packet) -> WispResult<Vec<u8>> {
        let mut wire = packet.to_bytes();
        match self {
            PacketSealer::Clear => Ok(wire),
            PacketSealer::ChaCha(key) => {
                let mut tag = [0u8; TAG_LEN];
                key.seal_in_place(sequence, &mut wire, &mut tag);
                wire.extend_from_slice(&tag);
                Ok(wire)
            }
            PacketSealer::Gcm(state) => {
                let nonce = state.next_nonce();
                let (length, body) = wire.split_at_mut(4);
                let tag = state
                    .key
                    .seal_in_place_separate_tag(nonce, Aad::from(&*length), body)
                    .map_err(|_| WispError::ProtocolViolation("AES-GCM seal failed".to_string()))?;
                wire.extend_from_slice(tag.as_ref());
                Ok(wire)
            }
        }
    }
}

impl std::fmt::Debug for PacketSealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            PacketSealer::Clear => "PacketSealer::Clear",
            PacketSealer::ChaCha(_) => "PacketSealer::ChaCha",
            PacketSealer::Gcm(_) => "PacketSealer::Gcm",
        })
    }
}

/// Incoming half of the packet cipher.
pub enum PacketOpener {
    /// No encryption (before the first NEWKEYS)
    Clear,
    /// chacha20-poly1305@openssh.com
    ChaCha(ChaChaOpeningKey),
    /// aes*-gcm@openssh.com
    Gcm(GcmState),
}

impl std::fmt::Debug for PacketOpener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            PacketOpener::Clear => "PacketOpener::Clear",
            PacketOpener::ChaCha(_) => "PacketOpener::ChaCha",
            PacketOpener::Gcm(_) => "PacketOpener::Gcm",
        })
    }
}

impl PacketOpener {
    /// Builds an opener from derived key material.
    ///
    /// # Errors
    ///
    /// Returns an error if the key or IV has the wrong length.
    pub fn new(keys: &DirectionKeys) -> WispResult<Self> {
        match keys.algorithm {
            CipherAlgorithm::ChaCha20Poly1305 => {
                let mut key = chacha_key(&keys.key)?;
                let opener = ChaChaOpeningKey::new(&key);
                key.zeroize();
                Ok(PacketOpener::ChaCha(opener))
            }
            algorithm => Ok(PacketOpener::Gcm(GcmState::new(
                algorithm, &keys.key, &keys.iv,
            )?)),
        }
    }

    /// Bytes that follow the packet body on the wire.
    pub fn tag_len(&self) -> usize {
        match self {
            PacketOpener::Clear => 0,
            _ => TAG_LEN,
        }
    }

    /// Decodes `packet_length` from the first four bytes on the wire.
    ///
    /// Pure function of its inputs, so it can be repeated while waiting for
    /// the rest of the packet.
    pub fn packet_length(&self, sequence: u32, header: [u8; 4]) -> usize {
        match self {
            PacketOpener::ChaCha(key) => {
                u32::from_be_bytes(key.decrypt_packet_length(sequence, header)) as usize
            }
            _ => u32::from_be_bytes(header) as usize,
        }
    }

    /// Authenticates and decrypts one complete packet (`4 + length + tag` bytes).
    ///
    /// # Errors
    ///
    /// Returns [`WispError::ProtocolViolation`] if the tag does not verify or
    /// the plaintext is not a well-formed packet.
    pub fn open(&mut self, sequence: u32, mut wire: Vec<u8>) -> WispResult<Packet> {
        let tag_len = self.tag_len();
        if wire.len() < 4 + tag_len {
            return Err(WispError::ProtocolViolation(
                "Encrypted packet too short".to_string(),
            ));
        }

        match self {
            PacketOpener::Clear => Packet::from_bytes(&wire),
            PacketOpener::ChaCha(key) => {
                let split = wire.len() - TAG_LEN;
                let mut tag = [0u8; TAG_LEN];
                tag.copy_from_slice(&wire[split..]);
                wire.truncate(split);

                let length = key.decrypt_packet_length(sequence, [wire[0], wire[1], wire[2], wire[3]]);
                let body = key
                    .open_in_place(sequence, &mut wire, &tag)
                    .map_err(|_| {
                        WispError::ProtocolViolation("Packet authentication failed".to_string())
                    })?
                    .to_vec();

                let mut plain = Vec::with_capacity(4 + body.len());
                plain.extend_from_slice(&length);
                plain.extend_from_slice(&body);
                Packet::from_bytes(&plain)
            }
            PacketOpener::Gcm(state) => {
                let nonce = state.next_nonce();
                let mut length = [0u8; 4];
                length.copy_from_slice(&wire[..4]);

                let body_len = state
                    .key
                    .open_in_place(nonce, Aad::from(length), &mut wire[4..])
                    .map_err(|_| {
                        WispError::ProtocolViolation("Packet authentication failed".to_string())
                    })?
                    .len();

                wire.truncate(4 + body_len);
                Packet::from_bytes(&wire)
            }
        }
    }
}
