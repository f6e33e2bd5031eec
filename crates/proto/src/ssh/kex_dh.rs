//! Elliptic-curve key exchange (RFC 5656, RFC 8731) and key derivation.
//!
//! This module implements:
//! - curve25519-sha256 and curve25519-sha256@libssh.org (RFC 8731)
//! - ecdh-sha2-nistp256 (RFC 5656)
//! - The exchange hash `H`
//! - Session key derivation (RFC 4253 Section 7.2)
//!
//! All three methods hash with SHA-256.
//!
//! # Example
//!
//! ```rust
//! use wisp_proto::ssh::kex_dh::{EcdhExchange, KexMethod};
//!
//! let client = EcdhExchange::new(KexMethod::Curve25519).unwrap();
//! let server = EcdhExchange::new(KexMethod::Curve25519).unwrap();
//!
//! let client_public = client.public_key().to_vec();
//! let server_public = server.public_key().to_vec();
//!
//! let k1 = client.compute_shared_secret(&server_public).unwrap();
//! let k2 = server.compute_shared_secret(&client_public).unwrap();
//! assert_eq!(*k1, *k2);
//! ```

use crate::ssh::cipher::{CipherAlgorithm, DirectionKeys, Role};
use crate::ssh::wire::{put_mpint, put_string};
use bytes::BytesMut;
use ring::agreement::{
    agree_ephemeral, Algorithm, EphemeralPrivateKey, UnparsedPublicKey, ECDH_P256, X25519,
};
use ring::rand::SystemRandom;
use sha2::{Digest, Sha256};
use wisp_platform::{WispError, WispResult};
use zeroize::Zeroizing;

/// Supported key exchange methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KexMethod {
    /// curve25519-sha256 (and the libssh.org alias)
    Curve25519,
    /// ecdh-sha2-nistp256
    EcdhP256,
}

impl KexMethod {
    /// Looks up a negotiated method name.
    ///
    /// # Errors
    ///
    /// Returns [`WispError::ProtocolViolation`] for unsupported names.
    pub fn from_name(name: &str) -> WispResult<Self> {
        match name {
            "curve25519-sha256" | "curve25519-sha256@libssh.org" => Ok(KexMethod::Curve25519),
            "ecdh-sha2-nistp256" => Ok(KexMethod::EcdhP256),
            other => Err(WispError::ProtocolViolation(format!(
                "Unsupported key exchange method: {}",
                other
            ))),
        }
    }

    fn algorithm(&self) -> &'static Algorithm {
        match self {
            KexMethod::Curve25519 => &X25519,
            KexMethod::EcdhP256 => &ECDH_P256,
        }
    }

    fn public_key_len(&self) -> usize {
        match self {
            KexMethod::Curve25519 => 32,
            KexMethod::EcdhP256 => 65,
        }
    }
}

/// One side's ephemeral key pair for a single exchange.
pub struct EcdhExchange {
    method: KexMethod,
    private_key: EphemeralPrivateKey,
    public_key: Vec<u8>,
}

impl EcdhExchange {
    /// Generates a fresh ephemeral key pair.
    ///
    /// # Errors
    ///
    /// Returns an error if the system RNG fails.
    pub fn new(method: KexMethod) -> WispResult<Self> {
        let rng = SystemRandom::new();
        let private_key = EphemeralPrivateKey::generate(method.algorithm(), &rng).map_err(|_| {
            WispError::ProtocolViolation("Failed to generate ephemeral key".to_string())
        })?;
        let public_key = private_key
            .compute_public_key()
            .map_err(|_| {
                WispError::ProtocolViolation("Failed to compute ephemeral public key".to_string())
            })?
            .as_ref()
            .to_vec();

        Ok(Self {
            method,
            private_key,
            public_key,
        })
    }

    /// Returns the method this key pair belongs to.
    pub fn method(&self) -> KexMethod {
        self.method
    }

    /// Returns the public value sent to the peer (`Q_C` or `Q_S`).
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Computes the shared secret `K` from the peer's public value.
    ///
    /// # Errors
    ///
    /// Returns [`WispError::ProtocolViolation`] if the peer's value has the
    /// wrong size or is not a valid point.
    pub fn compute_shared_secret(self, peer_public: &[u8]) -> WispResult<Zeroizing<Vec<u8>>> {
        if peer_public.len() != self.method.public_key_len() {
            return Err(WispError::ProtocolViolation(format!(
                "Peer ephemeral key has {} bytes, expected {}",
                peer_public.len(),
                self.method.public_key_len()
            )));
        }

        let peer = UnparsedPublicKey::new(self.method.algorithm(), peer_public);
        agree_ephemeral(self.private_key, &peer, |key_material| {
            Zeroizing::new(key_material.to_vec())
        })
        .map_err(|_| WispError::ProtocolViolation("Key agreement failed".to_string()))
    }
}

/// Inputs to the exchange hash, in wire order.
#[derive(Debug, Clone, Copy)]
pub struct ExchangeHashInput<'a> {
    /// V_C: client identification string, without CR LF
    pub client_version: &'a str,
    /// V_S: server identification string, without CR LF
    pub server_version: &'a str,
    /// I_C: payload of the client's KEXINIT
    pub client_kexinit: &'a [u8],
    /// I_S: payload of the server's KEXINIT
    pub server_kexinit: &'a [u8],
    /// K_S: server host key blob
    pub host_key_blob: &'a [u8],
    /// Q_C: client ephemeral public key
    pub client_ephemeral: &'a [u8],
    /// Q_S: server ephemeral public key
    pub server_ephemeral: &'a [u8],
    /// K: shared secret
    pub shared_secret: &'a [u8],
}

/// Computes the exchange hash `H` (RFC 5656 Section 4, RFC 8731 Section 3).
pub fn exchange_hash(input: &ExchangeHashInput<'_>) -> Vec<u8> {
    let mut buf = BytesMut::new();
    put_string(&mut buf, input.client_version.as_bytes());
    put_string(&mut buf, input.server_version.as_bytes());
    put_string(&mut buf, input.client_kexinit);
    put_string(&mut buf, input.server_kexinit);
    put_string(&mut buf, input.host_key_blob);
    put_string(&mut buf, input.client_ephemeral);
    put_string(&mut buf, input.server_ephemeral);
    put_mpint(&mut buf, input.shared_secret);

    Sha256::digest(&buf).to_vec()
}

/// Derives one key (RFC 4253 Section 7.2).
///
/// ```text
/// K1 = HASH(K || H || X || session_id)
/// K2 = HASH(K || H || K1)
/// K3 = HASH(K || H || K1 || K2)
/// key = K1 || K2 || K3 || ...
/// ```
///
/// `K` is hashed in its mpint encoding.
///
/// # Example
///
/// ```rust
/// use wisp_proto::ssh::kex_dh::derive_key;
///
/// let key = derive_key(&[0x42; 32], &[0x01; 32], &[0x02; 32], b'C', 64);
/// assert_eq!(key.len(), 64);
/// ```
pub fn derive_key(
    shared_secret: &[u8],
    exchange_hash: &[u8],
    session_id: &[u8],
    letter: u8,
    key_length: usize,
) -> Zeroizing<Vec<u8>> {
    let mut k_mpint = BytesMut::new();
    put_mpint(&mut k_mpint, shared_secret);

    let mut hasher = Sha256::new();
    hasher.update(&k_mpint);
    hasher.update(exchange_hash);
    hasher.update([letter]);
    hasher.update(session_id);

    let mut key = Zeroizing::new(hasher.finalize().to_vec());
    while key.len() < key_length {
        let mut hasher = Sha256::new();
        hasher.update(&k_mpint);
        hasher.update(exchange_hash);
        hasher.update(&key[..]);
        let block = hasher.finalize();
        key.extend_from_slice(&block);
    }

    key.truncate(key_length);
    key
}

/// Keys for both directions after one exchange.
#[derive(Debug)]
pub struct SessionKeys {
    /// Client-to-server keys (letters A and C)
    pub client_to_server: DirectionKeys,
    /// Server-to-client keys (letters B and D)
    pub server_to_client: DirectionKeys,
}

impl SessionKeys {
    /// Derives all keys for the negotiated ciphers.
    pub fn derive(
        shared_secret: &[u8],
        exchange_hash: &[u8],
        session_id: &[u8],
        cipher_client_to_server: CipherAlgorithm,
        cipher_server_to_client: CipherAlgorithm,
    ) -> Self {
        let direction = |algorithm: CipherAlgorithm, iv_letter: u8, key_letter: u8| {
            DirectionKeys {
                algorithm,
                key: derive_key(
                    shared_secret,
                    exchange_hash,
                    session_id,
                    key_letter,
                    algorithm.key_len(),
                )
                .to_vec(),
                iv: derive_key(
                    shared_secret,
                    exchange_hash,
                    session_id,
                    iv_letter,
                    algorithm.iv_len(),
                )
                .to_vec(),
            }
        };

        Self {
            client_to_server: direction(cipher_client_to_server, b'A', b'C'),
            server_to_client: direction(cipher_server_to_client, b'B', b'D'),
        }
    }

    /// Splits into `(sealing, opening)` keys for `role`.
    pub fn split(self, role: Role) -> (DirectionKeys, DirectionKeys) {
        match role {
            Role::Client => (self.client_to_server, self.server_to_client),
            Role::Server => (self.server_to_client, self.client_to_server),
        }
    }
}
