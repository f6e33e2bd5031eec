//! SSH key exchange negotiation (RFC 4253 Section 7).
//!
//! This module covers the algorithm-negotiation half of key exchange:
//! - SSH_MSG_KEXINIT encoding and parsing
//! - SSH_MSG_NEWKEYS
//! - Picking one algorithm per category from both sides' lists
//!
//! The ECDH computation itself lives in [`crate::ssh::kex_dh`].
//!
//! # Key Exchange Flow
//!
//! 1. Both sides send SSH_MSG_KEXINIT
//! 2. Algorithm negotiation (first client preference the server supports)
//! 3. ECDH exchange and host key signature check
//! 4. Both sides send SSH_MSG_NEWKEYS
//! 5. Switch to the negotiated cipher
//!
//! # Strict key exchange
//!
//! The client advertises `kex-strict-c-v00@openssh.com`. When the server
//! answers with `kex-strict-s-v00@openssh.com`, sequence numbers are reset at
//! every NEWKEYS and any non-kex packet during the first exchange is fatal.
//!
//! # Example
//!
//! ```rust
//! use wisp_proto::ssh::kex::{KexInit, NewKeys};
//!
//! let kexinit = KexInit::client_default();
//! assert!(kexinit.kex_algorithms().contains(&"curve25519-sha256".to_string()));
//!
//! assert_eq!(NewKeys::new().to_bytes(), vec![21]);
//! ```

use crate::ssh::cipher::CipherAlgorithm;
use crate::ssh::message::MessageType;
use crate::ssh::wire::{
    expect_message, put_bool, put_name_list, read_bool, read_bytes, read_name_list, read_u32,
};
use bytes::{BufMut, BytesMut};
use rand::RngCore;
use wisp_platform::{WispError, WispResult};

/// Pseudo-algorithm a client lists to request strict key exchange.
pub const STRICT_KEX_CLIENT: &str = "kex-strict-c-v00@openssh.com";

/// Pseudo-algorithm a server lists to confirm strict key exchange.
pub const STRICT_KEX_SERVER: &str = "kex-strict-s-v00@openssh.com";

/// Key exchange methods, most preferred first.
pub const KEX_ALGORITHMS: &[&str] = &[
    "curve25519-sha256",
    "curve25519-sha256@libssh.org",
    "ecdh-sha2-nistp256",
];

/// Host key algorithms whose signatures can be verified, most preferred first.
pub const HOST_KEY_ALGORITHMS: &[&str] = &[
    "ssh-ed25519",
    "ecdsa-sha2-nistp256",
    "rsa-sha2-512",
    "rsa-sha2-256",
];

/// AEAD ciphers, most preferred first.
pub const CIPHER_ALGORITHMS: &[&str] = &[
    "chacha20-poly1305@openssh.com",
    "aes256-gcm@openssh.com",
    "aes128-gcm@openssh.com",
];

/// MAC list sent for interoperability; AEAD ciphers never use a MAC.
pub const MAC_ALGORITHMS: &[&str] = &["hmac-sha2-256", "hmac-sha2-512"];

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// SSH_MSG_KEXINIT message (RFC 4253 Section 7.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    cookie: [u8; 16],
    kex_algorithms: Vec<String>,
    server_host_key_algorithms: Vec<String>,
    encryption_client_to_server: Vec<String>,
    encryption_server_to_client: Vec<String>,
    mac_client_to_server: Vec<String>,
    mac_server_to_client: Vec<String>,
    compression_client_to_server: Vec<String>,
    compression_server_to_client: Vec<String>,
    first_kex_packet_follows: bool,
}

impl KexInit {
    fn with_kex_list(kex_algorithms: Vec<String>) -> Self {
        let mut cookie = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut cookie);

        Self {
            cookie,
            kex_algorithms,
            server_host_key_algorithms: names(HOST_KEY_ALGORITHMS),
            encryption_client_to_server: names(CIPHER_ALGORITHMS),
            encryption_server_to_client: names(CIPHER_ALGORITHMS),
            mac_client_to_server: names(MAC_ALGORITHMS),
            mac_server_to_client: names(MAC_ALGORITHMS),
            compression_client_to_server: vec!["none".to_string()],
            compression_server_to_client: vec!["none".to_string()],
            first_kex_packet_follows: false,
        }
    }

    /// Creates the client's KEXINIT with the supported algorithm lists.
    pub fn client_default() -> Self {
        let mut kex = names(KEX_ALGORITHMS);
        kex.push(STRICT_KEX_CLIENT.to_string());
        Self::with_kex_list(kex)
    }

    /// Creates a server-side KEXINIT offering the same algorithms.
    pub fn server_default() -> Self {
        let mut kex = names(KEX_ALGORITHMS);
        kex.push(STRICT_KEX_SERVER.to_string());
        Self::with_kex_list(kex)
    }

    /// Restricts the host key algorithms (used by servers holding one key).
    pub fn with_host_key_algorithms(mut self, algorithms: &[&str]) -> Self {
        self.server_host_key_algorithms = names(algorithms);
        self
    }

    /// Restricts both cipher lists to `algorithms`.
    pub fn with_ciphers(mut self, algorithms: &[&str]) -> Self {
        self.encryption_client_to_server = names(algorithms);
        self.encryption_server_to_client = names(algorithms);
        self
    }

    /// Returns the cookie.
    pub fn cookie(&self) -> &[u8; 16] {
        &self.cookie
    }

    /// Returns the key exchange algorithms.
    pub fn kex_algorithms(&self) -> &[String] {
        &self.kex_algorithms
    }

    /// Returns the server host key algorithms.
    pub fn server_host_key_algorithms(&self) -> &[String] {
        &self.server_host_key_algorithms
    }

    /// Returns the encryption algorithms (client to server).
    pub fn encryption_client_to_server(&self) -> &[String] {
        &self.encryption_client_to_server
    }

    /// Returns the encryption algorithms (server to client).
    pub fn encryption_server_to_client(&self) -> &[String] {
        &self.encryption_server_to_client
    }

    /// Returns the compression algorithms (client to server).
    pub fn compression_client_to_server(&self) -> &[String] {
        &self.compression_client_to_server
    }

    /// Returns whether a guessed kex packet follows.
    pub fn first_kex_packet_follows(&self) -> bool {
        self.first_kex_packet_follows
    }

    /// Returns true if this KEXINIT advertises `marker` among its kex methods.
    pub fn advertises(&self, marker: &str) -> bool {
        self.kex_algorithms.iter().any(|k| k == marker)
    }

    /// Serializes the KEXINIT message (without packet framing).
    ///
    /// ```text
    /// byte         SSH_MSG_KEXINIT (20)
    /// byte[16]     cookie
    /// name-list    x 10
    /// boolean      first_kex_packet_follows
    /// uint32       0 (reserved)
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();

        buf.put_u8(MessageType::KexInit as u8);
        buf.put_slice(&self.cookie);

        put_name_list(&mut buf, &self.kex_algorithms);
        put_name_list(&mut buf, &self.server_host_key_algorithms);
        put_name_list(&mut buf, &self.encryption_client_to_server);
        put_name_list(&mut buf, &self.encryption_server_to_client);
        put_name_list(&mut buf, &self.mac_client_to_server);
        put_name_list(&mut buf, &self.mac_server_to_client);
        put_name_list(&mut buf, &self.compression_client_to_server);
        put_name_list(&mut buf, &self.compression_server_to_client);
        put_name_list(&mut buf, &[]);
        put_name_list(&mut buf, &[]);

        put_bool(&mut buf, self.first_kex_packet_follows);
        buf.put_u32(0);

        buf.to_vec()
    }

    /// Parses a KEXINIT message.
    ///
    /// # Errors
    ///
    /// Returns [`WispError::ProtocolViolation`] if the message is truncated
    /// or is not SSH_MSG_KEXINIT.
    pub fn from_bytes(data: &[u8]) -> WispResult<Self> {
        expect_message(data, MessageType::KexInit as u8, "SSH_MSG_KEXINIT")?;

        let mut offset = 1;
        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(read_bytes(data, &mut offset, 16)?);

        let kex_algorithms = read_name_list(data, &mut offset)?;
        let server_host_key_algorithms = read_name_list(data, &mut offset)?;
        let encryption_client_to_server = read_name_list(data, &mut offset)?;
        let encryption_server_to_client = read_name_list(data, &mut offset)?;
        let mac_client_to_server = read_name_list(data, &mut offset)?;
        let mac_server_to_client = read_name_list(data, &mut offset)?;
        let compression_client_to_server = read_name_list(data, &mut offset)?;
        let compression_server_to_client = read_name_list(data, &mut offset)?;
        let _languages_client_to_server = read_name_list(data, &mut offset)?;
        let _languages_server_to_client = read_name_list(data, &mut offset)?;
        let first_kex_packet_follows = read_bool(data, &mut offset)?;
        let _reserved = read_u32(data, &mut offset)?;

        Ok(Self {
            cookie,
            kex_algorithms,
            server_host_key_algorithms,
            encryption_client_to_server,
            encryption_server_to_client,
            mac_client_to_server,
            mac_server_to_client,
            compression_client_to_server,
            compression_server_to_client,
            first_kex_packet_follows,
        })
    }
}

/// SSH_MSG_NEWKEYS message (RFC 4253 Section 7.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NewKeys;

impl NewKeys {
    /// Creates a new SSH_MSG_NEWKEYS message.
    pub const fn new() -> Self {
        Self
    }

    /// Serializes the NEWKEYS message to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        vec![MessageType::NewKeys as u8]
    }

    /// Parses a NEWKEYS message from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`WispError::ProtocolViolation`] if the message is empty or of
    /// another type.
    pub fn from_bytes(data: &[u8]) -> WispResult<Self> {
        expect_message(data, MessageType::NewKeys as u8, "SSH_MSG_NEWKEYS")?;
        Ok(Self)
    }
}

/// Negotiates one algorithm between client and server.
///
/// Uses the first algorithm from the client's list that also appears in the
/// server's list (RFC 4253 Section 7.1).
///
/// # Errors
///
/// Returns [`WispError::ProtocolViolation`] if no common algorithm is found.
///
/// # Example
///
/// ```rust
/// use wisp_proto::ssh::kex::negotiate_algorithm;
///
/// let client = vec!["aes256-gcm@openssh.com".to_string(), "aes128-gcm@openssh.com".to_string()];
/// let server = vec!["aes128-gcm@openssh.com".to_string(), "aes256-gcm@openssh.com".to_string()];
///
/// let result = negotiate_algorithm(&client, &server).unwrap();
/// assert_eq!(result, "aes256-gcm@openssh.com");
/// ```
pub fn negotiate_algorithm(client_list: &[String], server_list: &[String]) -> WispResult<String> {
    client_list
        .iter()
        .find(|alg| server_list.contains(alg))
        .cloned()
        .ok_or_else(|| {
            WispError::ProtocolViolation(format!(
                "No common algorithm: client={:?}, server={:?}",
                client_list, server_list
            ))
        })
}

/// The result of algorithm negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    /// Key exchange method
    pub kex: String,
    /// Host key algorithm
    pub host_key: String,
    /// Cipher client to server
    pub cipher_client_to_server: CipherAlgorithm,
    /// Cipher server to client
    pub cipher_server_to_client: CipherAlgorithm,
    /// Compression (always `none`)
    pub compression: String,
    /// Both sides agreed on strict key exchange
    pub strict_kex: bool,
}

impl Negotiated {
    /// Negotiates every category from the two KEXINIT messages.
    ///
    /// # Errors
    ///
    /// Returns [`WispError::ProtocolViolation`] if any category has no
    /// common algorithm.
    pub fn from_kexinits(client: &KexInit, server: &KexInit) -> WispResult<Self> {
        let kex = negotiate_algorithm(&client.kex_algorithms, &server.kex_algorithms)?;
        let host_key = negotiate_algorithm(
            &client.server_host_key_algorithms,
            &server.server_host_key_algorithms,
        )?;
        let c2s = negotiate_algorithm(
            &client.encryption_client_to_server,
            &server.encryption_client_to_server,
        )?;
        let s2c = negotiate_algorithm(
            &client.encryption_server_to_client,
            &server.encryption_server_to_client,
        )?;
        let compression = negotiate_algorithm(
            &client.compression_client_to_server,
            &server.compression_client_to_server,
        )?;
        negotiate_algorithm(
            &client.compression_server_to_client,
            &server.compression_server_to_client,
        )?;

        let strict_kex =
            client.advertises(STRICT_KEX_CLIENT) && server.advertises(STRICT_KEX_SERVER);

        Ok(Self {
            kex,
            host_key,
            cipher_client_to_server: CipherAlgorithm::from_name(&c2s)?,
            cipher_server_to_client: CipherAlgorithm::from_name(&s2c)?,
            compression,
            strict_kex,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kexinit_client_default() {
        let kexinit = KexInit::client_default();
        assert_eq!(kexinit.cookie().len(), 16);
        assert!(kexinit.advertises(STRICT_KEX_CLIENT));
        assert!(kexinit
            .server_host_key_algorithms()
            .contains(&"rsa-sha2-512".to_string()));
        assert_eq!(kexinit.compression_client_to_server(), &["none".to_string()]);
        assert!(!kexinit.first_kex_packet_follows());
    }

    #[test]
    fn test_kexinit_round_trip() {
        let original = KexInit::client_default();
        let parsed = KexInit::from_bytes(&original.to_bytes()).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_kexinit_parse_invalid_type() {
        let mut data = vec![99];
        data.extend_from_slice(&[0u8; 20]);

        match KexInit::from_bytes(&data) {
            Err(WispError::ProtocolViolation(msg)) => assert!(msg.contains("Invalid message type")),
            other => panic!("Expected ProtocolViolation, got {:?}", other),
        }
    }

    #[test]
    fn test_kexinit_parse_truncated() {
        let bytes = KexInit::client_default().to_bytes();
        assert!(KexInit::from_bytes(&bytes[..bytes.len() - 2]).is_err());
        assert!(KexInit::from_bytes(&[20, 1, 2, 3]).is_err());
    }

    #[test]
    fn test_negotiate_algorithm_no_match() {
        let client = vec!["aes256-gcm@openssh.com".to_string()];
        let server = vec!["aes128-ctr".to_string()];

        match negotiate_algorithm(&client, &server) {
            Err(WispError::ProtocolViolation(msg)) => assert!(msg.contains("No common algorithm")),
            other => panic!("Expected ProtocolViolation, got {:?}", other),
        }
    }

    #[test]
    fn test_negotiated_prefers_client_order() {
        let client = KexInit::client_default();
        let server = KexInit::server_default()
            .with_host_key_algorithms(&["ssh-ed25519"])
            .with_ciphers(&["aes128-gcm@openssh.com", "chacha20-poly1305@openssh.com"]);

        let negotiated = Negotiated::from_kexinits(&client, &server).unwrap();
        assert_eq!(negotiated.kex, "curve25519-sha256");
        assert_eq!(negotiated.host_key, "ssh-ed25519");
        assert_eq!(
            negotiated.cipher_client_to_server,
            CipherAlgorithm::ChaCha20Poly1305
        );
        assert_eq!(negotiated.compression, "none");
        assert!(negotiated.strict_kex);
    }

    #[test]
    fn test_strict_kex_needs_both_markers() {
        let client = KexInit::client_default();
        let server = KexInit::with_kex_list(names(KEX_ALGORITHMS));

        let negotiated = Negotiated::from_kexinits(&client, &server).unwrap();
        assert!(!negotiated.strict_kex);
    }

    #[test]
    fn test_newkeys_from_bytes() {
        assert_eq!(NewKeys::from_bytes(&[21]).unwrap(), NewKeys::new());
        assert!(NewKeys::from_bytes(&[]).is_err());
        assert!(NewKeys::from_bytes(&[20]).is_err());
    }
}
