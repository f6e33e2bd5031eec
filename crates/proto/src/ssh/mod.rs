//! SSH (Secure Shell) client protocol.
//!
//! This module implements the client side of RFC 4251-4254.
//!
//! # Architecture
//!
//! The implementation is layered:
//!
//! 1. **Wire and packet layer** ([`wire`], [`packet`]) - data types and the
//!    binary packet protocol (RFC 4253 Section 6)
//! 2. **Transport layer** ([`transport`], [`kex`], [`kex_dh`], [`cipher`]) -
//!    key exchange and AEAD packet protection (RFC 4253, 5656, 8731)
//! 3. **Authentication layer** ([`auth`], [`identity`]) - user
//!    authentication (RFC 4252, 4256)
//! 4. **Connection layer** ([`connection`], [`channel`]) - channels, requests
//!    and flow control (RFC 4254)
//! 5. **Client** ([`client`]) - drives a whole connection over a
//!    [`wisp_platform::ByteStream`]
//!
//! Host keys are checked against a [`known_hosts`] database before
//! authentication starts.
//!
//! # Security Considerations
//!
//! - **Input Validation**: packet parsing enforces the 35000 byte limit
//! - **Constant-Time Operations**: hashed host names compare in constant time
//! - **Memory Safety**: keys and passwords are zeroized on drop using [`zeroize`]
//! - **Modern Algorithms**: AEAD ciphers only, Curve25519 preferred
//!
//! # Example
//!
//! ```rust
//! use wisp_proto::ssh::{Alignment, Packet};
//!
//! let packet = Packet::aligned(b"SSH-MSG-IGNORE payload".to_vec(), Alignment::CLEAR).unwrap();
//! let bytes = packet.to_bytes();
//!
//! let parsed = Packet::from_bytes(&bytes).unwrap();
//! assert_eq!(parsed.payload(), b"SSH-MSG-IGNORE payload");
//! ```
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol

pub mod auth;
pub mod channel;
pub mod cipher;
pub mod client;
pub mod connection;
pub mod hostkey;
pub mod identity;
pub mod keepalive;
pub mod kex;
pub mod kex_dh;
pub mod known_hosts;
pub mod message;
pub mod packet;
pub mod transport;
pub mod version;
pub mod wire;

// Re-export main types
pub use auth::{AuthMethod, AuthPrompter, NoPrompter, Prompt};
pub use channel::{ChannelState, SshChannel};
pub use cipher::{CipherAlgorithm, Role};
pub use client::{
    ChannelEvent, DataStream, HostKeyVerifier, PtySize, SshClient, SshClientConfig,
};
pub use connection::{ChannelMessage, ChannelOpenFailureReason, ChannelRequestType};
pub use hostkey::{Ed25519KeyPair, HostKeyAlgorithm, KeyPair, PublicHostKey};
pub use identity::Identity;
pub use keepalive::Keepalive;
pub use kex::{negotiate_algorithm, KexInit, Negotiated, NewKeys};
pub use known_hosts::{HostKeyStatus, KnownHostsFile, StrictHostKeyChecking, Verdict};
pub use message::MessageType;
pub use packet::{Alignment, Packet};
pub use transport::{PacketCodec, RekeyTracker, State, Transport, TransportState};
pub use version::Version;
