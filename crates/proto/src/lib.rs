//! Protocol engine for the wisp SSH session engine.
//!
//! This crate provides the client side of SSH-2:
//!
//! - **Transport**: version exchange, curve25519/ECDH key exchange, AEAD
//!   packet protection, strict key exchange and rekeying
//! - **Authentication**: `none`, Ed25519 `publickey`, `keyboard-interactive`
//!   and `password`
//! - **Connection**: one `session` channel with a pseudo-terminal, flow
//!   control and exit reporting
//! - **Trust**: OpenSSH `known_hosts` databases and `StrictHostKeyChecking`
//!
//! The engine runs over any [`wisp_platform::ByteStream`], so the same code
//! drives a TCP socket, a relay or a host-proxied socket.
//!
//! # Features
//!
//! - `ssh` (default) - SSH protocol support
//!
//! # Example
//!
//! ```rust
//! use wisp_proto::ssh::{Alignment, Packet};
//!
//! let packet = Packet::aligned(b"SSH message payload".to_vec(), Alignment::CLEAR).unwrap();
//! let wire_format = packet.to_bytes();
//!
//! let parsed = Packet::from_bytes(&wire_format).unwrap();
//! assert_eq!(parsed.payload(), b"SSH message payload");
//! ```
//!
//! # Security
//!
//! - All cryptographic operations use vetted libraries (`ring`, `dalek`)
//! - Secret material is held in `zeroize` containers
//! - Every length read from the wire is bounds-checked
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ssh")]
pub mod ssh;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
