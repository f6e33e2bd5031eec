//! # wisp Platform
//!
//! Core types shared by every wisp crate.
//!
//! This crate provides:
//! - Unified error types (`WispError`, `WispResult`)
//! - The byte-stream traits the protocol engine runs over (`StreamReader`,
//!   `StreamWriter`, `ByteStream`)
//!
//! # Examples
//!
//! ```
//! use wisp_platform::{WispError, WispResult};
//!
//! fn parse_port(text: &str) -> WispResult<u16> {
//!     text.parse()
//!         .map_err(|_| WispError::InvalidParameters(format!("bad port '{}'", text)))
//! }
//!
//! # fn main() -> WispResult<()> {
//! assert_eq!(parse_port("22")?, 22);
//! assert!(parse_port("ssh").is_err());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;
pub mod traits;

pub use error::{WispError, WispResult};
pub use traits::{ByteStream, ReadOutcome, StreamKind, StreamReader, StreamWriter};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
