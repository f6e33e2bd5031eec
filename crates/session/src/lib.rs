//! Session engine for wisp.
//!
//! An [`Engine`] runs interactive SSH sessions for a terminal it only talks
//! to through control messages:
//!
//! - **Gateway**: [`EngineInput`] and [`EngineOutput`], the nassh-style
//!   message set, with an in-process pair and a JSON-lines carrier
//! - **Controller**: bootstrapping, the interactive loop and a single exit
//!   per session
//! - **Streams**: TCP, WebSocket relays, host-proxied sockets, local files
//!   and random devices behind one [`wisp_platform::ByteStream`]
//! - **Descriptors**: the host side of `openFile`/`openSocket`, with paced
//!   writes and cumulative acknowledgements
//!
//! [`HostBridge`] plays the terminal's part for native front ends and tests.
//!
//! # Example
//!
//! ```rust
//! use wisp_session::{ConnectionParams, StartSessionArgs};
//!
//! let args = StartSessionArgs::for_destination("alice@example.com:2222");
//! let params = ConnectionParams::from_start_session(&args).unwrap();
//! assert_eq!(params.username, "alice");
//! assert_eq!(params.port, 2222);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod config;
pub mod controller;
pub mod fd_table;
pub mod gateway;
pub mod host;
pub mod params;
pub mod reconnect;
pub mod stream;

pub use config::ClientConfig;
pub use controller::{Engine, SessionPhase, SessionReport, ShutdownHandle};
pub use fd_table::DescriptorTable;
pub use gateway::{EngineEnd, EngineInput, EngineOutput, Gateway, HostEnd};
pub use host::{HostBridge, HostEvent};
pub use params::{ConnectionParams, StartSessionArgs};
pub use reconnect::{ReconnectConfig, ReconnectHandler};
pub use wisp_proto::ssh::StrictHostKeyChecking;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
