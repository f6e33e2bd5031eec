//! Byte stream variants.
//!
//! Every transport an engine can use ends up as a
//! [`wisp_platform::ByteStream`]:
//!
//! | variant | kind | module |
//! |---|---|---|
//! | TCP socket | `Socket` | [`socket`] |
//! | WebSocket relay | `RelayedSocket` | [`websocket`] |
//! | host-proxied socket | `RelayedSocket` | [`host`] |
//! | `/dev/random`, `/dev/urandom` | `RandomSource` | [`random`] |
//! | file in a [`file::FileStore`] | `LocalFile` | [`file`] |

/// Largest buffer a single stream read allocates, whatever size was asked
/// for.
pub const READ_CHUNK: usize = 32 * 1024;

pub mod file;
pub mod host;
pub mod io;
pub mod random;
pub mod socket;
pub mod websocket;

pub use file::{DirectoryStore, FileStore, OpenMode};
pub use host::HostRouter;
pub use io::from_io;
pub use random::{is_random_device, random_stream};
pub use socket::{DirectRelay, Relay};
pub use websocket::WebSocketRelay;
