//! Connection protocol messages (RFC 4254).
//!
//! Every channel message shares the `byte type, uint32 recipient` prefix, so
//! they are decoded together into a [`ChannelMessage`]. Global requests are
//! decoded separately because they carry no channel number.
//!
//! # Example
//!
//! ```rust
//! use wisp_proto::ssh::connection::{ChannelMessage, ChannelRequest, ChannelRequestType};
//!
//! let resize = ChannelRequest::new(
//!     0,
//!     ChannelRequestType::WindowChange { cols: 80, rows: 24, width_px: 0, height_px: 0 },
//!     false,
//! );
//! let bytes = ChannelMessage::Request(resize.clone()).to_bytes();
//! assert_eq!(ChannelMessage::from_bytes(&bytes).unwrap(), ChannelMessage::Request(resize));
//! ```

use crate::ssh::message::MessageType;
use crate::ssh::wire::{
    put_bool, put_string, read_bool, read_string, read_u32, read_u8, read_utf8,
};
use bytes::{BufMut, BytesMut};
use wisp_platform::{WispError, WispResult};

/// Receive window advertised for new channels.
pub const DEFAULT_WINDOW_SIZE: u32 = 2 * 1024 * 1024;

/// Largest channel data payload we accept.
pub const DEFAULT_MAX_PACKET_SIZE: u32 = 32 * 1024;

/// Upper bound on any window we track.
pub const MAX_WINDOW_SIZE: u32 = u32::MAX;

/// Extended data type code for stderr.
pub const EXTENDED_DATA_STDERR: u32 = 1;

/// Terminal modes blob holding only TTY_OP_END.
pub const EMPTY_TERMINAL_MODES: &[u8] = &[0];

/// Channel open failure reasons (RFC 4254 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChannelOpenFailureReason {
    /// SSH_OPEN_ADMINISTRATIVELY_PROHIBITED.
    AdministrativelyProhibited = 1,
    /// SSH_OPEN_CONNECT_FAILED.
    ConnectFailed = 2,
    /// SSH_OPEN_UNKNOWN_CHANNEL_TYPE.
    UnknownChannelType = 3,
    /// SSH_OPEN_RESOURCE_SHORTAGE.
    ResourceShortage = 4,
}

impl ChannelOpenFailureReason {
    /// Human-readable text for a reason code.
    pub fn describe(code: u32) -> &'static str {
        match code {
            1 => "administratively prohibited",
            2 => "connect failed",
            3 => "unknown channel type",
            4 => "resource shortage",
            _ => "unknown reason",
        }
    }
}

/// SSH_MSG_CHANNEL_OPEN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpen {
    /// Channel type, e.g. `session`.
    pub channel_type: String,
    /// Opener's channel number.
    pub sender_channel: u32,
    /// Opener's receive window.
    pub initial_window_size: u32,
    /// Largest packet the opener accepts.
    pub maximum_packet_size: u32,
    /// Type-specific trailing fields, kept raw.
    pub type_data: Vec<u8>,
}

impl ChannelOpen {
    /// A `session` channel open.
    pub fn session(sender_channel: u32, initial_window_size: u32, maximum_packet_size: u32) -> Self {
        Self {
            channel_type: "session".to_string(),
            sender_channel,
            initial_window_size,
            maximum_packet_size,
            type_data: Vec::new(),
        }
    }
}

/// Request carried by SSH_MSG_CHANNEL_REQUEST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequestType {
    /// Pseudo-terminal allocation.
    PtyReq {
        /// TERM value.
        term: String,
        /// Width in character cells.
        cols: u32,
        /// Height in character cells.
        rows: u32,
        /// Width in pixels, usually 0.
        width_px: u32,
        /// Height in pixels, usually 0.
        height_px: u32,
        /// Encoded terminal modes.
        modes: Vec<u8>,
    },
    /// Environment variable.
    Env {
        /// Variable name.
        name: String,
        /// Variable value.
        value: String,
    },
    /// Run a command.
    Exec {
        /// Command line.
        command: String,
    },
    /// Start the login shell.
    Shell,
    /// Terminal size change.
    WindowChange {
        /// Width in character cells.
        cols: u32,
        /// Height in character cells.
        rows: u32,
        /// Width in pixels.
        width_px: u32,
        /// Height in pixels.
        height_px: u32,
    },
    /// Remote command exit status.
    ExitStatus {
        /// Exit code.
        exit_status: u32,
    },
    /// Remote command killed by a signal.
    ExitSignal {
        /// Signal name without the `SIG` prefix.
        signal_name: String,
        /// Whether a core was dumped.
        core_dumped: bool,
        /// Error message.
        error_message: String,
    },
    /// Any other request, e.g. `keepalive@openssh.com`.
    Other {
        /// Request name.
        name: String,
        /// Raw request-specific data.
        data: Vec<u8>,
    },
}

impl ChannelRequestType {
    /// Returns the request name on the wire.
    pub fn name(&self) -> &str {
        match self {
            ChannelRequestType::PtyReq { .. } => "pty-req",
            ChannelRequestType::Env { .. } => "env",
            ChannelRequestType::Exec { .. } => "exec",
            ChannelRequestType::Shell => "shell",
            ChannelRequestType::WindowChange { .. } => "window-change",
            ChannelRequestType::ExitStatus { .. } => "exit-status",
            ChannelRequestType::ExitSignal { .. } => "exit-signal",
            ChannelRequestType::Other { name, .. } => name.as_str(),
        }
    }
}

/// SSH_MSG_CHANNEL_REQUEST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    recipient_channel: u32,
    request_type: ChannelRequestType,
    want_reply: bool,
}

impl ChannelRequest {
    /// Creates a request.
    pub fn new(recipient_channel: u32, request_type: ChannelRequestType, want_reply: bool) -> Self {
        Self {
            recipient_channel,
            request_type,
            want_reply,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the request.
    pub fn request_type(&self) -> &ChannelRequestType {
        &self.request_type
    }

    /// Returns whether a reply is wanted.
    pub fn want_reply(&self) -> bool {
        self.want_reply
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        put_string(buf, self.request_type.name().as_bytes());
        put_bool(buf, self.want_reply);

        match &self.request_type {
            ChannelRequestType::PtyReq {
                term,
                cols,
                rows,
                width_px,
                height_px,
                modes,
            } => {
                put_string(buf, term.as_bytes());
                buf.put_u32(*cols);
                buf.put_u32(*rows);
                buf.put_u32(*width_px);
                buf.put_u32(*height_px);
                put_string(buf, modes);
            }
            ChannelRequestType::Env { name, value } => {
                put_string(buf, name.as_bytes());
                put_string(buf, value.as_bytes());
            }
            ChannelRequestType::Exec { command } => put_string(buf, command.as_bytes()),
            ChannelRequestType::Shell => {}
            ChannelRequestType::WindowChange {
                cols,
                rows,
                width_px,
                height_px,
            } => {
                buf.put_u32(*cols);
                buf.put_u32(*rows);
                buf.put_u32(*width_px);
                buf.put_u32(*height_px);
            }
            ChannelRequestType::ExitStatus { exit_status } => buf.put_u32(*exit_status),
            ChannelRequestType::ExitSignal {
                signal_name,
                core_dumped,
                error_message,
            } => {
                put_string(buf, signal_name.as_bytes());
                put_bool(buf, *core_dumped);
                put_string(buf, error_message.as_bytes());
                put_string(buf, b"");
            }
            ChannelRequestType::Other { data, .. } => buf.put_slice(data),
        }
    }

    fn decode(recipient_channel: u32, data: &[u8], offset: &mut usize) -> WispResult<Self> {
        let name = read_utf8(data, offset)?;
        let want_reply = read_bool(data, offset)?;

        let request_type = match name.as_str() {
            "pty-req" => ChannelRequestType::PtyReq {
                term: read_utf8(data, offset)?,
                cols: read_u32(data, offset)?,
                rows: read_u32(data, offset)?,
                width_px: read_u32(data, offset)?,
                height_px: read_u32(data, offset)?,
                modes: read_string(data, offset)?.to_vec(),
            },
            "env" => ChannelRequestType::Env {
                name: read_utf8(data, offset)?,
                value: read_utf8(data, offset)?,
            },
            "exec" => ChannelRequestType::Exec {
                command: read_utf8(data, offset)?,
            },
            "shell" => ChannelRequestType::Shell,
            "window-change" => ChannelRequestType::WindowChange {
                cols: read_u32(data, offset)?,
                rows: read_u32(data, offset)?,
                width_px: read_u32(data, offset)?,
                height_px: read_u32(data, offset)?,
            },
            "exit-status" => ChannelRequestType::ExitStatus {
                exit_status: read_u32(data, offset)?,
            },
            "exit-signal" => {
                let signal_name = read_utf8(data, offset)?;
                let core_dumped = read_bool(data, offset)?;
                let error_message =
                    String::from_utf8_lossy(read_string(data, offset)?).into_owned();
                let _language = read_string(data, offset)?;
                ChannelRequestType::ExitSignal {
                    signal_name,
                    core_dumped,
                    error_message,
                }
            }
            _ => {
                let rest = data[*offset..].to_vec();
                *offset = data.len();
                ChannelRequestType::Other { name, data: rest }
            }
        };

        Ok(Self {
            recipient_channel,
            request_type,
            want_reply,
        })
    }
}

/// Any message addressed to a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    /// SSH_MSG_CHANNEL_OPEN (carries no recipient).
    Open(ChannelOpen),
    /// SSH_MSG_CHANNEL_OPEN_CONFIRMATION.
    OpenConfirmation {
        /// Our channel number.
        recipient_channel: u32,
        /// Peer's channel number.
        sender_channel: u32,
        /// Peer's receive window.
        initial_window_size: u32,
        /// Largest packet the peer accepts.
        maximum_packet_size: u32,
    },
    /// SSH_MSG_CHANNEL_OPEN_FAILURE.
    OpenFailure {
        /// Our channel number.
        recipient_channel: u32,
        /// Reason code.
        reason: u32,
        /// Description.
        description: String,
    },
    /// SSH_MSG_CHANNEL_WINDOW_ADJUST.
    WindowAdjust {
        /// Recipient channel.
        recipient_channel: u32,
        /// Bytes added to the window.
        bytes_to_add: u32,
    },
    /// SSH_MSG_CHANNEL_DATA.
    Data {
        /// Recipient channel.
        recipient_channel: u32,
        /// Payload.
        data: Vec<u8>,
    },
    /// SSH_MSG_CHANNEL_EXTENDED_DATA.
    ExtendedData {
        /// Recipient channel.
        recipient_channel: u32,
        /// Data type code; 1 is stderr.
        data_type: u32,
        /// Payload.
        data: Vec<u8>,
    },
    /// SSH_MSG_CHANNEL_EOF.
    Eof {
        /// Recipient channel.
        recipient_channel: u32,
    },
    /// SSH_MSG_CHANNEL_CLOSE.
    Close {
        /// Recipient channel.
        recipient_channel: u32,
    },
    /// SSH_MSG_CHANNEL_REQUEST.
    Request(ChannelRequest),
    /// SSH_MSG_CHANNEL_SUCCESS.
    Success {
        /// Recipient channel.
        recipient_channel: u32,
    },
    /// SSH_MSG_CHANNEL_FAILURE.
    Failure {
        /// Recipient channel.
        recipient_channel: u32,
    },
}

impl ChannelMessage {
    /// Returns true if `byte` is a channel message number.
    pub fn is_channel_message(byte: u8) -> bool {
        (MessageType::ChannelOpen as u8..=MessageType::ChannelFailure as u8).contains(&byte)
    }

    /// Returns the recipient channel, or `None` for an open.
    pub fn recipient_channel(&self) -> Option<u32> {
        match self {
            ChannelMessage::Open(_) => None,
            ChannelMessage::Request(request) => Some(request.recipient_channel),
            ChannelMessage::OpenConfirmation {
                recipient_channel, ..
            }
            | ChannelMessage::OpenFailure {
                recipient_channel, ..
            }
            | ChannelMessage::WindowAdjust {
                recipient_channel, ..
            }
            | ChannelMessage::Data {
                recipient_channel, ..
            }
            | ChannelMessage::ExtendedData {
                recipient_channel, ..
            }
            | ChannelMessage::Eof { recipient_channel }
            | ChannelMessage::Close { recipient_channel }
            | ChannelMessage::Success { recipient_channel }
            | ChannelMessage::Failure { recipient_channel } => Some(*recipient_channel),
        }
    }

    fn message_type(&self) -> MessageType {
        match self {
            ChannelMessage::Open(_) => MessageType::ChannelOpen,
            ChannelMessage::OpenConfirmation { .. } => MessageType::ChannelOpenConfirmation,
            ChannelMessage::OpenFailure { .. } => MessageType::ChannelOpenFailure,
            ChannelMessage::WindowAdjust { .. } => MessageType::ChannelWindowAdjust,
            ChannelMessage::Data { .. } => MessageType::ChannelData,
            ChannelMessage::ExtendedData { .. } => MessageType::ChannelExtendedData,
            ChannelMessage::Eof { .. } => MessageType::ChannelEof,
            ChannelMessage::Close { .. } => MessageType::ChannelClose,
            ChannelMessage::Request(_) => MessageType::ChannelRequest,
            ChannelMessage::Success { .. } => MessageType::ChannelSuccess,
            ChannelMessage::Failure { .. } => MessageType::ChannelFailure,
        }
    }

    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(self.message_type() as u8);

        match self {
            ChannelMessage::Open(open) => {
                put_string(&mut buf, open.channel_type.as_bytes());
                buf.put_u32(open.sender_channel);
                buf.put_u32(open.initial_window_size);
                buf.put_u32(open.maximum_packet_size);
                buf.put_slice(&open.type_data);
                return buf.to_vec();
            }
            ChannelMessage::Request(request) => {
                buf.put_u32(request.recipient_channel);
                request.encode_into(&mut buf);
                return buf.to_vec();
            }
            _ => {}
        }

        if let Some(recipient) = self.recipient_channel() {
            buf.put_u32(recipient);
        }
        match self {
            ChannelMessage::OpenConfirmation {
                sender_channel,
                initial_window_size,
                maximum_packet_size,
                ..
            } => {
                buf.put_u32(*sender_channel);
                buf.put_u32(*initial_window_size);
                buf.put_u32(*maximum_packet_size);
            }
            ChannelMessage::OpenFailure {
                reason,
                description,
                ..
            } => {
                buf.put_u32(*reason);
                put_string(&mut buf, description.as_bytes());
                put_string(&mut buf, b"");
            }
            ChannelMessage::WindowAdjust { bytes_to_add, .. } => buf.put_u32(*bytes_to_add),
            ChannelMessage::Data { data, .. } => put_string(&mut buf, data),
            ChannelMessage::ExtendedData {
                data_type, data, ..
            } => {
                buf.put_u32(*data_type);
                put_string(&mut buf, data);
            }
            _ => {}
        }
        buf.to_vec()
    }

    /// Parses a channel message.
    ///
    /// # Errors
    ///
    /// Returns [`WispError::ProtocolViolation`] for truncated data or a
    /// message number outside the channel range.
    pub fn from_bytes(data: &[u8]) -> WispResult<Self> {
        let mut offset = 0;
        let msg_type = read_u8(data, &mut offset)?;

        if msg_type == MessageType::ChannelOpen as u8 {
            let channel_type = read_utf8(data, &mut offset)?;
            let sender_channel = read_u32(data, &mut offset)?;
            let initial_window_size = read_u32(data, &mut offset)?;
            let maximum_packet_size = read_u32(data, &mut offset)?;
            return Ok(ChannelMessage::Open(ChannelOpen {
                channel_type,
                sender_channel,
                initial_window_size,
                maximum_packet_size,
                type_data: data[offset..].to_vec(),
            }));
        }

        let recipient_channel = read_u32(data, &mut offset)?;
        let message = match MessageType::from_u8(msg_type) {
            Some(MessageType::ChannelOpenConfirmation) => ChannelMessage::OpenConfirmation {
                recipient_channel,
                sender_channel: read_u32(data, &mut offset)?,
                initial_window_size: read_u32(data, &mut offset)?,
                maximum_packet_size: read_u32(data, &mut offset)?,
            },
            Some(MessageType::ChannelOpenFailure) => ChannelMessage::OpenFailure {
                recipient_channel,
                reason: read_u32(data, &mut offset)?,
                description: String::from_utf8_lossy(read_string(data, &mut offset)?)
                    .into_owned(),
            },
            Some(MessageType::ChannelWindowAdjust) => ChannelMessage::WindowAdjust {
                recipient_channel,
                bytes_to_add: read_u32(data, &mut offset)?,
            },
            Some(MessageType::ChannelData) => ChannelMessage::Data {
                recipient_channel,
                data: read_string(data, &mut offset)?.to_vec(),
            },
            Some(MessageType::ChannelExtendedData) => ChannelMessage::ExtendedData {
                recipient_channel,
                data_type: read_u32(data, &mut offset)?,
                data: read_string(data, &mut offset)?.to_vec(),
            },
            Some(MessageType::ChannelEof) => ChannelMessage::Eof { recipient_channel },
            Some(MessageType::ChannelClose) => ChannelMessage::Close { recipient_channel },
            Some(MessageType::ChannelRequest) => ChannelMessage::Request(
                ChannelRequest::decode(recipient_channel, data, &mut offset)?,
            ),
            Some(MessageType::ChannelSuccess) => ChannelMessage::Success { recipient_channel },
            Some(MessageType::ChannelFailure) => ChannelMessage::Failure { recipient_channel },
            _ => {
                return Err(WispError::ProtocolViolation(format!(
                    "Message {} is not a channel message",
                    msg_type
                )))
            }
        };
        Ok(message)
    }
}

/// SSH_MSG_GLOBAL_REQUEST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalRequest {
    /// Request name.
    pub name: String,
    /// Whether the sender waits for a reply.
    pub want_reply: bool,
}

impl GlobalRequest {
    /// Parses the request header; request-specific data is ignored.
    pub fn from_bytes(data: &[u8]) -> WispResult<Self> {
        let mut offset = 0;
        if read_u8(data, &mut offset)? != MessageType::GlobalRequest as u8 {
            return Err(WispError::ProtocolViolation(
                "Expected GLOBAL_REQUEST".to_string(),
            ));
        }
        Ok(Self {
            name: read_utf8(data, &mut offset)?,
            want_reply: read_bool(data, &mut offset)?,
        })
    }

    /// Serializes a request with no extra data.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::GlobalRequest as u8);
        put_string(&mut buf, self.name.as_bytes());
        put_bool(&mut buf, self.want_reply);
        buf.to_vec()
    }
}

/// SSH_MSG_REQUEST_FAILURE.
pub fn request_failure() -> Vec<u8> {
    vec![MessageType::RequestFailure as u8]
}
