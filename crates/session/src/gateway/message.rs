//! Control messages and their JSON envelope.
//!
//! Every message is `{"name": ..., "arguments": [...]}`. Binary payloads are
//! standard padded base64 strings.

use crate::params::StartSessionArgs;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use tracing::warn;
use wisp_platform::{WispError, WispResult};

/// Wire form of a control message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message name, e.g. `onRead`.
    pub name: String,
    /// Positional arguments.
    #[serde(rename = "arguments", alias = "argv", default)]
    pub argv: Vec<Value>,
}

impl Envelope {
    /// Parses one JSON document.
    pub fn from_json(text: &str) -> WispResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| WispError::ProtocolViolation(format!("malformed control message: {}", e)))
    }

    /// Renders the envelope as one line of JSON.
    pub fn to_json(&self) -> String {
        // Serializing strings and JSON values cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// A typed control message in one direction of the contract.
pub trait ControlMessage: Sized {
    /// Message name on the wire.
    fn name(&self) -> &'static str;

    /// Positional arguments on the wire.
    fn arguments(&self) -> Vec<Value>;

    /// Decodes `name` and `argv`.
    ///
    /// Returns `Ok(None)` for names this direction does not know, after
    /// logging them.
    ///
    /// # Errors
    ///
    /// Returns [`WispError::ProtocolViolation`] when a known message has the
    /// wrong argument shape.
    fn from_parts(name: &str, argv: &[Value]) -> WispResult<Option<Self>>;

    /// Wraps the message in its envelope.
    fn to_envelope(&self) -> Envelope {
        Envelope {
            name: self.name().to_string(),
            argv: self.arguments(),
        }
    }

    /// Decodes an envelope.
    fn from_envelope(envelope: &Envelope) -> WispResult<Option<Self>> {
        Self::from_parts(&envelope.name, &envelope.argv)
    }
}

/// Why a descriptor closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed on request.
    Closed,
    /// The socket peer finished sending.
    Eof,
    /// The stream failed.
    Error,
}

impl CloseReason {
    /// Returns the wire string.
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Closed => "closed",
            CloseReason::Eof => "eof",
            CloseReason::Error => "error",
        }
    }

    /// Reads a wire reason. Reasons other than `closed` and `eof` are
    /// stream-specific failures and map to [`CloseReason::Error`].
    pub fn from_wire(reason: &str) -> Self {
        match reason {
            "closed" => CloseReason::Closed,
            "eof" => CloseReason::Eof,
            "error" => CloseReason::Error,
            other => {
                warn!(reason = other, "Treating unknown close reason as an error");
                CloseReason::Error
            }
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Messages the terminal side sends to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineInput {
    /// `startSession [params]`
    StartSession(StartSessionArgs),
    /// `onResize [width, height]`
    OnResize {
        /// Columns.
        width: u32,
        /// Rows.
        height: u32,
    },
    /// `onRead [fd, data]`; fd 0 is keyboard input.
    OnRead {
        /// Descriptor.
        fd: u32,
        /// Bytes read. Empty means end of file.
        data: Vec<u8>,
    },
    /// `onOpenFile [fd, success]`
    OnOpenFile {
        /// Descriptor.
        fd: u32,
        /// Whether the open succeeded.
        success: bool,
    },
    /// `onOpenSocket [fd, success]`
    OnOpenSocket {
        /// Descriptor.
        fd: u32,
        /// Whether the connect succeeded.
        success: bool,
    },
    /// `onWriteAcknowledge [fd, total]`
    OnWriteAcknowledge {
        /// Descriptor.
        fd: u32,
        /// Cumulative bytes accepted on this descriptor.
        total: u64,
    },
    /// `onClose [fd, reason]`
    OnClose {
        /// Descriptor.
        fd: u32,
        /// Why it closed.
        reason: CloseReason,
    },
    /// `onExitAcknowledge []`
    OnExitAcknowledge,
}

impl EngineInput {
    /// Returns the descriptor a completion refers to, if any.
    pub fn fd(&self) -> Option<u32> {
        match self {
            EngineInput::OnRead { fd, .. }
            | EngineInput::OnOpenFile { fd, .. }
            | EngineInput::OnOpenSocket { fd, .. }
            | EngineInput::OnWriteAcknowledge { fd, .. }
            | EngineInput::OnClose { fd, .. } => Some(*fd),
            EngineInput::StartSession(_)
            | EngineInput::OnResize { .. }
            | EngineInput::OnExitAcknowledge => None,
        }
    }
}

impl ControlMessage for EngineInput {
    fn name(&self) -> &'static str {
        match self {
            EngineInput::StartSession(_) => "startSession",
            EngineInput::OnResize { .. } => "onResize",
            EngineInput::OnRead { .. } => "onRead",
            EngineInput::OnOpenFile { .. } => "onOpenFile",
            EngineInput::OnOpenSocket { .. } => "onOpenSocket",
            EngineInput::OnWriteAcknowledge { .. } => "onWriteAcknowledge",
            EngineInput::OnClose { .. } => "onClose",
            EngineInput::OnExitAcknowledge => "onExitAcknowledge",
        }
    }

    fn arguments(&self) -> Vec<Value> {
        match self {
            EngineInput::StartSession(args) => {
                vec![serde_json::to_value(args).unwrap_or(Value::Null)]
            }
            EngineInput::OnResize { width, height } => vec![json!(width), json!(height)],
            EngineInput::OnRead { fd, data } => vec![json!(fd), json!(STANDARD.encode(data))],
            EngineInput::OnOpenFile { fd, success } | EngineInput::OnOpenSocket { fd, success } => {
                vec![json!(fd), json!(success)]
            }
            EngineInput::OnWriteAcknowledge { fd, total } => vec![json!(fd), json!(total)],
            EngineInput::OnClose { fd, reason } => vec![json!(fd), json!(reason.as_str())],
            EngineInput::OnExitAcknowledge => Vec::new(),
        }
    }

    fn from_parts(name: &str, argv: &[Value]) -> WispResult<Option<Self>> {
        let args = Args::new(name, argv);
        let message = match name {
            "startSession" => {
                let params = match argv.first() {
                    Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                        WispError::ProtocolViolation(format!("startSession: {}", e))
                    })?,
                    None => StartSessionArgs::default(),
                };
                EngineInput::StartSession(params)
            }
            "onResize" => EngineInput::OnResize {
                width: args.u32(0)?,
                height: args.u32(1)?,
            },
            "onRead" => EngineInput::OnRead {
                fd: args.u32(0)?,
                data: args.bytes(1)?,
            },
            "onOpenFile" => EngineInput::OnOpenFile {
                fd: args.u32(0)?,
                success: args.bool(1)?,
            },
            "onOpenSocket" => EngineInput::OnOpenSocket {
                fd: args.u32(0)?,
                success: args.bool(1)?,
            },
            "onWriteAcknowledge" => EngineInput::OnWriteAcknowledge {
                fd: args.u32(0)?,
                total: args.u64(1)?,
            },
            "onClose" => EngineInput::OnClose {
                fd: args.u32(0)?,
                reason: match argv.get(1) {
                    Some(Value::String(reason)) => CloseReason::from_wire(reason),
                    None | Some(Value::Null) => CloseReason::Closed,
                    Some(other) => {
                        warn!(reason = %other, "Treating non-string close reason as an error");
                        CloseReason::Error
                    }
                },
            },
            "onExitAcknowledge" => EngineInput::OnExitAcknowledge,
            other => {
                warn!(name = other, "Ignoring unknown engine input");
                return Ok(None);
            }
        };
        Ok(Some(message))
    }
}

/// Messages the engine sends to the terminal side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineOutput {
    /// `printLog [text]`
    PrintLog(String),
    /// `exit [code]`
    Exit(i32),
    /// `openFile [fd, path, mode]`
    OpenFile {
        /// Descriptor chosen by the engine.
        fd: u32,
        /// Path to open.
        path: String,
        /// `fopen`-style mode.
        mode: String,
    },
    /// `openSocket [fd, host, port]`
    OpenSocket {
        /// Descriptor chosen by the engine.
        fd: u32,
        /// Host to dial.
        host: String,
        /// Port to dial.
        port: u16,
    },
    /// `write [fd, data]`; fd 1 and 2 are stdout and stderr.
    Write {
        /// Descriptor.
        fd: u32,
        /// Bytes to write.
        data: Vec<u8>,
    },
    /// `read [fd, size]`
    Read {
        /// Descriptor.
        fd: u32,
        /// Most bytes wanted.
        size: u32,
    },
    /// `close [fd]`
    Close {
        /// Descriptor.
        fd: u32,
    },
}

impl ControlMessage for EngineOutput {
    fn name(&self) -> &'static str {
        match self {
            EngineOutput::PrintLog(_) => "printLog",
            EngineOutput::Exit(_) => "exit",
            EngineOutput::OpenFile { .. } => "openFile",
            EngineOutput::OpenSocket { .. } => "openSocket",
            EngineOutput::Write { .. } => "write",
            EngineOutput::Read { .. } => "read",
            EngineOutput::Close { .. } => "close",
        }
    }

    fn arguments(&self) -> Vec<Value> {
        match self {
            EngineOutput::PrintLog(text) => vec![json!(text)],
            EngineOutput::Exit(code) => vec![json!(code)],
            EngineOutput::OpenFile { fd, path, mode } => vec![json!(fd), json!(path), json!(mode)],
            EngineOutput::OpenSocket { fd, host, port } => {
                vec![json!(fd), json!(host), json!(port)]
            }
            EngineOutput::Write { fd, data } => vec![json!(fd), json!(STANDARD.encode(data))],
            EngineOutput::Read { fd, size } => vec![json!(fd), json!(size)],
            EngineOutput::Close { fd } => vec![json!(fd)],
        }
    }

    fn from_parts(name: &str, argv: &[Value]) -> WispResult<Option<Self>> {
        let args = Args::new(name, argv);
        let message = match name {
            "printLog" => EngineOutput::PrintLog(args.string(0)?),
            "exit" => EngineOutput::Exit(args.i32(0)?),
            "openFile" => EngineOutput::OpenFile {
                fd: args.u32(0)?,
                path: args.string(1)?,
                mode: args.string(2)?,
            },
            "openSocket" => EngineOutput::OpenSocket {
                fd: args.u32(0)?,
                host: args.string(1)?,
                port: u16::try_from(args.u64(2)?)
                    .map_err(|_| args.shape(2, "a port number"))?,
            },
            "write" => EngineOutput::Write {
                fd: args.u32(0)?,
                data: args.bytes(1)?,
            },
            "read" => EngineOutput::Read {
                fd: args.u32(0)?,
                size: args.u32(1)?,
            },
            "close" => EngineOutput::Close { fd: args.u32(0)? },
            other => {
                warn!(name = other, "Ignoring unknown engine output");
                return Ok(None);
            }
        };
        Ok(Some(message))
    }
}

/// Positional argument accessors with shape errors naming the message.
struct Args<'a> {
    name: &'a str,
    argv: &'a [Value],
}

impl<'a> Args<'a> {
    fn new(name: &'a str, argv: &'a [Value]) -> Self {
        Self { name, argv }
    }

    fn shape(&self, index: usize, expected: &str) -> WispError {
        WispError::ProtocolViolation(format!(
            "{}: argument {} must be {}",
            self.name, index, expected
        ))
    }

    fn get(&self, index: usize) -> WispResult<&'a Value> {
        self.argv.get(index).ok_or_else(|| {
            WispError::ProtocolViolation(format!(
                "{}: expected at least {} arguments, got {}",
                self.name,
                index + 1,
                self.argv.len()
            ))
        })
    }

    /// Numbers may arrive as JSON numbers or numeric strings.
    fn i64(&self, index: usize) -> WispResult<i64> {
        let parsed = match self.get(index)? {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        };
        parsed.ok_or_else(|| self.shape(index, "an integer"))
    }

    fn u64(&self, index: usize) -> WispResult<u64> {
        u64::try_from(self.i64(index)?).map_err(|_| self.shape(index, "a non-negative integer"))
    }

    fn u32(&self, index: usize) -> WispResult<u32> {
        u32::try_from(self.i64(index)?).map_err(|_| self.shape(index, "a 32-bit unsigned integer"))
    }

    fn i32(&self, index: usize) -> WispResult<i32> {
        i32::try_from(self.i64(index)?).map_err(|_| self.shape(index, "a 32-bit integer"))
    }

    fn bool(&self, index: usize) -> WispResult<bool> {
        match self.get(index)? {
            Value::Bool(b) => Ok(*b),
            Value::Number(n) => Ok(n.as_i64().unwrap_or(0) != 0),
            _ => Err(self.shape(index, "a boolean")),
        }
    }

    fn string(&self, index: usize) -> WispResult<String> {
        match self.get(index)? {
            Value::String(s) => Ok(s.clone()),
            _ => Err(self.shape(index, "a string")),
        }
    }

    fn bytes(&self, index: usize) -> WispResult<Vec<u8>> {
        let text = self.string(index)?;
        STANDARD
            .decode(text.as_bytes())
            .map_err(|e| WispError::ProtocolViolation(format!("{}: bad base64: {}", self.name, e)))
    }
}
