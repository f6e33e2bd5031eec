//! Connection parameters.
//!
//! `startSession` carries a command-line-style argument list plus terminal
//! settings. [`ConnectionParams::from_start_session`] turns that into the
//! validated parameters one session runs with.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};
use wisp_platform::{WispError, WispResult};

/// Default SSH port.
pub const DEFAULT_PORT: u16 = 22;
/// Default terminal width in columns.
pub const DEFAULT_TERMINAL_WIDTH: u32 = 143;
/// Default terminal height in rows.
pub const DEFAULT_TERMINAL_HEIGHT: u32 = 18;
/// Default stdout/stderr write window in bytes.
pub const DEFAULT_WRITE_WINDOW: u64 = 8192;
/// Default `TERM`.
pub const DEFAULT_TERM: &str = "xterm-256color";

/// Flags that consume the following argument.
const FLAGS_WITH_VALUE: &[&str] = &[
    "-B", "-b", "-c", "-D", "-E", "-e", "-F", "-I", "-i", "-J", "-L", "-l", "-m", "-O", "-o",
    "-p", "-Q", "-R", "-S", "-W", "-w",
];

/// The `startSession` argument object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StartSessionArgs {
    /// Command-line-style arguments, e.g. `["-C", "alice@10.0.0.5"]`.
    pub arguments: Vec<String>,
    /// Environment sent to the remote shell.
    pub environment: BTreeMap<String, String>,
    /// Terminal width in columns.
    pub terminal_width: u32,
    /// Terminal height in rows.
    pub terminal_height: u32,
    /// Ask the host to proxy the SSH socket through `openSocket`.
    pub use_js_socket: bool,
    /// Unacknowledged stdout/stderr bytes allowed in flight.
    pub write_window: u64,
}

impl Default for StartSessionArgs {
    fn default() -> Self {
        let mut environment = BTreeMap::new();
        environment.insert("TERM".to_string(), DEFAULT_TERM.to_string());
        Self {
            arguments: Vec::new(),
            environment,
            terminal_width: DEFAULT_TERMINAL_WIDTH,
            terminal_height: DEFAULT_TERMINAL_HEIGHT,
            use_js_socket: false,
            write_window: DEFAULT_WRITE_WINDOW,
        }
    }
}

impl StartSessionArgs {
    /// Creates arguments for `destination` with default terminal settings.
    pub fn for_destination(destination: impl Into<String>) -> Self {
        Self {
            arguments: vec![destination.into()],
            ..Self::default()
        }
    }
}

/// Validated parameters of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    /// Login name.
    pub username: String,
    /// Host to connect to.
    pub hostname: String,
    /// Port to connect to.
    pub port: u16,
    /// `-C` was given. Only `none` compression is negotiated.
    pub compression: bool,
    /// Terminal width in columns.
    pub terminal_width: u32,
    /// Terminal height in rows.
    pub terminal_height: u32,
    /// Environment for the remote shell, sorted by name.
    pub environment: Vec<(String, String)>,
    /// Unacknowledged stdout/stderr bytes allowed in flight. Never zero.
    pub write_window: u64,
    /// Dial through the host's `openSocket`.
    pub use_host_socket: bool,
    /// Arguments that were not understood.
    pub extra_args: Vec<String>,
}

impl ConnectionParams {
    /// Parses and validates `startSession` arguments.
    ///
    /// `-p <port>` and `-l <login>` override the destination's port and
    /// user. Unknown flags and trailing words end up in `extra_args`.
    ///
    /// # Errors
    ///
    /// Returns [`WispError::InvalidParameters`] for a missing or malformed
    /// destination, an empty user or an out-of-range port.
    pub fn from_start_session(args: &StartSessionArgs) -> WispResult<Self> {
        let mut compression = false;
        let mut port_flag = None;
        let mut login_flag = None;
        let mut destination = None;
        let mut extra_args = Vec::new();

        let mut words = args.arguments.iter();
        while let Some(word) = words.next() {
            if destination.is_some() {
                extra_args.push(word.clone());
                continue;
            }
            match word.as_str() {
                "-C" => compression = true,
                "-p" | "-l" => {
                    let value = words.next().ok_or_else(|| {
                        WispError::InvalidParameters(format!("{} needs a value", word))
                    })?;
                    if word == "-p" {
                        port_flag = Some(parse_port(value)?);
                    } else {
                        login_flag = Some(value.clone());
                    }
                }
                flag if flag.starts_with("-p") && flag.len() > 2 => {
                    port_flag = Some(parse_port(&flag[2..])?);
                }
                flag if flag.starts_with("-l") && flag.len() > 2 => {
                    login_flag = Some(flag[2..].to_string());
                }
                flag if FLAGS_WITH_VALUE.contains(&flag) => {
                    extra_args.push(word.clone());
                    if let Some(value) = words.next() {
                        extra_args.push(value.clone());
                    }
                }
                flag if flag.starts_with('-') && flag.len() > 1 => extra_args.push(word.clone()),
                _ => destination = Some(word.clone()),
            }
        }

        let destination = destination
            .ok_or_else(|| WispError::InvalidParameters("no destination given".into()))?;
        let (user, hostname, port) = parse_destination(&destination)?;
        let username = login_flag.or(user).unwrap_or_default();
        if username.is_empty() {
            return Err(WispError::InvalidParameters(format!(
                "no user name for '{}'",
                destination
            )));
        }
        if !extra_args.is_empty() {
            warn!(args = ?extra_args, "Ignoring unsupported arguments");
        }

        let params = Self {
            username,
            hostname,
            port: port_flag.or(port).unwrap_or(DEFAULT_PORT),
            compression,
            terminal_width: args.terminal_width,
            terminal_height: args.terminal_height,
            environment: args
                .environment
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            write_window: match args.write_window {
                0 => DEFAULT_WRITE_WINDOW,
                window => window,
            },
            use_host_socket: args.use_js_socket,
            extra_args,
        };
        debug!(
            user = %params.username,
            host = %params.hostname,
            port = params.port,
            "Parsed connection parameters"
        );
        Ok(params)
    }

    /// Renders the parameters back into `startSession` arguments.
    pub fn to_start_session(&self) -> StartSessionArgs {
        let mut arguments = Vec::new();
        if self.compression {
            arguments.push("-C".to_string());
        }
        if self.port != DEFAULT_PORT {
            arguments.push("-p".to_string());
            arguments.push(self.port.to_string());
        }
        arguments.push(format!("{}@{}", self.username, self.hostname));
        arguments.extend(self.extra_args.iter().cloned());

        StartSessionArgs {
            arguments,
            environment: self.environment.iter().cloned().collect(),
            terminal_width: self.terminal_width,
            terminal_height: self.terminal_height,
            use_js_socket: self.use_host_socket,
            write_window: self.write_window,
        }
    }

    /// Returns `user@host:port`.
    pub fn display_target(&self) -> String {
        format!("{}@{}:{}", self.username, self.hostname, self.port)
    }
}

/// Splits `[user@]host[:port]`.
///
/// The user may not contain `@` and the host may contain neither `:` nor
/// `@`. A missing port is returned as `None`.
///
/// # Errors
///
/// Returns [`WispError::InvalidParameters`] for an empty host, an empty user
/// before `@` or a bad port.
pub fn parse_destination(destination: &str) -> WispResult<(Option<String>, String, Option<u16>)> {
    let invalid = |why: &str| WispError::InvalidParameters(format!("'{}': {}", destination, why));

    let (user, rest) = match destination.split_once('@') {
        Some(("", _)) => return Err(invalid("empty user name")),
        Some((user, rest)) => (Some(user.to_string()), rest),
        None => (None, destination),
    };
    if rest.contains('@') {
        return Err(invalid("more than one '@'"));
    }

    let (host, port) = match rest.split_once(':') {
        Some((host, port)) => (host, Some(parse_port(port)?)),
        None => (rest, None),
    };
    if host.is_empty() {
        return Err(invalid("empty host name"));
    }
    if host.contains(':') {
        return Err(invalid("more than one ':'"));
    }
    Ok((user, host.to_string(), port))
}

/// Parses a decimal port in 1-65535.
///
/// # Errors
///
/// Returns [`WispError::InvalidParameters`] otherwise.
pub fn parse_port(text: &str) -> WispResult<u16> {
    let invalid = || WispError::InvalidParameters(format!("bad port '{}'", text));
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    match text.parse::<u16>() {
        Ok(0) | Err(_) => Err(invalid()),
        Ok(port) => Ok(port),
    }
}
