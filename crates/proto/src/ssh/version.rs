//! Identification string exchange (RFC 4253 Section 4.2).
//!
//! ```text
//! SSH-protoversion-softwareversion SP comments CR LF
//! ```
//!
//! A server may send other lines before its identification string. They are
//! collected by [`BannerScanner`] and skipped, up to [`MAX_PRE_BANNER_LINES`].
//!
//! # Example
//!
//! ```rust
//! use wisp_proto::ssh::version::Version;
//!
//! let parsed = Version::parse("SSH-2.0-OpenSSH_9.6 Debian").unwrap();
//! assert_eq!(parsed.software(), "OpenSSH_9.6");
//! assert_eq!(parsed.comments(), Some("Debian"));
//! ```

use wisp_platform::{WispError, WispResult};

/// Maximum length of an identification line without CR LF.
pub const MAX_VERSION_LENGTH: usize = 255;

/// Lines a server may send before its identification string.
pub const MAX_PRE_BANNER_LINES: usize = 64;

/// Parsed identification string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    proto_version: String,
    software_version: String,
    comments: Option<String>,
}

impl Version {
    /// Creates a protocol 2.0 identification.
    pub fn new(software: &str, comments: Option<&str>) -> Self {
        Self {
            proto_version: "2.0".to_string(),
            software_version: software.to_string(),
            comments: comments.map(String::from),
        }
    }

    /// The identification wisp sends.
    ///
    /// ```rust
    /// use wisp_proto::ssh::version::Version;
    ///
    /// assert!(Version::wisp_default().to_string().starts_with("SSH-2.0-wisp_"));
    /// ```
    pub fn wisp_default() -> Self {
        Self::new(&format!("wisp_{}", env!("CARGO_PKG_VERSION")), None)
    }

    /// Parses an identification line, with or without the line terminator.
    ///
    /// # Errors
    ///
    /// Returns [`WispError::ProtocolViolation`] if the line is too long, does
    /// not start with `SSH-`, contains NUL, or names a protocol other than
    /// 2.0 or 1.99.
    pub fn parse(line: &str) -> WispResult<Self> {
        let line = line.trim_end_matches('\n').trim_end_matches('\r');

        if line.len() > MAX_VERSION_LENGTH {
            return Err(WispError::ProtocolViolation(format!(
                "identification string too long: {} bytes",
                line.len()
            )));
        }
        if line.contains('\0') {
            return Err(WispError::ProtocolViolation(
                "identification string contains NUL".to_string(),
            ));
        }

        let rest = line.strip_prefix("SSH-").ok_or_else(|| {
            WispError::ProtocolViolation(format!("not an SSH identification: '{}'", line))
        })?;
        let (proto_version, rest) = rest.split_once('-').ok_or_else(|| {
            WispError::ProtocolViolation(format!("malformed identification: '{}'", line))
        })?;

        if proto_version != "2.0" && proto_version != "1.99" {
            return Err(WispError::ProtocolViolation(format!(
                "unsupported protocol version '{}'",
                proto_version
            )));
        }

        let (software_version, comments) = match rest.split_once(' ') {
            Some((software, comments)) => (software, Some(comments.trim().to_string())),
            None => (rest, None),
        };
        if software_version.is_empty() {
            return Err(WispError::ProtocolViolation(
                "identification has no software version".to_string(),
            ));
        }

        Ok(Self {
            proto_version: proto_version.to_string(),
            software_version: software_version.to_string(),
            comments,
        })
    }

    /// Returns the protocol version.
    pub fn proto_version(&self) -> &str {
        &self.proto_version
    }

    /// Returns the software version.
    pub fn software(&self) -> &str {
        &self.software_version
    }

    /// Returns the comments, if any.
    pub fn comments(&self) -> Option<&str> {
        self.comments.as_deref()
    }

    /// Returns the line as sent, with CR LF.
    pub fn to_wire_format(&self) -> Vec<u8> {
        format!("{}\r\n", self).into_bytes()
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SSH-{}-{}", self.proto_version, self.software_version)?;
        if let Some(comments) = &self.comments {
            write!(f, " {}", comments)?;
        }
        Ok(())
    }
}

/// Incremental reader for the peer's identification line.
///
/// Bytes are fed as they arrive. Once the `SSH-` line is complete, the parsed
/// version, the exact line (needed for the exchange hash) and any bytes that
/// followed it are returned.
#[derive(Debug, Default)]
pub struct BannerScanner {
    buffer: Vec<u8>,
    skipped: Vec<String>,
}

/// Result of a completed scan.
#[derive(Debug)]
pub struct ScannedBanner {
    /// The parsed identification.
    pub version: Version,
    /// The identification line without CR LF.
    pub line: String,
    /// Lines received before the identification.
    pub preamble: Vec<String>,
    /// Bytes received after the identification line.
    pub remainder: Vec<u8>,
}

impl BannerScanner {
    /// Creates an empty scanner.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds received bytes. Returns the banner once it is complete.
    pub fn feed(&mut self, data: &[u8]) -> WispResult<Option<ScannedBanner>> {
        self.buffer.extend_from_slice(data);

        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&raw)
                .trim_end_matches('\n')
                .trim_end_matches('\r')
                .to_string();

            if line.starts_with("SSH-") {
                let version = Version::parse(&line)?;
                return Ok(Some(ScannedBanner {
                    version,
                    line,
                    preamble: std::mem::take(&mut self.skipped),
                    remainder: std::mem::take(&mut self.buffer),
                }));
            }

            if self.skipped.len() >= MAX_PRE_BANNER_LINES {
                return Err(WispError::ProtocolViolation(format!(
                    "no identification string within {} lines",
                    MAX_PRE_BANNER_LINES
                )));
            }
            self.skipped.push(line);
        }

        // Pre-banner lines share the identification length bound.
        if self.buffer.len() > MAX_VERSION_LENGTH + 2 {
            return Err(WispError::ProtocolViolation(
                "identification line too long".to_string(),
            ));
        }
        Ok(None)
    }
}
