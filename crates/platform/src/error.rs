//! Error types for wisp

use std::fmt;
use std::io::ErrorKind;

/// Unified error type for all wisp operations
#[derive(Debug)]
pub enum WispError {
    /// Malformed connect target, port or session arguments
    InvalidParameters(String),

    /// Transport-level failure while establishing or using a connection
    ConnectionFailed(String),

    /// The peer actively refused the connection
    ConnectionRefused(String),

    /// The host could not be reached (including dial timeouts)
    HostUnreachable(String),

    /// Access to a stream target was denied
    PermissionDenied(String),

    /// A stream target does not exist
    NotFound(String),

    /// The server's host key failed verification against the trust store
    HostKeyVerificationFailed(String),

    /// Every offered authentication method was rejected
    AuthenticationFailed(String),

    /// An operation named a descriptor that is not open
    DescriptorNotFound(u32),

    /// The peer sent malformed or out-of-order protocol data
    ProtocolViolation(String),

    /// I/O error that does not map onto a more specific variant
    Io(std::io::Error),

    /// Configuration error
    Config(String),

    /// Other error
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl WispError {
    /// Returns the process-style exit code reported for this error.
    ///
    /// Engine failures follow ssh(1) and report 255.
    pub fn exit_code(&self) -> i32 {
        match self {
            WispError::InvalidParameters(_) | WispError::Config(_) => 2,
            _ => 255,
        }
    }

    /// Returns true when the error ends the session rather than a single operation.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, WispError::DescriptorNotFound(_))
    }
}

impl fmt::Display for WispError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WispError::InvalidParameters(msg) => write!(f, "Invalid parameters: {}", msg),
            WispError::ConnectionFailed(msg) => write!(f, "Connection failed: {}", msg),
            WispError::ConnectionRefused(msg) => write!(f, "Connection refused: {}", msg),
            WispError::HostUnreachable(msg) => write!(f, "Host unreachable: {}", msg),
            WispError::PermissionDenied(msg) => write!(f, "Permission denied: {}", msg),
            WispError::NotFound(msg) => write!(f, "Not found: {}", msg),
            WispError::HostKeyVerificationFailed(msg) => {
                write!(f, "Host key verification failed: {}", msg)
            }
            WispError::AuthenticationFailed(msg) => write!(f, "Authentication failed: {}", msg),
            WispError::DescriptorNotFound(fd) => write!(f, "Descriptor not found: {}", fd),
            WispError::ProtocolViolation(msg) => write!(f, "Protocol violation: {}", msg),
            WispError::Io(e) => write!(f, "IO error: {}", e),
            WispError::Config(msg) => write!(f, "Configuration error: {}", msg),
            WispError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for WispError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WispError::Io(e) => Some(e),
            WispError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for WispError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            ErrorKind::ConnectionRefused => WispError::ConnectionRefused(err.to_string()),
            ErrorKind::TimedOut | ErrorKind::AddrNotAvailable => {
                WispError::HostUnreachable(err.to_string())
            }
            ErrorKind::PermissionDenied => WispError::PermissionDenied(err.to_string()),
            ErrorKind::NotFound => WispError::NotFound(err.to_string()),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
            | ErrorKind::NotConnected => WispError::ConnectionFailed(err.to_string()),
            _ => WispError::Io(err),
        }
    }
}

/// Result type for wisp operations
pub type WispResult<T> = Result<T, WispError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = WispError::InvalidParameters("empty hostname".to_string());
        assert_eq!(err.to_string(), "Invalid parameters: empty hostname");

        let err = WispError::DescriptorNotFound(7);
        assert_eq!(err.to_string(), "Descriptor not found: 7");
    }

    #[test]
    fn test_io_error_classification() {
        let refused = std::io::Error::new(ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(
            WispError::from(refused),
            WispError::ConnectionRefused(_)
        ));

        let timeout = std::io::Error::new(ErrorKind::TimedOut, "timeout");
        assert!(matches!(
            WispError::from(timeout),
            WispError::HostUnreachable(_)
        ));

        let denied = std::io::Error::new(ErrorKind::PermissionDenied, "denied");
        assert!(matches!(
            WispError::from(denied),
            WispError::PermissionDenied(_)
        ));

        let missing = std::io::Error::new(ErrorKind::NotFound, "missing");
        assert!(matches!(WispError::from(missing), WispError::NotFound(_)));

        let eof = std::io::Error::new(ErrorKind::UnexpectedEof, "eof");
        assert!(matches!(
            WispError::from(eof),
            WispError::ConnectionFailed(_)
        ));

        let other = std::io::Error::new(ErrorKind::Other, "other");
        assert!(matches!(WispError::from(other), WispError::Io(_)));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(WispError::InvalidParameters(String::new()).exit_code(), 2);
        assert_eq!(WispError::ProtocolViolation(String::new()).exit_code(), 255);
        assert_eq!(WispError::AuthenticationFailed(String::new()).exit_code(), 255);
    }

    #[test]
    fn test_descriptor_errors_are_not_fatal() {
        assert!(!WispError::DescriptorNotFound(3).is_fatal());
        assert!(WispError::ProtocolViolation("bad mac".into()).is_fatal());
    }
}
