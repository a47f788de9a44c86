//! Error types shared across rtlite crates.

use std::fmt;
use std::io;

/// Convenience result alias for rtlite operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A malformed or illegal wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Unknown topic byte.
    InvalidTopic(u8),
    /// Unknown action code.
    InvalidAction(String),
    /// Frame contained no fields.
    EmptyFrame,
    /// A required field was missing for the given action.
    MissingField(&'static str),
    /// Frame exceeded the configured maximum size.
    FrameTooLarge { size: usize, max: usize },
    /// A field was not valid UTF-8.
    InvalidUtf8,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::InvalidTopic(b) => write!(f, "invalid topic byte: 0x{:02x}", b),
            ProtocolError::InvalidAction(a) => write!(f, "invalid action code: {:?}", a),
            ProtocolError::EmptyFrame => write!(f, "empty frame"),
            ProtocolError::MissingField(name) => write!(f, "missing field: {}", name),
            ProtocolError::FrameTooLarge { size, max } => {
                write!(f, "frame of {} bytes exceeds maximum of {}", size, max)
            }
            ProtocolError::InvalidUtf8 => write!(f, "field is not valid UTF-8"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Top-level error type.
#[derive(Debug)]
pub enum Error {
    /// IO error from the socket layer.
    Io(io::Error),
    /// Wire protocol violation.
    Protocol(ProtocolError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Protocol(e) => write!(f, "protocol error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Protocol(e) => Some(e),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}
