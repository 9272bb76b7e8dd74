//! Image error types

use thiserror::Error;

/// The main error type for image operations
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error from the underlying byte source
    #[error("Byte source I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A caller supplied a value outside the accepted domain
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not allowed in the current image state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// The container bytes do not decode as a valid image
    #[error("Invalid image format: {0}")]
    InvalidFormat(String),

    /// A header checksum did not match its contents
    #[error("Checksum verification failed: {0}")]
    ChecksumVerification(String),

    /// A recognized but unsupported format feature
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// The parent supplied for a differencing image is not the one it references
    #[error("Parent identifier mismatch: expected {expected}, got {actual}")]
    ParentMismatch { expected: String, actual: String },
}

/// Coarse classification of [`Error`] values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller supplied a bad value; detected before any I/O
    InvalidArgument,
    /// Operation requested in a state that forbids it
    InvalidOperation,
    /// The container does not decode
    Format,
    /// The byte source failed
    Io,
}

/// Result type alias for image operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) => ErrorKind::Io,
            Error::InvalidArgument(_) | Error::ParentMismatch { .. } => ErrorKind::InvalidArgument,
            Error::InvalidOperation(_) => ErrorKind::InvalidOperation,
            Error::InvalidFormat(_) | Error::ChecksumVerification(_) | Error::Unsupported(_) => {
                ErrorKind::Format
            }
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Create an invalid operation error
    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        Error::InvalidOperation(msg.into())
    }

    /// Create an invalid format error
    pub fn invalid_format(msg: impl Into<String>) -> Self {
        Error::InvalidFormat(msg.into())
    }

    /// Create a checksum verification error
    pub fn checksum(msg: impl Into<String>) -> Self {
        Error::ChecksumVerification(msg.into())
    }

    /// Create an unsupported error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Error::Unsupported(msg.into())
    }

    /// Shorthand for the "image is not open" state error
    pub fn not_open() -> Self {
        Error::InvalidOperation("image is not open".to_string())
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        use std::io::ErrorKind as IoKind;

        match err {
            Error::Io(e) => e,
            err @ (Error::InvalidArgument(_) | Error::ParentMismatch { .. }) => {
                std::io::Error::new(IoKind::InvalidInput, err)
            }
            err @ (Error::InvalidFormat(_) | Error::ChecksumVerification(_)) => {
                std::io::Error::new(IoKind::InvalidData, err)
            }
            err => std::io::Error::other(err),
        }
    }
}
