//! Error taxonomy shared by every Warden component.
//!
//! Each component keeps its own error enum; `ErrorKind` is the common
//! classification callers use to decide how a failure is reported.

use std::fmt;
use thiserror::Error;

/// Classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Invalid or missing configuration (no terms acceptance, bad path)
    Configuration,
    /// Local state contradicts what the operation requires: challenge
    /// self-check mismatch, missing registry record, unsupported challenge
    Consistency,
    /// The certificate authority answered with a failure
    Protocol,
    /// An external command exited unsuccessfully
    Subprocess,
    /// The document store failed or answered unexpectedly
    Store,
    /// Local filesystem failure
    Io,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Consistency => "consistency",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Subprocess => "subprocess",
            ErrorKind::Store => "store",
            ErrorKind::Io => "io",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Implemented by every component error so callers can classify failures
/// without matching on concrete enums.
pub trait Classify {
    fn kind(&self) -> ErrorKind;
}

/// Identifier parsing errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("invalid hostname '{value}': {reason}")]
    InvalidFqdn { value: String, reason: &'static str },
}

impl Classify for IdError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Configuration
    }
}
