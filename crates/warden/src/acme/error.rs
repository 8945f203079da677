//! ACME and key-material error types

use thiserror::Error;

use warden_common::{Classify, ErrorKind, ExecError, IdError};

use crate::instances::DirectoryError;

/// Key-material storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid private key in {path}: {message}")]
    InvalidKey { path: String, message: String },

    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("invalid challenge token '{0}'")]
    InvalidToken(String),
}

impl Classify for StorageError {
    fn kind(&self) -> ErrorKind {
        match self {
            StorageError::InvalidToken(_) => ErrorKind::Consistency,
            _ => ErrorKind::Io,
        }
    }
}

/// Certificate issuance errors
#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("key storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("no ACME account exists and terms of service were not accepted (set acme.accept-terms)")]
    TermsNotAccepted,

    #[error("failed to load the existing ACME account: {0}")]
    AccountBootstrap(String),

    #[error("ACME {operation} failed: {message}")]
    Protocol {
        operation: &'static str,
        message: String,
    },

    #[error("no supported challenge for {domain} (offered: {offered})")]
    UnsupportedChallenge { domain: String, offered: String },

    #[error(
        "challenge self-check failed for {domain}: {url} returned {actual:?}, expected {expected:?}; \
         the web front end is not serving the challenge directory"
    )]
    ChallengeMismatch {
        domain: String,
        url: String,
        expected: String,
        actual: String,
    },

    #[error("challenge self-check request to {url} failed: {message}")]
    SelfCheckRequest { url: String, message: String },

    #[error("order became invalid: {0}")]
    OrderInvalid(String),

    #[error("order did not resolve after {0} polls")]
    PollTimeout(u32),

    #[error("CSR error: {0}")]
    Csr(String),

    #[error("certificate parse error: {0}")]
    Certificate(String),

    #[error("no stored CSR for {0}; issue a certificate first")]
    MissingCsr(String),

    #[error(transparent)]
    Hostname(#[from] IdError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error("reverse-proxy reload failed: {0}")]
    Reload(#[from] ExecError),
}

impl Classify for AcmeError {
    fn kind(&self) -> ErrorKind {
        match self {
            AcmeError::Storage(e) => e.kind(),
            AcmeError::TermsNotAccepted | AcmeError::Hostname(_) => ErrorKind::Configuration,
            AcmeError::AccountBootstrap(_)
            | AcmeError::Protocol { .. }
            | AcmeError::OrderInvalid(_)
            | AcmeError::PollTimeout(_) => ErrorKind::Protocol,
            AcmeError::UnsupportedChallenge { .. }
            | AcmeError::ChallengeMismatch { .. }
            | AcmeError::SelfCheckRequest { .. }
            | AcmeError::MissingCsr(_) => ErrorKind::Consistency,
            AcmeError::Csr(_) | AcmeError::Certificate(_) => ErrorKind::Consistency,
            AcmeError::Directory(e) => e.kind(),
            AcmeError::Reload(e) => e.kind(),
        }
    }
}

impl AcmeError {
    pub(crate) fn protocol(operation: &'static str, err: impl std::fmt::Display) -> Self {
        AcmeError::Protocol {
            operation,
            message: err.to_string(),
        }
    }
}
