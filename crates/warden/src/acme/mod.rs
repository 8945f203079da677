//! ACME certificate management for tenant instances
//!
//! Every tenant gets one certificate whose common name is the tenant
//! hostname and whose alternative names cover each installed application.
//!
//! # Architecture
//!
//! - [`KeyMaterialStore`] - Account credentials, master key, CSRs and
//!   certificates on disk
//! - [`ChallengePublisher`] - Writes HTTP-01 responses and checks they are served
//! - [`AcmeClient`] - Drives one order through the ACME state machine
//! - [`CertificateManager`] - Decides when to issue, regenerate or renew
//!
//! # Challenge Flow
//!
//! 1. [`CertificateManager`] builds a CSR signed with the master key
//! 2. [`AcmeClient`] opens an order; the authority returns one authorization per name
//! 3. [`ChallengePublisher`] writes `acme-challenge/<token>` and fetches it back
//!    through the web front end
//! 4. Only when the fetched body matches is the authority told to validate
//! 5. Once the order is ready, [`AcmeClient`] finalizes it and downloads the chain
//! 6. [`KeyMaterialStore`] persists the chain and the reverse proxy is reloaded

mod challenge;
mod client;
mod csr;
mod error;
mod lifecycle;
mod protocol;
mod storage;

pub use challenge::{ChallengePublisher, ACME_CHALLENGE_PREFIX};
pub use client::{
    AcmeAccount, AcmeClient, AcmeOrder, AuthorizationStatus, CertificateAuthority,
    ChallengeKind, ChallengeOffer, OrderPhase, OrderStatus, PendingAuthorization,
};
pub use csr::{diff_names, subject_alternative_names, CertificateInfo, SigningRequest};
pub use error::{AcmeError, StorageError};
pub use lifecycle::{
    CertificateManager, CertificateStatus, RegenerateOutcome, RenewOutcome,
    DEFAULT_RENEW_BEFORE_DAYS,
};
pub use protocol::{AccountSettings, InstantAcmeAccount};
pub use storage::KeyMaterialStore;
