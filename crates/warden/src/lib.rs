//! Warden: tenant lifecycle tooling for a multi-tenant personal-cloud platform
//!
//! Two concerns share this crate:
//!
//! - **Certificates**: one ACME certificate per tenant, covering the tenant
//!   hostname and one name per installed application, issued over HTTP-01
//!   with a local self-check before the authority is asked to validate.
//! - **Backup and restore**: every database of a tenant and its file tree
//!   packed into one archive, restorable in place or under a new hostname.
//!
//! Tenant identity and installed applications come from the document store
//! (see [`instances`]). Multi-tenant operations isolate failures per tenant
//! (see [`batch`]).

pub mod acme;
pub mod app;
pub mod backup;
pub mod batch;
pub mod hooks;
pub mod instances;
pub mod store;

// ============================================================================
// Re-exports
// ============================================================================

pub use acme::{AcmeError, CertificateManager, KeyMaterialStore};
pub use app::Warden;
pub use backup::{ArchiveError, BackupArchiver, RestoreEngine};
pub use batch::{run_batch, BatchReport, TenantFailure};
pub use instances::{Instance, InstanceDirectory, RegistryDirectory};
pub use store::{CouchStore, DocumentStore, MemoryStore, StoreError};
