//! Instance resolution
//!
//! Certificate issuance needs to know which applications a tenant has
//! installed; backup and restore need its storage prefix. Both live in the
//! platform control plane: the registry record in [`GLOBAL_INSTANCES_DB`]
//! and the tenant's own apps database.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use warden_common::{Classify, ErrorKind, Fqdn, StoragePrefix};

use crate::store::{Document, DocumentStore, StoreError, GLOBAL_INSTANCES_DB};

/// Suffix of the database listing a tenant's installed applications
pub const APPS_DB_SUFFIX: &str = "io-cozy-apps";

/// Where an instance's storage prefix came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixSource {
    /// The registry record names it
    Recorded,
    /// Old layout compatibility: derived from the fqdn
    Legacy,
}

/// A resolved tenant instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub fqdn: Fqdn,
    pub prefix: StoragePrefix,
    pub prefix_source: PrefixSource,
    pub applications: BTreeSet<String>,
}

impl Instance {
    pub fn slug(&self) -> &str {
        self.fqdn.slug()
    }

    pub fn domain(&self) -> &str {
        self.fqdn.domain()
    }
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("no registry record for {0}")]
    NotRegistered(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Classify for DirectoryError {
    fn kind(&self) -> ErrorKind {
        match self {
            DirectoryError::NotRegistered(_) => ErrorKind::Consistency,
            DirectoryError::Store(e) => e.kind(),
        }
    }
}

/// Resolves instances from the control plane
#[async_trait]
pub trait InstanceDirectory: Send + Sync {
    async fn resolve(&self, fqdn: &Fqdn) -> Result<Instance, DirectoryError>;
}

/// Registry record of an instance, if registered
pub async fn registry_record(
    store: &dyn DocumentStore,
    fqdn: &Fqdn,
) -> Result<Option<Document>, StoreError> {
    store
        .find_one(GLOBAL_INSTANCES_DB, "domain", fqdn.as_str())
        .await
}

/// Prefix recorded in a registry document
pub fn recorded_prefix(record: &Document) -> Option<StoragePrefix> {
    record
        .get("prefix")
        .and_then(Value::as_str)
        .filter(|p| !p.is_empty())
        .map(StoragePrefix::new)
}

/// Prefix of an instance: the recorded one, else the legacy derivation
pub fn resolve_prefix(fqdn: &Fqdn, record: Option<&Document>) -> (StoragePrefix, PrefixSource) {
    match record.and_then(recorded_prefix) {
        Some(prefix) => (prefix, PrefixSource::Recorded),
        None => {
            debug!(domain = %fqdn, "No recorded prefix, using old layout compatibility prefix");
            (StoragePrefix::legacy_from_fqdn(fqdn), PrefixSource::Legacy)
        }
    }
}

/// [`InstanceDirectory`] backed by the document store
pub struct RegistryDirectory {
    store: Arc<dyn DocumentStore>,
}

impl RegistryDirectory {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    async fn applications(&self, prefix: &StoragePrefix) -> Result<BTreeSet<String>, StoreError> {
        let db = prefix.database(APPS_DB_SUFFIX);
        let docs = match self.store.all_documents(&db).await {
            Ok(docs) => docs,
            Err(e) if e.is_not_found() => {
                debug!(db = %db, "No apps database, instance has no applications");
                return Ok(BTreeSet::new());
            }
            Err(e) => return Err(e),
        };

        Ok(docs
            .iter()
            .filter(|doc| {
                !crate::store::document_id(doc).is_some_and(|id| id.starts_with("_design/"))
            })
            .filter_map(|doc| doc.get("slug").and_then(Value::as_str))
            .filter(|slug| !slug.is_empty())
            .map(str::to_string)
            .collect())
    }
}

#[async_trait]
impl InstanceDirectory for RegistryDirectory {
    async fn resolve(&self, fqdn: &Fqdn) -> Result<Instance, DirectoryError> {
        let record = registry_record(self.store.as_ref(), fqdn)
            .await?
            .ok_or_else(|| DirectoryError::NotRegistered(fqdn.to_string()))?;

        let (prefix, prefix_source) = resolve_prefix(fqdn, Some(&record));
        let applications = self.applications(&prefix).await?;

        debug!(
            domain = %fqdn,
            prefix = %prefix,
            apps = applications.len(),
            "Resolved instance"
        );

        Ok(Instance {
            fqdn: fqdn.clone(),
            prefix,
            prefix_source,
            applications,
        })
    }
}
