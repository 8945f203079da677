//! Document store gateway
//!
//! Tenant data lives in logical databases named `<prefix>/<suffix>`; the
//! platform-wide registry of instances lives in [`GLOBAL_INSTANCES_DB`].
//! [`DocumentStore`] is the narrow slice of the CouchDB HTTP API the
//! certificate and backup engines need.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use warden_common::{Classify, ErrorKind, StoragePrefix};

mod couch;
mod memory;

pub use couch::CouchStore;
pub use memory::MemoryStore;

/// Registry of every instance on the platform
pub const GLOBAL_INSTANCES_DB: &str = "global/instances";

/// A JSON document as stored, including `_id` / `_rev`
pub type Document = Map<String, Value>;

/// Document store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document store request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{method} {path} returned {status}: {body}")]
    Status {
        method: &'static str,
        path: String,
        status: u16,
        body: String,
    },

    #[error("malformed document store response: {0}")]
    Malformed(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::Status { status: 404, .. })
    }
}

impl Classify for StoreError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Store
    }
}

/// One document the store refused during a bulk write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteFailure {
    pub id: String,
    pub error: String,
    pub reason: String,
}

/// Bulk operations on logical databases
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn list_databases(&self) -> Result<Vec<String>, StoreError>;

    /// Create a database; an existing one is not an error
    async fn create_database(&self, db: &str) -> Result<(), StoreError>;

    /// Delete a database; a missing one is not an error
    async fn delete_database(&self, db: &str) -> Result<(), StoreError>;

    /// Every live document of a database, bodies included
    async fn all_documents(&self, db: &str) -> Result<Vec<Document>, StoreError>;

    /// First document whose `field` equals `value`
    async fn find_one(
        &self,
        db: &str,
        field: &str,
        value: &str,
    ) -> Result<Option<Document>, StoreError>;

    /// Write documents, returning those the store rejected
    async fn bulk_write(
        &self,
        db: &str,
        docs: &[Document],
    ) -> Result<Vec<WriteFailure>, StoreError>;

    async fn delete_document(&self, db: &str, id: &str, rev: &str) -> Result<(), StoreError>;
}

/// Names of the databases belonging to one tenant, sorted
pub fn databases_with_prefix(all: &[String], prefix: &StoragePrefix) -> Vec<String> {
    let mut dbs: Vec<String> = all
        .iter()
        .filter(|db| prefix.suffix_of(db).is_some())
        .cloned()
        .collect();
    dbs.sort();
    dbs
}

/// Drop the revision token so the target store assigns a fresh one
pub fn strip_revision(mut doc: Document) -> Document {
    doc.remove("_rev");
    doc
}

/// `_id` of a document, if it has one
pub fn document_id(doc: &Document) -> Option<&str> {
    doc.get("_id").and_then(Value::as_str)
}

/// `_rev` of a document, if it has one
pub fn document_rev(doc: &Document) -> Option<&str> {
    doc.get("_rev").and_then(Value::as_str)
}
