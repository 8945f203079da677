//! In-memory document store
//!
//! Keeps CouchDB's observable behaviour where the engines depend on it:
//! revisions are assigned by the store, writing a document that carries a
//! stale or missing revision over an existing one is a conflict, and deleted
//! databases take their documents with them.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use super::{document_id, document_rev, Document, DocumentStore, StoreError, WriteFailure};

/// Document store held in process memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    databases: DashMap<String, BTreeMap<String, Document>>,
    /// Document ids every bulk write refuses
    rejected: DashMap<String, String>,
    sequence: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every future write of `id` fail with `reason`
    pub fn reject_id(&self, id: &str, reason: &str) {
        self.rejected.insert(id.to_string(), reason.to_string());
    }

    /// Documents of a database without revisions, keyed by id
    pub fn snapshot(&self, db: &str) -> Option<BTreeMap<String, Document>> {
        self.databases.get(db).map(|docs| {
            docs.iter()
                .map(|(id, doc)| {
                    let mut doc = doc.clone();
                    doc.remove("_rev");
                    (id.clone(), doc)
                })
                .collect()
        })
    }

    fn next_revision(&self, previous: Option<&str>) -> String {
        let generation = previous
            .and_then(|rev| rev.split('-').next())
            .and_then(|n| n.parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("{}-{:016x}", generation, seq)
    }

    fn missing(method: &'static str, db: &str) -> StoreError {
        StoreError::Status {
            method,
            path: format!("/{}", db),
            status: 404,
            body: r#"{"error":"not_found","reason":"Database does not exist."}"#.to_string(),
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn list_databases(&self) -> Result<Vec<String>, StoreError> {
        let mut names: Vec<String> = self.databases.iter().map(|e| e.key().clone()).collect();
        names.sort();
        Ok(names)
    }

    async fn create_database(&self, db: &str) -> Result<(), StoreError> {
        self.databases.entry(db.to_string()).or_default();
        Ok(())
    }

    async fn delete_database(&self, db: &str) -> Result<(), StoreError> {
        self.databases.remove(db);
        Ok(())
    }

    async fn all_documents(&self, db: &str) -> Result<Vec<Document>, StoreError> {
        let docs = self
            .databases
            .get(db)
            .ok_or_else(|| Self::missing("GET", db))?;
        Ok(docs.values().cloned().collect())
    }

    async fn find_one(
        &self,
        db: &str,
        field: &str,
        value: &str,
    ) -> Result<Option<Document>, StoreError> {
        let docs = self
            .databases
            .get(db)
            .ok_or_else(|| Self::missing("POST", db))?;
        Ok(docs
            .values()
            .find(|doc| doc.get(field).and_then(Value::as_str) == Some(value))
            .cloned())
    }

    async fn bulk_write(
        &self,
        db: &str,
        docs: &[Document],
    ) -> Result<Vec<WriteFailure>, StoreError> {
        let mut stored = self
            .databases
            .get_mut(db)
            .ok_or_else(|| Self::missing("POST", db))?;

        let mut failures = Vec::new();
        let mut seen = HashSet::new();
        for doc in docs {
            let id = match document_id(doc) {
                Some(id) => id.to_string(),
                None => format!("{:032x}", self.sequence.fetch_add(1, Ordering::Relaxed)),
            };

            if let Some(reason) = self.rejected.get(&id) {
                failures.push(WriteFailure {
                    id,
                    error: "forbidden".to_string(),
                    reason: reason.clone(),
                });
                continue;
            }

            let current_rev = stored.get(&id).and_then(document_rev).map(str::to_string);
            if !seen.insert(id.clone()) || current_rev.as_deref() != document_rev(doc) {
                failures.push(WriteFailure {
                    id,
                    error: "conflict".to_string(),
                    reason: "Document update conflict.".to_string(),
                });
                continue;
            }

            let mut doc = doc.clone();
            doc.insert("_id".to_string(), Value::String(id.clone()));
            doc.insert(
                "_rev".to_string(),
                Value::String(self.next_revision(current_rev.as_deref())),
            );
            stored.insert(id, doc);
        }

        Ok(failures)
    }

    async fn delete_document(&self, db: &str, id: &str, rev: &str) -> Result<(), StoreError> {
        let mut stored = self
            .databases
            .get_mut(db)
            .ok_or_else(|| Self::missing("DELETE", db))?;

        match stored.get(id).and_then(document_rev) {
            Some(current) if current == rev => {
                stored.remove(id);
                Ok(())
            }
            Some(_) => Err(StoreError::Status {
                method: "DELETE",
                path: format!("/{}/{}", db, id),
                status: 409,
                body: r#"{"error":"conflict"}"#.to_string(),
            }),
            None => Err(StoreError::Status {
                method: "DELETE",
                path: format!("/{}/{}", db, id),
                status: 404,
                body: r#"{"error":"not_found"}"#.to_string(),
            }),
        }
    }
}
