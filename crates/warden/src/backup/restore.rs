//! Archive restoration
//!
//! Restoring is destructive: the target tenant's databases, registry record
//! and file tree are replaced wholesale. The archive is read twice. The first
//! pass loads and validates every entry before anything is deleted; the
//! second extracts the file tree once the document store is done.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use flate2::read::GzDecoder;
use serde_json::Value;
use tar::Archive;
use tracing::{debug, info, warn};

use warden_common::{Fqdn, StoragePrefix};

use super::{is_safe_path, tenant_storage_dir, ArchiveError, DOCUMENTS_DIR, REGISTRY_ENTRY, STORAGE_DIR};
use crate::instances::{registry_record, resolve_prefix, PrefixSource};
use crate::store::{
    databases_with_prefix, document_id, document_rev, strip_revision, Document, DocumentStore,
    WriteFailure, GLOBAL_INSTANCES_DB,
};

/// A document the store refused during restore
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedDocument {
    pub database: String,
    pub failure: WriteFailure,
}

/// Outcome of a restore
#[derive(Debug, Clone)]
pub struct RestoreReport {
    pub fqdn: Fqdn,
    pub prefix: StoragePrefix,
    pub databases: usize,
    pub documents: usize,
    pub rejected: Vec<RejectedDocument>,
    pub files: usize,
}

/// Document entries of an archive
#[derive(Debug, Default)]
struct ArchiveContents {
    registry: Option<Document>,
    databases: BTreeMap<String, Vec<Document>>,
}

/// Replaces a tenant's state from an archive
pub struct RestoreEngine {
    store: Arc<dyn DocumentStore>,
    storage_root: PathBuf,
}

impl RestoreEngine {
    pub fn new(store: Arc<dyn DocumentStore>, storage_root: &Path) -> Self {
        Self {
            store,
            storage_root: storage_root.to_path_buf(),
        }
    }

    /// Restore `archive` as tenant `target`
    ///
    /// `target` may differ from the tenant the archive was taken from.
    pub async fn restore(&self, target: &Fqdn, archive: &Path) -> Result<RestoreReport, ArchiveError> {
        let contents = read_documents(archive)?;
        let archived_record = contents.registry.ok_or(ArchiveError::MissingRegistry)?;

        let prefix = self.target_prefix(target, &archived_record).await?;
        info!(
            domain = %target,
            prefix = %prefix,
            archive = %archive.display(),
            databases = contents.databases.len(),
            "Starting restore"
        );

        // Document databases
        let existing = databases_with_prefix(&self.store.list_databases().await?, &prefix);
        for db in &existing {
            self.store.delete_database(db).await?;
        }
        debug!(domain = %target, deleted = existing.len(), "Removed existing databases");

        let mut documents = 0;
        let mut rejected = Vec::new();
        for (suffix, docs) in &contents.databases {
            let db = prefix.database(suffix);
            self.store.create_database(&db).await?;

            let docs: Vec<Document> = docs.iter().cloned().map(strip_revision).collect();
            let failures = self.store.bulk_write(&db, &docs).await?;
            documents += docs.len().saturating_sub(failures.len());
            for failure in failures {
                warn!(
                    db = %db,
                    id = %failure.id,
                    error = %failure.error,
                    reason = %failure.reason,
                    "Document rejected during restore"
                );
                rejected.push(RejectedDocument {
                    database: db.clone(),
                    failure,
                });
            }
        }

        // Registry record
        self.replace_registry(target, &prefix, archived_record).await?;

        // File storage
        let files = self.restore_storage(target, archive)?;

        let report = RestoreReport {
            fqdn: target.clone(),
            prefix,
            databases: contents.databases.len(),
            documents,
            rejected,
            files,
        };
        info!(
            domain = %target,
            databases = report.databases,
            documents = report.documents,
            rejected = report.rejected.len(),
            files = report.files,
            "Restore finished"
        );
        Ok(report)
    }

    /// Existing record, else the archived one when restoring in place, else
    /// the old layout compatibility prefix
    async fn target_prefix(
        &self,
        target: &Fqdn,
        archived_record: &Document,
    ) -> Result<StoragePrefix, ArchiveError> {
        if let Some(existing) = self.existing_record(target).await? {
            return Ok(resolve_prefix(target, Some(&existing)).0);
        }

        let same_tenant = archived_record.get("domain").and_then(Value::as_str) == Some(target.as_str());
        let (prefix, source) = resolve_prefix(target, same_tenant.then_some(archived_record));
        if source == PrefixSource::Legacy {
            debug!(domain = %target, prefix = %prefix, "Restoring under derived prefix");
        }
        Ok(prefix)
    }

    async fn existing_record(&self, target: &Fqdn) -> Result<Option<Document>, ArchiveError> {
        match registry_record(self.store.as_ref(), target).await {
            Ok(record) => Ok(record),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn replace_registry(
        &self,
        target: &Fqdn,
        prefix: &StoragePrefix,
        archived_record: Document,
    ) -> Result<(), ArchiveError> {
        if let Some(existing) = self.existing_record(target).await? {
            if let (Some(id), Some(rev)) = (document_id(&existing), document_rev(&existing)) {
                self.store
                    .delete_document(GLOBAL_INSTANCES_DB, id, rev)
                    .await?;
            }
        }

        let renamed = archived_record.get("domain").and_then(Value::as_str) != Some(target.as_str());
        let mut record = strip_revision(archived_record);
        if renamed {
            // The source instance may still be registered under that id
            record.remove("_id");
        }
        record.insert("domain".to_string(), Value::String(target.to_string()));
        record.insert("prefix".to_string(), Value::String(prefix.to_string()));

        self.store.create_database(GLOBAL_INSTANCES_DB).await?;
        let failures = self.store.bulk_write(GLOBAL_INSTANCES_DB, &[record]).await?;
        if let Some(failure) = failures.into_iter().next() {
            return Err(ArchiveError::RegistryRejected {
                fqdn: target.to_string(),
                reason: format!("{}: {}", failure.error, failure.reason),
            });
        }

        debug!(domain = %target, renamed, "Registry record replaced");
        Ok(())
    }

    fn restore_storage(&self, target: &Fqdn, archive: &Path) -> Result<usize, ArchiveError> {
        let root = tenant_storage_dir(&self.storage_root, target);
        if root.exists() {
            std::fs::remove_dir_all(&root)?;
        }
        std::fs::create_dir_all(&root)?;

        let mut files = 0;
        let mut tar = Archive::new(GzDecoder::new(File::open(archive)?));
        for entry in tar.entries()? {
            let mut entry = entry?;
            let path = entry.path()?.into_owned();
            let Some(relative) = namespace_relative(&path, STORAGE_DIR) else {
                continue;
            };
            if relative.as_os_str().is_empty() {
                continue;
            }

            let entry_type = entry.header().entry_type();
            if !(entry_type.is_file() || entry_type.is_dir()) {
                continue;
            }

            let dest = root.join(&relative);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            entry.unpack(&dest)?;
            if entry_type.is_file() {
                files += 1;
            }
        }

        debug!(domain = %target, files, "File storage restored");
        Ok(files)
    }
}

/// Path below a top-level namespace, if the entry belongs to it
fn namespace_relative(path: &Path, namespace: &str) -> Option<PathBuf> {
    let mut components = path
        .components()
        .filter(|c| !matches!(c, Component::CurDir));
    match components.next() {
        Some(Component::Normal(first)) if first == namespace => Some(components.collect()),
        _ => None,
    }
}

/// First pass: validate every entry and load the documents
fn read_documents(archive: &Path) -> Result<ArchiveContents, ArchiveError> {
    let mut contents = ArchiveContents::default();
    let mut tar = Archive::new(GzDecoder::new(File::open(archive)?));

    for entry in tar.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let entry_name = path.to_string_lossy().into_owned();

        if !is_safe_path(&path) {
            return Err(ArchiveError::UnsafePath(entry_name));
        }

        // Links could point the extraction outside the tenant tree
        let entry_type = entry.header().entry_type();
        if !(entry_type.is_file() || entry_type.is_dir()) {
            return Err(ArchiveError::UnsafePath(entry_name));
        }

        let Some(relative) = namespace_relative(&path, DOCUMENTS_DIR) else {
            if namespace_relative(&path, STORAGE_DIR).is_none() {
                warn!(entry = %entry_name, "Ignoring unknown archive entry");
            }
            continue;
        };

        let stem = relative
            .to_str()
            .and_then(|name| name.strip_suffix(".json"))
            .ok_or_else(|| ArchiveError::MalformedEntry {
                entry: entry_name.clone(),
                message: "expected <name>.json".to_string(),
            })?;
        let name = urlencoding::decode(stem)
            .map_err(|e| ArchiveError::MalformedEntry {
                entry: entry_name.clone(),
                message: e.to_string(),
            })?
            .into_owned();

        let mut body = Vec::new();
        entry.read_to_end(&mut body)?;
        let docs: Vec<Document> = serde_json::from_slice(&body)?;

        if name == REGISTRY_ENTRY {
            contents.registry = docs.into_iter().next();
        } else {
            contents.databases.insert(name, docs);
        }
    }

    Ok(contents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::BackupArchiver;
    use crate::store::MemoryStore;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use serde_json::json;
    use tempfile::TempDir;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    struct Platform {
        store: Arc<MemoryStore>,
        storage: TempDir,
        backups: TempDir,
    }

    impl Platform {
        fn archiver(&self) -> BackupArchiver {
            BackupArchiver::new(self.store.clone(), self.storage.path(), self.backups.path())
        }

        fn engine(&self) -> RestoreEngine {
            RestoreEngine::new(self.store.clone(), self.storage.path())
        }

        fn tree(&self, fqdn: &str) -> PathBuf {
            self.storage.path().join(fqdn)
        }
    }

    /// alice.example.org, prefix cozy42, two databases and a small file tree
    async fn alice_platform() -> Platform {
        let store = Arc::new(MemoryStore::new());
        store.create_database(GLOBAL_INSTANCES_DB).await.unwrap();
        store
            .bulk_write(
                GLOBAL_INSTANCES_DB,
                &[doc(json!({
                    "_id": "inst-alice",
                    "domain": "alice.example.org",
                    "prefix": "cozy42",
                    "locale": "fr"
                }))],
            )
            .await
            .unwrap();

        store.create_database("cozy42/io-cozy-files").await.unwrap();
        store
            .bulk_write(
                "cozy42/io-cozy-files",
                &[
                    doc(json!({"_id": "f1", "name": "cat.jpg", "size": 4})),
                    doc(json!({"_id": "f2", "name": "notes.md", "size": 5})),
                ],
            )
            .await
            .unwrap();
        store.create_database("cozy42/io-cozy-apps").await.unwrap();
        store
            .bulk_write(
                "cozy42/io-cozy-apps",
                &[doc(json!({"_id": "io.cozy.apps/drive", "slug": "drive"}))],
            )
            .await
            .unwrap();

        let storage = TempDir::new().unwrap();
        let tree = storage.path().join("alice.example.org");
        std::fs::create_dir_all(tree.join("photos")).unwrap();
        std::fs::create_dir_all(tree.join("empty")).unwrap();
        std::fs::write(tree.join("photos/cat.jpg"), b"meow").unwrap();
        std::fs::write(tree.join("notes.md"), b"hello").unwrap();

        Platform {
            store,
            storage,
            backups: TempDir::new().unwrap(),
        }
    }

    fn alice() -> Fqdn {
        Fqdn::parse("alice.example.org").unwrap()
    }

    fn tree_listing(root: &Path) -> Vec<(PathBuf, Option<Vec<u8>>)> {
        crate::backup::walk_sorted(root)
            .unwrap()
            .into_iter()
            .map(|(rel, is_dir)| {
                let body = (!is_dir).then(|| std::fs::read(root.join(&rel)).unwrap());
                (rel, body)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_round_trip_in_place() {
        let platform = alice_platform().await;
        let files_before = platform.store.snapshot("cozy42/io-cozy-files").unwrap();
        let apps_before = platform.store.snapshot("cozy42/io-cozy-apps").unwrap();
        let tree_before = tree_listing(&platform.tree("alice.example.org"));

        let summary = platform.archiver().backup(&alice()).await.unwrap();

        // Drift after the backup: all of it must go
        platform.store.create_database("cozy42/io-cozy-stray").await.unwrap();
        platform
            .store
            .bulk_write(
                "cozy42/io-cozy-files",
                &[doc(json!({"_id": "f3", "name": "new.txt"}))],
            )
            .await
            .unwrap();
        std::fs::write(platform.tree("alice.example.org").join("stray.txt"), b"x").unwrap();

        let report = platform.engine().restore(&alice(), &summary.path).await.unwrap();

        assert_eq!(report.prefix.as_str(), "cozy42");
        assert_eq!(report.databases, 2);
        assert_eq!(report.documents, 3);
        assert!(report.rejected.is_empty());
        assert_eq!(report.files, 2);

        assert_eq!(platform.store.snapshot("cozy42/io-cozy-files").unwrap(), files_before);
        assert_eq!(platform.store.snapshot("cozy42/io-cozy-apps").unwrap(), apps_before);
        assert!(platform.store.snapshot("cozy42/io-cozy-stray").is_none());
        assert_eq!(tree_listing(&platform.tree("alice.example.org")), tree_before);

        let record = platform
            .store
            .find_one(GLOBAL_INSTANCES_DB, "domain", "alice.example.org")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record["_id"], "inst-alice");
        assert_eq!(record["prefix"], "cozy42");
        assert_eq!(record["locale"], "fr");
    }

    #[tokio::test]
    async fn test_restore_twice_is_idempotent() {
        let platform = alice_platform().await;
        let summary = platform.archiver().backup(&alice()).await.unwrap();

        platform.engine().restore(&alice(), &summary.path).await.unwrap();
        let first = platform.store.snapshot("cozy42/io-cozy-files").unwrap();
        let registry_first = platform.store.snapshot(GLOBAL_INSTANCES_DB).unwrap();

        platform.engine().restore(&alice(), &summary.path).await.unwrap();
        assert_eq!(platform.store.snapshot("cozy42/io-cozy-files").unwrap(), first);
        assert_eq!(platform.store.snapshot(GLOBAL_INSTANCES_DB).unwrap(), registry_first);
    }

    #[tokio::test]
    async fn test_restore_under_new_name() {
        let platform = alice_platform().await;
        let summary = platform.archiver().backup(&alice()).await.unwrap();
        let bob = Fqdn::parse("bob.example.org").unwrap();

        let report = platform.engine().restore(&bob, &summary.path).await.unwrap();

        assert_eq!(report.prefix.as_str(), "bob-example-org");
        assert_eq!(
            platform.store.snapshot("bob-example-org/io-cozy-files").unwrap(),
            platform.store.snapshot("cozy42/io-cozy-files").unwrap()
        );
        assert_eq!(
            tree_listing(&platform.tree("bob.example.org")),
            tree_listing(&platform.tree("alice.example.org"))
        );

        // Both instances stay registered
        let bob_record = platform
            .store
            .find_one(GLOBAL_INSTANCES_DB, "domain", "bob.example.org")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bob_record["prefix"], "bob-example-org");
        assert_ne!(bob_record["_id"], "inst-alice");
        assert!(platform
            .store
            .find_one(GLOBAL_INSTANCES_DB, "domain", "alice.example.org")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_rejected_documents_do_not_abort() {
        let platform = alice_platform().await;
        let summary = platform.archiver().backup(&alice()).await.unwrap();
        platform.store.reject_id("f2", "validation failed");

        let report = platform.engine().restore(&alice(), &summary.path).await.unwrap();

        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].database, "cozy42/io-cozy-files");
        assert_eq!(report.rejected[0].failure.id, "f2");
        assert_eq!(report.documents, 2);
        assert!(platform
            .store
            .snapshot("cozy42/io-cozy-files")
            .unwrap()
            .contains_key("f1"));
        assert_eq!(report.files, 2);
    }

    fn raw_archive(dir: &Path, entries: &[(&str, &str)]) -> PathBuf {
        let path = dir.join("crafted.tar.gz");
        let file = File::create(&path).unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        for (name, body) in entries {
            let mut header = tar::Header::new_old();
            header.as_old_mut().name[..name.len()].copy_from_slice(name.as_bytes());
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            header.set_entry_type(tar::EntryType::Regular);
            header.set_cksum();
            builder.append(&header, body.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
        path
    }

    #[tokio::test]
    async fn test_unsafe_entry_rejected_before_any_change() {
        let platform = alice_platform().await;
        let archive = raw_archive(
            platform.backups.path(),
            &[
                ("documents/_registry.json", r#"[{"domain":"alice.example.org"}]"#),
                ("storage/../../escape.txt", "pwned"),
            ],
        );

        let err = platform.engine().restore(&alice(), &archive).await.unwrap_err();
        assert!(matches!(err, ArchiveError::UnsafePath(_)));
        assert!(platform.store.snapshot("cozy42/io-cozy-files").is_some());
        assert!(platform.tree("alice.example.org").join("notes.md").exists());
    }

    #[tokio::test]
    async fn test_symlink_entry_rejected_before_any_change() {
        let platform = alice_platform().await;
        let outside = TempDir::new().unwrap();

        let path = platform.backups.path().join("linked.tar.gz");
        let file = File::create(&path).unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));

        let registry = br#"[{"domain":"alice.example.org"}]"#;
        let mut header = tar::Header::new_gnu();
        header.set_size(registry.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "documents/_registry.json", &registry[..])
            .unwrap();

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        header.set_mode(0o777);
        builder
            .append_link(&mut header, "storage/link", outside.path())
            .unwrap();

        let mut header = tar::Header::new_gnu();
        header.set_size(5);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "storage/link/evil.txt", &b"pwned"[..])
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let err = platform.engine().restore(&alice(), &path).await.unwrap_err();

        assert!(matches!(err, ArchiveError::UnsafePath(ref entry) if entry == "storage/link"));
        assert!(!outside.path().join("evil.txt").exists());
        assert!(platform.store.snapshot("cozy42/io-cozy-files").is_some());
        assert!(platform.tree("alice.example.org").join("notes.md").exists());
    }

    #[tokio::test]
    async fn test_archive_without_registry_is_rejected() {
        let platform = alice_platform().await;
        let archive = raw_archive(
            platform.backups.path(),
            &[("documents/io-cozy-files.json", "[]")],
        );

        let err = platform.engine().restore(&alice(), &archive).await.unwrap_err();
        assert!(matches!(err, ArchiveError::MissingRegistry));
        assert!(platform.store.snapshot("cozy42/io-cozy-files").is_some());
    }

    #[test]
    fn test_namespace_relative() {
        assert_eq!(
            namespace_relative(Path::new("storage/a/b"), STORAGE_DIR),
            Some(PathBuf::from("a/b"))
        );
        assert_eq!(
            namespace_relative(Path::new("./storage"), STORAGE_DIR),
            Some(PathBuf::new())
        );
        assert_eq!(namespace_relative(Path::new("documents/x.json"), STORAGE_DIR), None);
    }
}
