//! Tenant backup and restore
//!
//! An archive is a gzip-compressed tar with two top-level namespaces:
//!
//! ```text
//! documents/_registry.json        registry record of the instance
//! documents/<suffix>.json         one JSON array per logical database
//! storage/<relative path>         the tenant's file tree
//! ```
//!
//! Database entries are named by suffix only (the part after
//! `<prefix>/`), so an archive can be restored under another prefix.

use std::io;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use warden_common::{Classify, ErrorKind, Fqdn};

use crate::store::StoreError;

mod archive;
mod restore;

pub use archive::{BackupArchiver, BackupSummary};
pub use restore::{RejectedDocument, RestoreEngine, RestoreReport};

/// Namespace of database entries
pub const DOCUMENTS_DIR: &str = "documents";

/// Namespace of file storage entries
pub const STORAGE_DIR: &str = "storage";

/// Entry name (without extension) of the registry record
pub const REGISTRY_ENTRY: &str = "_registry";

/// Archive and restore errors
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to move archive into place: {0}")]
    Persist(#[from] tempfile::PersistError),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("no registry record for {0}")]
    NotRegistered(String),

    #[error("archive has no registry entry")]
    MissingRegistry,

    #[error("unsafe archive entry path '{0}'")]
    UnsafePath(String),

    #[error("malformed archive entry '{entry}': {message}")]
    MalformedEntry { entry: String, message: String },

    #[error("registry record for {fqdn} was rejected: {reason}")]
    RegistryRejected { fqdn: String, reason: String },
}

impl Classify for ArchiveError {
    fn kind(&self) -> ErrorKind {
        match self {
            ArchiveError::Io(_) | ArchiveError::Persist(_) => ErrorKind::Io,
            ArchiveError::Store(e) => e.kind(),
            ArchiveError::RegistryRejected { .. } => ErrorKind::Store,
            ArchiveError::Json(_)
            | ArchiveError::NotRegistered(_)
            | ArchiveError::MissingRegistry
            | ArchiveError::UnsafePath(_)
            | ArchiveError::MalformedEntry { .. } => ErrorKind::Consistency,
        }
    }
}

/// File name of a tenant's archive
pub fn archive_file_name(fqdn: &Fqdn) -> String {
    format!("{}.tar.gz", fqdn)
}

/// Root of a tenant's file tree
pub fn tenant_storage_dir(storage_root: &Path, fqdn: &Fqdn) -> PathBuf {
    storage_root.join(fqdn.as_str())
}

/// Entry name of a database, from its suffix
pub fn database_entry_name(suffix: &str) -> String {
    format!("{}/{}.json", DOCUMENTS_DIR, urlencoding::encode(suffix))
}

/// Archive entries must stay inside the extraction root
pub(crate) fn is_safe_path(path: &Path) -> bool {
    !path.is_absolute()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Every directory and regular file under `root`, as paths relative to it,
/// in sorted depth-first order. Directories are flagged `true`.
pub(crate) fn walk_sorted(root: &Path) -> io::Result<Vec<(PathBuf, bool)>> {
    fn visit(root: &Path, dir: &Path, out: &mut Vec<(PathBuf, bool)>) -> io::Result<()> {
        let mut entries: Vec<_> = std::fs::read_dir(dir)?.collect::<Result<_, _>>()?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let path = entry.path();
            let file_type = entry.file_type()?;
            let relative = path
                .strip_prefix(root)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?
                .to_path_buf();

            if file_type.is_dir() {
                out.push((relative, true));
                visit(root, &path, out)?;
            } else if file_type.is_file() {
                out.push((relative, false));
            } else {
                debug!(path = %path.display(), "Skipping special file");
            }
        }
        Ok(())
    }

    let mut out = Vec::new();
    visit(root, root, &mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_safe_paths() {
        assert!(is_safe_path(Path::new("storage/a/b.txt")));
        assert!(is_safe_path(Path::new("./storage/a")));
        assert!(!is_safe_path(Path::new("/etc/passwd")));
        assert!(!is_safe_path(Path::new("storage/../../etc/passwd")));
    }

    #[test]
    fn test_database_entry_name() {
        assert_eq!(database_entry_name("io-cozy-files"), "documents/io-cozy-files.json");
        assert_eq!(
            database_entry_name("io-cozy-files/versions"),
            "documents/io-cozy-files%2Fversions.json"
        );
    }

    #[test]
    fn test_walk_is_sorted_and_relative() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("b/inner")).unwrap();
        std::fs::write(dir.path().join("b/inner/z.txt"), "z").unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        std::fs::create_dir(dir.path().join("empty")).unwrap();

        let walked = walk_sorted(dir.path()).unwrap();
        let names: Vec<(String, bool)> = walked
            .into_iter()
            .map(|(p, d)| (p.to_string_lossy().into_owned(), d))
            .collect();

        assert_eq!(
            names,
            vec![
                ("a.txt".to_string(), false),
                ("b".to_string(), true),
                ("b/inner".to_string(), true),
                ("b/inner/z.txt".to_string(), false),
                ("empty".to_string(), true),
            ]
        );
    }

    #[test]
    fn test_archive_file_name() {
        let fqdn = Fqdn::parse("Alice.Example.org").unwrap();
        assert_eq!(archive_file_name(&fqdn), "alice.example.org.tar.gz");
    }
}
