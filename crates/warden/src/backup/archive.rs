//! Archive creation

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use tar::{Builder, Header};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use warden_common::Fqdn;

use super::{
    archive_file_name, database_entry_name, tenant_storage_dir, walk_sorted, ArchiveError,
    DOCUMENTS_DIR, REGISTRY_ENTRY, STORAGE_DIR,
};
use crate::instances::{registry_record, resolve_prefix};
use crate::store::{databases_with_prefix, DocumentStore};

/// What a finished backup contains
#[derive(Debug, Clone)]
pub struct BackupSummary {
    pub fqdn: Fqdn,
    pub path: PathBuf,
    pub databases: usize,
    pub documents: usize,
    pub files: usize,
}

/// Writes one archive per tenant
pub struct BackupArchiver {
    store: Arc<dyn DocumentStore>,
    storage_root: PathBuf,
    output_dir: PathBuf,
}

impl BackupArchiver {
    pub fn new(store: Arc<dyn DocumentStore>, storage_root: &Path, output_dir: &Path) -> Self {
        Self {
            store,
            storage_root: storage_root.to_path_buf(),
            output_dir: output_dir.to_path_buf(),
        }
    }

    /// Archive a tenant's databases and file tree
    ///
    /// The archive only appears under its final name once complete; on any
    /// error the partial file is discarded.
    pub async fn backup(&self, fqdn: &Fqdn) -> Result<BackupSummary, ArchiveError> {
        let record = registry_record(self.store.as_ref(), fqdn)
            .await?
            .ok_or_else(|| ArchiveError::NotRegistered(fqdn.to_string()))?;
        let (prefix, _) = resolve_prefix(fqdn, Some(&record));

        let all = self.store.list_databases().await?;
        let databases = databases_with_prefix(&all, &prefix);
        info!(
            domain = %fqdn,
            prefix = %prefix,
            databases = databases.len(),
            "Starting backup"
        );

        std::fs::create_dir_all(&self.output_dir)?;
        let mut temp = NamedTempFile::new_in(&self.output_dir)?;

        let mut documents = 0;
        let files;
        {
            let encoder = GzEncoder::new(temp.as_file_mut(), Compression::default());
            let mut builder = Builder::new(encoder);
            builder.follow_symlinks(false);

            append_json(
                &mut builder,
                &format!("{}/{}.json", DOCUMENTS_DIR, REGISTRY_ENTRY),
                &[&record],
            )?;

            for db in &databases {
                let Some(suffix) = prefix.suffix_of(db) else {
                    continue;
                };
                let docs = self.store.all_documents(db).await?;
                debug!(db = %db, documents = docs.len(), "Archiving database");
                documents += docs.len();
                append_json(&mut builder, &database_entry_name(suffix), &docs)?;
            }

            files = append_storage(&mut builder, &tenant_storage_dir(&self.storage_root, fqdn))?;

            builder.into_inner()?.finish()?.flush()?;
        }

        let path = self.output_dir.join(archive_file_name(fqdn));
        temp.persist(&path)?;

        info!(
            domain = %fqdn,
            path = %path.display(),
            databases = databases.len(),
            documents,
            files,
            "Backup written"
        );

        Ok(BackupSummary {
            fqdn: fqdn.clone(),
            path,
            databases: databases.len(),
            documents,
            files,
        })
    }
}

fn append_json<W: Write, T: Serialize>(
    builder: &mut Builder<W>,
    name: &str,
    value: &T,
) -> Result<(), ArchiveError> {
    let bytes = serde_json::to_vec(value)?;

    let mut header = Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
    header.set_cksum();

    builder.append_data(&mut header, name, bytes.as_slice())?;
    Ok(())
}

/// Append the tenant tree under `storage/`, returning the number of files
fn append_storage<W: Write>(builder: &mut Builder<W>, root: &Path) -> Result<usize, ArchiveError> {
    if !root.is_dir() {
        debug!(path = %root.display(), "No file storage for tenant");
        return Ok(0);
    }

    let mut files = 0;
    for (relative, is_dir) in walk_sorted(root)? {
        let name = Path::new(STORAGE_DIR).join(&relative);
        builder.append_path_with_name(root.join(&relative), &name)?;
        if !is_dir {
            files += 1;
        }
    }
    Ok(files)
}
