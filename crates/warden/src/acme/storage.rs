//! Key material storage
//!
//! One flat directory holds every piece of cryptographic material. Files are
//! keyed by canonical hostname, so a hostname always maps to the same files.
//!
//! # Directory Structure
//!
//! ```text
//! key-dir/
//! ├── account.json            # ACME account credentials (production)
//! ├── account-staging.json    # ACME account credentials (staging)
//! ├── cozy.pem                # Tenant master private key
//! ├── alice.example.org.csr   # Signing request, reused on renewal
//! ├── alice.example.org.crt   # Issued certificate chain
//! └── acme-challenge/
//!     └── <token>             # In-flight HTTP-01 responses
//! ```
//!
//! The challenge directory may live elsewhere (wherever the web front end
//! serves `/.well-known/acme-challenge/` from).

use std::fs;
use std::path::{Path, PathBuf};

use rcgen::KeyPair;
use tracing::{debug, info, trace, warn};

use warden_common::Fqdn;

use super::error::StorageError;

/// Tenant master key file name
const MASTER_KEY_FILE: &str = "cozy.pem";

const CSR_EXTENSION: &str = "csr";
const CERT_EXTENSION: &str = "crt";

/// Key material store
///
/// Sole owner of the on-disk key, CSR and certificate files. There is no
/// locking: one writer at a time is assumed.
#[derive(Debug)]
pub struct KeyMaterialStore {
    /// Base key directory
    base_path: PathBuf,
    /// Challenge-serving directory
    challenge_path: PathBuf,
}

impl KeyMaterialStore {
    /// Open (and create if needed) a key directory
    ///
    /// The key directory is restricted to the owner (0700 on Unix); the
    /// challenge directory stays world-readable so the web front end can
    /// serve it.
    pub fn new(base_path: &Path, challenge_path: &Path) -> Result<Self, StorageError> {
        fs::create_dir_all(base_path)?;
        fs::create_dir_all(challenge_path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(base_path, fs::Permissions::from_mode(0o700))?;
            fs::set_permissions(challenge_path, fs::Permissions::from_mode(0o755))?;
        }

        info!(
            key_dir = %base_path.display(),
            challenge_dir = %challenge_path.display(),
            "Opened key material store"
        );

        Ok(Self {
            base_path: base_path.to_path_buf(),
            challenge_path: challenge_path.to_path_buf(),
        })
    }

    /// Open a key directory with the challenge directory inside it
    pub fn with_default_challenge_dir(base_path: &Path) -> Result<Self, StorageError> {
        Self::new(base_path, &base_path.join("acme-challenge"))
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn challenge_path(&self) -> &Path {
        &self.challenge_path
    }

    // =========================================================================
    // Account Operations
    // =========================================================================

    fn account_path(&self, staging: bool) -> PathBuf {
        if staging {
            self.base_path.join("account-staging.json")
        } else {
            self.base_path.join("account.json")
        }
    }

    /// Load serialized account credentials
    pub fn load_account_credentials(&self, staging: bool) -> Result<Option<String>, StorageError> {
        let path = self.account_path(staging);

        if !path.exists() {
            trace!(staging, "No stored ACME account found");
            return Ok(None);
        }

        let content = fs::read_to_string(&path)?;
        debug!(staging, "Loaded ACME account credentials");
        Ok(Some(content))
    }

    /// Persist serialized account credentials
    pub fn save_account_credentials(&self, staging: bool, json: &str) -> Result<(), StorageError> {
        let path = self.account_path(staging);
        write_private(&path, json.as_bytes())?;
        info!(staging, "Saved ACME account credentials");
        Ok(())
    }

    /// Full account reset: drop the account credentials and every issued
    /// certificate and CSR
    pub fn reset_account(&self, staging: bool) -> Result<usize, StorageError> {
        let path = self.account_path(staging);
        if path.exists() {
            fs::remove_file(&path)?;
        }

        let mut removed = 0;
        for fqdn in self.list_certificates()? {
            self.delete_certificate(&fqdn)?;
            removed += 1;
        }

        warn!(staging, certificates = removed, "Reset ACME account");
        Ok(removed)
    }

    // =========================================================================
    // Master Key
    // =========================================================================

    /// Load the tenant master key, generating it on first use
    pub fn master_key(&self) -> Result<KeyPair, StorageError> {
        let path = self.base_path.join(MASTER_KEY_FILE);

        if path.exists() {
            let pem = fs::read_to_string(&path)?;
            return KeyPair::from_pem(&pem).map_err(|e| StorageError::InvalidKey {
                path: path.display().to_string(),
                message: e.to_string(),
            });
        }

        let key = KeyPair::generate().map_err(|e| StorageError::KeyGeneration(e.to_string()))?;
        write_private(&path, key.serialize_pem().as_bytes())?;
        info!(path = %path.display(), "Generated tenant master key");
        Ok(key)
    }

    // =========================================================================
    // CSR and Certificate Operations
    // =========================================================================

    fn artifact_path(&self, fqdn: &Fqdn, extension: &str) -> PathBuf {
        self.base_path.join(format!("{}.{}", fqdn, extension))
    }

    /// Persist a PEM signing request
    pub fn save_csr(&self, fqdn: &Fqdn, pem: &str) -> Result<(), StorageError> {
        fs::write(self.artifact_path(fqdn, CSR_EXTENSION), pem)?;
        debug!(domain = %fqdn, "Saved CSR");
        Ok(())
    }

    /// Load the stored signing request
    pub fn load_csr(&self, fqdn: &Fqdn) -> Result<Option<String>, StorageError> {
        read_optional(&self.artifact_path(fqdn, CSR_EXTENSION))
    }

    /// Persist an issued certificate chain, replacing any previous one
    pub fn save_certificate(&self, fqdn: &Fqdn, chain_pem: &str) -> Result<(), StorageError> {
        fs::write(self.artifact_path(fqdn, CERT_EXTENSION), chain_pem)?;
        info!(domain = %fqdn, "Saved certificate to storage");
        Ok(())
    }

    /// Load the stored certificate chain
    pub fn load_certificate(&self, fqdn: &Fqdn) -> Result<Option<String>, StorageError> {
        read_optional(&self.artifact_path(fqdn, CERT_EXTENSION))
    }

    /// Hostnames with a stored certificate
    pub fn list_certificates(&self) -> Result<Vec<Fqdn>, StorageError> {
        let mut domains = Vec::new();

        for entry in fs::read_dir(&self.base_path)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CERT_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match Fqdn::parse(stem) {
                Ok(fqdn) => domains.push(fqdn),
                Err(e) => warn!(file = %path.display(), error = %e, "Ignoring certificate file"),
            }
        }

        domains.sort();
        Ok(domains)
    }

    /// Remove the certificate and CSR of a hostname
    pub fn delete_certificate(&self, fqdn: &Fqdn) -> Result<(), StorageError> {
        for extension in [CERT_EXTENSION, CSR_EXTENSION] {
            let path = self.artifact_path(fqdn, extension);
            if path.exists() {
                fs::remove_file(&path)?;
            }
        }
        info!(domain = %fqdn, "Deleted stored certificate");
        Ok(())
    }

    // =========================================================================
    // Challenge Files
    // =========================================================================

    fn token_path(&self, token: &str) -> Result<PathBuf, StorageError> {
        // Tokens are base64url; anything else could escape the directory
        let valid = !token.is_empty()
            && token
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StorageError::InvalidToken(token.to_string()));
        }
        Ok(self.challenge_path.join(token))
    }

    /// Write the response for an HTTP-01 token
    pub fn write_challenge(&self, token: &str, key_authorization: &str) -> Result<(), StorageError> {
        let path = self.token_path(token)?;
        fs::write(&path, key_authorization)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o644))?;
        }

        trace!(token = %token, "Wrote challenge response");
        Ok(())
    }

    /// Remove the response for an HTTP-01 token
    pub fn remove_challenge(&self, token: &str) -> Result<(), StorageError> {
        let path = self.token_path(token)?;
        if path.exists() {
            fs::remove_file(&path)?;
            trace!(token = %token, "Removed challenge response");
        }
        Ok(())
    }
}

fn read_optional(path: &Path) -> Result<Option<String>, StorageError> {
    if !path.exists() {
        return Ok(None);
    }
    Ok(Some(fs::read_to_string(path)?))
}

/// Write a file readable only by its owner
fn write_private(path: &Path, content: &[u8]) -> Result<(), StorageError> {
    fs::write(path, content)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}
