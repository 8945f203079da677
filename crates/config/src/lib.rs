//! Warden configuration
//!
//! Configuration is a single TOML file. Every section and field has a
//! default, so an absent file (or an empty one) yields a usable
//! configuration for a local single-host deployment.
//!
//! ```toml
//! [acme]
//! email = "admin@example.org"
//! accept-terms = true
//! staging = false
//! key-dir = "/etc/warden/acme"
//!
//! [couchdb]
//! url = "http://127.0.0.1:5984"
//! username = "admin"
//! password = "secret"
//!
//! [storage]
//! root = "/var/lib/cozy"
//!
//! [backup]
//! dir = "/var/lib/warden/backups"
//!
//! [hooks]
//! reload-command = ["systemctl", "reload", "nginx"]
//!
//! [logging]
//! level = "info"
//! format = "json"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use validator::Validate;

use warden_common::{Classify, ErrorKind, LogFormat};

pub mod validate;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/warden/warden.toml";

/// Let's Encrypt production directory
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Let's Encrypt staging directory
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Environment variables that override file values, applied after loading
pub const ENV_OVERRIDES: &[&str] = &[
    "WARDEN_COUCHDB_URL",
    "WARDEN_COUCHDB_USERNAME",
    "WARDEN_COUCHDB_PASSWORD",
    "WARDEN_ACME_EMAIL",
    "WARDEN_STORAGE_ROOT",
    "WARDEN_BACKUP_DIR",
];

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Classify for ConfigError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Configuration
    }
}

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    #[validate(nested)]
    pub acme: AcmeConfig,

    #[validate(nested)]
    pub couchdb: CouchDbConfig,

    pub storage: StorageConfig,

    pub backup: BackupConfig,

    pub hooks: HooksConfig,

    #[validate(nested)]
    pub logging: LoggingConfig,
}

/// Certificate authority settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default, rename_all = "kebab-case")]
pub struct AcmeConfig {
    /// Use the staging directory instead of production
    pub staging: bool,

    /// Explicit directory URL, replacing the Let's Encrypt default
    #[validate(url)]
    pub directory_url: Option<String>,

    /// Contact address registered with the account
    #[validate(email)]
    pub email: Option<String>,

    /// Terms of service acceptance, required to register a new account
    pub accept_terms: bool,

    /// Key-material directory
    pub key_dir: PathBuf,

    /// Directory the web front end serves `/.well-known/acme-challenge/` from.
    /// Defaults to `<key-dir>/acme-challenge`.
    pub challenge_dir: Option<PathBuf>,

    /// Replaces `http://<domain>` when fetching a challenge for the self-check
    #[validate(url)]
    pub self_check_base: Option<String>,

    /// Renew when a certificate has this many days left or fewer
    #[validate(range(min = 1, max = 89))]
    pub renew_before_days: u32,

    /// Upper bound on order status polls before giving up
    #[validate(range(min = 1))]
    pub max_poll_attempts: u32,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            staging: false,
            directory_url: None,
            email: None,
            accept_terms: false,
            key_dir: PathBuf::from("/etc/warden/acme"),
            challenge_dir: None,
            self_check_base: None,
            renew_before_days: default_renew_before_days(),
            max_poll_attempts: default_max_poll_attempts(),
        }
    }
}

impl AcmeConfig {
    /// Directory URL for this configuration
    pub fn directory(&self) -> &str {
        match (&self.directory_url, self.staging) {
            (Some(url), _) => url,
            (None, true) => LETS_ENCRYPT_STAGING,
            (None, false) => LETS_ENCRYPT_PRODUCTION,
        }
    }

    /// Resolved challenge-serving directory
    pub fn challenge_dir(&self) -> PathBuf {
        self.challenge_dir
            .clone()
            .unwrap_or_else(|| self.key_dir.join("acme-challenge"))
    }
}

fn default_renew_before_days() -> u32 {
    30
}

fn default_max_poll_attempts() -> u32 {
    60
}

/// Document store connection
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default, rename_all = "kebab-case")]
pub struct CouchDbConfig {
    #[validate(url)]
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for CouchDbConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:5984".to_string(),
            username: None,
            password: None,
        }
    }
}

/// Tenant file storage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct StorageConfig {
    /// Root under which each tenant owns `<root>/<fqdn>/`
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/cozy"),
        }
    }
}

/// Backup output
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BackupConfig {
    pub dir: PathBuf,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/lib/warden/backups"),
        }
    }
}

/// External collaborators invoked after state changes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct HooksConfig {
    /// Reverse-proxy reload command, run after a certificate is written
    pub reload_command: Option<Vec<String>>,
}

/// Log output
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default, rename_all = "kebab-case")]
pub struct LoggingConfig {
    #[validate(length(min = 1))]
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl Config {
    /// Load a configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config = Self::from_toml(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load from an explicit path, or from the default location if a file
    /// exists there, or fall back to built-in defaults
    ///
    /// Values from [`ENV_OVERRIDES`] present in the process environment
    /// replace what the file says.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_PATH);
                if default_path.exists() {
                    Self::from_file(default_path)?
                } else {
                    debug!("No configuration file found, using defaults");
                    Self::default()
                }
            }
        };
        config.apply_env_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Apply overrides from a variable lookup
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for &name in ENV_OVERRIDES {
            let Some(value) = lookup(name) else {
                continue;
            };
            debug!(variable = name, "Applying environment override");
            match name {
                "WARDEN_COUCHDB_URL" => self.couchdb.url = value,
                "WARDEN_COUCHDB_USERNAME" => self.couchdb.username = Some(value),
                "WARDEN_COUCHDB_PASSWORD" => self.couchdb.password = Some(value),
                "WARDEN_ACME_EMAIL" => self.acme.email = Some(value),
                "WARDEN_STORAGE_ROOT" => self.storage.root = PathBuf::from(value),
                "WARDEN_BACKUP_DIR" => self.backup.dir = PathBuf::from(value),
                _ => {}
            }
        }
    }

    /// Validate field constraints and cross-field rules
    pub fn validate(&self) -> Result<(), ConfigError> {
        Validate::validate(self).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        validate::validate_semantics(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.acme.renew_before_days, 30);
        assert_eq!(config.acme.directory(), LETS_ENCRYPT_PRODUCTION);
        assert_eq!(
            config.acme.challenge_dir(),
            PathBuf::from("/etc/warden/acme/acme-challenge")
        );
        assert_eq!(config.couchdb.url, "http://127.0.0.1:5984");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let config = Config::from_toml(
            r#"
            [acme]
            email = "admin@example.org"
            accept-terms = true
            staging = true
            key-dir = "/srv/keys"
            challenge-dir = "/srv/www/challenges"

            [couchdb]
            url = "http://couch:5984"
            username = "admin"
            password = "secret"

            [hooks]
            reload-command = ["systemctl", "reload", "nginx"]

            [logging]
            level = "debug"
            format = "json"
            "#,
        )
        .unwrap();

        assert!(config.acme.accept_terms);
        assert_eq!(config.acme.directory(), LETS_ENCRYPT_STAGING);
        assert_eq!(
            config.acme.challenge_dir(),
            PathBuf::from("/srv/www/challenges")
        );
        assert_eq!(config.couchdb.username.as_deref(), Some("admin"));
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(
            config.hooks.reload_command,
            Some(vec![
                "systemctl".to_string(),
                "reload".to_string(),
                "nginx".to_string()
            ])
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_directory_override_wins() {
        let config = Config::from_toml(
            r#"
            [acme]
            staging = true
            directory-url = "https://acme.internal/directory"
            "#,
        )
        .unwrap();
        assert_eq!(config.acme.directory(), "https://acme.internal/directory");
    }

    #[test]
    fn test_invalid_url_rejected() {
        let config = Config::from_toml(
            r#"
            [couchdb]
            url = "not a url"
            "#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_invalid_email_rejected() {
        let config = Config::from_toml(
            r#"
            [acme]
            email = "nobody"
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_log_format_is_parse_error() {
        let result = Config::from_toml(
            r#"
            [logging]
            format = "xml"
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_env_overrides_replace_file_values() {
        let mut config = Config::from_toml(
            r#"
            [couchdb]
            url = "http://couch:5984"
            username = "admin"
            "#,
        )
        .unwrap();

        config.apply_env_overrides(|name| match name {
            "WARDEN_COUCHDB_URL" => Some("http://other:5984".to_string()),
            "WARDEN_COUCHDB_PASSWORD" => Some("hunter2".to_string()),
            _ => None,
        });

        assert_eq!(config.couchdb.url, "http://other:5984");
        assert_eq!(config.couchdb.username.as_deref(), Some("admin"));
        assert_eq!(config.couchdb.password.as_deref(), Some("hunter2"));
        assert_eq!(config.storage.root, PathBuf::from("/var/lib/cozy"));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("warden.toml");
        std::fs::write(&path, "[storage]\nroot = \"/data\"\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.storage.root, PathBuf::from("/data"));

        let missing = Config::from_file(dir.path().join("missing.toml"));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
    }
}
