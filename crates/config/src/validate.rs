//! Cross-field configuration checks
//!
//! Field-level constraints live on the structs as `validator` attributes;
//! this module holds the rules that involve more than one field.

use tracing::warn;

use crate::{Config, ConfigError};

/// Validate rules that span several fields
pub fn validate_semantics(config: &Config) -> Result<(), ConfigError> {
    if let Some(ref argv) = config.hooks.reload_command {
        if argv.is_empty() || argv[0].trim().is_empty() {
            return Err(ConfigError::Invalid(
                "hooks.reload-command must name a program".to_string(),
            ));
        }
    }

    if config.acme.key_dir.as_os_str().is_empty() {
        return Err(ConfigError::Invalid("acme.key-dir must not be empty".to_string()));
    }

    if config.storage.root.as_os_str().is_empty() {
        return Err(ConfigError::Invalid("storage.root must not be empty".to_string()));
    }

    if config.backup.dir.starts_with(&config.storage.root) {
        return Err(ConfigError::Invalid(format!(
            "backup.dir ({}) must not live inside storage.root ({})",
            config.backup.dir.display(),
            config.storage.root.display()
        )));
    }

    if config.couchdb.username.is_some() != config.couchdb.password.is_some() {
        return Err(ConfigError::Invalid(
            "couchdb.username and couchdb.password must be set together".to_string(),
        ));
    }

    if config.acme.email.is_none() {
        warn!("No acme.email configured; the account will be registered without a contact");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_empty_reload_command_rejected() {
        let mut config = Config::default();
        config.hooks.reload_command = Some(vec![]);
        assert!(validate_semantics(&config).is_err());

        config.hooks.reload_command = Some(vec!["nginx".into(), "-s".into(), "reload".into()]);
        assert!(validate_semantics(&config).is_ok());
    }

    #[test]
    fn test_backup_dir_inside_storage_rejected() {
        let mut config = Config::default();
        config.storage.root = PathBuf::from("/srv/cozy");
        config.backup.dir = PathBuf::from("/srv/cozy/backups");
        let err = validate_semantics(&config).unwrap_err();
        assert!(err.to_string().contains("backup.dir"));
    }

    #[test]
    fn test_half_credentials_rejected() {
        let mut config = Config::default();
        config.couchdb.username = Some("admin".into());
        assert!(validate_semantics(&config).is_err());

        config.couchdb.password = Some("secret".into());
        assert!(validate_semantics(&config).is_ok());
    }
}
