//! Component wiring for one invocation
//!
//! Builds every engine from a validated [`Config`]. One document store
//! client is shared by everything built from the same [`Warden`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::debug;
use url::Url;

use warden_config::{AcmeConfig, Config};

use crate::acme::{
    AccountSettings, AcmeClient, AcmeError, CertificateAuthority, CertificateManager,
    ChallengePublisher, InstantAcmeAccount, KeyMaterialStore, SigningRequest, StorageError,
};
use crate::backup::{BackupArchiver, RestoreEngine};
use crate::hooks::CommandReloader;
use crate::instances::RegistryDirectory;
use crate::store::{CouchStore, DocumentStore, StoreError};

/// Delay between order status polls
const ORDER_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Engines built from one configuration
pub struct Warden {
    config: Config,
    store: Arc<dyn DocumentStore>,
}

impl Warden {
    pub fn new(config: Config) -> Result<Self, StoreError> {
        let store = CouchStore::new(
            &config.couchdb.url,
            config.couchdb.username.as_deref(),
            config.couchdb.password.as_deref(),
        )?;
        Ok(Self::with_store(config, Arc::new(store)))
    }

    /// Use an already constructed document store
    pub fn with_store(config: Config, store: Arc<dyn DocumentStore>) -> Self {
        Self { config, store }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn key_store(&self) -> Result<Arc<KeyMaterialStore>, StorageError> {
        Ok(Arc::new(KeyMaterialStore::new(
            &self.config.acme.key_dir,
            &self.config.acme.challenge_dir(),
        )?))
    }

    /// Lifecycle manager; the ACME account is only contacted on first issuance
    pub fn certificate_manager(&self) -> Result<CertificateManager, AcmeError> {
        let keys = self.key_store()?;
        let authority = Arc::new(LazyAuthority {
            keys: keys.clone(),
            acme: self.config.acme.clone(),
            client: OnceCell::new(),
        });
        let directory = Arc::new(RegistryDirectory::new(self.store.clone()));

        let mut manager = CertificateManager::new(keys, authority, directory)
            .with_renew_before_days(self.config.acme.renew_before_days);
        if let Some(ref argv) = self.config.hooks.reload_command {
            manager = manager.with_reloader(Arc::new(CommandReloader::new(argv.clone())));
        }
        Ok(manager)
    }

    /// Remove the account credentials and every certificate for the
    /// configured environment
    pub fn reset_account(&self) -> Result<usize, StorageError> {
        self.key_store()?.reset_account(self.config.acme.staging)
    }

    pub fn archiver(&self) -> BackupArchiver {
        BackupArchiver::new(
            self.store.clone(),
            &self.config.storage.root,
            &self.config.backup.dir,
        )
    }

    pub fn restore_engine(&self) -> RestoreEngine {
        RestoreEngine::new(self.store.clone(), &self.config.storage.root)
    }
}

/// Bootstraps the ACME account the first time a certificate is requested
struct LazyAuthority {
    keys: Arc<KeyMaterialStore>,
    acme: AcmeConfig,
    client: OnceCell<AcmeClient>,
}

impl LazyAuthority {
    async fn connect(&self) -> Result<AcmeClient, AcmeError> {
        let settings = AccountSettings {
            directory_url: self.acme.directory(),
            staging: self.acme.staging,
            email: self.acme.email.as_deref(),
            accept_terms: self.acme.accept_terms,
        };
        let account = InstantAcmeAccount::bootstrap(&self.keys, &settings).await?;

        let self_check_base = self
            .acme
            .self_check_base
            .as_deref()
            .map(|base| {
                Url::parse(base).map_err(|e| AcmeError::SelfCheckRequest {
                    url: base.to_string(),
                    message: e.to_string(),
                })
            })
            .transpose()?;

        debug!(directory = %settings.directory_url, "ACME client connected");
        Ok(
            AcmeClient::new(
                Arc::new(account),
                ChallengePublisher::new(self.keys.clone(), self_check_base),
            )
            .with_polling(ORDER_POLL_INTERVAL, self.acme.max_poll_attempts),
        )
    }
}

#[async_trait]
impl CertificateAuthority for LazyAuthority {
    async fn obtain(&self, csr: &SigningRequest) -> Result<String, AcmeError> {
        let client = self.client.get_or_try_init(|| self.connect()).await?;
        client.obtain(csr).await
    }
}
