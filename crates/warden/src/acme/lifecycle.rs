//! Certificate lifecycle
//!
//! Three verbs, kept apart on purpose:
//!
//! - `issue` builds a fresh signing request from the installed applications.
//! - `regenerate` re-issues only when the installed applications no longer
//!   match the names in the current certificate.
//! - `renew` re-submits the stored signing request unchanged once the
//!   certificate gets close to expiry.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use warden_common::Fqdn;

use super::client::CertificateAuthority;
use super::csr::{diff_names, subject_alternative_names, CertificateInfo, SigningRequest};
use super::error::AcmeError;
use super::storage::KeyMaterialStore;
use crate::batch::{run_batch, BatchReport};
use crate::hooks::ProxyReloader;
use crate::instances::InstanceDirectory;

/// Default renewal threshold in days
pub const DEFAULT_RENEW_BEFORE_DAYS: i64 = 30;

/// Result of [`CertificateManager::regenerate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegenerateOutcome {
    /// The certificate already covers exactly the installed applications
    Unchanged,
    /// There was no certificate yet
    Issued { names: BTreeSet<String> },
    /// The name set changed
    Reissued {
        added: Vec<String>,
        removed: Vec<String>,
    },
}

/// Result of [`CertificateManager::renew`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewOutcome {
    NoCertificate,
    StillValid { remaining_days: i64 },
    Renewed { not_after: DateTime<Utc> },
}

/// Stored certificate as reported to the operator
#[derive(Debug, Clone)]
pub struct CertificateStatus {
    pub fqdn: Fqdn,
    pub info: CertificateInfo,
    pub remaining_days: i64,
    pub due_for_renewal: bool,
}

/// Decides when to issue and persists the results
pub struct CertificateManager {
    keys: Arc<KeyMaterialStore>,
    authority: Arc<dyn CertificateAuthority>,
    directory: Arc<dyn InstanceDirectory>,
    reloader: Option<Arc<dyn ProxyReloader>>,
    renew_before: Duration,
}

impl CertificateManager {
    pub fn new(
        keys: Arc<KeyMaterialStore>,
        authority: Arc<dyn CertificateAuthority>,
        directory: Arc<dyn InstanceDirectory>,
    ) -> Self {
        Self {
            keys,
            authority,
            directory,
            reloader: None,
            renew_before: Duration::days(DEFAULT_RENEW_BEFORE_DAYS),
        }
    }

    /// Run a reverse-proxy reload after every stored certificate
    pub fn with_reloader(mut self, reloader: Arc<dyn ProxyReloader>) -> Self {
        self.reloader = Some(reloader);
        self
    }

    pub fn with_renew_before_days(mut self, days: u32) -> Self {
        self.renew_before = Duration::days(i64::from(days));
        self
    }

    /// Issue a certificate for `slug.domain` and its applications
    pub async fn issue(
        &self,
        slug: &str,
        domain: &str,
        applications: &BTreeSet<String>,
    ) -> Result<CertificateInfo, AcmeError> {
        let fqdn = Fqdn::from_parts(slug, domain)?;
        let names = subject_alternative_names(&fqdn, applications.iter().map(String::as_str));
        self.issue_names(&fqdn, &names).await
    }

    /// Issue a certificate for a registered instance
    pub async fn issue_for(&self, fqdn: &Fqdn) -> Result<CertificateInfo, AcmeError> {
        let instance = self.directory.resolve(fqdn).await?;
        self.issue(instance.slug(), instance.domain(), &instance.applications)
            .await
    }

    /// Re-issue if the installed applications changed
    pub async fn regenerate(&self, fqdn: &Fqdn) -> Result<RegenerateOutcome, AcmeError> {
        let instance = self.directory.resolve(fqdn).await?;
        let desired = subject_alternative_names(
            &instance.fqdn,
            instance.applications.iter().map(String::as_str),
        );

        let Some(pem) = self.keys.load_certificate(fqdn)? else {
            info!(domain = %fqdn, "No certificate yet, issuing");
            self.issue_names(fqdn, &desired).await?;
            return Ok(RegenerateOutcome::Issued { names: desired });
        };

        let current = CertificateInfo::from_pem(&pem)?;
        if current.names == desired {
            debug!(domain = %fqdn, "Certificate names are up to date");
            return Ok(RegenerateOutcome::Unchanged);
        }

        let (added, removed) = diff_names(&current.names, &desired);
        info!(
            domain = %fqdn,
            added = ?added,
            removed = ?removed,
            "Certificate names changed, re-issuing"
        );
        self.issue_names(fqdn, &desired).await?;
        Ok(RegenerateOutcome::Reissued { added, removed })
    }

    /// Renew if the certificate is close to expiry
    pub async fn renew(&self, fqdn: &Fqdn) -> Result<RenewOutcome, AcmeError> {
        self.renew_at(fqdn, Utc::now()).await
    }

    /// [`renew`](Self::renew) as of `now`
    pub async fn renew_at(
        &self,
        fqdn: &Fqdn,
        now: DateTime<Utc>,
    ) -> Result<RenewOutcome, AcmeError> {
        let Some(pem) = self.keys.load_certificate(fqdn)? else {
            debug!(domain = %fqdn, "No certificate to renew");
            return Ok(RenewOutcome::NoCertificate);
        };

        let current = CertificateInfo::from_pem(&pem)?;
        if !current.needs_renewal(now, self.renew_before) {
            let remaining_days = current.remaining(now).num_days();
            debug!(domain = %fqdn, remaining_days, "Certificate still valid");
            return Ok(RenewOutcome::StillValid { remaining_days });
        }

        let csr_pem = self
            .keys
            .load_csr(fqdn)?
            .ok_or_else(|| AcmeError::MissingCsr(fqdn.to_string()))?;
        let csr = SigningRequest::from_pem(&csr_pem)?;

        info!(
            domain = %fqdn,
            not_after = %current.not_after,
            "Renewing certificate with stored CSR"
        );
        let renewed = self.obtain_and_store(fqdn, &csr).await?;
        Ok(RenewOutcome::Renewed {
            not_after: renewed.not_after,
        })
    }

    /// Renew every stored certificate, one tenant at a time
    pub async fn renew_all(&self) -> Result<BatchReport<RenewOutcome>, AcmeError> {
        self.renew_all_at(Utc::now()).await
    }

    async fn renew_all_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<BatchReport<RenewOutcome>, AcmeError> {
        let fqdns = self.keys.list_certificates()?;
        info!(count = fqdns.len(), "Checking stored certificates for renewal");
        Ok(run_batch("renew", fqdns, |fqdn| async move { self.renew_at(&fqdn, now).await }).await)
    }

    /// Stored certificate details, `None` if there is none
    pub fn status(&self, fqdn: &Fqdn) -> Result<Option<CertificateStatus>, AcmeError> {
        self.status_at(fqdn, Utc::now())
    }

    fn status_at(
        &self,
        fqdn: &Fqdn,
        now: DateTime<Utc>,
    ) -> Result<Option<CertificateStatus>, AcmeError> {
        let Some(pem) = self.keys.load_certificate(fqdn)? else {
            return Ok(None);
        };
        let info = CertificateInfo::from_pem(&pem)?;
        Ok(Some(CertificateStatus {
            fqdn: fqdn.clone(),
            remaining_days: info.remaining(now).num_days(),
            due_for_renewal: info.needs_renewal(now, self.renew_before),
            info,
        }))
    }

    async fn issue_names(
        &self,
        fqdn: &Fqdn,
        names: &BTreeSet<String>,
    ) -> Result<CertificateInfo, AcmeError> {
        let key = self.keys.master_key()?;
        let csr = SigningRequest::generate(fqdn.as_str(), names, &key)?;
        self.keys.save_csr(fqdn, &csr.pem)?;
        debug!(domain = %fqdn, names = csr.names.len(), "Saved CSR");

        self.obtain_and_store(fqdn, &csr).await
    }

    async fn obtain_and_store(
        &self,
        fqdn: &Fqdn,
        csr: &SigningRequest,
    ) -> Result<CertificateInfo, AcmeError> {
        let chain = self.authority.obtain(csr).await?;
        let info = CertificateInfo::from_pem(&chain)?;
        self.keys.save_certificate(fqdn, &chain)?;

        info!(
            domain = %fqdn,
            names = info.names.len(),
            not_after = %info.not_after,
            "Certificate stored"
        );

        if let Some(ref reloader) = self.reloader {
            reloader.reload(fqdn).await?;
        }

        Ok(info)
    }
}
