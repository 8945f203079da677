//! Signing requests and issued certificates
//!
//! A tenant certificate covers the tenant hostname (the common name) plus
//! one hostname per installed application. The SAN set of an existing
//! certificate is always read back out of the certificate itself rather
//! than recomputed.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::FromDer;

use warden_common::Fqdn;

use super::error::AcmeError;

/// SAN set of a tenant certificate: the tenant hostname plus
/// `<app>.<fqdn>` for every installed application
pub fn subject_alternative_names<'a, I>(fqdn: &Fqdn, applications: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut names: BTreeSet<String> = applications
        .into_iter()
        .map(str::trim)
        .filter(|app| !app.is_empty())
        .map(|app| fqdn.application_host(app))
        .collect();
    names.insert(fqdn.to_string());
    names
}

/// A PEM signing request together with the names it asks for
#[derive(Debug, Clone)]
pub struct SigningRequest {
    pub common_name: String,
    /// Always contains `common_name`
    pub names: BTreeSet<String>,
    pub pem: String,
    der: Vec<u8>,
}

impl SigningRequest {
    /// Build and sign a request with the given key
    pub fn generate(
        common_name: &str,
        names: &BTreeSet<String>,
        key: &KeyPair,
    ) -> Result<Self, AcmeError> {
        let mut names = names.clone();
        names.insert(common_name.to_string());

        // Common name first, the authority lists names in request order
        let ordered: Vec<String> = std::iter::once(common_name.to_string())
            .chain(names.iter().filter(|n| *n != common_name).cloned())
            .collect();

        let mut params =
            CertificateParams::new(ordered).map_err(|e| AcmeError::Csr(e.to_string()))?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;

        let csr = params
            .serialize_request(key)
            .map_err(|e| AcmeError::Csr(e.to_string()))?;
        let pem = csr.pem().map_err(|e| AcmeError::Csr(e.to_string()))?;

        Ok(Self {
            common_name: common_name.to_string(),
            names,
            pem,
            der: csr.der().to_vec(),
        })
    }

    /// Parse a stored PEM request
    pub fn from_pem(pem_text: &str) -> Result<Self, AcmeError> {
        let block = pem::parse(pem_text).map_err(|e| AcmeError::Csr(e.to_string()))?;
        let der = block.contents().to_vec();

        let (common_name, mut names) = {
            let (_, csr) = X509CertificationRequest::from_der(&der)
                .map_err(|e| AcmeError::Csr(e.to_string()))?;

            let common_name = csr
                .certification_request_info
                .subject
                .iter_common_name()
                .next()
                .and_then(|cn| cn.as_str().ok())
                .map(str::to_ascii_lowercase)
                .ok_or_else(|| AcmeError::Csr("request has no common name".to_string()))?;

            let mut names = BTreeSet::new();
            if let Some(extensions) = csr.requested_extensions() {
                for extension in extensions {
                    if let ParsedExtension::SubjectAlternativeName(san) = extension {
                        names.extend(dns_names(&san.general_names));
                    }
                }
            }
            (common_name, names)
        };
        names.insert(common_name.clone());

        Ok(Self {
            common_name,
            names,
            pem: pem_text.to_string(),
            der,
        })
    }

    /// DER encoding submitted at finalization
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Names in submission order, common name first
    pub fn ordered_names(&self) -> Vec<String> {
        std::iter::once(self.common_name.clone())
            .chain(self.names.iter().filter(|n| **n != self.common_name).cloned())
            .collect()
    }
}

fn dns_names(general_names: &[GeneralName<'_>]) -> Vec<String> {
    general_names
        .iter()
        .filter_map(|name| match name {
            GeneralName::DNSName(dns) => Some(dns.to_ascii_lowercase()),
            _ => None,
        })
        .collect()
}

/// What an issued certificate says about itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    pub common_name: Option<String>,
    pub names: BTreeSet<String>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl CertificateInfo {
    /// Parse the leaf (first block) of a PEM chain
    pub fn from_pem(chain_pem: &str) -> Result<Self, AcmeError> {
        let block = pem::parse(chain_pem).map_err(|e| AcmeError::Certificate(e.to_string()))?;
        let (_, cert) = x509_parser::parse_x509_certificate(block.contents())
            .map_err(|e| AcmeError::Certificate(e.to_string()))?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_ascii_lowercase);

        let mut names: BTreeSet<String> = match cert.subject_alternative_name() {
            Ok(Some(san)) => dns_names(&san.value.general_names).into_iter().collect(),
            Ok(None) => BTreeSet::new(),
            Err(e) => return Err(AcmeError::Certificate(e.to_string())),
        };
        if let Some(ref cn) = common_name {
            names.insert(cn.clone());
        }

        let validity = cert.validity();
        let not_before = DateTime::from_timestamp(validity.not_before.timestamp(), 0)
            .ok_or_else(|| AcmeError::Certificate("invalid notBefore".to_string()))?;
        let not_after = DateTime::from_timestamp(validity.not_after.timestamp(), 0)
            .ok_or_else(|| AcmeError::Certificate("invalid notAfter".to_string()))?;

        Ok(Self {
            common_name,
            names,
            not_before,
            not_after,
        })
    }

    /// Remaining validity at `now` (negative once expired)
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        self.not_after - now
    }

    /// True once the remaining validity is at or below the threshold
    pub fn needs_renewal(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.remaining(now) <= threshold
    }
}

/// Difference between two SAN sets as (added, removed)
pub fn diff_names(current: &BTreeSet<String>, desired: &BTreeSet<String>) -> (Vec<String>, Vec<String>) {
    let added = desired.difference(current).cloned().collect();
    let removed = current.difference(desired).cloned().collect();
    (added, removed)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Self-signed stand-in for an authority-issued certificate
    pub(crate) fn self_signed(common_name: &str, names: &BTreeSet<String>) -> String {
        let mut params = CertificateParams::new(names.iter().cloned().collect::<Vec<_>>()).unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;
        let key = KeyPair::generate().unwrap();
        params.self_signed(&key).unwrap().pem()
    }

    fn fqdn(s: &str) -> Fqdn {
        Fqdn::parse(s).unwrap()
    }

    #[test]
    fn test_san_set_for_installed_apps() {
        let names = subject_alternative_names(&fqdn("alice.example.org"), ["settings", "drive"]);
        let expected: BTreeSet<String> = [
            "alice.example.org",
            "settings.alice.example.org",
            "drive.alice.example.org",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        assert_eq!(names, expected);
    }

    #[test]
    fn test_san_set_without_apps_is_cn_only() {
        let names = subject_alternative_names(&fqdn("bob.example.org"), std::iter::empty());
        assert_eq!(names.len(), 1);
        assert!(names.contains("bob.example.org"));
    }

    #[test]
    fn test_csr_round_trips_names() {
        let key = KeyPair::generate().unwrap();
        let names = subject_alternative_names(&fqdn("alice.example.org"), ["drive"]);
        let csr = SigningRequest::generate("alice.example.org", &names, &key).unwrap();

        assert!(csr.pem.contains("BEGIN CERTIFICATE REQUEST"));

        let parsed = SigningRequest::from_pem(&csr.pem).unwrap();
        assert_eq!(parsed.common_name, "alice.example.org");
        assert_eq!(parsed.names, names);
        assert_eq!(parsed.der(), csr.der());
        assert_eq!(parsed.ordered_names()[0], "alice.example.org");
    }

    #[test]
    fn test_csr_always_contains_common_name() {
        let key = KeyPair::generate().unwrap();
        let names: BTreeSet<String> = ["drive.alice.example.org".to_string()].into();
        let csr = SigningRequest::generate("alice.example.org", &names, &key).unwrap();
        assert!(csr.names.contains("alice.example.org"));
    }

    #[test]
    fn test_certificate_info_from_pem() {
        let names = subject_alternative_names(&fqdn("alice.example.org"), ["settings"]);
        let pem = self_signed("alice.example.org", &names);

        let info = CertificateInfo::from_pem(&pem).unwrap();
        assert_eq!(info.common_name.as_deref(), Some("alice.example.org"));
        assert_eq!(info.names, names);
        assert!(info.not_after > info.not_before);
    }

    #[test]
    fn test_certificate_info_rejects_garbage() {
        assert!(CertificateInfo::from_pem("not a certificate").is_err());
    }

    #[test]
    fn test_renewal_threshold_is_inclusive() {
        let now = Utc::now();
        let info = CertificateInfo {
            common_name: None,
            names: BTreeSet::new(),
            not_before: now - Duration::days(60),
            not_after: now + Duration::days(30),
        };
        assert!(info.needs_renewal(now, Duration::days(30)));
        assert!(!info.needs_renewal(now - Duration::seconds(1), Duration::days(30)));
    }

    #[test]
    fn test_diff_names() {
        let current: BTreeSet<String> = ["a", "b"].into_iter().map(String::from).collect();
        let desired: BTreeSet<String> = ["b", "c"].into_iter().map(String::from).collect();
        assert_eq!(
            diff_names(&current, &desired),
            (vec!["c".to_string()], vec!["a".to_string()])
        );
    }

    proptest! {
        #[test]
        fn san_set_contains_cn_and_one_name_per_app(
            apps in proptest::collection::btree_set("[a-z][a-z0-9]{0,10}", 0..8)
        ) {
            let fqdn = fqdn("alice.example.org");
            let names = subject_alternative_names(&fqdn, apps.iter().map(String::as_str));

            prop_assert!(names.contains("alice.example.org"));
            prop_assert_eq!(names.len(), apps.len() + 1);
            for app in &apps {
                let host = format!("{}.alice.example.org", app);
                prop_assert!(names.contains(&host));
            }
        }
    }
}
