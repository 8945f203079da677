//! Type-safe identifier newtypes for Warden.
//!
//! These types keep tenant hostnames and storage prefixes apart at compile
//! time, so a prefix is never passed where a hostname is expected (they look
//! alike: `alice.example.org` vs `alice-example-org`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::IdError;

/// Canonical fully-qualified domain name of a tenant instance.
///
/// Canonical form is lower-case without a trailing dot. Every on-disk
/// artifact keyed by hostname uses this form, so `Alice.Example.org.` and
/// `alice.example.org` resolve to the same files.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fqdn(String);

impl Fqdn {
    /// Parse and canonicalise a hostname
    pub fn parse(raw: &str) -> Result<Self, IdError> {
        let name = raw.trim().trim_end_matches('.').to_ascii_lowercase();

        if name.is_empty() {
            return Err(IdError::InvalidFqdn {
                value: raw.to_string(),
                reason: "empty hostname",
            });
        }
        if !name.contains('.') {
            return Err(IdError::InvalidFqdn {
                value: raw.to_string(),
                reason: "hostname must contain at least one dot",
            });
        }
        if name.split('.').any(str::is_empty) {
            return Err(IdError::InvalidFqdn {
                value: raw.to_string(),
                reason: "empty label",
            });
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
        {
            return Err(IdError::InvalidFqdn {
                value: raw.to_string(),
                reason: "invalid character",
            });
        }

        Ok(Self(name))
    }

    /// Build the fqdn of an instance from its slug and domain suffix
    pub fn from_parts(slug: &str, domain: &str) -> Result<Self, IdError> {
        Self::parse(&format!("{}.{}", slug, domain))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First label of the hostname (`alice` in `alice.example.org`)
    pub fn slug(&self) -> &str {
        self.0.split_once('.').map(|(slug, _)| slug).unwrap_or(&self.0)
    }

    /// Everything after the first label (`example.org`)
    pub fn domain(&self) -> &str {
        self.0.split_once('.').map(|(_, domain)| domain).unwrap_or("")
    }

    /// Hostname an installed application is served on (`drive.alice.example.org`)
    pub fn application_host(&self, app: &str) -> String {
        format!("{}.{}", app.to_ascii_lowercase(), self.0)
    }
}

impl fmt::Display for Fqdn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Fqdn {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Fqdn {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Fqdn> for String {
    fn from(fqdn: Fqdn) -> Self {
        fqdn.0
    }
}

/// Prefix shared by every logical database of one tenant.
///
/// Database names are `<prefix>/<suffix>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoragePrefix(String);

impl StoragePrefix {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self(prefix.into())
    }

    /// Old layout compatibility: instances created before prefixes were
    /// recorded use the fqdn with every `.` replaced by `-`.
    ///
    /// Only call this when the registry record carries no prefix.
    pub fn legacy_from_fqdn(fqdn: &Fqdn) -> Self {
        Self(fqdn.as_str().replace('.', "-"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Full name of one of the tenant's databases
    pub fn database(&self, suffix: &str) -> String {
        format!("{}/{}", self.0, suffix)
    }

    /// Strip the prefix from a database name, if the database belongs to
    /// this tenant
    pub fn suffix_of<'a>(&self, db_name: &'a str) -> Option<&'a str> {
        db_name
            .strip_prefix(self.0.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|suffix| !suffix.is_empty())
    }
}

impl fmt::Display for StoragePrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
