//! Per-tenant isolation for multi-tenant runs
//!
//! Tenants are processed one at a time, in order. A tenant whose operation
//! fails is recorded and logged, and the run moves on to the next one.

use std::fmt;
use std::future::Future;

use tracing::{error, info};

use warden_common::{Classify, ErrorKind, Fqdn};

/// A tenant whose operation failed
#[derive(Debug, Clone)]
pub struct TenantFailure {
    pub fqdn: Fqdn,
    pub kind: ErrorKind,
    pub message: String,
}

/// Outcome of a batch run
#[derive(Debug)]
pub struct BatchReport<T> {
    pub succeeded: Vec<(Fqdn, T)>,
    pub failed: Vec<TenantFailure>,
}

impl<T> BatchReport<T> {
    pub fn new() -> Self {
        Self {
            succeeded: Vec::new(),
            failed: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }
}

impl<T> Default for BatchReport<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Run `op` for every tenant, isolating failures
pub async fn run_batch<T, E, F, Fut, I>(operation: &str, fqdns: I, mut op: F) -> BatchReport<T>
where
    I: IntoIterator<Item = Fqdn>,
    F: FnMut(Fqdn) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify + fmt::Display,
{
    let mut report = BatchReport::new();

    for fqdn in fqdns {
        match op(fqdn.clone()).await {
            Ok(value) => report.succeeded.push((fqdn, value)),
            Err(e) => {
                error!(
                    operation,
                    domain = %fqdn,
                    kind = %e.kind(),
                    error = %e,
                    "Tenant operation failed"
                );
                report.failed.push(TenantFailure {
                    fqdn,
                    kind: e.kind(),
                    message: e.to_string(),
                });
            }
        }
    }

    info!(
        operation,
        succeeded = report.succeeded.len(),
        failed = report.failed.len(),
        "Batch finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_common::IdError;

    fn fqdns(names: &[&str]) -> Vec<Fqdn> {
        names.iter().map(|n| Fqdn::parse(n).unwrap()).collect()
    }

    #[tokio::test]
    async fn test_one_failure_does_not_stop_the_batch() {
        let mut visited = Vec::new();
        let report = run_batch(
            "test",
            fqdns(&["a.example.org", "b.example.org", "c.example.org"]),
            |fqdn| {
                visited.push(fqdn.to_string());
                async move {
                    if fqdn.slug() == "b" {
                        Err(IdError::InvalidFqdn {
                            value: fqdn.to_string(),
                            reason: "broken tenant",
                        })
                    } else {
                        Ok(fqdn.slug().len())
                    }
                }
            },
        )
        .await;

        assert_eq!(visited.len(), 3);
        assert_eq!(report.total(), 3);
        assert!(!report.is_success());
        assert_eq!(report.succeeded.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].fqdn.as_str(), "b.example.org");
        assert_eq!(report.failed[0].kind, ErrorKind::Configuration);
        assert!(report.failed[0].message.contains("broken tenant"));
    }

    #[tokio::test]
    async fn test_empty_batch_succeeds() {
        let report: BatchReport<()> =
            run_batch("test", Vec::new(), |_| async { Ok::<(), IdError>(()) }).await;
        assert!(report.is_success());
        assert_eq!(report.total(), 0);
    }
}
