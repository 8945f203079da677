//! HTTP-01 challenge publication
//!
//! Challenge responses are written as files into the directory the web front
//! end serves under `/.well-known/acme-challenge/`. Before the authority is
//! told a challenge is ready, the response is fetched back over plain HTTP:
//! if the front end does not serve exactly what was written, the authority
//! would fail validation too, so the order is abandoned early.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, trace, warn};
use url::Url;

use super::error::AcmeError;
use super::storage::KeyMaterialStore;

/// HTTP-01 challenge path prefix
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

const SELF_CHECK_TIMEOUT: Duration = Duration::from_secs(30);

/// Publishes challenge responses and verifies they are served
///
/// # Thread Safety
///
/// Published tokens are tracked in a `DashMap`, so clones share the set of
/// files to clean up.
#[derive(Debug, Clone)]
pub struct ChallengePublisher {
    storage: Arc<KeyMaterialStore>,
    http: reqwest::Client,
    /// Replaces `http://<domain>` in self-check URLs
    self_check_base: Option<Url>,
    /// Map of published token -> domain
    published: Arc<DashMap<String, String>>,
}

impl ChallengePublisher {
    pub fn new(storage: Arc<KeyMaterialStore>, self_check_base: Option<Url>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(SELF_CHECK_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            storage,
            http,
            self_check_base,
            published: Arc::new(DashMap::new()),
        }
    }

    /// Write the response file for a token
    pub fn publish(&self, domain: &str, token: &str, key_authorization: &str) -> Result<(), AcmeError> {
        debug!(domain = %domain, token = %token, "Publishing HTTP-01 challenge");
        self.storage.write_challenge(token, key_authorization)?;
        self.published.insert(token.to_string(), domain.to_string());
        Ok(())
    }

    /// URL the authority (and the self-check) fetches for a token
    pub fn challenge_url(&self, domain: &str, token: &str) -> String {
        match self.self_check_base {
            Some(ref base) => format!(
                "{}{}{}",
                base.as_str().trim_end_matches('/'),
                ACME_CHALLENGE_PREFIX,
                token
            ),
            None => format!("http://{}{}{}", domain, ACME_CHALLENGE_PREFIX, token),
        }
    }

    /// Fetch the published response and compare it byte-for-byte
    pub async fn verify(&self, domain: &str, token: &str, expected: &str) -> Result<(), AcmeError> {
        let url = self.challenge_url(domain, token);
        trace!(domain = %domain, url = %url, "Running challenge self-check");

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| AcmeError::SelfCheckRequest {
                url: url.clone(),
                message: e.to_string(),
            })?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| AcmeError::SelfCheckRequest {
                url: url.clone(),
                message: e.to_string(),
            })?;

        if status.is_success() && body.as_ref() == expected.as_bytes() {
            debug!(domain = %domain, "Challenge self-check passed");
            return Ok(());
        }

        let actual = if status.is_success() {
            String::from_utf8_lossy(&body).into_owned()
        } else {
            format!("HTTP {}", status.as_u16())
        };

        Err(AcmeError::ChallengeMismatch {
            domain: domain.to_string(),
            url,
            expected: expected.to_string(),
            actual,
        })
    }

    /// Remove one published response
    fn remove(&self, token: &str) {
        if self.published.remove(token).is_some() {
            if let Err(e) = self.storage.remove_challenge(token) {
                warn!(token = %token, error = %e, "Failed to remove challenge file");
            }
        }
    }

    /// Remove every published response
    pub fn clear(&self) {
        let tokens: Vec<String> = self.published.iter().map(|e| e.key().clone()).collect();
        for token in &tokens {
            self.remove(token);
        }
        if !tokens.is_empty() {
            debug!(cleared = tokens.len(), "Cleared published ACME challenges");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn setup(base: Option<&str>) -> (TempDir, ChallengePublisher) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(KeyMaterialStore::with_default_challenge_dir(temp_dir.path()).unwrap());
        let publisher = ChallengePublisher::new(storage, base.map(|b| Url::parse(b).unwrap()));
        (temp_dir, publisher)
    }

    #[test]
    fn test_challenge_url() {
        let (_dir, publisher) = setup(None);
        assert_eq!(
            publisher.challenge_url("alice.example.org", "tok"),
            "http://alice.example.org/.well-known/acme-challenge/tok"
        );

        let (_dir, publisher) = setup(Some("http://127.0.0.1:8080/"));
        assert_eq!(
            publisher.challenge_url("alice.example.org", "tok"),
            "http://127.0.0.1:8080/.well-known/acme-challenge/tok"
        );
    }

    #[test]
    fn test_publish_and_clear() {
        let (dir, publisher) = setup(None);

        publisher.publish("a.example.org", "token1", "token1.k").unwrap();
        publisher.publish("b.example.org", "token2", "token2.k").unwrap();
        assert_eq!(publisher.published.len(), 2);
        assert!(dir.path().join("acme-challenge/token1").exists());

        publisher.clear();
        assert_eq!(publisher.published.len(), 0);
        assert!(!dir.path().join("acme-challenge/token1").exists());
        assert!(!dir.path().join("acme-challenge/token2").exists());
    }

    #[tokio::test]
    async fn test_self_check_passes_on_exact_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/acme-challenge/tok"))
            .respond_with(ResponseTemplate::new(200).set_body_string("tok.thumb"))
            .mount(&server)
            .await;

        let (_dir, publisher) = setup(Some(&server.uri()));
        publisher
            .verify("alice.example.org", "tok", "tok.thumb")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_self_check_rejects_trailing_newline() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/acme-challenge/tok"))
            .respond_with(ResponseTemplate::new(200).set_body_string("tok.thumb\n"))
            .mount(&server)
            .await;

        let (_dir, publisher) = setup(Some(&server.uri()));
        let err = publisher
            .verify("alice.example.org", "tok", "tok.thumb")
            .await
            .unwrap_err();
        assert!(matches!(err, AcmeError::ChallengeMismatch { .. }));
    }

    #[tokio::test]
    async fn test_self_check_reports_http_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let (_dir, publisher) = setup(Some(&server.uri()));
        match publisher.verify("alice.example.org", "tok", "tok.thumb").await {
            Err(AcmeError::ChallengeMismatch { actual, .. }) => assert_eq!(actual, "HTTP 404"),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
