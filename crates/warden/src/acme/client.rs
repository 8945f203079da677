//! ACME order state machine
//!
//! One call to [`AcmeClient::obtain`] drives one order through:
//!
//! ```text
//! AccountReady → OrderCreated → AuthorizationsPending → ValidationInFlight
//!              → Finalizing → Valid | Invalid
//! ```
//!
//! The wire protocol sits behind [`AcmeAccount`] / [`AcmeOrder`] so the
//! state machine does not depend on a particular ACME library. Nothing is
//! retried across orders: a failed order is abandoned and the next
//! invocation starts from scratch.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, trace};

use super::challenge::ChallengePublisher;
use super::csr::SigningRequest;
use super::error::AcmeError;

/// Default delay between order status polls
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default delay between certificate download attempts
const DEFAULT_CERT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default upper bound on polls per phase
const DEFAULT_MAX_POLL_ATTEMPTS: u32 = 60;

/// Phase of the order currently being driven
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderPhase {
    Uninitialized,
    AccountReady,
    OrderCreated,
    AuthorizationsPending,
    ValidationInFlight,
    Finalizing,
    Valid,
    Invalid,
}

impl fmt::Display for OrderPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Status of one authorization as reported by the authority
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Other(String),
}

/// Challenge types the authority may offer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeKind {
    Http01,
    Other(String),
}

/// One challenge offered for an authorization
#[derive(Debug, Clone)]
pub struct ChallengeOffer {
    pub kind: ChallengeKind,
    pub token: String,
    /// Endpoint notified once the response is in place
    pub url: String,
    /// Expected response body (`token.thumbprint`)
    pub key_authorization: String,
}

/// Proof of control required for one domain of an order
#[derive(Debug, Clone)]
pub struct PendingAuthorization {
    pub domain: String,
    pub status: AuthorizationStatus,
    pub challenges: Vec<ChallengeOffer>,
}

/// Order status after a refresh
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid(String),
}

/// A registered ACME account able to open orders
#[async_trait]
pub trait AcmeAccount: Send + Sync {
    async fn new_order(&self, names: &[String]) -> Result<Box<dyn AcmeOrder>, AcmeError>;
}

/// One open order at the authority
#[async_trait]
pub trait AcmeOrder: Send {
    async fn authorizations(&mut self) -> Result<Vec<PendingAuthorization>, AcmeError>;

    /// Tell the authority the challenge response is in place
    async fn set_challenge_ready(&mut self, challenge_url: &str) -> Result<(), AcmeError>;

    async fn refresh(&mut self) -> Result<OrderStatus, AcmeError>;

    async fn finalize(&mut self, csr_der: &[u8]) -> Result<(), AcmeError>;

    /// PEM chain once issued, `None` while still processing
    async fn certificate(&mut self) -> Result<Option<String>, AcmeError>;
}

/// Anything able to turn a signing request into a certificate chain
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    async fn obtain(&self, csr: &SigningRequest) -> Result<String, AcmeError>;
}

/// HTTP-01 ACME client
pub struct AcmeClient {
    account: Arc<dyn AcmeAccount>,
    challenges: ChallengePublisher,
    poll_interval: Duration,
    cert_poll_interval: Duration,
    max_poll_attempts: u32,
}

impl AcmeClient {
    /// Create a client over a ready account
    pub fn new(account: Arc<dyn AcmeAccount>, challenges: ChallengePublisher) -> Self {
        trace!(phase = %OrderPhase::AccountReady, "ACME client ready");
        Self {
            account,
            challenges,
            poll_interval: DEFAULT_POLL_INTERVAL,
            cert_poll_interval: DEFAULT_CERT_POLL_INTERVAL,
            max_poll_attempts: DEFAULT_MAX_POLL_ATTEMPTS,
        }
    }

    /// Override polling cadence
    pub fn with_polling(mut self, interval: Duration, max_attempts: u32) -> Self {
        self.poll_interval = interval;
        self.cert_poll_interval = interval.min(DEFAULT_CERT_POLL_INTERVAL);
        self.max_poll_attempts = max_attempts.max(1);
        self
    }

    async fn drive(
        &self,
        order: &mut dyn AcmeOrder,
        csr: &SigningRequest,
    ) -> Result<String, AcmeError> {
        let authorizations = order.authorizations().await?;
        debug!(
            domain = %csr.common_name,
            phase = %OrderPhase::AuthorizationsPending,
            count = authorizations.len(),
            "Received authorizations"
        );

        for authz in &authorizations {
            self.prove_control(order, authz).await?;
        }

        debug!(domain = %csr.common_name, phase = %OrderPhase::ValidationInFlight, "Waiting for validation");
        let status = self.wait_until_ready(order).await?;

        debug!(domain = %csr.common_name, phase = %OrderPhase::Finalizing, "Finalizing order");
        if status != OrderStatus::Valid {
            order.finalize(csr.der()).await?;
        }

        for _ in 0..self.max_poll_attempts {
            if let Some(chain) = order.certificate().await? {
                info!(domain = %csr.common_name, phase = %OrderPhase::Valid, "Certificate issued");
                return Ok(chain);
            }
            trace!(domain = %csr.common_name, "Certificate not yet available");
            tokio::time::sleep(self.cert_poll_interval).await;
        }

        Err(AcmeError::PollTimeout(self.max_poll_attempts))
    }

    /// Publish, self-check, then announce one authorization's challenge
    async fn prove_control(
        &self,
        order: &mut dyn AcmeOrder,
        authz: &PendingAuthorization,
    ) -> Result<(), AcmeError> {
        if authz.status == AuthorizationStatus::Valid {
            trace!(domain = %authz.domain, "Authorization already valid");
            return Ok(());
        }

        let challenge = authz
            .challenges
            .iter()
            .find(|c| c.kind == ChallengeKind::Http01)
            .ok_or_else(|| AcmeError::UnsupportedChallenge {
                domain: authz.domain.clone(),
                offered: authz
                    .challenges
                    .iter()
                    .map(|c| format!("{:?}", c.kind))
                    .collect::<Vec<_>>()
                    .join(", "),
            })?;

        self.challenges
            .publish(&authz.domain, &challenge.token, &challenge.key_authorization)?;
        self.challenges
            .verify(&authz.domain, &challenge.token, &challenge.key_authorization)
            .await?;

        order.set_challenge_ready(&challenge.url).await?;
        debug!(domain = %authz.domain, "Challenge announced to the authority");
        Ok(())
    }

    async fn wait_until_ready(&self, order: &mut dyn AcmeOrder) -> Result<OrderStatus, AcmeError> {
        for attempt in 1..=self.max_poll_attempts {
            match order.refresh().await? {
                status @ (OrderStatus::Ready | OrderStatus::Valid) => return Ok(status),
                OrderStatus::Invalid(reason) => {
                    debug!(phase = %OrderPhase::Invalid, "Order invalid");
                    return Err(AcmeError::OrderInvalid(reason));
                }
                OrderStatus::Pending | OrderStatus::Processing => {
                    trace!(attempt, "Order still pending");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }

        Err(AcmeError::PollTimeout(self.max_poll_attempts))
    }
}

#[async_trait]
impl CertificateAuthority for AcmeClient {
    async fn obtain(&self, csr: &SigningRequest) -> Result<String, AcmeError> {
        let names = csr.ordered_names();
        info!(domain = %csr.common_name, names = ?names, "Requesting certificate");

        let mut order = self.account.new_order(&names).await?;
        debug!(domain = %csr.common_name, phase = %OrderPhase::OrderCreated, "Order created");

        let result = self.drive(order.as_mut(), csr).await;

        // Responses are only needed while the order is open
        self.challenges.clear();
        result
    }
}

impl fmt::Debug for AcmeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcmeClient")
            .field("poll_interval", &self.poll_interval)
            .field("max_poll_attempts", &self.max_poll_attempts)
            .finish()
    }
}
