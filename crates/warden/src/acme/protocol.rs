//! ACME wire protocol binding over `instant-acme`

use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus as WireAuthzStatus, ChallengeType,
    Identifier, NewAccount, NewOrder, Order, OrderStatus as WireOrderStatus,
};
use tracing::{debug, info};

use super::client::{
    AcmeAccount, AcmeOrder, AuthorizationStatus, ChallengeKind, ChallengeOffer, OrderStatus,
    PendingAuthorization,
};
use super::error::AcmeError;
use super::storage::KeyMaterialStore;

/// Account registration parameters
#[derive(Debug, Clone)]
pub struct AccountSettings<'a> {
    pub directory_url: &'a str,
    pub staging: bool,
    pub email: Option<&'a str>,
    pub accept_terms: bool,
}

/// Registered account at a real ACME directory
pub struct InstantAcmeAccount {
    account: Account,
}

impl InstantAcmeAccount {
    /// Load the stored account, or register a new one
    ///
    /// An account file that exists but cannot be used is an error: silently
    /// registering a replacement would orphan the existing registration.
    pub async fn bootstrap(
        store: &KeyMaterialStore,
        settings: &AccountSettings<'_>,
    ) -> Result<Self, AcmeError> {
        if let Some(json) = store.load_account_credentials(settings.staging)? {
            let credentials: AccountCredentials = serde_json::from_str(&json)
                .map_err(|e| AcmeError::AccountBootstrap(e.to_string()))?;
            let account = Account::from_credentials(credentials)
                .await
                .map_err(|e| AcmeError::AccountBootstrap(e.to_string()))?;
            debug!(staging = settings.staging, "Loaded existing ACME account");
            return Ok(Self { account });
        }

        if !settings.accept_terms {
            return Err(AcmeError::TermsNotAccepted);
        }

        let contact = settings.email.map(|email| format!("mailto:{}", email));
        let contact_refs: Vec<&str> = contact.iter().map(String::as_str).collect();
        let new_account = NewAccount {
            contact: &contact_refs,
            terms_of_service_agreed: true,
            only_return_existing: false,
        };

        info!(
            directory = %settings.directory_url,
            staging = settings.staging,
            "Registering new ACME account"
        );
        let (account, credentials) = Account::create(&new_account, settings.directory_url, None)
            .await
            .map_err(|e| AcmeError::protocol("account registration", e))?;

        let json = serde_json::to_string_pretty(&credentials)
            .map_err(|e| AcmeError::protocol("account registration", e))?;
        store.save_account_credentials(settings.staging, &json)?;

        info!(account = %account.id(), "ACME account registered");
        Ok(Self { account })
    }
}

#[async_trait]
impl AcmeAccount for InstantAcmeAccount {
    async fn new_order(&self, names: &[String]) -> Result<Box<dyn AcmeOrder>, AcmeError> {
        let identifiers: Vec<Identifier> = names.iter().cloned().map(Identifier::Dns).collect();
        let order = self
            .account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(|e| AcmeError::protocol("new order", e))?;
        Ok(Box::new(InstantAcmeOrder { order }))
    }
}

struct InstantAcmeOrder {
    order: Order,
}

#[async_trait]
impl AcmeOrder for InstantAcmeOrder {
    async fn authorizations(&mut self) -> Result<Vec<PendingAuthorization>, AcmeError> {
        let authorizations = self
            .order
            .authorizations()
            .await
            .map_err(|e| AcmeError::protocol("authorizations", e))?;

        Ok(authorizations
            .iter()
            .map(|authz| {
                #[allow(unreachable_patterns)]
                let domain = match &authz.identifier {
                    Identifier::Dns(name) => name.clone(),
                    other => format!("{:?}", other),
                };
                let status = match authz.status {
                    WireAuthzStatus::Pending => AuthorizationStatus::Pending,
                    WireAuthzStatus::Valid => AuthorizationStatus::Valid,
                    WireAuthzStatus::Invalid => AuthorizationStatus::Invalid,
                    ref other => AuthorizationStatus::Other(format!("{:?}", other)),
                };
                let challenges = authz
                    .challenges
                    .iter()
                    .map(|challenge| ChallengeOffer {
                        kind: match challenge.r#type {
                            ChallengeType::Http01 => ChallengeKind::Http01,
                            ref other => ChallengeKind::Other(format!("{:?}", other)),
                        },
                        token: challenge.token.clone(),
                        url: challenge.url.clone(),
                        key_authorization: self
                            .order
                            .key_authorization(challenge)
                            .as_str()
                            .to_string(),
                    })
                    .collect();

                PendingAuthorization {
                    domain,
                    status,
                    challenges,
                }
            })
            .collect())
    }

    async fn set_challenge_ready(&mut self, challenge_url: &str) -> Result<(), AcmeError> {
        self.order
            .set_challenge_ready(challenge_url)
            .await
            .map_err(|e| AcmeError::protocol("challenge ready", e))
    }

    async fn refresh(&mut self) -> Result<OrderStatus, AcmeError> {
        let state = self
            .order
            .refresh()
            .await
            .map_err(|e| AcmeError::protocol("order refresh", e))?;

        Ok(match state.status {
            WireOrderStatus::Pending => OrderStatus::Pending,
            WireOrderStatus::Ready => OrderStatus::Ready,
            WireOrderStatus::Processing => OrderStatus::Processing,
            WireOrderStatus::Valid => OrderStatus::Valid,
            WireOrderStatus::Invalid => OrderStatus::Invalid(
                state
                    .error
                    .as_ref()
                    .map(|problem| format!("{:?}", problem))
                    .unwrap_or_else(|| "no reason given".to_string()),
            ),
        })
    }

    async fn finalize(&mut self, csr_der: &[u8]) -> Result<(), AcmeError> {
        self.order
            .finalize(csr_der)
            .await
            .map_err(|e| AcmeError::protocol("finalize", e))
    }

    async fn certificate(&mut self) -> Result<Option<String>, AcmeError> {
        self.order
            .certificate()
            .await
            .map_err(|e| AcmeError::protocol("certificate download", e))
    }
}
