//! ACME protocol capability
//!
//! The issuance engine drives orders through the [`AcmeProtocol`] and
//! [`AcmeOrder`] traits. [`InstantAcmeClient`] implements them on top of
//! `instant-acme`; tests substitute their own implementation.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType as AcmeChallengeType,
    Identifier, NewAccount, NewOrder, Order, OrderStatus,
};
use tokio::sync::RwLock;
use tracing::{debug, info, trace, warn};

use zonecert_common::{ChallengeType, Zone};
use zonecert_config::AcmeConfig;

use super::error::AcmeError;
use super::storage::{CertificateStorage, StoredAccount};

/// A challenge the ACME server offered for an authorization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferedChallenge {
    pub challenge: ChallengeType,
    pub token: String,
    pub key_authorization: String,
    /// Challenge URL, used to signal readiness
    pub url: String,
}

/// An authorization that still needs a challenge completed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAuthorization {
    /// DNS identifier being validated (the zone without any `*.` prefix)
    pub identifier: String,
    pub offered: Vec<OfferedChallenge>,
}

/// Order status as seen by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderProgress {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid(String),
}

/// Creates ACME orders
#[async_trait]
pub trait AcmeProtocol: Send + Sync {
    /// Open a new order for a single zone
    async fn new_order(&self, zone: &Zone) -> Result<Box<dyn AcmeOrder>, AcmeError>;
}

/// One open ACME order
#[async_trait]
pub trait AcmeOrder: Send {
    /// Authorizations not yet valid, with the challenges offered for each
    async fn authorizations(&mut self) -> Result<Vec<PendingAuthorization>, AcmeError>;

    /// Tell the server the challenge response is in place
    async fn set_ready(&mut self, challenge: &OfferedChallenge) -> Result<(), AcmeError>;

    /// Refresh and report the order status
    async fn poll(&mut self) -> Result<OrderProgress, AcmeError>;

    /// Submit the DER-encoded CSR
    async fn finalize(&mut self, csr_der: &[u8]) -> Result<(), AcmeError>;

    /// Download the PEM chain once the order is valid
    async fn certificate_chain(&mut self) -> Result<Option<String>, AcmeError>;
}

// ============================================================================
// instant-acme
// ============================================================================

/// ACME client backed by `instant-acme`.
///
/// The account is created (or reloaded from stored credentials) lazily on
/// the first order.
pub struct InstantAcmeClient {
    account: RwLock<Option<Account>>,
    directory: String,
    email: Option<String>,
    storage: Option<Arc<CertificateStorage>>,
}

impl InstantAcmeClient {
    pub fn new(config: &AcmeConfig, storage: Option<Arc<CertificateStorage>>) -> Self {
        Self {
            account: RwLock::new(None),
            directory: config.directory.clone(),
            email: config.email.clone(),
            storage,
        }
    }

    /// Load the account from storage, or register a new one
    pub async fn init_account(&self) -> Result<(), AcmeError> {
        let mut slot = self.account.write().await;
        if slot.is_some() {
            return Ok(());
        }

        if let Some(creds_json) = self.stored_credentials()? {
            info!("Loading existing ACME account from storage");
            let credentials: AccountCredentials = serde_json::from_str(&creds_json)
                .map_err(|e| {
                    AcmeError::AccountCreation(format!("Failed to deserialize credentials: {}", e))
                })?;

            let account = Account::from_credentials(credentials)
                .await
                .map_err(|e| AcmeError::AccountCreation(e.to_string()))?;
            *slot = Some(account);
            return Ok(());
        }

        info!(
            email = ?self.email,
            directory = %self.directory,
            "Creating new ACME account"
        );

        let contact = self.email.as_ref().map(|e| format!("mailto:{}", e));
        let contacts: Vec<&str> = contact.iter().map(String::as_str).collect();

        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &contacts,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.directory,
            None,
        )
        .await
        .map_err(|e| AcmeError::AccountCreation(e.to_string()))?;

        if let Some(storage) = &self.storage {
            let json = serde_json::to_string_pretty(&credentials).map_err(|e| {
                AcmeError::AccountCreation(format!("Failed to serialize credentials: {}", e))
            })?;
            storage.save_credentials_json(&json)?;
            storage.save_account(&StoredAccount {
                contact_email: self.email.clone(),
                directory: self.directory.clone(),
                created: Utc::now(),
            })?;
        }

        info!("ACME account created");
        *slot = Some(account);
        Ok(())
    }

    /// Stored credentials, unless they were registered with another directory
    fn stored_credentials(&self) -> Result<Option<String>, AcmeError> {
        let Some(storage) = &self.storage else {
            return Ok(None);
        };

        if let Some(account) = storage.load_account()? {
            if account.directory != self.directory {
                warn!(
                    stored = %account.directory,
                    configured = %self.directory,
                    "Stored ACME account belongs to another directory, registering a new one"
                );
                return Ok(None);
            }
        }
        Ok(storage.load_credentials_json()?)
    }

    async fn account(&self) -> Result<Account, AcmeError> {
        if let Some(account) = self.account.read().await.as_ref() {
            return Ok(account.clone());
        }
        self.init_account().await?;
        self.account
            .read()
            .await
            .clone()
            .ok_or_else(|| AcmeError::AccountCreation("account not initialized".to_string()))
    }
}

impl std::fmt::Debug for InstantAcmeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstantAcmeClient")
            .field("directory", &self.directory)
            .field("email", &self.email)
            .field("has_storage", &self.storage.is_some())
            .finish()
    }
}

#[async_trait]
impl AcmeProtocol for InstantAcmeClient {
    async fn new_order(&self, zone: &Zone) -> Result<Box<dyn AcmeOrder>, AcmeError> {
        let account = self.account().await?;

        let identifiers = [Identifier::Dns(zone.to_string())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;

        debug!(zone = %zone, status = ?order.state().status, "Created ACME order");
        Ok(Box::new(InstantAcmeOrder {
            order,
            zone: zone.clone(),
        }))
    }
}

struct InstantAcmeOrder {
    order: Order,
    zone: Zone,
}

fn challenge_type(kind: &AcmeChallengeType) -> Option<ChallengeType> {
    match kind {
        AcmeChallengeType::Http01 => Some(ChallengeType::Http01),
        AcmeChallengeType::TlsAlpn01 => Some(ChallengeType::TlsAlpn01),
        _ => None,
    }
}

#[async_trait]
impl AcmeOrder for InstantAcmeOrder {
    async fn authorizations(&mut self) -> Result<Vec<PendingAuthorization>, AcmeError> {
        let authorizations = self.order.authorizations().await?;
        let identifier = self.zone.as_str().trim_start_matches("*.").to_string();

        let mut pending = Vec::new();
        for authz in authorizations {
            if authz.status == AuthorizationStatus::Valid {
                trace!(zone = %self.zone, "Authorization already valid");
                continue;
            }

            let offered = authz
                .challenges
                .iter()
                .filter_map(|c| {
                    challenge_type(&c.r#type).map(|challenge| OfferedChallenge {
                        challenge,
                        token: c.token.clone(),
                        key_authorization: self.order.key_authorization(c).as_str().to_string(),
                        url: c.url.clone(),
                    })
                })
                .collect();

            pending.push(PendingAuthorization {
                identifier: identifier.clone(),
                offered,
            });
        }

        Ok(pending)
    }

    async fn set_ready(&mut self, challenge: &OfferedChallenge) -> Result<(), AcmeError> {
        self.order.set_challenge_ready(&challenge.url).await?;
        Ok(())
    }

    async fn poll(&mut self) -> Result<OrderProgress, AcmeError> {
        let state = self.order.refresh().await?;
        Ok(match state.status {
            OrderStatus::Pending => OrderProgress::Pending,
            OrderStatus::Ready => OrderProgress::Ready,
            OrderStatus::Processing => OrderProgress::Processing,
            OrderStatus::Valid => OrderProgress::Valid,
            OrderStatus::Invalid => OrderProgress::Invalid(
                state
                    .error
                    .as_ref()
                    .and_then(|problem| problem.detail.clone())
                    .unwrap_or_else(|| "order became invalid".to_string()),
            ),
        })
    }

    async fn finalize(&mut self, csr_der: &[u8]) -> Result<(), AcmeError> {
        self.order.finalize(csr_der).await?;
        Ok(())
    }

    async fn certificate_chain(&mut self) -> Result<Option<String>, AcmeError> {
        Ok(self.order.certificate().await?)
    }
}
