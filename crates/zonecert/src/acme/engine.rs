//! Certificate issuance engine
//!
//! Drives one ACME order per attempt through
//!
//! ```text
//! Requested -> OrderCreated -> ChallengeSelected -> ChallengeInProgress
//!           -> Validated -> CertificateRetrieved
//! ```
//!
//! with `Failed` reachable from every non-terminal state. Each transition is
//! published as an [`IssuanceEvent`].
//!
//! # Challenge selection
//!
//! Challenge types are tried in [`ChallengeType::PREFERENCE`] order
//! (TLS-ALPN-01, then HTTP-01). A type is used only if it is enabled, the
//! server offered it, and its responder is listening. If every enabled and
//! offered type lacks a listening responder the attempt fails immediately
//! with a configuration error.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use rcgen::{CertificateParams, DistinguishedName, KeyPair};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use zonecert_common::{ChallengeType, Zone};
use zonecert_config::{AcmeConfig, ChallengesConfig, RenewalConfig};

use super::cache::Issuer;
use super::certificate::Certificate;
use super::challenge::{ChallengeGuard, ChallengeManager};
use super::client::{AcmeOrder, AcmeProtocol, OfferedChallenge, OrderProgress};
use super::error::AcmeError;

/// Capacity of the issuance event channel
const EVENT_CAPACITY: usize = 256;

/// Account-level policy shared by every zone of a server instance.
///
/// Immutable once built; the engine and the facade hold it behind an `Arc`.
#[derive(Debug, Clone)]
pub struct AcmeAccountTemplate {
    acme: AcmeConfig,
    zones: Vec<Zone>,
    renew_before: Duration,
    check_interval: Duration,
    issuance_timeout: Duration,
    poll_interval: Duration,
}

impl AcmeAccountTemplate {
    /// Validate and freeze the ACME and renewal settings
    pub fn new(acme: AcmeConfig, renewal: RenewalConfig) -> Result<Self, AcmeError> {
        if !acme.challenges.any_enabled() {
            return Err(AcmeError::Configuration(
                "at least one ACME challenge type must be enabled".to_string(),
            ));
        }

        let zones = acme
            .zones
            .iter()
            .map(|z| Zone::new(z))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            acme,
            zones,
            renew_before: Duration::from_secs(u64::from(renewal.renew_before_days) * 86_400),
            check_interval: Duration::from_secs(renewal.check_interval_secs),
            issuance_timeout: Duration::from_secs(renewal.issuance_timeout_secs),
            poll_interval: Duration::from_millis(renewal.poll_interval_ms),
        })
    }

    pub fn email(&self) -> Option<&str> {
        self.acme.email.as_deref()
    }

    pub fn directory(&self) -> &str {
        &self.acme.directory
    }

    /// Zones listed in configuration
    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    pub fn challenges(&self) -> &ChallengesConfig {
        &self.acme.challenges
    }

    /// Enabled challenge types in preference order
    pub fn enabled_challenges(&self) -> Vec<ChallengeType> {
        self.acme.challenges.enabled_types()
    }

    pub fn bind_address(&self) -> IpAddr {
        self.acme.bind_address
    }

    /// Socket address for a challenge type's responder
    pub fn responder_addr(&self, challenge: ChallengeType) -> SocketAddr {
        SocketAddr::new(self.acme.bind_address, self.acme.challenges.get(challenge).port)
    }

    pub fn acme_config(&self) -> &AcmeConfig {
        &self.acme
    }

    pub fn renew_before(&self) -> Duration {
        self.renew_before
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    pub fn issuance_timeout(&self) -> Duration {
        self.issuance_timeout
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

/// State of one issuance attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssuanceState {
    Requested,
    OrderCreated,
    ChallengeSelected(ChallengeType),
    ChallengeInProgress,
    Validated,
    CertificateRetrieved,
    Failed(String),
}

impl IssuanceState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IssuanceState::CertificateRetrieved | IssuanceState::Failed(_)
        )
    }
}

impl fmt::Display for IssuanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IssuanceState::Requested => write!(f, "requested"),
            IssuanceState::OrderCreated => write!(f, "order-created"),
            IssuanceState::ChallengeSelected(c) => write!(f, "challenge-selected({})", c),
            IssuanceState::ChallengeInProgress => write!(f, "challenge-in-progress"),
            IssuanceState::Validated => write!(f, "validated"),
            IssuanceState::CertificateRetrieved => write!(f, "certificate-retrieved"),
            IssuanceState::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// A state transition of an issuance attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuanceEvent {
    pub zone: Zone,
    pub state: IssuanceState,
}

/// Runs ACME orders and produces certificates.
///
/// Never touches the certificate cache; results are handed back to the
/// caller (normally the cache, through [`Issuer`]).
pub struct AcmeManager {
    template: Arc<AcmeAccountTemplate>,
    protocol: Arc<dyn AcmeProtocol>,
    challenges: ChallengeManager,
    /// Zones with an open order
    active: DashMap<Zone, ()>,
    events: broadcast::Sender<IssuanceEvent>,
    shutdown: CancellationToken,
}

/// Removes a zone from the open-order set on drop
struct ActiveOrder<'a> {
    active: &'a DashMap<Zone, ()>,
    zone: Zone,
}

impl Drop for ActiveOrder<'_> {
    fn drop(&mut self) {
        self.active.remove(&self.zone);
    }
}

impl AcmeManager {
    pub fn new(
        template: Arc<AcmeAccountTemplate>,
        protocol: Arc<dyn AcmeProtocol>,
        challenges: ChallengeManager,
        shutdown: CancellationToken,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            template,
            protocol,
            challenges,
            active: DashMap::new(),
            events,
            shutdown,
        }
    }

    pub fn template(&self) -> &Arc<AcmeAccountTemplate> {
        &self.template
    }

    pub fn challenges(&self) -> &ChallengeManager {
        &self.challenges
    }

    /// Receive every subsequent state transition
    pub fn subscribe(&self) -> broadcast::Receiver<IssuanceEvent> {
        self.events.subscribe()
    }

    /// Whether an order is currently open for `zone`
    pub fn is_active(&self, zone: &Zone) -> bool {
        self.active.contains_key(zone)
    }

    /// Issue a certificate for `zone`, waiting for a terminal state.
    ///
    /// Bounded by the template's issuance timeout and by the shutdown
    /// token. Challenge material is released on every exit path.
    pub async fn issue_sync(&self, zone: &Zone) -> Result<Certificate, AcmeError> {
        let _order = self.open_order(zone)?;
        let start = Instant::now();
        self.emit(zone, IssuanceState::Requested);

        let timeout = self.template.issuance_timeout;
        let result = tokio::select! {
            _ = self.shutdown.cancelled() => Err(AcmeError::Cancelled(zone.to_string())),
            outcome = tokio::time::timeout(timeout, self.run(zone)) => match outcome {
                Ok(result) => result,
                Err(_) => Err(AcmeError::Timeout {
                    zone: zone.to_string(),
                    elapsed: start.elapsed(),
                }),
            },
        };

        match result {
            Ok(cert) => {
                info!(
                    zone = %zone,
                    expires = %cert.expires(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Certificate issued"
                );
                Ok(cert)
            }
            Err(e) => {
                let e = e.into_issuance(zone.as_str());
                warn!(zone = %zone, error = %e, "Certificate issuance failed");
                self.emit(zone, IssuanceState::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    fn open_order(&self, zone: &Zone) -> Result<ActiveOrder<'_>, AcmeError> {
        match self.active.entry(zone.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(AcmeError::Issuance {
                zone: zone.to_string(),
                message: "an order for this zone is already open".to_string(),
            }),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(());
                Ok(ActiveOrder {
                    active: &self.active,
                    zone: zone.clone(),
                })
            }
        }
    }

    fn emit(&self, zone: &Zone, state: IssuanceState) {
        debug!(zone = %zone, state = %state, "Issuance state");
        // No subscribers is fine
        let _ = self.events.send(IssuanceEvent {
            zone: zone.clone(),
            state,
        });
    }

    async fn run(&self, zone: &Zone) -> Result<Certificate, AcmeError> {
        let mut order = self.protocol.new_order(zone).await?;
        self.emit(zone, IssuanceState::OrderCreated);

        let authorizations = order.authorizations().await?;

        let mut guards: Vec<ChallengeGuard> = Vec::with_capacity(authorizations.len());
        let mut selected: Vec<OfferedChallenge> = Vec::with_capacity(authorizations.len());
        for authz in &authorizations {
            let offered = self.select_challenge(zone, &authz.offered)?;
            self.emit(zone, IssuanceState::ChallengeSelected(offered.challenge));

            guards.push(self.challenges.prepare(
                offered.challenge,
                &authz.identifier,
                &offered.token,
                &offered.key_authorization,
            )?);
            selected.push(offered.clone());
        }

        for offered in &selected {
            order.set_ready(offered).await?;
        }
        if !selected.is_empty() {
            self.emit(zone, IssuanceState::ChallengeInProgress);
        }

        self.wait_until_ready(zone, order.as_mut()).await?;
        drop(guards);
        self.emit(zone, IssuanceState::Validated);

        let (csr_der, key_pem) = generate_csr(zone)?;
        order.finalize(&csr_der).await?;

        let chain = self.wait_for_chain(zone, order.as_mut()).await?;
        let cert = Certificate::from_pem(zone.clone(), chain, key_pem)?;
        self.emit(zone, IssuanceState::CertificateRetrieved);
        Ok(cert)
    }

    fn select_challenge<'a>(
        &self,
        zone: &Zone,
        offered: &'a [OfferedChallenge],
    ) -> Result<&'a OfferedChallenge, AcmeError> {
        let mut not_listening = Vec::new();

        for kind in self.template.enabled_challenges() {
            let Some(candidate) = offered.iter().find(|c| c.challenge == kind) else {
                continue;
            };
            if self.challenges.is_listening(kind) {
                return Ok(candidate);
            }
            debug!(zone = %zone, challenge = %kind, "Responder not listening, trying next challenge");
            not_listening.push(kind.as_str());
        }

        if !not_listening.is_empty() {
            return Err(AcmeError::Configuration(format!(
                "no responder listening for challenge type(s): {}",
                not_listening.join(", ")
            )));
        }

        Err(AcmeError::Issuance {
            zone: zone.to_string(),
            message: "ACME server offered none of the enabled challenge types".to_string(),
        })
    }

    async fn wait_until_ready(
        &self,
        zone: &Zone,
        order: &mut dyn AcmeOrder,
    ) -> Result<(), AcmeError> {
        loop {
            match order.poll().await? {
                OrderProgress::Ready => return Ok(()),
                OrderProgress::Pending => {}
                OrderProgress::Invalid(reason) => {
                    return Err(AcmeError::Issuance {
                        zone: zone.to_string(),
                        message: format!("validation failed: {}", reason),
                    });
                }
                OrderProgress::Processing | OrderProgress::Valid => {
                    return Err(AcmeError::Issuance {
                        zone: zone.to_string(),
                        message: "order was finalized before validation completed".to_string(),
                    });
                }
            }
            tokio::time::sleep(self.template.poll_interval).await;
        }
    }

    async fn wait_for_chain(
        &self,
        zone: &Zone,
        order: &mut dyn AcmeOrder,
    ) -> Result<String, AcmeError> {
        loop {
            match order.poll().await? {
                OrderProgress::Valid => {
                    return order.certificate_chain().await?.ok_or_else(|| {
                        AcmeError::Issuance {
                            zone: zone.to_string(),
                            message: "order is valid but no certificate was returned".to_string(),
                        }
                    });
                }
                OrderProgress::Processing | OrderProgress::Ready => {}
                OrderProgress::Pending => {
                    return Err(AcmeError::Issuance {
                        zone: zone.to_string(),
                        message: "order returned to pending after finalization".to_string(),
                    });
                }
                OrderProgress::Invalid(reason) => {
                    return Err(AcmeError::Issuance {
                        zone: zone.to_string(),
                        message: format!("finalization failed: {}", reason),
                    });
                }
            }
            tokio::time::sleep(self.template.poll_interval).await;
        }
    }
}

#[async_trait]
impl Issuer for AcmeManager {
    async fn issue(&self, zone: &Zone) -> Result<Certificate, AcmeError> {
        self.issue_sync(zone).await
    }
}

impl fmt::Debug for AcmeManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcmeManager")
            .field("template", &self.template)
            .field("active_orders", &self.active.len())
            .finish()
    }
}

/// Fresh key pair and CSR for a zone; returns (CSR DER, key PEM)
fn generate_csr(zone: &Zone) -> Result<(Vec<u8>, String), AcmeError> {
    let mut params = CertificateParams::new(vec![zone.to_string()])
        .map_err(|e| AcmeError::Protocol(format!("invalid CSR parameters: {}", e)))?;
    params.distinguished_name = DistinguishedName::new();

    let key = KeyPair::generate()
        .map_err(|e| AcmeError::Protocol(format!("key generation failed: {}", e)))?;
    let csr = params
        .serialize_request(&key)
        .map_err(|e| AcmeError::Protocol(format!("CSR generation failed: {}", e)))?;

    Ok((csr.der().to_vec(), key.serialize_pem()))
}
