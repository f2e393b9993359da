//! Certificate service
//!
//! Composes the challenge responders, issuance engine, certificate cache and
//! TLS parameter builder for one server instance.
//!
//! Startup order matters: [`CertificateService::start_responders`] must run
//! before any issuance, and every background task is tracked so
//! [`CertificateService::shutdown`] can cancel and join it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use zonecert_common::{ChallengeType, Zone};
use zonecert_config::{Config, TlsConfig};

use crate::acme::{
    start_http_responder, start_tls_alpn_responder, AcmeAccountTemplate, AcmeError,
    AcmeManager, AcmeProtocol, Certificate, CertificateCache, CertificateStorage,
    ChallengeManager, InstantAcmeClient, IssuanceEvent, IssueHandle, RenewalScheduler,
    ResponderHandle,
};
use crate::tls::{TlsParams, TlsServerConfig};

/// Outcome of starting the challenge responders
#[derive(Debug, Default)]
pub struct ResponderReport {
    /// Responders now listening, with their bound address
    pub started: Vec<(ChallengeType, SocketAddr)>,
    /// Responders that failed to set up or bind
    pub failed: Vec<AcmeError>,
}

impl ResponderReport {
    /// Bound address of a started responder
    pub fn addr(&self, challenge: ChallengeType) -> Option<SocketAddr> {
        self.started
            .iter()
            .find(|(c, _)| *c == challenge)
            .map(|(_, addr)| *addr)
    }

    /// Whether at least one enabled responder failed
    pub fn is_degraded(&self) -> bool {
        !self.failed.is_empty()
    }

    /// Whether no responder is listening
    pub fn none_started(&self) -> bool {
        self.started.is_empty()
    }
}

struct TlsState {
    params: TlsParams,
    config: TlsServerConfig,
}

/// Certificate automation for one server instance
pub struct CertificateService {
    template: Arc<AcmeAccountTemplate>,
    challenges: ChallengeManager,
    engine: Arc<AcmeManager>,
    cache: CertificateCache,
    tls: Mutex<Option<TlsState>>,
    responders_started: AtomicBool,
    last_responder_error: Arc<Mutex<Option<AcmeError>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl CertificateService {
    /// Build the service from a validated template and an ACME capability
    pub fn new(
        template: AcmeAccountTemplate,
        protocol: Arc<dyn AcmeProtocol>,
        storage: Option<Arc<CertificateStorage>>,
    ) -> Self {
        let template = Arc::new(template);
        let shutdown = CancellationToken::new();
        let challenges = ChallengeManager::new();

        let engine = Arc::new(AcmeManager::new(
            Arc::clone(&template),
            protocol,
            challenges.clone(),
            shutdown.child_token(),
        ));

        let mut cache = CertificateCache::new(engine.clone(), template.renew_before());
        if let Some(storage) = storage {
            cache = cache.with_storage(storage);
        }

        Self {
            template,
            challenges,
            engine,
            cache,
            tls: Mutex::new(None),
            responders_started: AtomicBool::new(false),
            last_responder_error: Arc::new(Mutex::new(None)),
            tasks: Mutex::new(Vec::new()),
            shutdown,
        }
    }

    /// Build the service from configuration, using `instant-acme` for the
    /// ACME protocol and loading any stored certificates
    pub fn from_config(config: &Config) -> Result<Self, AcmeError> {
        config.validate()?;

        let template = AcmeAccountTemplate::new(config.acme.clone(), config.renewal)?;
        let storage = match &config.acme.storage {
            Some(path) => Some(Arc::new(CertificateStorage::new(path)?)),
            None => None,
        };
        let protocol = Arc::new(InstantAcmeClient::new(&config.acme, storage.clone()));

        let service = Self::new(template, protocol, storage);
        if let Some(tls) = &config.tls {
            service.configure_tls(tls)?;
        }
        service.cache.load_from_storage()?;

        Ok(service)
    }

    /// Configure server TLS from configuration.
    ///
    /// Allowed once per instance.
    pub fn configure_tls(&self, config: &TlsConfig) -> Result<TlsServerConfig, AcmeError> {
        self.configure_tls_params(TlsParams::from_config(config)?)
    }

    /// Configure server TLS from loaded parameters.
    ///
    /// Allowed once per instance.
    pub fn configure_tls_params(&self, params: TlsParams) -> Result<TlsServerConfig, AcmeError> {
        let mut tls = self.tls.lock();
        if tls.is_some() {
            return Err(AcmeError::Configuration(
                "TLS already configured for this server instance".to_string(),
            ));
        }

        let config = params.build(Arc::new(self.cache.clone()))?;
        info!(client_auth = %config.client_auth(), "TLS configured");
        *tls = Some(TlsState {
            params,
            config: config.clone(),
        });
        Ok(config)
    }

    /// The server TLS configuration; built with defaults if
    /// [`configure_tls`](Self::configure_tls) was never called
    pub fn tls_config(&self) -> Result<TlsServerConfig, AcmeError> {
        Ok(self.tls_state()?.1)
    }

    fn tls_state(&self) -> Result<(TlsParams, TlsServerConfig), AcmeError> {
        let mut tls = self.tls.lock();
        if let Some(state) = tls.as_ref() {
            return Ok((state.params.clone(), state.config.clone()));
        }

        let params = TlsParams::new(Default::default());
        let config = params.build(Arc::new(self.cache.clone()))?;
        debug!("Using default TLS parameters");
        *tls = Some(TlsState {
            params: params.clone(),
            config: config.clone(),
        });
        Ok((params, config))
    }

    /// Start the enabled challenge responders.
    ///
    /// A setup or bind failure on one responder is recorded in the report
    /// (and in [`last_responder_error`](Self::last_responder_error)) without
    /// affecting the other.
    pub async fn start_responders(&self) -> Result<ResponderReport, AcmeError> {
        if self.responders_started.swap(true, Ordering::SeqCst) {
            return Err(AcmeError::Configuration(
                "challenge responders already started".to_string(),
            ));
        }

        let mut report = ResponderReport::default();

        for challenge in self.template.enabled_challenges() {
            let addr = self.template.responder_addr(challenge);
            let started = match challenge {
                ChallengeType::Http01 => {
                    start_http_responder(addr, self.challenges.clone(), self.shutdown.child_token())
                        .await
                }
                ChallengeType::TlsAlpn01 => self.start_tls_alpn(addr).await,
            };

            match started {
                Ok(handle) => {
                    report.started.push((challenge, handle.local_addr()));
                    self.watch_responder(handle);
                }
                Err(e) => {
                    error!(challenge = %challenge, error = %e, "Challenge responder failed to start");
                    *self.last_responder_error.lock() = Some(e.clone());
                    report.failed.push(e);
                }
            }
        }

        if report.is_degraded() && !report.none_started() {
            warn!(
                started = report.started.len(),
                failed = report.failed.len(),
                "Running with a subset of challenge responders"
            );
        }

        Ok(report)
    }

    /// Non-challenge hellos on the TLS-ALPN port get the server's own
    /// certificate selection
    async fn start_tls_alpn(&self, addr: SocketAddr) -> Result<ResponderHandle, AcmeError> {
        let (params, server) = self.tls_state()?;
        let resolver = self
            .challenges
            .resolver(Some(Arc::clone(&server.server_config().cert_resolver)));
        let config = params.build_challenge(Arc::new(resolver))?;
        start_tls_alpn_responder(addr, self.challenges.clone(), config, self.shutdown.child_token())
            .await
    }

    /// Record the responder's exit error, if any, without blocking
    fn watch_responder(&self, handle: ResponderHandle) {
        let last_error = Arc::clone(&self.last_responder_error);
        let task = tokio::spawn(async move {
            let challenge = handle.challenge();
            if let Err(e) = handle.join().await {
                error!(challenge = %challenge, error = %e, "Challenge responder stopped");
                *last_error.lock() = Some(e);
            }
        });
        self.tasks.lock().push(task);
    }

    /// Most recent responder failure
    pub fn last_responder_error(&self) -> Option<AcmeError> {
        self.last_responder_error.lock().clone()
    }

    fn ensure_responders(&self) -> Result<(), AcmeError> {
        if self.responders_started.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AcmeError::Configuration(
                "challenge responders must be started before issuance".to_string(),
            ))
        }
    }

    /// A certificate for `zone`, issuing only if none usable is cached
    pub async fn obtain(&self, zone: &Zone) -> Result<Arc<Certificate>, AcmeError> {
        self.ensure_responders()?;
        self.cache.obtain(zone).await
    }

    /// Issue a certificate for `zone` and wait for the outcome
    pub async fn issue_sync(&self, zone: &Zone) -> Result<Arc<Certificate>, AcmeError> {
        self.ensure_responders()?;
        self.cache.issue(zone).await
    }

    /// Start issuance for `zone` in the background
    pub fn issue_async(&self, zone: &Zone) -> Result<IssueHandle, AcmeError> {
        self.ensure_responders()?;
        Ok(self.cache.issue_async(zone))
    }

    /// Start issuance for every zone without a certificate outside the
    /// renewal window
    pub fn manage(&self, zones: &[Zone]) -> Result<Vec<IssueHandle>, AcmeError> {
        self.ensure_responders()?;

        let now = Utc::now();
        let renew_before = chrono::Duration::from_std(self.template.renew_before())
            .unwrap_or(chrono::Duration::MAX);

        let handles = zones
            .iter()
            .filter(|zone| match self.cache.get(zone) {
                Some(cert) => cert.needs_renewal(now, renew_before),
                None => true,
            })
            .map(|zone| self.cache.issue_async(zone))
            .collect::<Vec<_>>();

        info!(
            zones = zones.len(),
            issuing = handles.len(),
            "Managing certificates"
        );
        Ok(handles)
    }

    /// Start the background renewal scheduler
    pub fn spawn_renewal(&self) {
        let scheduler = RenewalScheduler::new(self.cache.clone())
            .with_zones(self.template.zones().to_vec())
            .with_interval(self.template.check_interval());
        let task = tokio::spawn(scheduler.run(self.shutdown.child_token()));
        self.tasks.lock().push(task);
    }

    /// Issuance state transitions
    pub fn subscribe(&self) -> broadcast::Receiver<IssuanceEvent> {
        self.engine.subscribe()
    }

    pub fn template(&self) -> &AcmeAccountTemplate {
        &self.template
    }

    pub fn cache(&self) -> &CertificateCache {
        &self.cache
    }

    pub fn engine(&self) -> &Arc<AcmeManager> {
        &self.engine
    }

    pub fn challenges(&self) -> &ChallengeManager {
        &self.challenges
    }

    /// Cancel in-flight issuance, stop responders and the scheduler, and
    /// wait up to `grace` for them to exit
    pub async fn shutdown(&self, grace: Duration) {
        info!("Shutting down certificate service");
        self.shutdown.cancel();

        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        let count = tasks.len();
        let joined = tokio::time::timeout(grace, futures::future::join_all(tasks)).await;

        match joined {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        warn!(error = %e, "Background task ended abnormally");
                    }
                }
                debug!(tasks = count, "Background tasks stopped");
            }
            Err(_) => warn!(
                tasks = count,
                grace_ms = grace.as_millis() as u64,
                "Background tasks did not stop within grace period"
            ),
        }

        self.challenges.clear();
    }
}

impl std::fmt::Debug for CertificateService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateService")
            .field("zones", &self.template.zones().len())
            .field("cache", &self.cache)
            .field(
                "responders_started",
                &self.responders_started.load(Ordering::SeqCst),
            )
            .finish()
    }
}
