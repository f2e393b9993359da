//! Certificate cache
//!
//! The only owner of issued certificates. Lookups happen on every TLS
//! handshake; issuance is single-flight per zone, so any number of
//! concurrent callers for one zone share one ACME order and its outcome.
//!
//! Entries are `Arc<Certificate>` values swapped whole, so readers never
//! observe a partially replaced certificate. A replacement never lowers a
//! zone's expiry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use zonecert_common::Zone;

use super::certificate::Certificate;
use super::error::AcmeError;
use super::storage::CertificateStorage;

/// Produces certificates for the cache
#[async_trait]
pub trait Issuer: Send + Sync {
    async fn issue(&self, zone: &Zone) -> Result<Certificate, AcmeError>;
}

type SharedIssuance = Shared<BoxFuture<'static, Result<Arc<Certificate>, AcmeError>>>;

/// Concurrency-safe zone -> certificate store with single-flight issuance
#[derive(Clone)]
pub struct CertificateCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    entries: DashMap<Zone, Arc<Certificate>>,
    in_flight: Mutex<HashMap<Zone, SharedIssuance>>,
    issuer: Arc<dyn Issuer>,
    renew_before: chrono::Duration,
    storage: Option<Arc<CertificateStorage>>,
}

/// Handle to a background issuance
#[derive(Debug)]
pub struct IssueHandle {
    zone: Zone,
    task: JoinHandle<Result<Arc<Certificate>, AcmeError>>,
}

impl IssueHandle {
    pub fn zone(&self) -> &Zone {
        &self.zone
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop waiting. The issuance itself keeps running for other callers.
    pub fn abort(&self) {
        self.task.abort();
    }

    /// Wait for the issuance outcome
    pub async fn wait(self) -> Result<Arc<Certificate>, AcmeError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(AcmeError::Issuance {
                zone: self.zone.to_string(),
                message: format!("issuance task failed: {}", e),
            }),
        }
    }
}

impl CertificateCache {
    pub fn new(issuer: Arc<dyn Issuer>, renew_before: Duration) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: DashMap::new(),
                in_flight: Mutex::new(HashMap::new()),
                issuer,
                renew_before: chrono::Duration::from_std(renew_before)
                    .unwrap_or(chrono::Duration::MAX),
                storage: None,
            }),
        }
    }

    /// Persist issued certificates to `storage`.
    ///
    /// Must be called before the cache is shared.
    pub fn with_storage(self, storage: Arc<CertificateStorage>) -> Self {
        let inner = match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.storage = Some(storage);
                inner
            }
            Err(shared) => {
                warn!("Certificate cache already shared, storage not attached");
                return Self { inner: shared };
            }
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// The cached certificate for a zone, regardless of expiry
    pub fn get(&self, zone: &Zone) -> Option<Arc<Certificate>> {
        self.inner.entries.get(zone).map(|e| Arc::clone(e.value()))
    }

    /// Certificate for a TLS server name: exact zone first, then the
    /// wildcard zone covering it
    pub fn lookup(&self, server_name: &str) -> Option<Arc<Certificate>> {
        let name = server_name.trim_end_matches('.').to_ascii_lowercase();

        if let Ok(zone) = Zone::new(&name) {
            if let Some(cert) = self.get(&zone) {
                return Some(cert);
            }
        }

        let (_, parent) = name.split_once('.')?;
        let wildcard = Zone::new(&format!("*.{}", parent)).ok()?;
        self.get(&wildcard)
    }

    /// A certificate for `zone`, issuing one if none is usable.
    ///
    /// A cached certificate inside the renewal window is still returned
    /// immediately, with a renewal started in the background.
    pub async fn obtain(&self, zone: &Zone) -> Result<Arc<Certificate>, AcmeError> {
        let now = Utc::now();
        if let Some(cert) = self.get(zone) {
            if !cert.is_expired(now) {
                if cert.needs_renewal(now, self.inner.renew_before) {
                    debug!(zone = %zone, expires = %cert.expires(), "Cached certificate near expiry, renewing in background");
                    drop(self.issuance(zone, true));
                }
                trace!(zone = %zone, "Serving cached certificate");
                return Ok(cert);
            }
        }

        self.issuance(zone, false).await
    }

    /// Issue a new certificate even if a valid one is cached
    pub async fn issue(&self, zone: &Zone) -> Result<Arc<Certificate>, AcmeError> {
        self.issuance(zone, true).await
    }

    /// Start issuance in the background and return immediately.
    ///
    /// The result lands in the cache; the handle only observes it.
    pub fn issue_async(&self, zone: &Zone) -> IssueHandle {
        let shared = self.issuance(zone, true);
        IssueHandle {
            zone: zone.clone(),
            task: tokio::spawn(shared),
        }
    }

    /// Renew a zone. On failure the existing certificate stays in place.
    pub async fn renew(&self, zone: &Zone) -> Result<Arc<Certificate>, AcmeError> {
        self.issuance(zone, true)
            .await
            .map_err(|e| e.into_renewal(zone.as_str()))
    }

    /// Zones whose certificate is inside the renewal window
    pub fn zones_needing_renewal(&self) -> Vec<Zone> {
        let now = Utc::now();
        self.inner
            .entries
            .iter()
            .filter(|e| e.value().needs_renewal(now, self.inner.renew_before))
            .map(|e| e.key().clone())
            .collect()
    }

    /// Load unexpired certificates from storage; returns how many were loaded
    pub fn load_from_storage(&self) -> Result<usize, AcmeError> {
        let Some(storage) = &self.inner.storage else {
            return Ok(0);
        };

        let now = Utc::now();
        let mut loaded = 0;
        for name in storage.list_zones()? {
            let zone = match Zone::new(&name) {
                Ok(zone) => zone,
                Err(e) => {
                    warn!(zone = %name, error = %e, "Skipping stored certificate with invalid zone");
                    continue;
                }
            };
            let stored = match storage.load_certificate(zone.as_str()) {
                Ok(Some(stored)) => stored,
                Ok(None) => continue,
                Err(e) => {
                    warn!(zone = %zone, error = %e, "Skipping unreadable stored certificate");
                    continue;
                }
            };

            match Certificate::from_pem(zone.clone(), stored.cert_pem, stored.key_pem) {
                Ok(cert) if cert.is_expired(now) => {
                    debug!(zone = %zone, expires = %cert.expires(), "Skipping expired stored certificate");
                }
                Ok(cert) => {
                    self.inner.install(cert, false);
                    loaded += 1;
                }
                Err(e) => {
                    warn!(zone = %zone, error = %e, "Skipping unreadable stored certificate");
                }
            }
        }

        info!(count = loaded, "Loaded certificates from storage");
        Ok(loaded)
    }

    /// Stop serving a zone's certificate. Stored copies are kept.
    pub fn remove(&self, zone: &Zone) -> Option<Arc<Certificate>> {
        let removed = self.inner.entries.remove(zone).map(|(_, cert)| cert);
        if removed.is_some() {
            info!(zone = %zone, "Removed certificate from cache");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Whether an issuance for `zone` is in flight
    pub fn is_issuing(&self, zone: &Zone) -> bool {
        self.inner.in_flight.lock().contains_key(zone)
    }

    /// Join or start the single issuance for a zone.
    ///
    /// Without `force`, a usable cached certificate (re-checked under the
    /// in-flight lock) short-circuits issuance.
    fn issuance(&self, zone: &Zone, force: bool) -> SharedIssuance {
        let mut in_flight = self.inner.in_flight.lock();

        if let Some(existing) = in_flight.get(zone) {
            trace!(zone = %zone, "Joining in-flight issuance");
            return existing.clone();
        }

        if !force {
            if let Some(cert) = self.get(zone).filter(|c| !c.is_expired(Utc::now())) {
                return futures::future::ready(Ok(cert)).boxed().shared();
            }
        }

        debug!(zone = %zone, force, "Starting issuance");
        let inner = Arc::clone(&self.inner);
        let task_zone = zone.clone();
        let (registered_tx, registered_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            // Dropped last, including on panic or abort, after any install
            let _slot = InFlightSlot {
                inner: Arc::clone(&inner),
                zone: task_zone.clone(),
            };
            let _ = registered_rx.await;
            inner.run_issuance(&task_zone).await
        });

        let handle_zone = zone.clone();
        let shared = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(AcmeError::Issuance {
                    zone: handle_zone.to_string(),
                    message: format!("issuance task failed: {}", e),
                }),
            }
        }
        .boxed()
        .shared();

        in_flight.insert(zone.clone(), shared.clone());
        let _ = registered_tx.send(());
        shared
    }
}

/// Releases a zone's in-flight slot when its issuance task ends
struct InFlightSlot {
    inner: Arc<CacheInner>,
    zone: Zone,
}

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        self.inner.in_flight.lock().remove(&self.zone);
    }
}

impl CacheInner {
    /// The entry is visible before the caller's [`InFlightSlot`] is
    /// released, so a caller arriving in between never starts a second order
    async fn run_issuance(&self, zone: &Zone) -> Result<Arc<Certificate>, AcmeError> {
        match self.issuer.issue(zone).await {
            Ok(cert) => Ok(self.install(cert, true)),
            Err(e) => {
                warn!(zone = %zone, error = %e, "Issuance failed, cache entry unchanged");
                Err(e)
            }
        }
    }

    /// Insert a certificate unless the current one expires later.
    ///
    /// Returns the certificate now in the cache.
    fn install(&self, cert: Certificate, persist: bool) -> Arc<Certificate> {
        let zone = cert.zone().clone();
        let cert = Arc::new(cert);

        match self.entries.entry(zone.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().expires() > cert.expires() {
                    warn!(
                        zone = %zone,
                        current = %entry.get().expires(),
                        new = %cert.expires(),
                        "Keeping cached certificate with later expiry"
                    );
                    return Arc::clone(entry.get());
                }
                entry.insert(Arc::clone(&cert));
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&cert));
            }
        }

        info!(zone = %zone, expires = %cert.expires(), "Certificate cached");

        if persist {
            if let Some(storage) = &self.storage {
                if let Err(e) = storage.save_certificate(
                    zone.as_str(),
                    cert.chain_pem(),
                    cert.key_pem(),
                    cert.expires(),
                ) {
                    warn!(zone = %zone, error = %e, "Failed to persist certificate");
                }
            }
        }

        cert
    }
}

impl ResolvesServerCert for CertificateCache {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let server_name = client_hello.server_name()?;
        let cert = self.lookup(server_name)?;

        if cert.is_expired(Utc::now()) {
            debug!(server_name = %server_name, "Cached certificate expired, not serving");
            return None;
        }

        trace!(server_name = %server_name, zone = %cert.zone(), "Resolved certificate");
        Some(Arc::clone(cert.certified_key()))
    }
}

impl std::fmt::Debug for CertificateCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateCache")
            .field("entries", &self.inner.entries.len())
            .field("in_flight", &self.inner.in_flight.lock().len())
            .field("renew_before", &self.inner.renew_before)
            .field("has_storage", &self.inner.storage.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pem_pair(zone: &str, days: i64) -> (String, String) {
        let key = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::new(vec![zone.to_string()]).unwrap();
        let not_after = Utc::now() + chrono::Duration::days(days);
        params.not_after = rcgen::date_time_ymd(
            chrono::Datelike::year(&not_after),
            chrono::Datelike::month(&not_after) as u8,
            chrono::Datelike::day(&not_after) as u8,
        );
        let cert = params.self_signed(&key).unwrap();
        (cert.pem(), key.serialize_pem())
    }

    fn certificate(zone: &str, days: i64) -> Certificate {
        let (chain, key) = pem_pair(zone, days);
        Certificate::from_pem(Zone::new(zone).unwrap(), chain, key).unwrap()
    }

    struct CountingIssuer {
        calls: AtomicUsize,
        days: i64,
    }

    #[async_trait]
    impl Issuer for CountingIssuer {
        async fn issue(&self, zone: &Zone) -> Result<Certificate, AcmeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(certificate(zone.as_str(), self.days))
        }
    }

    fn cache(days: i64) -> (Arc<CountingIssuer>, CertificateCache) {
        let issuer = Arc::new(CountingIssuer {
            calls: AtomicUsize::new(0),
            days,
        });
        let cache = CertificateCache::new(issuer.clone(), Duration::from_secs(30 * 86_400));
        (issuer, cache)
    }

    #[tokio::test]
    async fn test_obtain_issues_once_then_caches() {
        let (issuer, cache) = cache(90);
        let zone = Zone::new("example.test").unwrap();

        let first = cache.obtain(&zone).await.unwrap();
        let second = cache.obtain(&zone).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
        assert!(!cache.is_issuing(&zone));
    }

    #[tokio::test]
    async fn test_lookup_falls_back_to_wildcard() {
        let (_, cache) = cache(90);
        cache.inner.install(certificate("*.example.test", 90), false);
        cache.inner.install(certificate("api.example.test", 90), false);

        let exact = cache.lookup("API.example.test.").unwrap();
        assert_eq!(exact.zone().as_str(), "api.example.test");

        let wildcard = cache.lookup("www.example.test").unwrap();
        assert_eq!(wildcard.zone().as_str(), "*.example.test");

        assert!(cache.lookup("a.b.example.test").is_none());
        assert!(cache.lookup("example.test").is_none());
    }

    #[tokio::test]
    async fn test_install_never_lowers_expiry() {
        let (_, cache) = cache(90);
        let later = cache.inner.install(certificate("example.test", 80), false);
        let kept = cache.inner.install(certificate("example.test", 40), false);

        assert!(Arc::ptr_eq(&later, &kept));
        let zone = Zone::new("example.test").unwrap();
        assert_eq!(cache.get(&zone).unwrap().expires(), later.expires());
    }

    #[tokio::test]
    async fn test_zones_needing_renewal() {
        let (_, cache) = cache(90);
        cache.inner.install(certificate("old.example.test", 10), false);
        cache.inner.install(certificate("new.example.test", 80), false);

        let zones = cache.zones_needing_renewal();
        assert_eq!(zones, vec![Zone::new("old.example.test").unwrap()]);
    }

    #[tokio::test]
    async fn test_remove() {
        let (_, cache) = cache(90);
        let zone = Zone::new("example.test").unwrap();
        cache.obtain(&zone).await.unwrap();

        assert!(cache.remove(&zone).is_some());
        assert!(cache.get(&zone).is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_storage_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = Arc::new(CertificateStorage::new(dir.path()).unwrap());
        let zone = Zone::new("example.test").unwrap();

        let (_, first) = cache(90);
        let first = first.with_storage(Arc::clone(&storage));
        let issued = first.obtain(&zone).await.unwrap();

        let (issuer, reloaded) = cache(90);
        let reloaded = reloaded.with_storage(storage);
        assert_eq!(reloaded.load_from_storage().unwrap(), 1);

        let served = reloaded.obtain(&zone).await.unwrap();
        assert_eq!(served.expires(), issued.expires());
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 0);
    }

    struct PanicsOnce {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Issuer for PanicsOnce {
        async fn issue(&self, zone: &Zone) -> Result<Certificate, AcmeError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("issuer bug");
            }
            Ok(certificate(zone.as_str(), 90))
        }
    }

    #[tokio::test]
    async fn test_panicking_issuer_does_not_poison_zone() {
        let issuer = Arc::new(PanicsOnce {
            calls: AtomicUsize::new(0),
        });
        let cache = CertificateCache::new(issuer.clone(), Duration::from_secs(30 * 86_400));
        let zone = Zone::new("example.test").unwrap();

        let err = cache.obtain(&zone).await.unwrap_err();
        assert!(matches!(err, AcmeError::Issuance { .. }), "{err}");
        assert!(!cache.is_issuing(&zone));

        cache.obtain(&zone).await.unwrap();
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unreadable_stored_zone_is_skipped() {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = Arc::new(CertificateStorage::new(dir.path()).unwrap());

        let (chain, key) = pem_pair("good.example.test", 90);
        let expires = Utc::now() + chrono::Duration::days(90);
        storage
            .save_certificate("good.example.test", &chain, &key, expires)
            .unwrap();

        // Certificate without its key or metadata
        let bad = dir.path().join("zones/bad.example.test");
        std::fs::create_dir_all(&bad).unwrap();
        std::fs::write(bad.join("cert.pem"), chain).unwrap();

        let (_, cache) = cache(90);
        let cache = cache.with_storage(storage);
        assert_eq!(cache.load_from_storage().unwrap(), 1);
        assert!(cache.lookup("good.example.test").is_some());
        assert!(cache.lookup("bad.example.test").is_none());
    }
}
