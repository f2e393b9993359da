//! Background certificate renewal scheduler
//!
//! Periodically scans the cache and renews certificates inside the renewal
//! window. Managed zones with no cached certificate (for example after a
//! failed first issuance) are retried on the same scan.

use std::time::Duration;

use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use zonecert_common::Zone;

use super::cache::CertificateCache;

/// Default check interval (12 hours)
const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(12 * 3600);

/// Minimum check interval
const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Delay before the first scan
const INITIAL_DELAY: Duration = Duration::from_secs(10);

/// Outcome of one renewal scan
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RenewalReport {
    pub renewed: Vec<Zone>,
    pub failed: Vec<Zone>,
}

impl RenewalReport {
    pub fn is_empty(&self) -> bool {
        self.renewed.is_empty() && self.failed.is_empty()
    }
}

/// Background certificate renewal scheduler
///
/// Runs as a background task; a failed renewal keeps the cached
/// certificate and is retried on the next scan.
pub struct RenewalScheduler {
    cache: CertificateCache,
    zones: Vec<Zone>,
    check_interval: Duration,
    initial_delay: Duration,
}

impl RenewalScheduler {
    pub fn new(cache: CertificateCache) -> Self {
        Self {
            cache,
            zones: Vec::new(),
            check_interval: DEFAULT_CHECK_INTERVAL,
            initial_delay: INITIAL_DELAY,
        }
    }

    /// Zones that must always have a certificate
    pub fn with_zones(mut self, zones: Vec<Zone>) -> Self {
        self.zones = zones;
        self
    }

    /// Set the check interval
    ///
    /// The interval is clamped to a minimum of one minute to avoid
    /// excessive polling.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval.max(MIN_CHECK_INTERVAL);
        self
    }

    /// Set the delay before the first scan
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// Run the renewal loop until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            check_interval_secs = self.check_interval.as_secs(),
            "Starting certificate renewal scheduler"
        );

        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Renewal scheduler cancelled before first check");
                return;
            }
            _ = tokio::time::sleep(self.initial_delay) => {}
        }

        let mut ticker = interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Renewal scheduler stopped");
                    return;
                }
                _ = ticker.tick() => {
                    debug!("Running scheduled certificate renewal check");
                    self.check_renewals().await;
                }
            }
        }
    }

    /// Renew every cached certificate inside the renewal window and issue
    /// for managed zones that have none
    pub async fn check_renewals(&self) -> RenewalReport {
        let mut zones = self.cache.zones_needing_renewal();
        for zone in &self.zones {
            if self.cache.get(zone).is_none() && !zones.contains(zone) {
                zones.push(zone.clone());
            }
        }
        let mut report = RenewalReport::default();

        if zones.is_empty() {
            debug!(cached = self.cache.len(), "No certificates need renewal");
            return report;
        }

        info!(zone_count = zones.len(), "Renewing certificates");

        for zone in zones {
            let start = Instant::now();
            match self.cache.renew(&zone).await {
                Ok(cert) => {
                    info!(
                        zone = %zone,
                        expires = %cert.expires(),
                        elapsed_secs = start.elapsed().as_secs(),
                        "Certificate renewed"
                    );
                    report.renewed.push(zone);
                }
                Err(e) => {
                    // The cached certificate stays in service
                    error!(zone = %zone, error = %e, "Certificate renewal failed");
                    report.failed.push(zone);
                }
            }
        }

        report
    }
}

impl std::fmt::Debug for RenewalScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewalScheduler")
            .field("check_interval", &self.check_interval)
            .field("cached", &self.cache.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;

    use crate::acme::{AcmeError, Certificate, Issuer};

    struct FailingIssuer;

    #[async_trait]
    impl Issuer for FailingIssuer {
        async fn issue(&self, zone: &Zone) -> Result<Certificate, AcmeError> {
            Err(AcmeError::Protocol(format!("no CA for {}", zone)))
        }
    }

    #[test]
    fn test_interval_is_clamped() {
        let cache = CertificateCache::new(Arc::new(FailingIssuer), Duration::from_secs(86_400));
        let scheduler = RenewalScheduler::new(cache).with_interval(Duration::from_secs(1));
        assert_eq!(scheduler.check_interval(), MIN_CHECK_INTERVAL);
    }

    #[tokio::test]
    async fn test_empty_cache_reports_nothing() {
        let cache = CertificateCache::new(Arc::new(FailingIssuer), Duration::from_secs(86_400));
        let report = RenewalScheduler::new(cache).check_renewals().await;
        assert!(report.is_empty());
    }

    #[tokio::test]
    async fn test_missing_managed_zone_is_retried() {
        let cache = CertificateCache::new(Arc::new(FailingIssuer), Duration::from_secs(86_400));
        let zone = Zone::new("example.test").unwrap();

        let report = RenewalScheduler::new(cache)
            .with_zones(vec![zone.clone()])
            .check_renewals()
            .await;
        assert_eq!(report.failed, vec![zone]);
        assert!(report.renewed.is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancellation() {
        let cache = CertificateCache::new(Arc::new(FailingIssuer), Duration::from_secs(86_400));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(
            RenewalScheduler::new(cache)
                .with_initial_delay(Duration::from_secs(3600))
                .run(shutdown.clone()),
        );

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
