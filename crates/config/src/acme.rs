//! ACME and renewal configuration types.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use zonecert_common::ChallengeType;

/// Let's Encrypt production directory URL
pub const LETSENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
/// Let's Encrypt staging directory URL
pub const LETSENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Default port of the HTTP-01 responder
pub const DEFAULT_HTTP_PORT: u16 = 80;
/// Default port of the TLS-ALPN-01 responder
pub const DEFAULT_TLS_ALPN_PORT: u16 = 443;

/// Settings for one challenge type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeConfig {
    /// Whether the responder for this challenge type is started
    pub enabled: bool,
    /// Port the responder listens on (ignored when disabled)
    pub port: u16,
}

impl ChallengeConfig {
    pub fn enabled(port: u16) -> Self {
        Self {
            enabled: true,
            port,
        }
    }

    pub fn disabled(port: u16) -> Self {
        Self {
            enabled: false,
            port,
        }
    }
}

/// Both challenge configurations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengesConfig {
    pub http: ChallengeConfig,
    pub tls_alpn: ChallengeConfig,
}

impl ChallengesConfig {
    /// Configuration for a challenge type
    pub fn get(&self, challenge: ChallengeType) -> &ChallengeConfig {
        match challenge {
            ChallengeType::Http01 => &self.http,
            ChallengeType::TlsAlpn01 => &self.tls_alpn,
        }
    }

    /// Mutable configuration for a challenge type
    pub fn get_mut(&mut self, challenge: ChallengeType) -> &mut ChallengeConfig {
        match challenge {
            ChallengeType::Http01 => &mut self.http,
            ChallengeType::TlsAlpn01 => &mut self.tls_alpn,
        }
    }

    /// Enabled challenge types in preference order
    pub fn enabled_types(&self) -> Vec<ChallengeType> {
        ChallengeType::PREFERENCE
            .into_iter()
            .filter(|c| self.get(*c).enabled)
            .collect()
    }

    /// Whether any challenge type is enabled
    pub fn any_enabled(&self) -> bool {
        self.http.enabled || self.tls_alpn.enabled
    }
}

impl Default for ChallengesConfig {
    /// Both challenge types enabled on their standard ports
    fn default() -> Self {
        Self {
            http: ChallengeConfig::enabled(DEFAULT_HTTP_PORT),
            tls_alpn: ChallengeConfig::enabled(DEFAULT_TLS_ALPN_PORT),
        }
    }
}

/// ACME account and issuance configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcmeConfig {
    /// Contact email for the ACME account
    pub email: Option<String>,
    /// ACME directory URL
    pub directory: String,
    /// Zones to manage
    pub zones: Vec<String>,
    /// Challenge responder settings
    pub challenges: ChallengesConfig,
    /// Address the challenge responders bind to
    pub bind_address: IpAddr,
    /// Directory for persisted certificates and account credentials
    pub storage: Option<PathBuf>,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            email: None,
            directory: LETSENCRYPT_PRODUCTION.to_string(),
            zones: Vec::new(),
            challenges: ChallengesConfig::default(),
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            storage: None,
        }
    }
}

/// Renewal and issuance timing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenewalConfig {
    /// Renew when a certificate expires within this many days
    pub renew_before_days: u32,
    /// Interval between renewal scans
    pub check_interval_secs: u64,
    /// Upper bound for a single issuance attempt
    pub issuance_timeout_secs: u64,
    /// Interval between ACME order status polls
    pub poll_interval_ms: u64,
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            renew_before_days: 30,
            check_interval_secs: 12 * 3600,
            issuance_timeout_secs: 300,
            poll_interval_ms: 2000,
        }
    }
}
