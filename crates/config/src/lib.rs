//! Configuration for zonecert.
//!
//! Configuration is written in KDL:
//!
//! ```kdl
//! tls "/etc/zonecert/fallback.crt" "/etc/zonecert/fallback.key" "/etc/zonecert/ca.crt" {
//!     client_auth "verify_if_given"
//! }
//!
//! acme {
//!     email "admin@example.com"
//!     zones "example.com" "www.example.com"
//!     challenge http port 80
//!     challenge tlsalpn port 443
//!     storage "/var/lib/zonecert"
//! }
//!
//! renewal {
//!     renew-before-days 30
//! }
//! ```
//!
//! Only one `tls` block is allowed per server instance.

pub mod acme;
pub mod kdl;
pub mod tls;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use zonecert_common::{UnknownToken, Zone, ZoneError};

pub use acme::{AcmeConfig, ChallengeConfig, ChallengesConfig, RenewalConfig};
pub use tls::TlsConfig;

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid KDL: {0}")]
    Parse(String),

    #[error("TLS already configured for this server instance")]
    DuplicateTls,

    #[error("'{0}' block may only appear once")]
    DuplicateBlock(&'static str),

    #[error("unknown option '{option}' in {block} block")]
    UnknownOption { block: &'static str, option: String },

    #[error("unexpected term: {0}: term should only be challenge, zones, email, directory, staging, bind-address or storage")]
    UnexpectedTerm(String),

    #[error("'{directive}' expects {expected} argument(s), found {found}")]
    ArgCount {
        directive: String,
        expected: &'static str,
        found: usize,
    },

    #[error("invalid value for '{directive}': {message}")]
    InvalidValue { directive: String, message: String },

    #[error("unexpected challenge {0}: challenge should only be tlsalpn or http")]
    UnknownChallenge(String),

    #[error("{challenge} port is not an int in 1..=65535: {value}")]
    InvalidPort { challenge: String, value: String },

    #[error(transparent)]
    UnknownToken(#[from] UnknownToken),

    #[error(transparent)]
    InvalidZone(#[from] ZoneError),

    #[error("at least one ACME challenge type must be enabled")]
    NoChallengeEnabled,

    #[error("client auth mode '{0}' requires a trust root (CA) file")]
    MissingTrustRoots(zonecert_common::ClientAuthMode),

    #[error("certificate and key must be configured together")]
    IncompleteKeyPair,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive (overridden by `RUST_LOG`)
    pub level: String,
    pub format: LogFormat,
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            ansi: true,
        }
    }
}

/// Complete configuration for one server instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub tls: Option<TlsConfig>,
    pub acme: AcmeConfig,
    pub renewal: RenewalConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a KDL file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config = Self::from_kdl(&source)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Parse configuration from KDL source
    pub fn from_kdl(source: &str) -> Result<Self, ConfigError> {
        kdl::parse_document(source)
    }

    /// Validated zones from the ACME block
    pub fn zones(&self) -> Result<Vec<Zone>, ConfigError> {
        self.acme
            .zones
            .iter()
            .map(|z| Zone::new(z).map_err(ConfigError::from))
            .collect()
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.zones()?;

        if !self.acme.challenges.any_enabled() {
            return Err(ConfigError::NoChallengeEnabled);
        }

        if let Some(tls) = &self.tls {
            if tls.cert_file.is_some() != tls.key_file.is_some() {
                return Err(ConfigError::IncompleteKeyPair);
            }
            if tls.client_auth.requires_trust_roots() && tls.ca_file.is_none() {
                return Err(ConfigError::MissingTrustRoots(tls.client_auth));
            }
        }

        debug!(
            zones = self.acme.zones.len(),
            challenges = ?self.acme.challenges.enabled_types(),
            "Configuration validated"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zonecert_common::{ChallengeType, ClientAuthMode};

    #[test]
    fn test_parse_full_document() {
        let config = Config::from_kdl(
            r#"
            tls "/certs/server.crt" "/certs/server.key" "/certs/ca.crt" {
                client_auth "require_and_verify"
            }
            acme {
                email "admin@example.test"
                zones "example.test" "www.example.test"
                challenge http port 8080
                challenge tlsalpn port 5001
                bind-address "127.0.0.1"
                storage "/var/lib/zonecert"
            }
            renewal {
                renew-before-days 20
                check-interval-secs 600
            }
            logging {
                level "debug"
                format "json"
            }
            "#,
        )
        .unwrap();

        let tls = config.tls.as_ref().unwrap();
        assert_eq!(tls.client_auth, ClientAuthMode::RequireAndVerify);
        assert_eq!(tls.ca_file.as_deref(), Some(Path::new("/certs/ca.crt")));

        assert_eq!(config.acme.email.as_deref(), Some("admin@example.test"));
        assert_eq!(config.acme.zones.len(), 2);
        assert_eq!(config.acme.challenges.http, ChallengeConfig::enabled(8080));
        assert_eq!(config.acme.challenges.tls_alpn, ChallengeConfig::enabled(5001));
        assert_eq!(config.acme.bind_address.to_string(), "127.0.0.1");

        assert_eq!(config.renewal.renew_before_days, 20);
        assert_eq!(config.renewal.check_interval_secs, 600);
        assert_eq!(config.renewal.issuance_timeout_secs, 300);
        assert_eq!(config.logging.format, LogFormat::Json);

        config.validate().unwrap();
    }

    #[test]
    fn test_listed_challenges_disable_the_rest() {
        let config = Config::from_kdl(
            r#"
            acme {
                challenge tlsalpn port 5001
            }
            "#,
        )
        .unwrap();

        assert_eq!(
            config.acme.challenges.enabled_types(),
            vec![ChallengeType::TlsAlpn01]
        );
        assert!(!config.acme.challenges.http.enabled);
    }

    #[test]
    fn test_no_challenges_enables_defaults() {
        let config = Config::from_kdl("acme { zones \"example.test\" }").unwrap();
        assert!(config.acme.challenges.http.enabled);
        assert!(config.acme.challenges.tls_alpn.enabled);
    }

    #[test]
    fn test_duplicate_tls_block_is_rejected() {
        let err = Config::from_kdl(
            r#"
            tls "a.crt" "a.key"
            tls "b.crt" "b.key"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateTls));
        assert_eq!(
            err.to_string(),
            "TLS already configured for this server instance"
        );
    }

    #[test]
    fn test_tls_argument_count() {
        let err = Config::from_kdl(r#"tls "only-cert.crt""#).unwrap_err();
        assert!(matches!(err, ConfigError::ArgCount { found: 1, .. }));
    }

    #[test]
    fn test_tls_requires_certificate_and_key() {
        let err = Config::from_kdl(
            r#"
            tls {
                client_auth "request"
            }
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ArgCount { found: 0, .. }));

        let err = Config::from_kdl(r#"tls "a.crt" "a.key" "ca.crt" "extra""#).unwrap_err();
        assert!(matches!(err, ConfigError::ArgCount { found: 4, .. }));
    }

    #[test]
    fn test_unknown_client_auth_mode() {
        let err = Config::from_kdl(
            r#"
            tls "a.crt" "a.key" {
                client_auth "sometimes"
            }
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("sometimes"));
    }

    #[test]
    fn test_unknown_tls_option() {
        let err = Config::from_kdl(
            r#"
            tls "a.crt" "a.key" {
                ciphers "all"
            }
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownOption { block: "tls", .. }));
    }

    #[test]
    fn test_unknown_challenge_type() {
        let err = Config::from_kdl("acme { challenge dns port 53 }").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownChallenge(ref c) if c == "dns"));
    }

    #[test]
    fn test_challenge_port_must_be_integer() {
        let err = Config::from_kdl("acme { challenge http port eighty }").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPort { .. }));

        let err = Config::from_kdl("acme { challenge http port 70000 }").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPort { .. }));

        // A quoted number still parses as a port
        let config = Config::from_kdl(r#"acme { challenge http port "8080" }"#).unwrap();
        assert_eq!(config.acme.challenges.http.port, 8080);
    }

    #[test]
    fn test_challenge_requires_port_keyword() {
        let err = Config::from_kdl("acme { challenge http 80 }").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_unexpected_acme_term() {
        let err = Config::from_kdl(r#"acme { wildcard "yes" }"#).unwrap_err();
        assert!(matches!(err, ConfigError::UnexpectedTerm(ref t) if t == "wildcard"));
    }

    #[test]
    fn test_validate_requires_trust_roots_for_verification() {
        let config = Config::from_kdl(
            r#"
            tls "a.crt" "a.key" {
                client_auth "verify_if_given"
            }
            "#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingTrustRoots(ClientAuthMode::VerifyIfGiven))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_zone() {
        let config = Config::from_kdl(r#"acme { zones "not a zone" }"#).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidZone(_))));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "acme {{ zones \"example.test\" }}").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.zones().unwrap()[0].as_str(), "example.test");

        let err = Config::from_file("/nonexistent/zonecert.kdl").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
