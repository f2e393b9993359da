//! ACME error types

use std::io;
use std::time::Duration;
use thiserror::Error;

use zonecert_common::{ChallengeType, ZoneError};
use zonecert_config::ConfigError;

use crate::tls::TlsError;

/// Errors that can occur while managing certificates.
///
/// The variants fall into the recovery classes the service relies on:
/// configuration errors abort startup, responder bind errors degrade a
/// single challenge type, and issuance, renewal and timeout errors are
/// retried on the next `obtain` or renewal scan.
///
/// Cloneable so a single issuance failure can be handed to every caller
/// waiting on it.
#[derive(Debug, Clone, Error)]
pub enum AcmeError {
    /// Invalid or duplicate TLS/ACME configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Zone name failed validation
    #[error(transparent)]
    InvalidZone(#[from] ZoneError),

    /// A challenge listener failed to bind
    #[error("failed to bind {challenge} responder on {address}: {message}")]
    ResponderBind {
        challenge: ChallengeType,
        address: String,
        message: String,
    },

    /// A challenge listener stopped after binding
    #[error("{challenge} responder failed: {message}")]
    ResponderFailed {
        challenge: ChallengeType,
        message: String,
    },

    /// Failed to create or load the ACME account
    #[error("failed to create ACME account: {0}")]
    AccountCreation(String),

    /// ACME order or validation failure
    #[error("certificate issuance for '{zone}' failed: {message}")]
    Issuance { zone: String, message: String },

    /// Background renewal failed; the existing certificate stays in service
    #[error("renewal of '{zone}' failed: {message}")]
    Renewal { zone: String, message: String },

    /// Issuance exceeded the bounded wait
    #[error("issuance for '{zone}' timed out after {elapsed:?}")]
    Timeout { zone: String, elapsed: Duration },

    /// Issuance was cancelled by shutdown
    #[error("issuance for '{0}' was cancelled")]
    Cancelled(String),

    /// ACME protocol error from the client
    #[error("ACME protocol error: {0}")]
    Protocol(String),

    /// Certificate material could not be parsed
    #[error("failed to parse certificate: {0}")]
    CertificateParse(String),

    /// Storage operation failed
    #[error("storage error: {0}")]
    Storage(String),
}

impl AcmeError {
    /// Whether retrying later can succeed without operator action
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            AcmeError::Configuration(_) | AcmeError::InvalidZone(_) | AcmeError::ResponderBind { .. }
        )
    }

    /// Classify a failure inside an issuance attempt.
    ///
    /// Protocol, parse and storage failures become [`AcmeError::Issuance`];
    /// configuration, timeout and cancellation errors keep their kind.
    pub(crate) fn into_issuance(self, zone: &str) -> AcmeError {
        match self {
            AcmeError::Configuration(_)
            | AcmeError::InvalidZone(_)
            | AcmeError::Issuance { .. }
            | AcmeError::Timeout { .. }
            | AcmeError::Cancelled(_) => self,
            other => AcmeError::Issuance {
                zone: zone.to_string(),
                message: other.to_string(),
            },
        }
    }

    /// Wrap a failure observed by the renewal scheduler
    pub(crate) fn into_renewal(self, zone: &str) -> AcmeError {
        AcmeError::Renewal {
            zone: zone.to_string(),
            message: self.to_string(),
        }
    }
}

/// Errors specific to certificate storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// IO error during file operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Failed to serialize/deserialize data
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

impl From<StorageError> for AcmeError {
    fn from(e: StorageError) -> Self {
        AcmeError::Storage(e.to_string())
    }
}

impl From<instant_acme::Error> for AcmeError {
    fn from(e: instant_acme::Error) -> Self {
        AcmeError::Protocol(e.to_string())
    }
}

impl From<ConfigError> for AcmeError {
    fn from(e: ConfigError) -> Self {
        AcmeError::Configuration(e.to_string())
    }
}

impl From<TlsError> for AcmeError {
    fn from(e: TlsError) -> Self {
        AcmeError::Configuration(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_issuance_wraps_protocol_errors() {
        let err = AcmeError::CertificateParse("bad PEM".to_string()).into_issuance("example.test");
        match err {
            AcmeError::Issuance { zone, message } => {
                assert_eq!(zone, "example.test");
                assert!(message.contains("bad PEM"));
            }
            other => panic!("expected Issuance, got {other:?}"),
        }
    }

    #[test]
    fn test_into_issuance_keeps_timeouts_and_config_errors() {
        let timeout = AcmeError::Timeout {
            zone: "example.test".to_string(),
            elapsed: Duration::from_secs(5),
        };
        assert!(matches!(timeout.into_issuance("example.test"), AcmeError::Timeout { .. }));

        let config = AcmeError::Configuration("no responder".to_string());
        assert!(matches!(config.into_issuance("example.test"), AcmeError::Configuration(_)));
    }

    #[test]
    fn test_recoverability() {
        assert!(!AcmeError::Configuration("x".into()).is_recoverable());
        assert!(AcmeError::Protocol("x".into()).is_recoverable());
        assert!(AcmeError::Timeout {
            zone: "a.test".into(),
            elapsed: Duration::from_secs(1)
        }
        .is_recoverable());
    }
}
