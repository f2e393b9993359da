//! Issued certificate material

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rustls::sign::CertifiedKey;
use rustls::InconsistentKeys;
use x509_parser::prelude::*;

use zonecert_common::Zone;

use super::error::AcmeError;
use crate::tls::{certified_key_from_pem, crypto_provider, parse_certificates};

/// A signed certificate chain with its private key.
///
/// Never mutated after construction; renewal produces a new value.
#[derive(Clone)]
pub struct Certificate {
    zone: Zone,
    chain_pem: String,
    key_pem: String,
    issued: DateTime<Utc>,
    expires: DateTime<Utc>,
    certified_key: Arc<CertifiedKey>,
}

impl Certificate {
    /// Parse a PEM chain and key.
    ///
    /// Fails if the chain is empty or malformed, the leaf does not name
    /// `zone`, or the key does not load or does not belong to the leaf.
    pub fn from_pem(
        zone: Zone,
        chain_pem: impl Into<String>,
        key_pem: impl Into<String>,
    ) -> Result<Self, AcmeError> {
        let chain_pem = chain_pem.into();
        let key_pem = key_pem.into();

        let certs = parse_certificates(&chain_pem)
            .map_err(|e| AcmeError::CertificateParse(e.to_string()))?;
        let (issued, expires) = inspect_leaf(&certs[0], &zone)?;

        let certified_key = certified_key_from_pem(&chain_pem, &key_pem, &crypto_provider())
            .map_err(|e| AcmeError::CertificateParse(e.to_string()))?;
        match certified_key.keys_match() {
            Ok(()) | Err(rustls::Error::InconsistentKeys(InconsistentKeys::Unknown)) => {}
            Err(e) => {
                return Err(AcmeError::CertificateParse(format!(
                    "private key does not match the leaf certificate: {}",
                    e
                )))
            }
        }

        Ok(Self {
            zone,
            chain_pem,
            key_pem,
            issued,
            expires,
            certified_key: Arc::new(certified_key),
        })
    }

    pub fn zone(&self) -> &Zone {
        &self.zone
    }

    /// PEM chain, leaf first
    pub fn chain_pem(&self) -> &str {
        &self.chain_pem
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// Leaf `notBefore`
    pub fn issued(&self) -> DateTime<Utc> {
        self.issued
    }

    /// Leaf `notAfter`
    pub fn expires(&self) -> DateTime<Utc> {
        self.expires
    }

    /// The rustls signing material served during handshakes
    pub fn certified_key(&self) -> &Arc<CertifiedKey> {
        &self.certified_key
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires <= now
    }

    /// Whether expiry falls within `renew_before` of `now`
    pub fn needs_renewal(&self, now: DateTime<Utc>, renew_before: chrono::Duration) -> bool {
        self.expires - now <= renew_before
    }
}

impl std::fmt::Debug for Certificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Certificate")
            .field("zone", &self.zone)
            .field("issued", &self.issued)
            .field("expires", &self.expires)
            .field("chain_len", &self.certified_key.cert.len())
            .finish()
    }
}

/// Validity period of the leaf, which must list `zone` as a DNS name
fn inspect_leaf(der: &[u8], zone: &Zone) -> Result<(DateTime<Utc>, DateTime<Utc>), AcmeError> {
    let (_, cert) = parse_x509_certificate(der)
        .map_err(|e| AcmeError::CertificateParse(format!("invalid leaf certificate: {}", e)))?;

    let names = cert
        .subject_alternative_name()
        .map_err(|e| AcmeError::CertificateParse(format!("invalid subjectAltName: {}", e)))?;
    let covers_zone = names.is_some_and(|san| {
        san.value.general_names.iter().any(|name| {
            matches!(name, GeneralName::DNSName(dns) if dns.eq_ignore_ascii_case(zone.as_str()))
        })
    });
    if !covers_zone {
        return Err(AcmeError::CertificateParse(format!(
            "leaf certificate does not cover {}",
            zone
        )));
    }

    let validity = cert.validity();
    let to_utc = |ts: i64| {
        DateTime::<Utc>::from_timestamp(ts, 0)
            .ok_or_else(|| AcmeError::CertificateParse(format!("timestamp out of range: {}", ts)))
    };

    Ok((
        to_utc(validity.not_before.timestamp())?,
        to_utc(validity.not_after.timestamp())?,
    ))
}
