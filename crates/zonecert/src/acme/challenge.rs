//! ACME challenge material
//!
//! Holds what the responders serve while a validation is in progress:
//! HTTP-01 key authorizations under `/.well-known/acme-challenge/<token>`
//! and TLS-ALPN-01 certificates selected when a client offers
//! `acme-tls/1`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use rcgen::{CertificateParams, CustomExtension, KeyPair};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use sha2::{Digest, Sha256};
use tracing::{debug, trace};

use zonecert_common::ChallengeType;

use super::error::AcmeError;
use crate::tls::{crypto_provider, ACME_TLS_ALPN_PROTOCOL};

/// HTTP-01 challenge path prefix
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Shared store of pending challenge responses.
///
/// Clones share state, so the engine and both responders see the same
/// material.
#[derive(Debug, Clone, Default)]
pub struct ChallengeManager {
    /// HTTP-01 token -> key authorization
    challenges: Arc<DashMap<String, String>>,
    /// TLS-ALPN-01 identifier -> challenge certificate
    alpn_certs: Arc<DashMap<String, Arc<CertifiedKey>>>,
    http_listening: Arc<AtomicBool>,
    tls_alpn_listening: Arc<AtomicBool>,
}

impl ChallengeManager {
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // HTTP-01
    // =========================================================================

    /// Register a pending HTTP-01 challenge
    pub fn add_challenge(&self, token: &str, key_authorization: &str) {
        debug!(token = %token, "Registering ACME HTTP-01 challenge");
        self.challenges
            .insert(token.to_string(), key_authorization.to_string());
    }

    /// Remove a completed or abandoned HTTP-01 challenge
    pub fn remove_challenge(&self, token: &str) {
        if self.challenges.remove(token).is_some() {
            debug!(token = %token, "Removed ACME HTTP-01 challenge");
        }
    }

    /// Key authorization for a token, if registered
    pub fn get_response(&self, token: &str) -> Option<String> {
        let result = self.challenges.get(token).map(|v| v.clone());
        trace!(token = %token, found = result.is_some(), "ACME challenge token lookup");
        result
    }

    /// Returns the token if `path` is an ACME challenge path
    pub fn extract_token(path: &str) -> Option<&str> {
        path.strip_prefix(ACME_CHALLENGE_PREFIX)
    }

    // =========================================================================
    // TLS-ALPN-01
    // =========================================================================

    /// Register a TLS-ALPN-01 challenge certificate for an identifier
    pub fn add_alpn_certificate(&self, identifier: &str, key: Arc<CertifiedKey>) {
        debug!(identifier = %identifier, "Registering ACME TLS-ALPN-01 certificate");
        self.alpn_certs.insert(identifier.to_ascii_lowercase(), key);
    }

    pub fn remove_alpn_certificate(&self, identifier: &str) {
        if self
            .alpn_certs
            .remove(&identifier.to_ascii_lowercase())
            .is_some()
        {
            debug!(identifier = %identifier, "Removed ACME TLS-ALPN-01 certificate");
        }
    }

    /// Challenge certificate for a TLS server name
    pub fn alpn_certificate(&self, server_name: &str) -> Option<Arc<CertifiedKey>> {
        self.alpn_certs
            .get(&server_name.to_ascii_lowercase())
            .map(|v| Arc::clone(v.value()))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Install the material for one challenge.
    ///
    /// The returned guard removes it again when dropped, which covers
    /// success, failure, timeout and cancellation alike.
    pub fn prepare(
        &self,
        challenge: ChallengeType,
        identifier: &str,
        token: &str,
        key_authorization: &str,
    ) -> Result<ChallengeGuard, AcmeError> {
        let slot = match challenge {
            ChallengeType::Http01 => {
                self.add_challenge(token, key_authorization);
                ChallengeSlot::Http(token.to_string())
            }
            ChallengeType::TlsAlpn01 => {
                let key = tls_alpn_certificate(identifier, key_authorization)?;
                self.add_alpn_certificate(identifier, Arc::new(key));
                ChallengeSlot::TlsAlpn(identifier.to_string())
            }
        };

        Ok(ChallengeGuard {
            manager: self.clone(),
            slot,
        })
    }

    /// Record whether the responder for `challenge` is accepting connections
    pub fn set_listening(&self, challenge: ChallengeType, listening: bool) {
        self.listening_flag(challenge)
            .store(listening, Ordering::SeqCst);
    }

    pub fn is_listening(&self, challenge: ChallengeType) -> bool {
        self.listening_flag(challenge).load(Ordering::SeqCst)
    }

    fn listening_flag(&self, challenge: ChallengeType) -> &AtomicBool {
        match challenge {
            ChallengeType::Http01 => &self.http_listening,
            ChallengeType::TlsAlpn01 => &self.tls_alpn_listening,
        }
    }

    /// Number of pending challenges of both types
    pub fn pending_count(&self) -> usize {
        self.challenges.len() + self.alpn_certs.len()
    }

    /// Drop all pending challenge material
    pub fn clear(&self) {
        let count = self.pending_count();
        self.challenges.clear();
        self.alpn_certs.clear();
        if count > 0 {
            debug!(cleared = count, "Cleared all pending ACME challenges");
        }
    }

    /// Resolver serving challenge certificates to `acme-tls/1` clients and
    /// delegating everything else to `fallback`
    pub fn resolver(&self, fallback: Option<Arc<dyn ResolvesServerCert>>) -> ChallengeResolver {
        ChallengeResolver {
            manager: self.clone(),
            fallback,
        }
    }
}

#[derive(Debug)]
enum ChallengeSlot {
    Http(String),
    TlsAlpn(String),
}

/// Removes challenge material on drop
#[derive(Debug)]
#[must_use = "challenge material is removed when the guard is dropped"]
pub struct ChallengeGuard {
    manager: ChallengeManager,
    slot: ChallengeSlot,
}

impl Drop for ChallengeGuard {
    fn drop(&mut self) {
        match &self.slot {
            ChallengeSlot::Http(token) => self.manager.remove_challenge(token),
            ChallengeSlot::TlsAlpn(identifier) => self.manager.remove_alpn_certificate(identifier),
        }
    }
}

/// Certificate resolver for the TLS-ALPN-01 responder
#[derive(Debug)]
pub struct ChallengeResolver {
    manager: ChallengeManager,
    fallback: Option<Arc<dyn ResolvesServerCert>>,
}

impl ResolvesServerCert for ChallengeResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let wants_challenge = client_hello
            .alpn()
            .map(|mut protocols| protocols.any(|p| p == ACME_TLS_ALPN_PROTOCOL))
            .unwrap_or(false);

        if wants_challenge {
            let server_name = client_hello.server_name()?;
            let key = self.manager.alpn_certificate(server_name);
            trace!(
                server_name = %server_name,
                found = key.is_some(),
                "TLS-ALPN-01 certificate lookup"
            );
            return key;
        }

        self.fallback.as_ref()?.resolve(client_hello)
    }
}

/// Build the self-signed TLS-ALPN-01 certificate for an identifier.
///
/// The certificate carries the critical `acmeIdentifier` extension with
/// the SHA-256 digest of the key authorization.
pub fn tls_alpn_certificate(
    identifier: &str,
    key_authorization: &str,
) -> Result<CertifiedKey, AcmeError> {
    let digest = Sha256::digest(key_authorization.as_bytes());

    let mut params = CertificateParams::new(vec![identifier.to_string()])
        .map_err(|e| AcmeError::Protocol(format!("invalid challenge identifier: {}", e)))?;
    params.custom_extensions = vec![CustomExtension::new_acme_identifier(&digest)];

    let key = KeyPair::generate()
        .map_err(|e| AcmeError::Protocol(format!("challenge key generation failed: {}", e)))?;
    let cert = params
        .self_signed(&key)
        .map_err(|e| AcmeError::Protocol(format!("challenge certificate failed: {}", e)))?;

    let signing_key = crypto_provider()
        .key_provider
        .load_private_key(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            key.serialize_der(),
        )))
        .map_err(|e| AcmeError::Protocol(format!("challenge key rejected: {}", e)))?;

    Ok(CertifiedKey::new(vec![cert.der().clone()], signing_key))
}
