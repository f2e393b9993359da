//! TLS server parameters
//!
//! Builds hardened rustls server configurations whose certificates are
//! selected at handshake time by a resolver (normally the certificate
//! cache), with an optional explicit certificate as the fallback.
//!
//! # Policy
//!
//! - Protocol versions are limited to TLS 1.2 and TLS 1.3
//! - Cipher suites are restricted to an ordered AEAD allowlist with ECDHE
//!   key exchange, and the server's order wins
//! - Client certificates follow [`ClientAuthMode`]
//!
//! # Trust roots
//!
//! A single trust-root set is configured per server. It is the set
//! exposed for server chain checks ([`TlsServerConfig::trust_roots`]) and
//! the set client certificates are verified against. Separate roots for
//! the two directions are not supported.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::{aws_lc_rs, CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::{ClientHello, ResolvesServerCert, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use rustls::{
    DigitallySignedStruct, DistinguishedName, RootCertStore, ServerConfig, SignatureScheme,
    SupportedCipherSuite, SupportedProtocolVersion,
};
use thiserror::Error;
use tracing::{debug, info};

use zonecert_common::ClientAuthMode;
use zonecert_config::TlsConfig;

/// ALPN protocol identifier for TLS-ALPN-01 validation
pub const ACME_TLS_ALPN_PROTOCOL: &[u8] = b"acme-tls/1";

/// Accepted protocol versions (TLS 1.2 floor, TLS 1.3 ceiling)
pub static PROTOCOL_VERSIONS: &[&SupportedProtocolVersion] =
    &[&rustls::version::TLS13, &rustls::version::TLS12];

/// Error type for TLS operations
#[derive(Debug, Error)]
pub enum TlsError {
    /// Failed to load certificate material
    #[error("Failed to load certificate: {0}")]
    CertificateLoad(String),

    /// Failed to load private key
    #[error("Failed to load private key: {0}")]
    KeyLoad(String),

    /// Trust-root material is missing or malformed
    #[error("Invalid trust roots: {0}")]
    TrustRoots(String),

    /// Client auth mode needs trust roots that were not supplied
    #[error("Client auth mode '{0}' requires trust roots")]
    MissingTrustRoots(ClientAuthMode),

    /// Failed to build TLS configuration
    #[error("Failed to build TLS config: {0}")]
    ConfigBuild(String),
}

/// Cipher suites in server preference order.
///
/// TLS 1.3 suites are all AEAD with (EC)DHE; the TLS 1.2 entries are the
/// ECDHE + AEAD subset.
pub fn cipher_suites() -> Vec<SupportedCipherSuite> {
    use aws_lc_rs::cipher_suite::*;

    vec![
        TLS13_AES_256_GCM_SHA384,
        TLS13_CHACHA20_POLY1305_SHA256,
        TLS13_AES_128_GCM_SHA256,
        TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
        TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
        TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    ]
}

/// Crypto provider restricted to [`cipher_suites`]
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(CryptoProvider {
        cipher_suites: cipher_suites(),
        ..aws_lc_rs::default_provider()
    })
}

// ============================================================================
// Parameters
// ============================================================================

/// Validated inputs for building server TLS configurations
#[derive(Clone)]
pub struct TlsParams {
    client_auth: ClientAuthMode,
    trust_roots: Option<Arc<RootCertStore>>,
    explicit_cert: Option<Arc<CertifiedKey>>,
    alpn_protocols: Vec<Vec<u8>>,
    provider: Arc<CryptoProvider>,
}

impl TlsParams {
    /// Parameters with the given client auth mode and nothing else
    pub fn new(client_auth: ClientAuthMode) -> Self {
        Self {
            client_auth,
            trust_roots: None,
            explicit_cert: None,
            alpn_protocols: Vec::new(),
            provider: crypto_provider(),
        }
    }

    /// Load parameters from configuration, reading all PEM material
    pub fn from_config(config: &TlsConfig) -> Result<Self, TlsError> {
        let mut params = Self::new(config.client_auth);

        if let Some(ca_path) = &config.ca_file {
            params.trust_roots = Some(Arc::new(load_trust_roots(ca_path)?));
        }

        match (&config.cert_file, &config.key_file) {
            (Some(cert), Some(key)) => {
                let certified = load_certified_key(cert, key, &params.provider)?;
                info!(cert_file = %cert.display(), "Loaded explicit TLS certificate");
                params.explicit_cert = Some(Arc::new(certified));
            }
            (None, None) => {}
            _ => {
                return Err(TlsError::ConfigBuild(
                    "certificate and key must be configured together".to_string(),
                ));
            }
        }

        Ok(params)
    }

    /// Use the given trust roots for client verification
    pub fn with_trust_roots(mut self, roots: RootCertStore) -> Self {
        self.trust_roots = Some(Arc::new(roots));
        self
    }

    /// Serve this certificate when the managed resolver has none
    pub fn with_certified_key(mut self, key: CertifiedKey) -> Self {
        self.explicit_cert = Some(Arc::new(key));
        self
    }

    /// Application protocols advertised by the managed configuration
    pub fn with_alpn_protocols(mut self, protocols: Vec<Vec<u8>>) -> Self {
        self.alpn_protocols = protocols;
        self
    }

    /// Replace the restricted default crypto provider
    pub fn with_provider(mut self, provider: Arc<CryptoProvider>) -> Self {
        self.provider = provider;
        self
    }

    /// The crypto provider used for key loading and handshakes
    pub fn provider(&self) -> &Arc<CryptoProvider> {
        &self.provider
    }

    pub fn client_auth(&self) -> ClientAuthMode {
        self.client_auth
    }

    /// Build the server configuration.
    ///
    /// `managed` is consulted first on every handshake; the explicit
    /// certificate (if any) is served when it returns nothing.
    pub fn build(
        &self,
        managed: Arc<dyn ResolvesServerCert>,
    ) -> Result<TlsServerConfig, TlsError> {
        let verifier = self.client_verifier()?;

        let builder = ServerConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_protocol_versions(PROTOCOL_VERSIONS)
            .map_err(|e| TlsError::ConfigBuild(e.to_string()))?;

        let builder = match verifier {
            Some(verifier) => builder.with_client_cert_verifier(verifier),
            None => builder.with_no_client_auth(),
        };

        let mut config = builder.with_cert_resolver(Arc::new(ServerCertResolver {
            managed,
            fallback: self.explicit_cert.clone(),
        }));
        config.ignore_client_order = true;
        config.alpn_protocols = self.alpn_protocols.clone();

        debug!(
            client_auth = %self.client_auth,
            has_trust_roots = self.trust_roots.is_some(),
            has_explicit_cert = self.explicit_cert.is_some(),
            "TLS server configuration built"
        );

        Ok(TlsServerConfig {
            config: Arc::new(config),
            client_auth: self.client_auth,
            trust_roots: self.trust_roots.clone(),
        })
    }

    /// Build the configuration served by the TLS-ALPN-01 responder.
    ///
    /// Same version and suite policy, no client authentication (the ACME
    /// validator never presents a certificate) and `acme-tls/1` first in
    /// the ALPN list. `resolver` alone selects certificates; the explicit
    /// certificate is not consulted.
    pub fn build_challenge(
        &self,
        resolver: Arc<dyn ResolvesServerCert>,
    ) -> Result<Arc<ServerConfig>, TlsError> {
        let mut config = ServerConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_protocol_versions(PROTOCOL_VERSIONS)
            .map_err(|e| TlsError::ConfigBuild(e.to_string()))?
            .with_no_client_auth()
            .with_cert_resolver(resolver);
        config.ignore_client_order = true;

        let mut alpn = vec![ACME_TLS_ALPN_PROTOCOL.to_vec()];
        alpn.extend(self.alpn_protocols.iter().cloned());
        config.alpn_protocols = alpn;

        Ok(Arc::new(config))
    }

    fn client_verifier(&self) -> Result<Option<Arc<dyn ClientCertVerifier>>, TlsError> {
        let schemes = self.provider.signature_verification_algorithms;

        let verifier: Arc<dyn ClientCertVerifier> = match self.client_auth {
            ClientAuthMode::None => return Ok(None),
            ClientAuthMode::Request => Arc::new(UnverifiedClientCert {
                mandatory: false,
                schemes,
            }),
            ClientAuthMode::RequireAny => Arc::new(UnverifiedClientCert {
                mandatory: true,
                schemes,
            }),
            mode @ (ClientAuthMode::VerifyIfGiven | ClientAuthMode::RequireAndVerify) => {
                let roots = self
                    .trust_roots
                    .clone()
                    .ok_or(TlsError::MissingTrustRoots(mode))?;
                let builder =
                    WebPkiClientVerifier::builder_with_provider(roots, Arc::clone(&self.provider));
                let builder = if mode == ClientAuthMode::VerifyIfGiven {
                    builder.allow_unauthenticated()
                } else {
                    builder
                };
                builder.build().map_err(|e| {
                    TlsError::ConfigBuild(format!("Failed to build client verifier: {}", e))
                })?
            }
        };

        info!(client_auth = %self.client_auth, "Client certificate authentication enabled");
        Ok(Some(verifier))
    }
}

impl std::fmt::Debug for TlsParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsParams")
            .field("client_auth", &self.client_auth)
            .field("has_trust_roots", &self.trust_roots.is_some())
            .field("has_explicit_cert", &self.explicit_cert.is_some())
            .finish()
    }
}

// ============================================================================
// Built Configuration
// ============================================================================

/// Immutable server TLS configuration snapshot
#[derive(Clone)]
pub struct TlsServerConfig {
    config: Arc<ServerConfig>,
    client_auth: ClientAuthMode,
    trust_roots: Option<Arc<RootCertStore>>,
}

impl TlsServerConfig {
    /// The rustls configuration for terminating inbound connections
    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.config)
    }

    /// Acceptor for tokio streams
    pub fn acceptor(&self) -> tokio_rustls::TlsAcceptor {
        tokio_rustls::TlsAcceptor::from(self.server_config())
    }

    pub fn client_auth(&self) -> ClientAuthMode {
        self.client_auth
    }

    /// The single trust-root set of this server
    pub fn trust_roots(&self) -> Option<&Arc<RootCertStore>> {
        self.trust_roots.as_ref()
    }
}

impl std::fmt::Debug for TlsServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsServerConfig")
            .field("client_auth", &self.client_auth)
            .field("has_trust_roots", &self.trust_roots.is_some())
            .finish()
    }
}

/// Managed resolver first, explicit certificate second
#[derive(Debug)]
struct ServerCertResolver {
    managed: Arc<dyn ResolvesServerCert>,
    fallback: Option<Arc<CertifiedKey>>,
}

impl ResolvesServerCert for ServerCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.managed
            .resolve(client_hello)
            .or_else(|| self.fallback.clone())
    }
}

/// Client verifier for the `request` and `require-any` modes: the
/// certificate chain is not checked, but the handshake signature is.
#[derive(Debug)]
struct UnverifiedClientCert {
    mandatory: bool,
    schemes: WebPkiSupportedAlgorithms,
}

impl ClientCertVerifier for UnverifiedClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        self.mandatory
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.schemes)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.schemes)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.supported_schemes()
    }
}

// ============================================================================
// PEM Loading
// ============================================================================

/// Parse all certificates from PEM text
pub fn parse_certificates(pem: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::CertificateLoad(e.to_string()))?;

    if certs.is_empty() {
        return Err(TlsError::CertificateLoad(
            "No certificates found in PEM data".to_string(),
        ));
    }
    Ok(certs)
}

/// Parse the first private key from PEM text
pub fn parse_private_key(pem: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| TlsError::KeyLoad(e.to_string()))?
        .ok_or_else(|| TlsError::KeyLoad("No private key found in PEM data".to_string()))
}

/// Build a certified key from PEM certificate chain and key
pub fn certified_key_from_pem(
    chain_pem: &str,
    key_pem: &str,
    provider: &CryptoProvider,
) -> Result<CertifiedKey, TlsError> {
    let certs = parse_certificates(chain_pem)?;
    let key = parse_private_key(key_pem)?;

    let signing_key = provider
        .key_provider
        .load_private_key(key)
        .map_err(|e| TlsError::KeyLoad(format!("Unsupported private key: {}", e)))?;

    Ok(CertifiedKey::new(certs, signing_key))
}

/// Load a certificate chain and private key from files
pub fn load_certified_key(
    cert_path: &Path,
    key_path: &Path,
    provider: &CryptoProvider,
) -> Result<CertifiedKey, TlsError> {
    let chain_pem = fs::read_to_string(cert_path)
        .map_err(|e| TlsError::CertificateLoad(format!("{}: {}", cert_path.display(), e)))?;
    let key_pem = fs::read_to_string(key_path)
        .map_err(|e| TlsError::KeyLoad(format!("{}: {}", key_path.display(), e)))?;

    certified_key_from_pem(&chain_pem, &key_pem, provider).map_err(|e| match e {
        TlsError::CertificateLoad(msg) => {
            TlsError::CertificateLoad(format!("{}: {}", cert_path.display(), msg))
        }
        TlsError::KeyLoad(msg) => TlsError::KeyLoad(format!("{}: {}", key_path.display(), msg)),
        other => other,
    })
}

/// Load trust roots from a PEM file
pub fn load_trust_roots(ca_path: &Path) -> Result<RootCertStore, TlsError> {
    let pem = fs::read_to_string(ca_path)
        .map_err(|e| TlsError::TrustRoots(format!("{}: {}", ca_path.display(), e)))?;

    let certs = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::TrustRoots(format!("{}: {}", ca_path.display(), e)))?;

    let mut root_store = RootCertStore::empty();
    for cert in certs {
        root_store.add(cert).map_err(|e| {
            TlsError::TrustRoots(format!("{}: invalid CA certificate: {}", ca_path.display(), e))
        })?;
    }

    if root_store.is_empty() {
        return Err(TlsError::TrustRoots(format!(
            "{}: No CA certificates found",
            ca_path.display()
        )));
    }

    info!(
        ca_file = %ca_path.display(),
        cert_count = root_store.len(),
        "Loaded trust roots"
    );

    Ok(root_store)
}
