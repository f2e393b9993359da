//! Shared helpers for zonecert integration tests
//!
//! [`MockAcme`] plays the ACME server: it offers challenges, validates them
//! against the real responders over loopback and signs the engine's CSR
//! once the order is finalized.

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, Utc};
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, CertifiedIssuer, IsCa,
    KeyPair,
};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, CertificateSigningRequestDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use zonecert::acme::{AcmeOrder, OfferedChallenge, OrderProgress, PendingAuthorization};
use zonecert::{AcmeAccountTemplate, AcmeError, AcmeProtocol, ChallengeType, Zone};
use zonecert_config::{AcmeConfig, ChallengeConfig, ChallengesConfig, RenewalConfig};

/// OID of the `acmeIdentifier` extension
const ACME_IDENTIFIER_OID: &str = "1.3.6.1.5.5.7.1.31";

/// Pick a loopback port that is free right now
pub fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub fn zone(name: &str) -> Zone {
    Zone::new(name).unwrap()
}

/// ACME settings bound to loopback with the given responder ports
pub fn acme_config(zones: &[&str], http: ChallengeConfig, tls_alpn: ChallengeConfig) -> AcmeConfig {
    AcmeConfig {
        email: Some("ops@example.test".to_string()),
        directory: "https://acme.invalid/directory".to_string(),
        zones: zones.iter().map(|z| z.to_string()).collect(),
        challenges: ChallengesConfig { http, tls_alpn },
        bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        storage: None,
    }
}

/// Fast polling and a short issuance bound
pub fn renewal_config(timeout_secs: u64) -> RenewalConfig {
    RenewalConfig {
        renew_before_days: 30,
        check_interval_secs: 3600,
        issuance_timeout_secs: timeout_secs,
        poll_interval_ms: 10,
    }
}

pub fn template(acme: AcmeConfig, timeout_secs: u64) -> AcmeAccountTemplate {
    AcmeAccountTemplate::new(acme, renewal_config(timeout_secs)).unwrap()
}

/// Self-signed certificate valid for `days` from now; returns (cert PEM, key PEM)
pub fn self_signed(names: &[&str], days: i64) -> (String, String) {
    let mut params =
        CertificateParams::new(names.iter().map(|n| n.to_string()).collect::<Vec<_>>()).unwrap();
    set_validity(&mut params, days);

    let key = KeyPair::generate().unwrap();
    let cert = params.self_signed(&key).unwrap();
    (cert.pem(), key.serialize_pem())
}

fn set_validity(params: &mut CertificateParams, days: i64) {
    let not_before = Utc::now() - chrono::Duration::days(1);
    let not_after = Utc::now() + chrono::Duration::days(days);
    params.not_before =
        rcgen::date_time_ymd(not_before.year(), not_before.month() as u8, not_before.day() as u8);
    params.not_after =
        rcgen::date_time_ymd(not_after.year(), not_after.month() as u8, not_after.day() as u8);
}

/// Sign a CSR with a throwaway CA; returns the leaf followed by the CA
pub fn sign_csr(csr_der: &[u8], days: i64) -> String {
    let mut csr =
        CertificateSigningRequestParams::from_der(&CertificateSigningRequestDer::from(csr_der))
            .unwrap();
    set_validity(&mut csr.params, days);

    let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca = CertifiedIssuer::self_signed(ca_params, KeyPair::generate().unwrap()).unwrap();

    let leaf = csr.signed_by(&*ca).unwrap();
    format!("{}{}", leaf.pem(), ca.pem())
}

// ============================================================================
// TLS client helpers
// ============================================================================

/// Accepts any server certificate and handshake signature. Challenge
/// certificates carry a critical extension that webpki refuses to parse.
#[derive(Debug)]
pub struct AcceptAnyServerCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// TLS client that trusts any server and presents no certificate
pub fn insecure_connector(alpn: &[&[u8]]) -> TlsConnector {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let mut config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .unwrap()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(provider)))
        .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    TlsConnector::from(Arc::new(config))
}

// ============================================================================
// Challenge validation, as a CA would do it
// ============================================================================

async fn validate_http(port: u16, challenge: &OfferedChallenge) -> Result<(), String> {
    let mut stream = TcpStream::connect(("127.0.0.1", port))
        .await
        .map_err(|e| format!("connection to HTTP-01 responder failed: {}", e))?;

    let request = format!(
        "GET /.well-known/acme-challenge/{} HTTP/1.1\r\nHost: acme.test\r\nConnection: close\r\n\r\n",
        challenge.token
    );
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| e.to_string())?;

    let mut response = String::new();
    stream
        .read_to_string(&mut response)
        .await
        .map_err(|e| e.to_string())?;

    if !response.starts_with("HTTP/1.1 200") {
        return Err(format!("unexpected HTTP-01 response: {}", response));
    }
    let body = response.split("\r\n\r\n").nth(1).unwrap_or_default();
    if body != challenge.key_authorization {
        return Err(format!("wrong key authorization: {:?}", body));
    }
    Ok(())
}

async fn validate_tls_alpn(
    port: u16,
    identifier: &str,
    challenge: &OfferedChallenge,
) -> Result<(), String> {
    let stream = TcpStream::connect(("127.0.0.1", port))
        .await
        .map_err(|e| format!("connection to TLS-ALPN-01 responder failed: {}", e))?;

    let server_name = ServerName::try_from(identifier.to_string()).map_err(|e| e.to_string())?;
    let tls = insecure_connector(&[b"acme-tls/1"])
        .connect(server_name, stream)
        .await
        .map_err(|e| format!("TLS-ALPN-01 handshake failed: {}", e))?;

    let (_, conn) = tls.get_ref();
    if conn.alpn_protocol() != Some(b"acme-tls/1".as_slice()) {
        return Err("acme-tls/1 was not negotiated".to_string());
    }

    let certs = conn
        .peer_certificates()
        .ok_or_else(|| "no certificate presented".to_string())?;
    let (_, cert) = x509_parser::parse_x509_certificate(certs[0].as_ref())
        .map_err(|e| format!("unparseable challenge certificate: {}", e))?;

    let digest = Sha256::digest(challenge.key_authorization.as_bytes());
    let extension = cert
        .extensions()
        .iter()
        .find(|ext| ext.oid.to_id_string() == ACME_IDENTIFIER_OID)
        .ok_or_else(|| "acmeIdentifier extension missing".to_string())?;

    if !extension.critical {
        return Err("acmeIdentifier extension is not critical".to_string());
    }
    if !extension.value.ends_with(digest.as_slice()) {
        return Err("acmeIdentifier digest mismatch".to_string());
    }
    Ok(())
}

// ============================================================================
// Mock ACME server
// ============================================================================

/// How the mock server treats an order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Validate against the responders and issue a certificate
    Issue,
    /// Validate, then return a chain that is not a certificate
    MalformedChain,
    /// Reject every challenge
    RejectValidation,
    /// Never progress past pending
    Hang,
}

struct MockInner {
    http_port: u16,
    tls_alpn_port: u16,
    offered: Vec<ChallengeType>,
    behavior: Mutex<Behavior>,
    cert_days: Mutex<i64>,
    order_delay: Duration,
    orders: AtomicUsize,
    validated: Mutex<Vec<ChallengeType>>,
}

/// In-process stand-in for an ACME server
#[derive(Clone)]
pub struct MockAcme {
    inner: Arc<MockInner>,
}

impl MockAcme {
    pub fn new(http_port: u16, tls_alpn_port: u16) -> Self {
        Self::with_offered(
            http_port,
            tls_alpn_port,
            vec![ChallengeType::Http01, ChallengeType::TlsAlpn01],
            Behavior::Issue,
            Duration::ZERO,
        )
    }

    pub fn with_offered(
        http_port: u16,
        tls_alpn_port: u16,
        offered: Vec<ChallengeType>,
        behavior: Behavior,
        order_delay: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(MockInner {
                http_port,
                tls_alpn_port,
                offered,
                behavior: Mutex::new(behavior),
                cert_days: Mutex::new(90),
                order_delay,
                orders: AtomicUsize::new(0),
                validated: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.inner.behavior.lock().unwrap() = behavior;
    }

    pub fn set_cert_days(&self, days: i64) {
        *self.inner.cert_days.lock().unwrap() = days;
    }

    /// Orders opened so far
    pub fn order_count(&self) -> usize {
        self.inner.orders.load(Ordering::SeqCst)
    }

    /// Challenge types that passed validation, in order
    pub fn validated(&self) -> Vec<ChallengeType> {
        self.inner.validated.lock().unwrap().clone()
    }
}

#[async_trait]
impl AcmeProtocol for MockAcme {
    async fn new_order(&self, zone: &Zone) -> Result<Box<dyn AcmeOrder>, AcmeError> {
        let n = self.inner.orders.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.inner.order_delay.is_zero() {
            tokio::time::sleep(self.inner.order_delay).await;
        }

        let offered = self
            .inner
            .offered
            .iter()
            .map(|challenge| {
                let token = format!("token{}{}", n, challenge.as_str().replace('-', ""));
                OfferedChallenge {
                    challenge: *challenge,
                    key_authorization: format!("{}.mock-thumbprint", token),
                    url: format!("https://acme.invalid/chall/{}", token),
                    token,
                }
            })
            .collect();

        Ok(Box::new(MockOrder {
            mock: self.clone(),
            behavior: *self.inner.behavior.lock().unwrap(),
            zone: zone.clone(),
            identifier: zone.as_str().trim_start_matches("*.").to_string(),
            offered,
            validated: false,
            rejection: None,
            csr: None,
        }))
    }
}

struct MockOrder {
    mock: MockAcme,
    behavior: Behavior,
    zone: Zone,
    identifier: String,
    offered: Vec<OfferedChallenge>,
    validated: bool,
    rejection: Option<String>,
    csr: Option<Vec<u8>>,
}

#[async_trait]
impl AcmeOrder for MockOrder {
    async fn authorizations(&mut self) -> Result<Vec<PendingAuthorization>, AcmeError> {
        Ok(vec![PendingAuthorization {
            identifier: self.identifier.clone(),
            offered: self.offered.clone(),
        }])
    }

    async fn set_ready(&mut self, challenge: &OfferedChallenge) -> Result<(), AcmeError> {
        match self.behavior {
            Behavior::Hang => return Ok(()),
            Behavior::RejectValidation => {
                self.rejection = Some("CA rejected the challenge response".to_string());
                return Ok(());
            }
            Behavior::Issue | Behavior::MalformedChain => {}
        }

        let outcome = match challenge.challenge {
            ChallengeType::Http01 => validate_http(self.mock.inner.http_port, challenge).await,
            ChallengeType::TlsAlpn01 => {
                validate_tls_alpn(self.mock.inner.tls_alpn_port, &self.identifier, challenge).await
            }
        };

        match outcome {
            Ok(()) => {
                self.validated = true;
                self.mock
                    .inner
                    .validated
                    .lock()
                    .unwrap()
                    .push(challenge.challenge);
            }
            Err(reason) => self.rejection = Some(reason),
        }
        Ok(())
    }

    async fn poll(&mut self) -> Result<OrderProgress, AcmeError> {
        if let Some(reason) = &self.rejection {
            return Ok(OrderProgress::Invalid(reason.clone()));
        }
        if !self.validated {
            return Ok(OrderProgress::Pending);
        }
        if self.csr.is_some() {
            Ok(OrderProgress::Valid)
        } else {
            Ok(OrderProgress::Ready)
        }
    }

    async fn finalize(&mut self, csr_der: &[u8]) -> Result<(), AcmeError> {
        self.csr = Some(csr_der.to_vec());
        Ok(())
    }

    async fn certificate_chain(&mut self) -> Result<Option<String>, AcmeError> {
        if self.behavior == Behavior::MalformedChain {
            return Ok(Some(
                "-----BEGIN CERTIFICATE-----\nbm90IGEgY2VydGlmaWNhdGU=\n-----END CERTIFICATE-----\n"
                    .to_string(),
            ));
        }

        let Some(csr) = &self.csr else {
            return Ok(None);
        };
        let days = *self.mock.inner.cert_days.lock().unwrap();
        Ok(Some(sign_csr(csr, days)))
    }
}

/// Responder addresses for a fresh pair of free ports
pub fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}
