//! Zonecert Library
//!
//! Automatic TLS certificates over ACME for long-running network services.
//!
//! - **Challenge responders**: HTTP-01 and TLS-ALPN-01 listeners that run
//!   independently, so one failing does not block the other
//! - **Certificate cache**: single-flight issuance per zone, handshake-time
//!   certificate selection and background renewal
//! - **Issuance engine**: the ACME order state machine, bounded by a
//!   timeout and cancellable on shutdown
//! - **TLS parameters**: hardened rustls server configurations with
//!   configurable client certificate authentication
//!
//! # Example
//!
//! ```ignore
//! use zonecert::CertificateService;
//! use zonecert_config::Config;
//!
//! let config = Config::from_file("zonecert.kdl")?;
//! let service = CertificateService::from_config(&config)?;
//! service.start_responders().await?;
//! service.manage(&config.zones()?)?;
//!
//! let tls = service.tls_config()?;
//! let acceptor = tls.acceptor();
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod acme;
pub mod service;
pub mod tls;

// ============================================================================
// Public API Re-exports
// ============================================================================

// Certificate management
pub use acme::{
    AcmeAccountTemplate, AcmeError, AcmeManager, AcmeProtocol, Certificate, CertificateCache,
    CertificateStorage, ChallengeManager, InstantAcmeClient, IssuanceEvent, IssuanceState,
    IssueHandle, Issuer, RenewalScheduler,
};

// Facade
pub use service::{CertificateService, ResponderReport};

// TLS
pub use tls::{TlsError, TlsParams, TlsServerConfig};

// Shared types
pub use zonecert_common::{ChallengeType, ClientAuthMode, Zone};
