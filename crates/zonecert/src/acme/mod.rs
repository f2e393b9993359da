//! ACME automatic certificate management
//!
//! # Architecture
//!
//! - [`ChallengeManager`] - Pending HTTP-01 and TLS-ALPN-01 challenge material
//! - [`start_http_responder`] / [`start_tls_alpn_responder`] - Challenge listeners
//! - [`AcmeManager`] - Issuance state machine over an [`AcmeProtocol`]
//! - [`InstantAcmeClient`] - `instant-acme` implementation of [`AcmeProtocol`]
//! - [`CertificateCache`] - Single-flight certificate store and handshake resolver
//! - [`RenewalScheduler`] - Background renewal scans
//! - [`CertificateStorage`] - Persistent certificates and account credentials
//!
//! # Challenge Flow
//!
//! 1. A caller asks the [`CertificateCache`] for a zone
//! 2. The cache starts (or joins) the single issuance for that zone
//! 3. [`AcmeManager`] opens an order and picks a challenge whose responder is listening
//! 4. [`ChallengeManager`] holds the key authorization (HTTP-01) or the
//!    `acmeIdentifier` certificate (TLS-ALPN-01) while the CA validates
//! 5. The order is finalized with a fresh key and the chain is parsed
//! 6. The cache installs the certificate and persists it

mod cache;
mod certificate;
mod challenge;
mod client;
mod engine;
mod error;
mod responder;
mod scheduler;
mod storage;

pub use cache::{CertificateCache, IssueHandle, Issuer};
pub use certificate::Certificate;
pub use challenge::{
    tls_alpn_certificate, ChallengeGuard, ChallengeManager, ChallengeResolver,
    ACME_CHALLENGE_PREFIX,
};
pub use client::{
    AcmeOrder, AcmeProtocol, InstantAcmeClient, OfferedChallenge, OrderProgress,
    PendingAuthorization,
};
pub use engine::{AcmeAccountTemplate, AcmeManager, IssuanceEvent, IssuanceState};
pub use error::{AcmeError, StorageError};
pub use responder::{start_http_responder, start_tls_alpn_responder, ResponderHandle};
pub use scheduler::{RenewalReport, RenewalScheduler};
pub use storage::{CertificateMeta, CertificateStorage, StoredAccount, StoredCertificate};
