//! Server TLS configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use zonecert_common::ClientAuthMode;

/// TLS settings for one server instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Explicit certificate chain, served when no managed certificate matches
    pub cert_file: Option<PathBuf>,
    /// Private key for `cert_file`
    pub key_file: Option<PathBuf>,
    /// Trust roots, used for both server chain checks and client verification
    pub ca_file: Option<PathBuf>,
    /// Client certificate policy
    pub client_auth: ClientAuthMode,
}
