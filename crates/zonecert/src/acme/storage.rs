//! Certificate and account storage
//!
//! Persists ACME account credentials and issued certificates so a restart
//! serves the existing certificates instead of re-issuing them.
//!
//! # Directory Structure
//!
//! ```text
//! storage/
//! ├── account.json          # Account metadata (contact, creation time)
//! ├── credentials.json      # ACME account credentials (opaque, serialized)
//! └── zones/
//!     └── example.com/
//!         ├── cert.pem      # Certificate chain
//!         ├── key.pem       # Private key
//!         └── meta.json     # Expiry and issue time
//! ```
//!
//! Wildcard zones are stored under a `_wildcard.` prefix since `*` is not a
//! portable file name character.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use super::error::StorageError;

const ZONES_DIR: &str = "zones";
const WILDCARD_PREFIX: &str = "_wildcard.";

/// Certificate metadata stored alongside the certificate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateMeta {
    /// Zone the certificate was issued for
    pub zone: String,
    /// When the certificate expires
    pub expires: DateTime<Utc>,
    /// When the certificate was issued
    pub issued: DateTime<Utc>,
}

/// A stored certificate with its metadata
#[derive(Debug, Clone)]
pub struct StoredCertificate {
    /// PEM-encoded certificate chain
    pub cert_pem: String,
    /// PEM-encoded private key
    pub key_pem: String,
    pub meta: CertificateMeta,
}

/// ACME account metadata, kept next to the opaque credentials JSON
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredAccount {
    #[serde(default)]
    pub contact_email: Option<String>,
    /// Directory URL the account was registered with
    pub directory: String,
    pub created: DateTime<Utc>,
}

/// Filesystem storage for accounts and certificates
#[derive(Debug)]
pub struct CertificateStorage {
    base_path: PathBuf,
}

impl CertificateStorage {
    /// Open (creating if needed) storage at the given path.
    ///
    /// Directories get 0700 permissions on Unix.
    pub fn new(base_path: &Path) -> Result<Self, StorageError> {
        let zones_path = base_path.join(ZONES_DIR);
        fs::create_dir_all(&zones_path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o700);
            fs::set_permissions(base_path, perms.clone())?;
            fs::set_permissions(&zones_path, perms)?;
        }

        info!(
            storage_path = %base_path.display(),
            "Initialized certificate storage"
        );

        Ok(Self {
            base_path: base_path.to_path_buf(),
        })
    }

    // =========================================================================
    // Account Operations
    // =========================================================================

    /// Load stored account metadata
    pub fn load_account(&self) -> Result<Option<StoredAccount>, StorageError> {
        let account_path = self.base_path.join("account.json");

        if !account_path.exists() {
            trace!("No stored ACME account found");
            return Ok(None);
        }

        let content = fs::read_to_string(&account_path)?;
        let account: StoredAccount = serde_json::from_str(&content)?;

        debug!(
            contact = ?account.contact_email,
            directory = %account.directory,
            "Loaded ACME account metadata"
        );
        Ok(Some(account))
    }

    /// Save account metadata
    pub fn save_account(&self, account: &StoredAccount) -> Result<(), StorageError> {
        let account_path = self.base_path.join("account.json");
        write_private(&account_path, serde_json::to_string_pretty(account)?.as_bytes())?;

        info!(contact = ?account.contact_email, "Saved ACME account metadata");
        Ok(())
    }

    /// Load raw credentials JSON (`instant_acme::AccountCredentials`)
    pub fn load_credentials_json(&self) -> Result<Option<String>, StorageError> {
        let creds_path = self.base_path.join("credentials.json");

        if !creds_path.exists() {
            trace!("No stored ACME credentials found");
            return Ok(None);
        }

        let content = fs::read_to_string(&creds_path)?;
        debug!("Loaded ACME credentials JSON");
        Ok(Some(content))
    }

    /// Save raw credentials JSON
    pub fn save_credentials_json(&self, json: &str) -> Result<(), StorageError> {
        let creds_path = self.base_path.join("credentials.json");
        write_private(&creds_path, json.as_bytes())?;

        info!("Saved ACME credentials JSON");
        Ok(())
    }

    // =========================================================================
    // Certificate Operations
    // =========================================================================

    fn zone_path(&self, zone: &str) -> PathBuf {
        self.base_path.join(ZONES_DIR).join(zone_dir_name(zone))
    }

    /// Load a stored certificate for a zone
    pub fn load_certificate(&self, zone: &str) -> Result<Option<StoredCertificate>, StorageError> {
        let zone_path = self.zone_path(zone);
        let cert_path = zone_path.join("cert.pem");

        if !cert_path.exists() {
            trace!(zone = %zone, "No stored certificate found");
            return Ok(None);
        }

        let cert_pem = fs::read_to_string(&cert_path)?;
        let key_pem = fs::read_to_string(zone_path.join("key.pem"))?;
        let meta: CertificateMeta =
            serde_json::from_str(&fs::read_to_string(zone_path.join("meta.json"))?)?;

        debug!(
            zone = %zone,
            expires = %meta.expires,
            "Loaded stored certificate"
        );

        Ok(Some(StoredCertificate {
            cert_pem,
            key_pem,
            meta,
        }))
    }

    /// Save a certificate for a zone.
    ///
    /// The metadata file is written last, so a partially written entry is
    /// never loaded with a stale expiry.
    pub fn save_certificate(
        &self,
        zone: &str,
        cert_pem: &str,
        key_pem: &str,
        expires: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let zone_path = self.zone_path(zone);
        fs::create_dir_all(&zone_path)?;

        fs::write(zone_path.join("cert.pem"), cert_pem)?;
        write_private(&zone_path.join("key.pem"), key_pem.as_bytes())?;

        let meta = CertificateMeta {
            zone: zone.to_string(),
            expires,
            issued: Utc::now(),
        };
        fs::write(zone_path.join("meta.json"), serde_json::to_string_pretty(&meta)?)?;

        info!(
            zone = %zone,
            expires = %expires,
            "Saved certificate to storage"
        );

        Ok(())
    }

    /// List all stored zones
    pub fn list_zones(&self) -> Result<Vec<String>, StorageError> {
        let zones_path = self.base_path.join(ZONES_DIR);

        if !zones_path.exists() {
            return Ok(Vec::new());
        }

        let mut zones = Vec::new();
        for entry in fs::read_dir(&zones_path)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    zones.push(zone_from_dir_name(name));
                }
            }
        }

        Ok(zones)
    }
}

fn zone_dir_name(zone: &str) -> String {
    match zone.strip_prefix("*.") {
        Some(rest) => format!("{WILDCARD_PREFIX}{rest}"),
        None => zone.to_string(),
    }
}

fn zone_from_dir_name(name: &str) -> String {
    match name.strip_prefix(WILDCARD_PREFIX) {
        Some(rest) => format!("*.{rest}"),
        None => name.to_string(),
    }
}

/// Write a file readable only by the owner
fn write_private(path: &Path, contents: &[u8]) -> Result<(), StorageError> {
    fs::write(path, contents)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}
