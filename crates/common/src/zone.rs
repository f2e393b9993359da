//! Zone names under certificate management.
//!
//! A [`Zone`] is a hostname (or a wildcard hostname such as
//! `*.example.com`) that has been validated and normalized once, so the
//! rest of the system never has to re-check it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Maximum length of a full domain name (without trailing dot)
const MAX_NAME_LEN: usize = 253;

/// Maximum length of a single label
const MAX_LABEL_LEN: usize = 63;

/// Reasons a zone name is rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ZoneError {
    #[error("zone name is empty")]
    Empty,

    #[error("zone '{0}' exceeds 253 characters")]
    TooLong(String),

    #[error("zone '{0}' must contain at least two labels")]
    SingleLabel(String),

    #[error("zone '{zone}' has an invalid label '{label}'")]
    InvalidLabel { zone: String, label: String },

    #[error("zone '{0}' may only use '*' as the entire leftmost label")]
    MisplacedWildcard(String),
}

/// A validated, lowercase domain name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Zone(String);

impl Zone {
    /// Validate and normalize a zone name.
    ///
    /// The name is lowercased and a single trailing dot is stripped.
    pub fn new(name: &str) -> Result<Self, ZoneError> {
        let name = name.trim().trim_end_matches('.').to_ascii_lowercase();

        if name.is_empty() {
            return Err(ZoneError::Empty);
        }
        if name.len() > MAX_NAME_LEN {
            return Err(ZoneError::TooLong(name));
        }

        let labels: Vec<&str> = name.split('.').collect();
        if labels.len() < 2 {
            return Err(ZoneError::SingleLabel(name));
        }

        for (i, label) in labels.iter().enumerate() {
            if label.contains('*') {
                if i != 0 || *label != "*" {
                    return Err(ZoneError::MisplacedWildcard(name));
                }
                continue;
            }
            if !is_valid_label(label) {
                return Err(ZoneError::InvalidLabel {
                    label: label.to_string(),
                    zone: name,
                });
            }
        }

        Ok(Self(name))
    }

    /// Get the zone name
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is a wildcard zone (`*.example.com`)
    pub fn is_wildcard(&self) -> bool {
        self.0.starts_with("*.")
    }

    /// Check whether a TLS server name is covered by this zone.
    ///
    /// Wildcards cover exactly one additional label, so `*.example.com`
    /// matches `www.example.com` but neither `example.com` nor
    /// `a.b.example.com`.
    pub fn matches(&self, server_name: &str) -> bool {
        let server_name = server_name.trim_end_matches('.').to_ascii_lowercase();

        match self.0.strip_prefix("*.") {
            Some(base) => server_name
                .split_once('.')
                .map(|(head, rest)| !head.is_empty() && rest == base)
                .unwrap_or(false),
            None => server_name == self.0,
        }
    }
}

fn is_valid_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= MAX_LABEL_LEN
        && !label.starts_with('-')
        && !label.ends_with('-')
        && label
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Zone {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for Zone {
    type Err = ZoneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Zone {
    type Error = ZoneError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(&s)
    }
}

impl From<Zone> for String {
    fn from(zone: Zone) -> Self {
        zone.0
    }
}
