//! Shared enumerations for challenge types and client authentication.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A configuration token that does not name a known value
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} '{token}'")]
pub struct UnknownToken {
    pub kind: &'static str,
    pub token: String,
}

// ============================================================================
// Challenge Types
// ============================================================================

/// ACME challenge types this system can answer.
///
/// DNS-01 is intentionally absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChallengeType {
    /// HTTP-01: key authorization served at `/.well-known/acme-challenge/<token>`
    Http01,
    /// TLS-ALPN-01: self-signed certificate presented over ALPN `acme-tls/1`
    TlsAlpn01,
}

impl ChallengeType {
    /// Order in which enabled challenge types are tried
    pub const PREFERENCE: [ChallengeType; 2] = [ChallengeType::TlsAlpn01, ChallengeType::Http01];

    /// The ACME identifier of this challenge type
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeType::Http01 => "http-01",
            ChallengeType::TlsAlpn01 => "tls-alpn-01",
        }
    }
}

impl fmt::Display for ChallengeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChallengeType {
    type Err = UnknownToken;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" | "http-01" | "http01" => Ok(ChallengeType::Http01),
            "tlsalpn" | "tls-alpn-01" | "tlsalpn01" => Ok(ChallengeType::TlsAlpn01),
            _ => Err(UnknownToken {
                kind: "challenge",
                token: s.to_string(),
            }),
        }
    }
}

// ============================================================================
// Client Authentication
// ============================================================================

/// Client certificate policy for TLS connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClientAuthMode {
    /// Do not ask for a client certificate
    #[default]
    None,
    /// Ask for a certificate, accept any (or none) without verification
    Request,
    /// Require a certificate, accept any without verification
    RequireAny,
    /// Verify a certificate against the trust roots if one is presented
    VerifyIfGiven,
    /// Require a certificate that verifies against the trust roots
    RequireAndVerify,
}

impl ClientAuthMode {
    /// Canonical token for this mode
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientAuthMode::None => "none",
            ClientAuthMode::Request => "request",
            ClientAuthMode::RequireAny => "require-any",
            ClientAuthMode::VerifyIfGiven => "verify-if-given",
            ClientAuthMode::RequireAndVerify => "require-and-verify",
        }
    }

    /// Whether presented certificates are verified against trust roots
    pub fn requires_trust_roots(&self) -> bool {
        matches!(
            self,
            ClientAuthMode::VerifyIfGiven | ClientAuthMode::RequireAndVerify
        )
    }

    /// Whether a handshake without a client certificate is rejected
    pub fn is_mandatory(&self) -> bool {
        matches!(
            self,
            ClientAuthMode::RequireAny | ClientAuthMode::RequireAndVerify
        )
    }
}

impl fmt::Display for ClientAuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClientAuthMode {
    type Err = UnknownToken;

    /// Accepts the directive spellings (`nocert`, `require`,
    /// `verify_if_given`, ...) as well as the canonical tokens.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "none" | "nocert" => Ok(ClientAuthMode::None),
            "request" => Ok(ClientAuthMode::Request),
            "require" | "require-any" => Ok(ClientAuthMode::RequireAny),
            "verify-if-given" => Ok(ClientAuthMode::VerifyIfGiven),
            "require-and-verify" => Ok(ClientAuthMode::RequireAndVerify),
            _ => Err(UnknownToken {
                kind: "authentication type",
                token: s.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_challenge_type_tokens() {
        assert_eq!("http".parse::<ChallengeType>().unwrap(), ChallengeType::Http01);
        assert_eq!(
            "tlsalpn".parse::<ChallengeType>().unwrap(),
            ChallengeType::TlsAlpn01
        );
        assert_eq!(
            "TLS-ALPN-01".parse::<ChallengeType>().unwrap(),
            ChallengeType::TlsAlpn01
        );
        let err = "dns".parse::<ChallengeType>().unwrap_err();
        assert_eq!(err.to_string(), "unknown challenge 'dns'");
    }

    #[test]
    fn test_challenge_preference_is_tls_alpn_first() {
        assert_eq!(ChallengeType::PREFERENCE[0], ChallengeType::TlsAlpn01);
        assert_eq!(ChallengeType::PREFERENCE[1], ChallengeType::Http01);
    }

    #[test]
    fn test_client_auth_directive_tokens() {
        let cases = [
            ("nocert", ClientAuthMode::None),
            ("request", ClientAuthMode::Request),
            ("require", ClientAuthMode::RequireAny),
            ("verify_if_given", ClientAuthMode::VerifyIfGiven),
            ("require_and_verify", ClientAuthMode::RequireAndVerify),
        ];
        for (token, mode) in cases {
            assert_eq!(token.parse::<ClientAuthMode>().unwrap(), mode, "{token}");
        }
    }

    #[test]
    fn test_client_auth_canonical_roundtrip() {
        for mode in [
            ClientAuthMode::None,
            ClientAuthMode::Request,
            ClientAuthMode::RequireAny,
            ClientAuthMode::VerifyIfGiven,
            ClientAuthMode::RequireAndVerify,
        ] {
            assert_eq!(mode.as_str().parse::<ClientAuthMode>().unwrap(), mode);
        }
    }

    #[test]
    fn test_client_auth_unknown_token() {
        let err = "sometimes".parse::<ClientAuthMode>().unwrap_err();
        assert_eq!(err.token, "sometimes");
        assert_eq!(ClientAuthMode::default(), ClientAuthMode::None);
    }

    #[test]
    fn test_client_auth_flags() {
        assert!(ClientAuthMode::RequireAndVerify.requires_trust_roots());
        assert!(ClientAuthMode::RequireAndVerify.is_mandatory());
        assert!(!ClientAuthMode::RequireAny.requires_trust_roots());
        assert!(ClientAuthMode::RequireAny.is_mandatory());
        assert!(!ClientAuthMode::Request.is_mandatory());
    }
}
