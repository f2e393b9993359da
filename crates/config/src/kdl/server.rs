//! TLS, ACME, renewal and logging block parsing.

use std::net::IpAddr;
use std::path::PathBuf;

use kdl::{KdlNode, KdlValue};
use tracing::trace;

use zonecert_common::{ChallengeType, ClientAuthMode};

use crate::acme::{
    AcmeConfig, ChallengeConfig, ChallengesConfig, RenewalConfig, LETSENCRYPT_STAGING,
};
use crate::tls::TlsConfig;
use crate::{ConfigError, LogFormat, LoggingConfig};

use super::helpers::{
    display_value, get_bool_entry, get_first_arg_string, get_int_entry, get_string_args,
    get_string_entry, positional_args,
};

/// Parse a `tls <cert> <key> [<ca>] { client_auth <mode> }` block
pub fn parse_tls(node: &KdlNode) -> Result<TlsConfig, ConfigError> {
    trace!("Parsing TLS configuration block");

    let args = get_string_args(node);
    if positional_args(node).len() != args.len() {
        return Err(ConfigError::InvalidValue {
            directive: "tls".to_string(),
            message: "certificate, key and CA arguments must be strings".to_string(),
        });
    }

    let mut config = match args.as_slice() {
        [cert, key] => TlsConfig {
            cert_file: Some(PathBuf::from(cert)),
            key_file: Some(PathBuf::from(key)),
            ..Default::default()
        },
        [cert, key, ca] => TlsConfig {
            cert_file: Some(PathBuf::from(cert)),
            key_file: Some(PathBuf::from(key)),
            ca_file: Some(PathBuf::from(ca)),
            ..Default::default()
        },
        _ => {
            return Err(ConfigError::ArgCount {
                directive: "tls".to_string(),
                expected: "2 or 3",
                found: args.len(),
            });
        }
    };

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "client_auth" | "client-auth" => {
                    let mode_args = get_string_args(child);
                    if mode_args.len() != 1 || positional_args(child).len() != 1 {
                        return Err(ConfigError::ArgCount {
                            directive: "client_auth".to_string(),
                            expected: "1",
                            found: positional_args(child).len(),
                        });
                    }
                    config.client_auth = mode_args[0].parse::<ClientAuthMode>()?;
                }
                "ca-file" | "ca_file" => {
                    config.ca_file = get_first_arg_string(child).map(PathBuf::from);
                }
                other => {
                    return Err(ConfigError::UnknownOption {
                        block: "tls",
                        option: other.to_string(),
                    });
                }
            }
        }
    }

    trace!(
        has_explicit_cert = config.cert_file.is_some(),
        has_trust_roots = config.ca_file.is_some(),
        client_auth = %config.client_auth,
        "Parsed TLS configuration"
    );

    Ok(config)
}

/// Parse an `acme { ... }` block
pub fn parse_acme(node: &KdlNode) -> Result<AcmeConfig, ConfigError> {
    trace!("Parsing ACME configuration block");

    let mut config = AcmeConfig::default();
    let mut explicit: Option<ChallengesConfig> = None;

    let Some(children) = node.children() else {
        return Ok(config);
    };

    for child in children.nodes() {
        let term = child.name().value().to_lowercase();
        match term.as_str() {
            "email" => config.email = get_first_arg_string(child),
            "directory" => {
                config.directory = get_first_arg_string(child).ok_or_else(|| {
                    ConfigError::InvalidValue {
                        directive: "directory".to_string(),
                        message: "expected a directory URL".to_string(),
                    }
                })?;
            }
            "staging" => {
                if positional_args(child).first().and_then(|v| v.as_bool()) == Some(true) {
                    config.directory = LETSENCRYPT_STAGING.to_string();
                }
            }
            "zones" | "domains" => config.zones.extend(get_string_args(child)),
            "challenge" => {
                let (challenge, port) = parse_challenge(child)?;
                // Listing any challenge switches from "all enabled" to "only listed"
                let challenges = explicit.get_or_insert_with(|| {
                    let mut c = ChallengesConfig::default();
                    c.http.enabled = false;
                    c.tls_alpn.enabled = false;
                    c
                });
                *challenges.get_mut(challenge) = ChallengeConfig::enabled(port);
            }
            "bind-address" => {
                let raw = get_first_arg_string(child).unwrap_or_default();
                config.bind_address =
                    raw.parse::<IpAddr>()
                        .map_err(|e| ConfigError::InvalidValue {
                            directive: "bind-address".to_string(),
                            message: format!("'{}': {}", raw, e),
                        })?;
            }
            "storage" => config.storage = get_first_arg_string(child).map(PathBuf::from),
            other => {
                return Err(ConfigError::UnexpectedTerm(other.to_string()));
            }
        }
    }

    if let Some(challenges) = explicit {
        config.challenges = challenges;
    }

    trace!(
        zones = ?config.zones,
        challenges = ?config.challenges.enabled_types(),
        directory = %config.directory,
        "Parsed ACME configuration"
    );

    Ok(config)
}

/// Parse `challenge <http|tlsalpn> port <integer>`
pub fn parse_challenge(node: &KdlNode) -> Result<(ChallengeType, u16), ConfigError> {
    let args = positional_args(node);
    let rendered: Vec<String> = args.iter().map(|v| display_value(v)).collect();

    if args.len() != 3 || args[1].as_string() != Some("port") {
        return Err(ConfigError::InvalidValue {
            directive: "challenge".to_string(),
            message: format!("unexpected arguments {:?}, expected <http|tlsalpn> port <integer>", rendered),
        });
    }

    let token = args[0].as_string().unwrap_or_default();
    let challenge = token
        .parse::<ChallengeType>()
        .map_err(|_| ConfigError::UnknownChallenge(rendered[0].clone()))?;

    let port = parse_port(args[2]).ok_or_else(|| ConfigError::InvalidPort {
        challenge: rendered[0].clone(),
        value: rendered[2].clone(),
    })?;

    trace!(challenge = %challenge, port, "Parsed challenge");
    Ok((challenge, port))
}

fn parse_port(value: &KdlValue) -> Option<u16> {
    let port = match value.as_integer() {
        Some(i) => i64::try_from(i).ok()?,
        None => value.as_string()?.trim().parse::<i64>().ok()?,
    };
    match u16::try_from(port) {
        Ok(0) | Err(_) => None,
        Ok(p) => Some(p),
    }
}

/// Parse a `renewal { ... }` block
pub fn parse_renewal(node: &KdlNode) -> Result<RenewalConfig, ConfigError> {
    let defaults = RenewalConfig::default();

    let positive = |name: &str, default: u64| -> Result<u64, ConfigError> {
        match get_int_entry(node, name) {
            None => Ok(default),
            Some(v) if v > 0 => Ok(v as u64),
            Some(v) => Err(ConfigError::InvalidValue {
                directive: name.to_string(),
                message: format!("must be positive, got {}", v),
            }),
        }
    };

    let config = RenewalConfig {
        renew_before_days: positive(
            "renew-before-days",
            u64::from(defaults.renew_before_days),
        )?
        .min(u64::from(u32::MAX)) as u32,
        check_interval_secs: positive("check-interval-secs", defaults.check_interval_secs)?,
        issuance_timeout_secs: positive("issuance-timeout-secs", defaults.issuance_timeout_secs)?,
        poll_interval_ms: positive("poll-interval-millis", defaults.poll_interval_ms)?,
    };

    trace!(
        renew_before_days = config.renew_before_days,
        check_interval_secs = config.check_interval_secs,
        "Parsed renewal configuration"
    );

    Ok(config)
}

/// Parse a `logging { level "info" format "json" }` block
pub fn parse_logging(node: &KdlNode) -> Result<LoggingConfig, ConfigError> {
    let mut config = LoggingConfig::default();

    if let Some(level) = get_string_entry(node, "level") {
        config.level = level;
    }
    if let Some(format) = get_string_entry(node, "format") {
        config.format = match format.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "pretty" | "text" => LogFormat::Pretty,
            other => {
                return Err(ConfigError::InvalidValue {
                    directive: "format".to_string(),
                    message: format!("unknown log format '{}', expected json or pretty", other),
                });
            }
        };
    }
    if let Some(ansi) = get_bool_entry(node, "ansi") {
        config.ansi = ansi;
    }

    Ok(config)
}
