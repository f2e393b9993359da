//! KDL configuration parsing.

mod helpers;
mod server;

pub use server::{parse_acme, parse_challenge, parse_logging, parse_renewal, parse_tls};

use kdl::KdlDocument;
use tracing::debug;

use crate::{Config, ConfigError};

/// Parse a complete configuration document
pub fn parse_document(source: &str) -> Result<Config, ConfigError> {
    let doc: KdlDocument = source
        .parse()
        .map_err(|e: kdl::KdlError| ConfigError::Parse(e.to_string()))?;

    let mut config = Config::default();
    let mut seen_acme = false;

    for node in doc.nodes() {
        match node.name().value() {
            "tls" => {
                if config.tls.is_some() {
                    return Err(ConfigError::DuplicateTls);
                }
                config.tls = Some(parse_tls(node)?);
            }
            "acme" => {
                if seen_acme {
                    return Err(ConfigError::DuplicateBlock("acme"));
                }
                seen_acme = true;
                config.acme = parse_acme(node)?;
            }
            "renewal" => config.renewal = parse_renewal(node)?,
            "logging" => config.logging = parse_logging(node)?,
            other => {
                return Err(ConfigError::UnknownOption {
                    block: "root",
                    option: other.to_string(),
                });
            }
        }
    }

    debug!(
        has_tls = config.tls.is_some(),
        zone_count = config.acme.zones.len(),
        "Parsed configuration document"
    );

    Ok(config)
}
