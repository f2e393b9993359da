//! Zonecert - Main entry point
//!
//! Keeps certificates for the configured zones issued and renewed until
//! interrupted.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use zonecert::CertificateService;
use zonecert_config::{Config, LogFormat, LoggingConfig};

/// Default configuration path
const DEFAULT_CONFIG: &str = "/etc/zonecert/zonecert.kdl";

/// Grace period for background tasks on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Zonecert - automatic ACME certificates with HTTP-01 and TLS-ALPN-01
#[derive(Parser, Debug)]
#[command(name = "zonecert")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = "ZONECERT_CONFIG")]
    config: Option<String>,

    /// Test configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose")]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate configuration file and exit
    Test {
        /// Configuration file to test
        #[arg(short = 'c', long = "config")]
        config: Option<String>,
    },
    /// Run the certificate service (default)
    Run {
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.test {
        return test_config(cli.config.as_deref());
    }

    match cli.command {
        Some(Commands::Test { config }) => test_config(config.as_deref().or(cli.config.as_deref())),
        Some(Commands::Run { config }) => run(config.or(cli.config), cli.verbose),
        None => run(cli.config, cli.verbose),
    }
}

fn load_config(path: Option<&str>) -> Result<(Config, String)> {
    let path = path.unwrap_or(DEFAULT_CONFIG).to_string();
    let config = Config::from_file(&path)
        .with_context(|| format!("Failed to load configuration file {}", path))?;
    Ok((config, path))
}

/// Initialize tracing; `RUST_LOG` overrides the configured level
fn init_logging(logging: &LoggingConfig, verbose: bool) {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(logging.ansi);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

/// Test configuration file and exit
fn test_config(config_path: Option<&str>) -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let (config, path) = load_config(config_path)?;
    config.validate().context("Configuration validation failed")?;

    info!("Configuration test successful:");
    info!("  - {} zone(s)", config.acme.zones.len());
    info!(
        "  - challenges: {:?}",
        config.acme.challenges.enabled_types()
    );
    if let Some(tls) = &config.tls {
        info!("  - client auth: {}", tls.client_auth);
    }
    if config.acme.storage.is_none() {
        warn!("No storage configured; certificates are re-issued on every start");
    }

    println!("zonecert: configuration file {} test is successful", path);
    Ok(())
}

/// Run the certificate service until interrupted
fn run(config_path: Option<String>, verbose: bool) -> Result<()> {
    let (config, path) = load_config(config_path.as_deref())?;
    init_logging(&config.logging, verbose);
    info!(config = %path, "Loaded configuration");

    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        warn!("A default crypto provider was already installed");
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;
    runtime.block_on(serve(config))
}

async fn serve(config: Config) -> Result<()> {
    let zones = config.zones()?;
    let service =
        CertificateService::from_config(&config).context("Failed to initialize certificate service")?;

    let report = service.start_responders().await?;
    for (challenge, addr) in &report.started {
        info!(challenge = %challenge, address = %addr, "Challenge responder ready");
    }
    if report.none_started() {
        for e in &report.failed {
            error!(error = %e, "Challenge responder unavailable");
        }
        bail!("no challenge responder could be started");
    }

    let handles = service.manage(&zones)?;
    service.spawn_renewal();

    let issuing = tokio::spawn(async move {
        for handle in handles {
            let zone = handle.zone().clone();
            match handle.wait().await {
                Ok(cert) => info!(zone = %zone, expires = %cert.expires(), "Certificate ready"),
                Err(e) => error!(zone = %zone, error = %e, "Certificate not obtained, will retry on renewal scan"),
            }
        }
    });

    info!(zones = zones.len(), "Zonecert started");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Received shutdown signal, initiating graceful shutdown");

    issuing.abort();
    service.shutdown(SHUTDOWN_GRACE).await;

    if let Some(e) = service.last_responder_error() {
        warn!(error = %e, "Last challenge responder error");
    }

    Ok(())
}
