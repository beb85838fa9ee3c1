//! autocert - Main entry point
//!
//! Obtains and renews a certificate over ACME DNS-01.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use autocert::dns::create_provisioner;
use autocert::{CertificateManager, ManagerConfig, RenewalState};
use autocert_config::Config;

/// autocert - ACME DNS-01 certificate manager
#[derive(Parser, Debug)]
#[command(name = "autocert")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = "AUTOCERT_CONFIG")]
    config: String,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose")]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate configuration file and exit
    Test,
    /// Load or issue the certificate once and exit
    Issue {
        /// Give up after this many seconds
        #[arg(long = "timeout")]
        timeout: Option<u64>,
    },
    /// Keep the certificate renewed until interrupted (default)
    Run,
}

fn main() -> Result<()> {
    // Before any TLS client is created
    autocert::install_crypto_provider();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Test) => test_config(&cli.config),
        Some(Commands::Issue { timeout }) => {
            init_logging(cli.verbose);
            runtime()?.block_on(issue(&cli.config, timeout.map(Duration::from_secs)))
        }
        Some(Commands::Run) | None => {
            init_logging(cli.verbose);
            runtime()?.block_on(run(&cli.config))
        }
    }
}

fn init_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")
}

fn load_config(path: &str) -> Result<Config> {
    info!("Loading configuration from: {}", path);
    let config = Config::from_file(path).context("Failed to load configuration file")?;
    config.validate().context("Configuration validation failed")?;
    Ok(config)
}

fn build_manager(config: &Config) -> Result<Arc<CertificateManager>> {
    let provisioner =
        create_provisioner(&config.dns_provider).context("Failed to create DNS provisioner")?;
    let manager_config = ManagerConfig::from_config(config, provisioner);
    Ok(Arc::new(CertificateManager::new(manager_config)))
}

/// Test configuration file and exit
fn test_config(config_path: &str) -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let config = load_config(config_path)?;

    info!("Configuration test successful:");
    info!("  - domain: {}", config.acme.domain);
    info!("  - directory: {}", config.acme.directory_url());
    info!("  - dns zone: {}", config.dns_provider.provider.zone());
    info!(
        "  - propagation check: {}",
        if config.dns_provider.propagation.enabled {
            "enabled"
        } else {
            "disabled"
        }
    );

    println!(
        "autocert: configuration file {} test is successful",
        config_path
    );
    Ok(())
}

/// One load-or-issue pass
async fn issue(config_path: &str, timeout: Option<Duration>) -> Result<()> {
    let config = load_config(config_path)?;
    let manager = build_manager(&config)?;
    let cancel = CancellationToken::new();

    let pass = manager.load_or_renew(&cancel);
    tokio::pin!(pass);

    let result = match timeout {
        Some(limit) => tokio::select! {
            result = &mut pass => result,
            _ = tokio::time::sleep(limit) => {
                // Let the pass observe cancellation so the challenge record is removed
                cancel.cancel();
                let _ = pass.await;
                bail!("Certificate issuance timed out after {}s", limit.as_secs());
            }
        },
        None => pass.await,
    };
    result.context("Certificate issuance failed")?;

    if let Some(live) = manager.live() {
        info!(
            domain = %config.acme.domain,
            not_after = %live.not_after,
            path = %manager.store().cert_path(&config.acme.domain).display(),
            "Certificate ready"
        );
    }
    Ok(())
}

/// Load or issue, then renew until Ctrl-C or a failed renewal
async fn run(config_path: &str) -> Result<()> {
    let config = load_config(config_path)?;
    let manager = build_manager(&config)?;
    let cancel = CancellationToken::new();

    let handle = manager
        .run(cancel.clone())
        .await
        .context("Initial certificate pass failed")?;

    let mut state = handle.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received interrupt, shutting down");
                cancel.cancel();
                break;
            }
            changed = state.changed() => {
                if changed.is_err() || state.borrow().is_terminal() {
                    break;
                }
            }
        }
    }

    match handle.finished().await {
        RenewalState::Failed(reason) => {
            error!(reason = %reason, "Certificate renewal stopped");
            bail!("Certificate renewal failed: {}", reason)
        }
        _ => Ok(()),
    }
}
