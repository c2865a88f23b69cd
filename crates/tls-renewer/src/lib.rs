//! tls-renewer keeps a TLS certificate bundle on disk valid
//!
//! The daemon fetches certificates from a Vault PKI endpoint, writes them as
//! a single `certificate + key` file and runs configured hook commands so
//! consuming services pick up the new material. See [`renewal`] for the
//! scheduling rules.

pub mod cert_writer;
pub mod clock;
pub mod config;
pub mod env_expand;
pub mod hooks;
pub mod renewal;
pub mod source;
pub mod tracing_setup;

#[cfg(test)]
pub(crate) mod test_utils;

use crate::config::Config;
use crate::renewal::{Renewer, SHUTDOWN_GRACE};
use crate::tracing_setup::LogFormat;
use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::signal;
use tracing::{error, info};

const EXIT_FATAL: u8 = 1;
const EXIT_CONFIG: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "tls-renewer")]
#[command(about = "Keep a TLS certificate bundle renewed from Vault PKI", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Path to config file (.json or .toml)
    #[arg(
        short,
        long,
        env = "TLS_RENEWER_CONFIG",
        default_value = "/etc/tls-renewer/config.json"
    )]
    pub config: PathBuf,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

pub async fn run() -> Result<ExitCode> {
    let cli = Cli::parse();
    tracing_setup::init(cli.log_format)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "tls-renewer starting"
    );

    let config = match Config::from_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            eprintln!(
                "Configuration error: {}: {}",
                cli.config.display(),
                e
            );
            return Ok(ExitCode::from(EXIT_CONFIG));
        }
    };

    let renewer = match Renewer::from_config(&config) {
        Ok(renewer) => renewer,
        Err(e) => {
            error!(error = %e, "Failed to set up certificate source");
            eprintln!("Configuration error: {}", e);
            return Ok(ExitCode::from(EXIT_CONFIG));
        }
    };

    info!(
        vault = %config.vault.address,
        bundle = %config.tls.bundle_path().display(),
        onstart_hooks = config.onstart.len(),
        onreplace_hooks = config.onreplace.len(),
        "Configuration loaded"
    );

    let mut handle = renewer.spawn();

    let stopped = tokio::select! {
        result = handle.stopped() => Some(result),
        _ = shutdown_signal() => None,
    };

    match stopped {
        // The scheduler already logged the fatal error
        Some(Err(e)) => {
            eprintln!("Error: {}", e);
            Ok(ExitCode::from(EXIT_FATAL))
        }
        Some(Ok(())) => Ok(ExitCode::SUCCESS),
        None => {
            info!("Shutdown signal received");
            if let Err(e) = handle.shutdown(SHUTDOWN_GRACE).await {
                error!(error = %e, "Renewal loop failed during shutdown");
                return Ok(ExitCode::from(EXIT_FATAL));
            }
            info!("tls-renewer stopped");
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Wait for SIGTERM or Ctrl+C
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = sigterm => {},
    }
}
