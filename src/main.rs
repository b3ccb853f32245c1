//! Database Backup Tool
//!
//! Dumps, encrypts and uploads one PostgreSQL snapshot per invocation.

// drivevault/src/main.rs
use std::process::ExitCode;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use drivevault::backup;
use drivevault::config::RawBackupConfig;
use drivevault::errors::BackupError;

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env file is fine; the environment may already be populated.
    dotenv::dotenv().ok();
    if let Err(e) = init_logging() {
        eprintln!("❌ Error: {e:?}");
        return ExitCode::from(BackupError::EXIT_INTERNAL);
    }

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let raw = RawBackupConfig::from_env();
    match backup::run_backup_flow(&raw, &cancel).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => ExitCode::from(e.exit_code()),
    }
}

fn init_logging() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))
        .context("Failed to install log subscriber")
}

/// Cancels the run on SIGINT, or SIGTERM on unix.
async fn cancel_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "Could not listen for Ctrl-C");
                return;
            }
            warn!("Interrupt received, cancelling backup");
        }
        _ = terminate => warn!("Termination requested, cancelling backup"),
    }
    cancel.cancel();
}
