//! bleproxy daemon entry point

use std::fs::OpenOptions;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use bleproxy_ble::backend::SystemAdapter;
use bleproxy_runtime::Daemon;

mod cli;

use cli::Cli;

/// Exit code when terminated by a signal
const EXIT_SIGNAL: u8 = 130;
/// Exit code for a fatal startup error
const EXIT_STARTUP: u8 = 1;
/// Exit code when no BLE adapter is usable
const EXIT_NO_ADAPTER: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_logging(&cli) {
        eprintln!("failed to initialize logging: {e}");
        return ExitCode::from(EXIT_STARTUP);
    }

    let adapter = match SystemAdapter::new().await {
        Ok(adapter) => adapter,
        Err(e) => {
            error!(error = %e, "no usable Bluetooth adapter");
            return ExitCode::from(EXIT_NO_ADAPTER);
        }
    };

    let config = cli.to_config();
    let daemon = match Daemon::start(config, adapter).await {
        Ok(daemon) => daemon,
        Err(e) => {
            error!(error = %e, "failed to start daemon");
            return ExitCode::from(EXIT_STARTUP);
        }
    };

    info!(addr = %daemon.local_addr(), "bleproxy is running, press Ctrl+C to stop");

    daemon
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to wait for shutdown signal");
            }
            info!("shutdown signal received");
        })
        .await;

    ExitCode::from(EXIT_SIGNAL)
}

/// Route tracing output to stderr or the configured log file
fn setup_logging(cli: &Cli) -> std::io::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));

    match &cli.log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::sync::Arc::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}
