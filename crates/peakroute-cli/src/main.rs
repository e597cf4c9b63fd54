//! peakroute - local HTTP proxy over the antpeak.com VPN backend

use anyhow::{Context, Result};
use clap::Parser;
use peakroute_cli::config::DEFAULT_LOG_LEVEL;
use peakroute_cli::{Cli, Settings, StartupError};
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Setup logging with the specified log level; `RUST_LOG` wins when set
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(log_level)
            .with_context(|| format!("Invalid log level: {}", log_level))?,
    };

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false),
        )
        .with(filter)
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match Settings::from_cli(cli) {
        Ok(settings) => settings,
        Err(e) => {
            let _ = setup_logging(DEFAULT_LOG_LEVEL);
            let e = StartupError::from(e);
            error!("{}", e);
            return ExitCode::from(e.exit_code());
        }
    };

    if let Err(e) = setup_logging(&settings.log_level) {
        eprintln!("{:#}", e);
        return ExitCode::from(2);
    }

    match peakroute_cli::run(settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::from(e.exit_code())
        }
    }
}
