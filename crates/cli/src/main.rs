use std::process::ExitCode;

use anyhow::{anyhow, Result};
use clap::Parser;
use tenantflow_cli::Cli;
use tenantflow_core::config::{AppConfig, LogFormat, LoadOptions};
use tracing_subscriber::EnvFilter;

/// Logs go to stderr so command output on stdout stays machine-readable.
/// A config that fails to load still gets default logging; the command
/// itself reports the config error.
fn init_logging(options: LoadOptions) -> Result<()> {
    let config = AppConfig::load(options).unwrap_or_default();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .map_err(|error| anyhow!("invalid log filter: {error}"))?;

    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match config.logging.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
    .map_err(|error| anyhow!("failed to install tracing subscriber: {error}"))
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.global.load_options())?;
    Ok(tenantflow_cli::execute(cli))
}
