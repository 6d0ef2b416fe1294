//! autobrowser CLI entry point.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use autobrowser_rs::config::AutomationConfig;
use autobrowser_rs::driver::{multi, single};
use autobrowser_rs::runner;

/// Headless-browser crawling automation driven over the Chrome DevTools
/// Protocol, coordinated through Redis.
///
/// All run configuration is read from the environment (see the project's
/// documentation for the full variable list); the CLI only controls
/// logging verbosity.
#[derive(Parser)]
#[command(name = "autobrowser")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable debug-level logging, overriding `RUST_LOG`.
    #[arg(short, long)]
    verbose: bool,
}

fn install_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    install_tracing(cli.verbose);

    let config = Arc::new(AutomationConfig::from_env());

    let exit_code = if config.browser_host_ip.is_some() {
        tracing::info!("starting in single-browser mode");
        let driver = Arc::new(single::SingleBrowserDriver::new(config)?);
        single::start(&driver).await?;
        runner::run_to_exit_code(driver).await
    } else {
        tracing::info!("starting in multi-browser mode");
        let driver = Arc::new(multi::MultiBrowserDriver::new(config)?);
        multi::start(&driver).await?;
        runner::run_to_exit_code(driver).await
    };

    std::process::exit(exit_code);
}
