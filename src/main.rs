//! modver - check whether a newer version of a module has been published
//!
//! Lookups are cached on disk for a day, so repeated invocations stay offline.

use clap::Parser;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use modver::cli::{Cli, Command};
use modver::version::{cache_key, ModuleVersionChecker, RegistryClient};

/// Logs go to stderr so command output on stdout stays machine readable.
fn init_logging(verbose: bool) {
    let filter = if verbose { "modver=debug" } else { "modver=warn" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let settings = cli.command.settings()?;

    match cli.command {
        Command::Check {
            module, current, ..
        } => {
            let registry =
                RegistryClient::with_base_url(settings.registry_url.clone(), settings.fetch_timeout)?;
            let checker = ModuleVersionChecker::new(module, settings.store(), registry);
            // Covers the disk round trip as well as the request itself.
            let budget = settings.fetch_timeout + Duration::from_secs(1);
            let status = checker.check_with_timeout(&current, budget).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::CachePath { module, .. } => {
            println!("{}", settings.store().cache_path(&cache_key(&module)).display());
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    run(cli).await
}
