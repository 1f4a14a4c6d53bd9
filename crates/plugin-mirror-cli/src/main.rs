mod commands;
mod config;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use plugin_mirror_store::FsMirrorStore;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::AppConfig;

#[derive(Parser)]
#[command(name = "plugin-mirror")]
#[command(about = "Mirror a plugin marketplace into a local catalog and artifact store")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, global = true, env = "PLUGIN_MIRROR_CONFIG")]
    config_file: Option<PathBuf>,

    /// Log filter (e.g. `info`, `plugin_mirror=debug`)
    #[arg(long, global = true, env = "PLUGIN_MIRROR_LOG", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sync every configured product version from upstream
    Sync {
        /// Only mirror these plugin ids (repeatable)
        #[arg(long = "include-plugin", value_name = "ID")]
        include: Vec<String>,
        /// Keep withdrawn catalogs and unreferenced artifacts
        #[arg(long)]
        no_retire: bool,
    },
    /// Show published catalogs and stored artifacts
    Status,
}

fn init_logging(filter: &str) {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    // Ignore a second init, e.g. from tests.
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}

fn open_store(config: &AppConfig) -> Result<FsMirrorStore> {
    FsMirrorStore::open(
        &config.base_path,
        &config.storage_path,
        &config.storage_url,
    )
    .with_context(|| {
        format!(
            "failed to open mirror store at {}",
            config.storage_path.display()
        )
    })
}

/// Cancel `token` on the first Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C, cancelling run");
            eprintln!("Cancelling; waiting for in-progress commits to finish...");
            token.cancel();
        }
    });
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let app_config = config::load_config(cli.config_file.as_deref())?;

    match cli.command {
        Command::Sync { include, no_retire } => {
            let store = Arc::new(open_store(&app_config)?);
            let mut options = app_config.sync_options(&include);
            if no_retire {
                options.retire = false;
            }

            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());

            let report = commands::sync::run(&app_config, store, options, cancel).await?;
            if report.is_success() {
                Ok(ExitCode::SUCCESS)
            } else {
                eprintln!("error: no product version was published");
                Ok(ExitCode::FAILURE)
            }
        }
        Command::Status => {
            let store = open_store(&app_config)?;
            commands::status::run(&app_config, &store)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);
    run(cli).await
}
