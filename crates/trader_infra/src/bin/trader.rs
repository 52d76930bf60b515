//! trader: one supervised worker per account file.
//!
//! Usage:
//!   trader [--config-dir <DIR>] [--log <FILTER>]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span};
use tracing_subscriber::EnvFilter;

use trader_infra::config::load_accounts;
use trader_infra::supervisor::{RestartPolicy, SupervisorExit, supervise};
use trader_infra::worker::run_account;

#[derive(Parser, Debug)]
#[command(name = "trader")]
#[command(about = "Real-time equity auto-trader")]
#[command(version)]
struct Args {
    /// Directory holding one JSON file per account
    #[arg(long, default_value = "config/accounts")]
    config_dir: PathBuf,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log))
        .context("invalid log filter")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let accounts = load_accounts(&args.config_dir)
        .with_context(|| format!("loading accounts from {}", args.config_dir.display()))?;
    info!(accounts = accounts.len(), "starting");

    let cancel = CancellationToken::new();
    let mut handles = Vec::with_capacity(accounts.len());
    for account in accounts {
        let policy = RestartPolicy::from_tunables(&account.tunables()?);
        let name = account.name.clone();
        let span = info_span!("account", name = %name);
        let token = cancel.clone();
        let handle = tokio::spawn(
            async move {
                supervise(&name, &policy, token, |child| run_account(account.clone(), child)).await
            }
            .instrument(span),
        );
        handles.push(handle);
    }

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received; stopping workers");
            shutdown.cancel();
        }
    });

    for handle in handles {
        match handle.await {
            Ok(SupervisorExit::GaveUp { restarts, last_error }) => {
                error!(restarts, %last_error, "account worker gave up");
            }
            Ok(exit) => info!(?exit, "account worker exited"),
            Err(join) => error!(error = %join, "account task failed"),
        }
    }
    Ok(())
}
