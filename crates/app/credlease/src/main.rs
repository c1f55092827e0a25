//! `credlease` binary.
//!
//! Runs the stale-lease reaper as a long-lived process, or performs one-shot
//! reap and refresh operations against the shared PostgreSQL store. Command
//! output is JSON on stdout; logs go to stderr.

// Import and re-export the `error` module
pub use self::error::{Error, Result};
mod error;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use cli::{Cli, Commands};
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use credlease_core::clock::{Clock, SystemClock};
use credlease_core::config::LeaseConfig;
use credlease_core::lease::LeaseManager;
use credlease_core::metrics::LeaseMetrics;
use credlease_core::reaper::StaleLeaseReaper;
use credlease_core::refresh::provider::HttpTokenProvider;
use credlease_core::refresh::{RefreshOrchestrator, RefreshOutcome, RefreshSettings};
use credlease_core::scheduler::ReaperScheduler;
use credlease_core::store::{LockStore, PgLockStore};

mod cli;
mod logging;

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = run().await {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> Result<()> {
    dotenvy::dotenv().ok();
    logging::init()?;

    let args = Cli::parse();

    if args.command == Commands::Version {
        println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let mut config = LeaseConfig::from_env()?;
    config.database_url = args.database_url;

    info!(
        max_connections = args.max_connections,
        instance = %config.instance,
        "configuring connection pool"
    );
    let pool = PgPoolOptions::new()
        .max_connections(args.max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&config.database_url)
        .await?;

    info!("running database migrations");
    credlease_core::migrate::migrate(&pool).await?;

    let store: Arc<dyn LockStore> = Arc::new(PgLockStore::new(pool, &config.encryption_key));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let metrics = Arc::new(LeaseMetrics::new());

    match args.command {
        Commands::Reaper {
            interval_ms,
            threshold_ms,
        } => {
            if let Some(ms) = interval_ms {
                config.reaper_interval = Duration::from_millis(ms);
            }
            if let Some(ms) = threshold_ms {
                config.stale_threshold = Duration::from_millis(ms);
            }
            config.validate()?;

            let reaper = StaleLeaseReaper::new(store, clock, metrics.clone());
            let scheduler = ReaperScheduler::new(reaper);
            if !scheduler.start(config.reaper_interval, config.stale_threshold) {
                return Err(Error::Custom("reaper scheduler did not start".into()));
            }

            tokio::signal::ctrl_c().await?;
            info!("shutdown signal received");
            scheduler.stop().await;

            println!(
                "{}",
                serde_json::json!({
                    "scheduler": scheduler.status(),
                    "metrics": metrics.snapshot(),
                })
            );
        }

        Commands::Reap { threshold_ms } => {
            if let Some(ms) = threshold_ms {
                config.stale_threshold = Duration::from_millis(ms);
                config.validate()?;
            }
            let reaper = StaleLeaseReaper::new(store, clock, metrics);
            let report = reaper.reap_now(config.stale_threshold_chrono()).await?;
            println!("{}", serde_json::to_string(&report)?);
        }

        Commands::Refresh {
            server_id,
            token_url,
            client_id,
            client_secret,
        } => {
            let provider = HttpTokenProvider::new(token_url, client_id, client_secret, clock.clone());
            let leases = LeaseManager::new(store, clock, metrics, config.instance.clone());
            let orchestrator = RefreshOrchestrator::new(
                leases,
                Arc::new(provider),
                config.retry_policy(),
                RefreshSettings::from(&config),
            );

            let outcome = orchestrator.refresh_with_retry(&server_id).await?;
            let kind = match &outcome {
                RefreshOutcome::Refreshed(_) => "refreshed",
                RefreshOutcome::AlreadyFresh(_) => "alreadyFresh",
            };
            // Token values stay out of the output.
            println!(
                "{}",
                serde_json::json!({
                    "serverId": server_id,
                    "outcome": kind,
                    "expiresAt": outcome.tokens().expires_at,
                })
            );
        }

        Commands::Version => {}
    }

    Ok(())
}
