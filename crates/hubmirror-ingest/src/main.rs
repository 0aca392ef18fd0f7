//! hubmirror replication daemon.
//!
//! Backfills every account's history from a hub and follows its live event
//! stream, writing both into a SQLite mirror.
//!
//! # Usage
//!
//! ```bash
//! # Backfill and live replication against a local hub
//! hubmirror-ingest
//!
//! # Custom hub and database
//! hubmirror-ingest \
//!     --hub-url http://hub.example:2281 \
//!     --database-path /data/hubmirror.db
//!
//! # Live only, smaller batches
//! HUB_URL=http://hub.example:2281 hubmirror-ingest --no-backfill --max-batch-size 20
//! ```
//!
//! # Graceful Shutdown
//!
//! On SIGINT (exit 130) or SIGTERM (exit 143):
//! 1. Stops consuming live events and admitting new backfill accounts
//! 2. Lets in-flight accounts and the buffered live batch finish
//! 3. Releases the hub subscription
//!
//! Already-completed accounts and the committed cursor make the next start
//! resume where this one left off.

use anyhow::{Context, Result, bail};
use clap::Parser;
use hubmirror_core::metrics::{init_metrics, start_metrics_server};
use hubmirror_ingest::gateway::DEFAULT_MAX_ATTEMPTS;
use hubmirror_ingest::hub::{DEFAULT_HUB_URL, DEFAULT_PAGE_SIZE};
use hubmirror_ingest::live::{DEFAULT_MAX_BATCH_SIZE, DEFAULT_MAX_WAIT};
use hubmirror_ingest::{
    BackfillConfig, BackfillScheduler, BackfillStats, BatcherConfig, GatewayConfig,
    HttpHubClient, HttpHubConfig, LiveConfig, LivePipeline, LiveStats, PersistenceGateway,
    SqliteStore,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// hubmirror replication daemon.
#[derive(Parser, Debug)]
#[command(name = "hubmirror-ingest")]
#[command(about = "Mirror a Farcaster hub into SQLite")]
#[command(version)]
struct Args {
    /// Hub HTTP API URL
    #[arg(long, env = "HUB_URL", default_value = DEFAULT_HUB_URL)]
    hub_url: String,

    /// SQLite database file
    #[arg(long, env = "DATABASE_PATH", default_value = "./data/hubmirror.db")]
    database_path: PathBuf,

    /// Accounts backfilled in parallel (defaults to the number of CPUs)
    #[arg(long, env = "MAX_CONCURRENCY")]
    max_concurrency: Option<usize>,

    /// Messages requested per history page
    #[arg(long, env = "MAX_PAGE_SIZE", default_value_t = DEFAULT_PAGE_SIZE)]
    page_size: u32,

    /// Live messages per batch
    #[arg(long, env = "MAX_BATCH_SIZE", default_value_t = DEFAULT_MAX_BATCH_SIZE)]
    max_batch_size: usize,

    /// Longest a partial live batch waits before flushing, in milliseconds
    #[arg(long, env = "BATCH_INTERVAL_MS", default_value_t = DEFAULT_MAX_WAIT.as_millis() as u64)]
    batch_interval_ms: u64,

    /// Attempts per storage operation on transient failures
    #[arg(long, env = "MAX_STORE_RETRIES", default_value_t = DEFAULT_MAX_ATTEMPTS)]
    max_store_retries: u32,

    /// Skip the historical backfill
    #[arg(long)]
    no_backfill: bool,

    /// Skip live replication
    #[arg(long)]
    no_live: bool,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, env = "METRICS_PORT", default_value = "9090")]
    metrics_port: u16,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse()?)
                .add_directive("hubmirror_ingest=debug".parse()?),
        )
        .init();

    let args = Args::parse();
    if args.no_backfill && args.no_live {
        bail!("--no-backfill and --no-live together leave nothing to run");
    }

    tracing::info!("hubmirror replication daemon starting...");

    if args.metrics_port > 0 {
        match init_metrics() {
            Some(handle) => start_metrics_server(args.metrics_port, handle)
                .await
                .with_context(|| {
                    format!("Failed to start metrics server on port {}", args.metrics_port)
                })?,
            None => tracing::warn!("Metrics recorder already installed; not serving metrics"),
        }
    }

    let concurrency = args.max_concurrency.unwrap_or_else(num_cpus::get).max(1);

    tracing::info!("Configuration:");
    tracing::info!("  Hub: {}", args.hub_url);
    tracing::info!("  Database: {}", args.database_path.display());
    tracing::info!(
        "  Backfill: {} (concurrency {}, page size {})",
        !args.no_backfill,
        concurrency,
        args.page_size
    );
    tracing::info!(
        "  Live: {} (batch {} / {}ms)",
        !args.no_live,
        args.max_batch_size,
        args.batch_interval_ms
    );
    tracing::info!("  Store retries: {}", args.max_store_retries);

    let store = SqliteStore::open(&args.database_path)
        .with_context(|| format!("Failed to open database at {}", args.database_path.display()))?;
    let gateway = Arc::new(PersistenceGateway::new(
        Arc::new(store),
        GatewayConfig {
            max_attempts: args.max_store_retries.max(1),
        },
    ));

    let hub = Arc::new(
        HttpHubClient::new(HttpHubConfig {
            base_url: args.hub_url.clone(),
            page_size: args.page_size,
            ..Default::default()
        })
        .context("Invalid hub configuration")?,
    );

    match hub.hub_info().await {
        Ok(info) => {
            tracing::info!(
                "Hub {} version {} (syncing: {})",
                if info.nickname.is_empty() { &args.hub_url } else { &info.nickname },
                info.version,
                info.is_syncing
            );
            if let Some(stats) = info.db_stats {
                tracing::info!(
                    "  ~{} messages, {} fid events, {} fname events",
                    stats.num_messages,
                    stats.num_fid_events,
                    stats.num_fname_events
                );
            }
        }
        Err(e) => tracing::warn!("Unable to get info about hub {}: {}", args.hub_url, e),
    }

    let backfill = BackfillScheduler::new(
        Arc::clone(&hub),
        Arc::clone(&gateway),
        BackfillConfig { concurrency },
    );
    let live = LivePipeline::new(
        Arc::clone(&hub),
        Arc::clone(&gateway),
        LiveConfig {
            batcher: BatcherConfig {
                max_batch_size: args.max_batch_size.max(1),
                max_wait: Duration::from_millis(args.batch_interval_ms),
            },
            ..Default::default()
        },
    );

    // A fatal error on one side stops the other.
    let backfill_run = async {
        if args.no_backfill {
            return Ok(None);
        }
        let result = backfill.run().await;
        if result.is_err() {
            live.stop();
        }
        result.map(Some)
    };
    let live_run = async {
        if args.no_live {
            return Ok(None);
        }
        let result = live.run().await;
        if result.is_err() {
            backfill.stop();
        }
        result.map(Some)
    };
    let engine = async { tokio::join!(backfill_run, live_run) };
    tokio::pin!(engine);

    let exit_code = tokio::select! {
        (backfilled, lived) = &mut engine => {
            summarize(backfilled, lived)?;
            ExitCode::SUCCESS
        }
        code = shutdown_signal() => {
            tracing::info!("Shutdown signal received, stopping gracefully...");
            backfill.stop();
            live.stop();
            let (backfilled, lived) = engine.await;
            summarize(backfilled, lived)?;
            ExitCode::from(code)
        }
    };

    Ok(exit_code)
}

/// Log what each side did and surface the first fatal error.
fn summarize(
    backfilled: hubmirror_ingest::Result<Option<BackfillStats>>,
    lived: hubmirror_ingest::Result<Option<LiveStats>>,
) -> Result<()> {
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("SHUTDOWN COMPLETE");
    tracing::info!("═══════════════════════════════════════════════════════");

    if let Ok(Some(stats)) = &backfilled {
        tracing::info!("Accounts total:       {}", stats.max_account_id);
        tracing::info!("Accounts backfilled:  {}", stats.completed);
        tracing::info!("Accounts skipped:     {}", stats.skipped);
        tracing::info!("Accounts failed:      {}", stats.failed);
        tracing::info!("Messages backfilled:  {}", stats.messages);
    }
    if let Ok(Some(stats)) = &lived {
        tracing::info!("Live events received: {}", stats.subscriber.received);
        tracing::info!("Live messages:        {}", stats.subscriber.forwarded);
        tracing::info!("Live batches:         {}", stats.batches);
        tracing::info!("Cursor:               {:?}", stats.cursor);
    }

    backfilled.context("Backfill failed")?;
    lived.context("Live replication failed")?;
    Ok(())
}

/// Wait for SIGINT or SIGTERM and return the matching exit code.
async fn shutdown_signal() -> u8 {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        130
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                143
            }
            Err(e) => {
                tracing::warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<u8>().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<u8>();

    tokio::select! {
        code = interrupt => code,
        code = terminate => code,
    }
}
