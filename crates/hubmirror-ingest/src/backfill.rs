//! BackfillScheduler: resumable bulk replication of every account.
//!
//! # Architecture
//!
//! ```text
//! max_account_id ──► ids 1..=max minus completed ──► bounded worker pool
//!                                                        │
//!                        per account, sequentially:      ▼
//!                        casts → reactions → links → signers
//!                        → verifications → user data, every page
//!                                                        │
//!                                                        ▼
//!                                 PersistenceGateway::merge → mark_backfilled
//! ```
//!
//! Only completion is persisted. An account that fails or is interrupted
//! stays pending and is re-fetched from its first page on the next run,
//! which is safe because every merge is idempotent. A failure in one
//! account never affects the others.

use crate::gateway::PersistenceGateway;
use crate::hub::{HubClient, MessageKind, PageCursor};
use crate::{Error, Result};
use hubmirror_core::metrics::{increment, set_gauge};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Configuration for the backfill scheduler.
#[derive(Debug, Clone)]
pub struct BackfillConfig {
    /// Accounts processed in parallel.
    pub concurrency: usize,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            concurrency: num_cpus::get(),
        }
    }
}

/// Statistics from a backfill run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillStats {
    pub max_account_id: u64,
    /// Accounts already complete before this run.
    pub skipped: u64,
    pub completed: u64,
    pub failed: u64,
    /// Messages fetched and merged.
    pub messages: u64,
}

/// Humanized duration: `1h 2m 3s`, `4m 0s`, `12s`.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{}h {}m {}s", h, m, s)
    } else if m > 0 {
        format!("{}m {}s", m, s)
    } else {
        format!("{}s", s)
    }
}

struct Progress {
    started: Instant,
    total: u64,
    processed: u64,
}

impl Progress {
    fn new(total: u64) -> Self {
        Self {
            started: Instant::now(),
            total,
            processed: 0,
        }
    }

    /// Count one finished job and estimate the time left for the rest.
    fn advance(&mut self) -> Duration {
        self.processed += 1;
        let remaining = self.total.saturating_sub(self.processed);
        let per_job = self.started.elapsed().as_secs_f64() / self.processed as f64;
        Duration::from_secs_f64(per_job * remaining as f64)
    }
}

/// Fetch and merge every message of one account, then mark it complete.
///
/// Pages are merged on the blocking pool so SQLite writes stay off the
/// runtime's worker threads. Returns the number of messages merged.
async fn backfill_account<H: HubClient>(
    hub: &H,
    gateway: &Arc<PersistenceGateway>,
    fid: u64,
) -> Result<u64> {
    let mut messages = 0u64;

    for kind in MessageKind::ALL {
        let mut cursor = PageCursor::new(fid, kind);
        while let Some(page) = cursor.next_page(hub).await? {
            let gateway = Arc::clone(gateway);
            let merged = tokio::task::spawn_blocking(move || {
                gateway.merge_all(&page).map(|_| page.len())
            })
            .await??;
            messages += merged as u64;
        }
    }

    gateway.mark_backfilled(fid)?;
    Ok(messages)
}

/// Bounded-concurrency backfill over all accounts.
pub struct BackfillScheduler<H> {
    hub: Arc<H>,
    gateway: Arc<PersistenceGateway>,
    config: BackfillConfig,
    running: Arc<AtomicBool>,
}

impl<H: HubClient> BackfillScheduler<H> {
    pub fn new(hub: Arc<H>, gateway: Arc<PersistenceGateway>, config: BackfillConfig) -> Self {
        Self {
            hub,
            gateway,
            config,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Flag cleared by [`stop`](Self::stop); share it with a signal handler.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Stop admitting new accounts. Jobs already running finish normally.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Run one full pass over accounts `1..=max_account_id`.
    pub async fn run(&self) -> Result<BackfillStats> {
        let max_account_id = self.hub.max_account_id().await?;
        let completed = self.gateway.backfilled_accounts()?;
        let pending: Vec<u64> = (1..=max_account_id)
            .filter(|fid| !completed.contains(fid))
            .collect();

        let mut stats = BackfillStats {
            max_account_id,
            skipped: max_account_id - pending.len() as u64,
            ..Default::default()
        };

        if pending.is_empty() {
            tracing::info!("Backfill: all {} accounts already complete", max_account_id);
            return Ok(stats);
        }

        let concurrency = self.config.concurrency.max(1);
        tracing::info!(
            "Backfill: {} of {} accounts pending ({} complete), concurrency {}",
            pending.len(),
            max_account_id,
            stats.skipped,
            concurrency
        );
        set_gauge("backfill_running", 1.0);

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut jobs = JoinSet::new();
        let mut progress = Progress::new(pending.len() as u64);

        for fid in pending {
            if !self.running.load(Ordering::SeqCst) {
                tracing::info!("Backfill stopping; not starting fid {} or later", fid);
                break;
            }

            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|_| Error::ChannelClosed("backfill worker pool"))?;
            if !self.running.load(Ordering::SeqCst) {
                tracing::info!("Backfill stopping; not starting fid {} or later", fid);
                break;
            }

            let hub = Arc::clone(&self.hub);
            let gateway = Arc::clone(&self.gateway);
            jobs.spawn(async move {
                let result = backfill_account(hub.as_ref(), &gateway, fid).await;
                drop(permit);
                (fid, result)
            });

            while let Some(joined) = jobs.try_join_next() {
                self.record(joined?, max_account_id, &mut stats, &mut progress);
            }
        }

        while let Some(joined) = jobs.join_next().await {
            self.record(joined?, max_account_id, &mut stats, &mut progress);
        }

        set_gauge("backfill_running", 0.0);
        tracing::info!(
            "Backfill pass finished: {} completed, {} failed, {} skipped, {} messages",
            stats.completed,
            stats.failed,
            stats.skipped,
            stats.messages
        );
        Ok(stats)
    }

    fn record(
        &self,
        (fid, result): (u64, Result<u64>),
        max_account_id: u64,
        stats: &mut BackfillStats,
        progress: &mut Progress,
    ) {
        let eta = progress.advance();
        match result {
            Ok(messages) => {
                stats.completed += 1;
                stats.messages += messages;
                increment("backfill_accounts_completed_total", 1);
                increment("backfill_messages_total", messages);
                tracing::info!(
                    "Backfill: completed fid {}/{} ({} messages). Estimated time remaining: {}",
                    fid,
                    max_account_id,
                    messages,
                    format_duration(eta)
                );
            }
            Err(e) => {
                stats.failed += 1;
                increment("backfill_accounts_failed_total", 1);
                tracing::warn!(
                    "Backfill: fid {} failed, will retry on next run: {}",
                    fid,
                    e
                );
            }
        }
    }
}
