use crate::account::Account;
use crate::config::Settings;
use crate::engine::{is_fatal_error, Engine};
use crate::queue::InProcessQueue;
use crate::storage::SnapshotStore;
use crate::twitter::TwitterClient;
use crate::{account::AccountRegistry, datetime_utils::now_ms};
use anyhow::Result;
use futures_util::stream::{self, StreamExt};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tokio::sync::{oneshot, RwLock};
use tokio::time;
use tracing::{debug, error, info, warn};

/// Pause between scheduler passes once a shard has work.
const CYCLE_PAUSE: Duration = Duration::from_secs(5);
/// Pause when nothing in the shard is due yet.
const IDLE_PAUSE: Duration = Duration::from_secs(10);

/// Deterministic, restart-stable shard assignment: SHA-256 of the account
/// id, first four bytes as a u32, modulo worker count. The same account is
/// always owned by the same worker, so no two workers ever touch one
/// account concurrently.
pub fn shard_index(user_id: &str, worker_count: usize) -> usize {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    let hash = hasher.finalize();
    let bytes: [u8; 4] = hash[0..4].try_into().expect("sha256 yields at least 4 bytes");
    (u32::from_be_bytes(bytes) as usize) % worker_count.max(1)
}

/// Global daemon statistics
#[derive(Debug, Default)]
struct DaemonStats {
    cycles: u64,
    accounts_polled: u64,
    failed_polls: u64,
    timed_out: u64,
    digests_enqueued: u64,
}

/// Main entry point for the polling daemon: a fixed pool of worker loops
/// over disjoint account shards, a slower recovery loop, the task-queue
/// consumer, and a stats reporter, all shut down together on ctrl-c.
pub async fn execute(data_dir: &Path, workers_override: Option<usize>) -> Result<()> {
    let mut settings = Settings::from_env()?;
    if let Some(workers) = workers_override {
        settings.workers = workers;
    }
    settings.workers = settings.workers.max(1);
    let settings = Arc::new(settings);

    let engine = Engine {
        client: Arc::new(TwitterClient::from_env()?),
        store: SnapshotStore::new(data_dir)?,
        accounts: AccountRegistry::new(data_dir)?,
        settings: settings.clone(),
    };

    info!(
        "Starting daemon with {workers} workers, poll interval {interval:?}",
        workers = settings.workers,
        interval = settings.poll_interval
    );

    let queue = InProcessQueue::start(Arc::new(engine.clone()));
    let stats = Arc::new(RwLock::new(DaemonStats::default()));
    let start_time = Instant::now();

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    tokio::spawn(async move {
        let _ = signal::ctrl_c().await;
        info!("Received shutdown signal (Ctrl+C)");
        let _ = shutdown_tx.send(());
    });

    let stats_handle = spawn_stats_reporter(stats.clone(), engine.store.clone(), start_time);

    let mut handles = Vec::new();
    for worker_index in 0..settings.workers {
        let engine = engine.clone();
        let queue = queue.clone();
        let stats = stats.clone();
        let worker_count = settings.workers;
        handles.push(tokio::spawn(async move {
            worker_loop(engine, queue, stats, worker_index, worker_count).await
        }));
    }
    {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move { recovery_loop(engine).await }));
    }

    let result = tokio::select! {
        (finished, _, _) = futures_util::future::select_all(&mut handles) => {
            match finished {
                Ok(Err(e)) => {
                    error!("Worker aborted with fatal error: {e:#}");
                    Err(e)
                }
                Ok(Ok(())) => Ok(()),
                Err(join_err) => Err(anyhow::Error::new(join_err).context("Worker task panicked")),
            }
        }
        _ = shutdown_rx => {
            info!("Gracefully shutting down daemon...");
            Ok(())
        }
    };

    stats_handle.abort();
    for handle in &handles {
        handle.abort();
    }

    print_final_stats(&stats, &engine.store, start_time).await;
    info!("Daemon shutdown complete");
    result
}

/// One worker: repeatedly polls the due accounts of its shard with bounded
/// concurrency and a per-account watchdog. Only a fatal (app-level) error
/// ends the loop.
async fn worker_loop(
    engine: Engine,
    queue: Arc<InProcessQueue>,
    stats: Arc<RwLock<DaemonStats>>,
    worker_index: usize,
    worker_count: usize,
) -> Result<()> {
    let mut last_polled: HashMap<String, Instant> = HashMap::new();

    loop {
        let ready = ready_accounts(&engine, &last_polled, worker_index, worker_count)?;

        if ready.is_empty() {
            time::sleep(IDLE_PAUSE).await;
            continue;
        }

        debug!(
            "Worker {worker_index}: polling {count} accounts",
            count = ready.len()
        );

        let results: Vec<(String, Result<Option<crate::engine::CycleOutcome>>)> =
            stream::iter(ready)
                .map(|mut account| {
                    let engine = engine.clone();
                    let queue = queue.clone();
                    async move {
                        let user_id = account.user_id.clone();
                        let result = time::timeout(
                            engine.settings.cycle_timeout,
                            engine.run_account_cycle(&mut account, queue.as_ref()),
                        )
                        .await;
                        let result = match result {
                            Ok(cycle) => cycle.map(Some),
                            Err(_elapsed) => {
                                warn!(
                                    "Cycle watchdog expired for {user_id} after {timeout:?}, abandoning",
                                    timeout = engine.settings.cycle_timeout
                                );
                                Ok(None)
                            }
                        };
                        (user_id, result)
                    }
                })
                .buffer_unordered(engine.settings.account_parallelism.max(1))
                .collect()
                .await;

        let mut stats_guard = stats.write().await;
        stats_guard.cycles += 1;
        for (user_id, result) in results {
            last_polled.insert(user_id.clone(), Instant::now());
            match result {
                Ok(Some(outcome)) => {
                    stats_guard.accounts_polled += 1;
                    if outcome.digest_enqueued {
                        stats_guard.digests_enqueued += 1;
                    }
                }
                Ok(None) => {
                    stats_guard.timed_out += 1;
                    stats_guard.failed_polls += 1;
                }
                Err(e) => {
                    stats_guard.failed_polls += 1;
                    if is_fatal_error(&e) {
                        return Err(e);
                    }
                    warn!("Cycle failed for {user_id}: {e:#}");
                }
            }
        }
        drop(stats_guard);

        time::sleep(CYCLE_PAUSE).await;
    }
}

/// Accounts of this worker's shard that are due: polled category, cadence
/// interval elapsed, and past the rate-limit tracker's next-check time.
fn ready_accounts(
    engine: &Engine,
    last_polled: &HashMap<String, Instant>,
    worker_index: usize,
    worker_count: usize,
) -> Result<Vec<Account>> {
    let now = now_ms();
    let mut ready = Vec::new();

    for account in engine.accounts.load_all()? {
        if !account.category.is_polled() {
            continue;
        }
        if shard_index(&account.user_id, worker_count) != worker_index {
            continue;
        }

        let interval = engine
            .settings
            .poll_interval_for_vip(account.category.is_vip());
        let cadence_due = match last_polled.get(&account.user_id) {
            None => true,
            Some(last) => last.elapsed() >= interval,
        };
        if !cadence_due {
            continue;
        }

        if let Some(next_check_at) = engine.store.load_next_check_at(&account.user_id)? {
            if next_check_at > now {
                continue;
            }
        }

        ready.push(account);
    }

    Ok(ready)
}

/// Slow loop that re-tests suspended/revoked/closed accounts and promotes
/// them back to `Enabled` once the API accepts their credentials again.
async fn recovery_loop(engine: Engine) -> Result<()> {
    let mut interval = time::interval(engine.settings.recovery_interval);
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so startup isn't a burst of
    // probes for long-dead accounts.
    interval.tick().await;

    loop {
        interval.tick().await;

        let candidates: Vec<Account> = engine
            .accounts
            .load_all()?
            .into_iter()
            .filter(|a| a.category.is_recoverable())
            .collect();

        if candidates.is_empty() {
            continue;
        }
        info!(
            "Recovery pass over {count} accounts",
            count = candidates.len()
        );

        for mut account in candidates {
            match engine.recover_account(&mut account).await {
                Ok(true) => {
                    info!(
                        "Account {user_id} (@{screen_name}) recovered",
                        user_id = account.user_id,
                        screen_name = account.screen_name
                    );
                }
                Ok(false) => {}
                Err(e) => {
                    if is_fatal_error(&e) {
                        return Err(e);
                    }
                    warn!(
                        "Recovery check failed for {user_id}: {e:#}",
                        user_id = account.user_id
                    );
                }
            }
        }
    }
}

fn spawn_stats_reporter(
    stats: Arc<RwLock<DaemonStats>>,
    store: SnapshotStore,
    start_time: Instant,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_secs(60));
        interval.tick().await;

        loop {
            interval.tick().await;

            let stats = stats.read().await;
            let uptime = start_time.elapsed();
            let hours = uptime.as_secs() / 3600;
            let minutes = (uptime.as_secs() % 3600) / 60;
            let total_unfollowers = store.total_unfollowers().unwrap_or(0);

            info!(
                "Stats | Uptime: {hours}h{minutes}m | Cycles: {cycles} | Polled: {polled} (failed {failed}, timed out {timed_out}) | Digests: {digests} | Unfollowers total: {total_unfollowers}",
                cycles = stats.cycles,
                polled = stats.accounts_polled,
                failed = stats.failed_polls,
                timed_out = stats.timed_out,
                digests = stats.digests_enqueued
            );
        }
    })
}

async fn print_final_stats(
    stats: &Arc<RwLock<DaemonStats>>,
    store: &SnapshotStore,
    start_time: Instant,
) {
    let stats = stats.read().await;
    let uptime = start_time.elapsed();

    info!("=== Final Daemon Statistics ===");
    info!(
        "Uptime: {uptime:.2} hours",
        uptime = uptime.as_secs_f64() / 3600.0
    );
    info!("Scheduler cycles: {cycles}", cycles = stats.cycles);
    info!(
        "Accounts polled: {polled} ({failed} failed, {timed_out} timed out)",
        polled = stats.accounts_polled,
        failed = stats.failed_polls,
        timed_out = stats.timed_out
    );
    info!(
        "Digests enqueued: {digests}",
        digests = stats.digests_enqueued
    );
    info!(
        "Unfollowers detected in total: {total}",
        total = store.total_unfollowers().unwrap_or(0)
    );
    info!("===============================");
}
