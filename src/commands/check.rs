use crate::account::AccountRegistry;
use crate::config::Settings;
use crate::engine::Engine;
use crate::queue::{EnqueueOptions, Task, TaskHandler, TaskQueue};
use crate::storage::SnapshotStore;
use crate::twitter::TwitterClient;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Queue stand-in for the one-shot command: digests go out immediately,
/// glitch re-checks are only reported (the daemon owns deferred work).
struct InlineQueue {
    engine: Engine,
}

#[async_trait]
impl TaskQueue for InlineQueue {
    async fn enqueue(&self, task: Task, _options: EnqueueOptions) -> Result<Uuid> {
        match task {
            Task::GlitchRecheck { records, user_id } => {
                info!(
                    "{count} suspected glitches for {user_id} would be re-checked by the daemon; skipping in one-shot mode",
                    count = records.len()
                );
            }
            task @ Task::SendDigest { .. } => {
                self.engine.handle(task).await?;
            }
        }
        Ok(Uuid::new_v4())
    }
}

/// Runs one full poll cycle (fetch, diff, classify, filter, dispatch) for a
/// single registered account.
pub async fn execute(user_id: &str, data_dir: &Path) -> Result<()> {
    let engine = Engine {
        client: Arc::new(TwitterClient::from_env()?),
        store: SnapshotStore::new(data_dir)?,
        accounts: AccountRegistry::new(data_dir)?,
        settings: Arc::new(Settings::from_env()?),
    };

    let mut account = engine
        .accounts
        .load(user_id)?
        .with_context(|| format!("Account {user_id} is not registered"))?;

    info!(
        "Checking {user_id} (@{screen_name}, {category:?})",
        screen_name = account.screen_name,
        category = account.category
    );

    let queue = InlineQueue {
        engine: engine.clone(),
    };
    let outcome = engine.run_account_cycle(&mut account, &queue).await?;

    if outcome.fetch_deferred {
        println!(
            "Fetch deferred after {fetched} followers: quota exhausted, partial progress saved",
            fetched = outcome.fetched
        );
    } else {
        println!(
            "{fetched} followers; {new} new, {lost} lost ({deferred} deferred for re-check), digest sent: {sent}",
            fetched = outcome.fetched,
            new = outcome.new_followers,
            lost = outcome.unfollowers,
            deferred = outcome.deferred_records,
            sent = outcome.digest_enqueued
        );
    }

    Ok(())
}
