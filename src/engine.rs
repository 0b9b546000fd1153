use crate::account::{Account, AccountCategory, AccountRegistry};
use crate::config::Settings;
use crate::datetime_utils::now_ms;
use crate::diff::{classify_unfollowers, diff_followers, reclassify};
use crate::fetcher::{FetchOutcome, FollowerFetcher};
use crate::glitch::{partition_first_pass, resolve_second_pass};
use crate::notify::dispatch_digest;
use crate::queue::{EnqueueOptions, Task, TaskHandler, TaskQueue};
use crate::ratelimit;
use crate::storage::SnapshotStore;
use crate::twitter::{TwitterApiError, TwitterClient};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Everything one poll cycle needs, shared by workers, queue handlers and
/// the one-shot commands.
#[derive(Clone)]
pub struct Engine {
    pub client: Arc<TwitterClient>,
    pub store: SnapshotStore,
    pub accounts: AccountRegistry,
    pub settings: Arc<Settings>,
}

/// Summary of one account's poll cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleOutcome {
    pub fetched: usize,
    pub new_followers: usize,
    pub unfollowers: usize,
    /// The pagination walk ran out of quota and was persisted for resume.
    pub fetch_deferred: bool,
    /// Suspected glitches handed to the second-try re-check.
    pub deferred_records: usize,
    pub digest_enqueued: bool,
}

/// True when the error must abort the whole process, not just one account.
pub fn is_fatal_error(err: &anyhow::Error) -> bool {
    err.downcast_ref::<TwitterApiError>()
        .is_some_and(TwitterApiError::is_fatal)
}

impl Engine {
    /// One full cycle for one account, phases strictly in order: fetch,
    /// diff, classify, glitch-filter, enqueue dispatch. The snapshot is
    /// committed once, atomically, after classification; an abort anywhere
    /// before that leaves the stored state untouched.
    pub async fn run_account_cycle(
        &self,
        account: &mut Account,
        queue: &dyn TaskQueue,
    ) -> Result<CycleOutcome> {
        let user_id = account.user_id.clone();
        let cycle_now_ms = now_ms();
        let mut outcome = CycleOutcome::default();

        let resume = self.store.load_resume(&user_id)?;
        let fetcher = FollowerFetcher::new(&self.client, self.settings.page_size);

        let fetched = match fetcher.fetch_all(account, resume, cycle_now_ms).await {
            Ok(FetchOutcome::Complete(list)) => list,
            Ok(FetchOutcome::Deferred {
                state,
                next_check_at_ms,
            }) => {
                self.store.save_resume(&user_id, &state)?;
                self.store.save_next_check_at(&user_id, next_check_at_ms)?;
                outcome.fetched = state.ids.len();
                outcome.fetch_deferred = true;
                return Ok(outcome);
            }
            Err(e) => return Err(self.account_api_error(account, e)),
        };

        self.store.clear_resume(&user_id)?;
        outcome.fetched = fetched.ids.len();

        // Spread the remaining quota over the rest of the window.
        if let (Some(remaining), Some(reset_at_ms)) =
            (fetched.quota.remaining, fetched.quota.reset_at_ms)
        {
            let next = ratelimit::next_check_at(
                remaining,
                reset_at_ms,
                u64::from(fetched.pages.max(1)),
                cycle_now_ms,
                self.settings.safety_margin.as_millis() as i64,
            );
            self.store.save_next_check_at(&user_id, next)?;
        }

        let stored = self.store.load_snapshot(&user_id)?;
        let bootstrap = stored.is_none();
        let diff = diff_followers(stored.as_ref().map(|s| s.followers.as_slice()), &fetched.ids);
        outcome.new_followers = diff.new_followers.len();
        outcome.unfollowers = diff.unfollowers.len();

        if bootstrap {
            // First-ever fetch: everyone is a pre-existing follower, nothing
            // can be an unfollower, and no notification goes out.
            self.store.apply_cycle(
                &user_id,
                &fetched.ids,
                &diff.new_followers,
                &[],
                &fetched.cursor_hints,
                &fetched.failed_hints,
                0,
            )?;
            info!(
                "Bootstrapped {user_id} (@{screen_name}) with {count} followers",
                screen_name = account.screen_name,
                count = fetched.ids.len()
            );
            return Ok(outcome);
        }

        let times_snapshot = stored.unwrap_or_default();
        let classified = match classify_unfollowers(
            &self.client,
            &account.credentials,
            &user_id,
            &diff.unfollowers,
            &times_snapshot,
            cycle_now_ms,
            self.settings.classify_batch_cap,
        )
        .await
        {
            Ok(classified) => classified,
            Err(e) => return Err(self.account_api_error(account, e)),
        };

        self.store.apply_cycle(
            &user_id,
            &fetched.ids,
            &diff.new_followers,
            &diff.unfollowers,
            &fetched.cursor_hints,
            &fetched.failed_hints,
            cycle_now_ms,
        )?;

        let verdict = partition_first_pass(
            classified.records,
            cycle_now_ms,
            self.settings.glitch_min_follow_duration(),
        );
        outcome.deferred_records = verdict.deferred.len();

        if !verdict.deferred.is_empty() {
            queue
                .enqueue(
                    Task::GlitchRecheck {
                        user_id: user_id.clone(),
                        records: verdict.deferred,
                    },
                    EnqueueOptions {
                        delay: self.settings.glitch_recheck_delay,
                        max_attempts: self.settings.task_max_attempts,
                        retry_backoff: self.settings.task_retry_backoff,
                    },
                )
                .await
                .context("Failed to enqueue glitch re-check")?;
        }

        if !verdict.notify.is_empty() || classified.unclassified > 0 {
            queue
                .enqueue(
                    Task::SendDigest {
                        user_id: user_id.clone(),
                        records: verdict.notify,
                        unclassified: classified.unclassified,
                    },
                    EnqueueOptions {
                        delay: Duration::ZERO,
                        max_attempts: self.settings.task_max_attempts,
                        retry_backoff: self.settings.task_retry_backoff,
                    },
                )
                .await
                .context("Failed to enqueue digest dispatch")?;
            outcome.digest_enqueued = true;
        }

        debug!(
            "Cycle for {user_id} done: {fetched} followers, +{new} -{lost}, {deferred} deferred",
            fetched = outcome.fetched,
            new = outcome.new_followers,
            lost = outcome.unfollowers,
            deferred = outcome.deferred_records
        );

        Ok(outcome)
    }

    /// Re-tests a non-enabled account and promotes it back to `Enabled` when
    /// the API accepts its credentials again. Returns whether it recovered.
    pub async fn recover_account(&self, account: &mut Account) -> Result<bool> {
        match self.client.verify_credentials(&account.credentials).await {
            Ok(()) => {
                self.accounts
                    .transition(account, AccountCategory::Enabled)?;
                Ok(true)
            }
            Err(e) if e.is_fatal() => Err(anyhow::Error::new(e)),
            Err(e) => {
                debug!(
                    "Account {user_id} still not recoverable: {e}",
                    user_id = account.user_id
                );
                Ok(false)
            }
        }
    }

    /// Applies the per-account state transition an API error demands, then
    /// wraps it for propagation. Fatal (app-level) errors transition nothing.
    fn account_api_error(&self, account: &mut Account, e: TwitterApiError) -> anyhow::Error {
        let category = match &e {
            TwitterApiError::TokenRevoked => Some(AccountCategory::Revoked),
            TwitterApiError::AccountSuspended | TwitterApiError::Locked => {
                Some(AccountCategory::Suspended)
            }
            TwitterApiError::NotFound => Some(AccountCategory::AccountClosed),
            _ => None,
        };

        if let Some(category) = category {
            if let Err(save_err) = self.accounts.transition(account, category) {
                warn!(
                    "Failed to persist category transition for {user_id}: {save_err}",
                    user_id = account.user_id
                );
            }
        }

        anyhow::Error::new(e).context(format!(
            "Polling failed for account {user_id}",
            user_id = account.user_id
        ))
    }
}

/// Queue consumer: delivery and glitch re-checks run here, decoupled from
/// the polling cycle that produced them.
#[async_trait]
impl TaskHandler for Engine {
    async fn handle(&self, task: Task) -> Result<()> {
        match task {
            Task::SendDigest {
                user_id,
                records,
                unclassified,
            } => {
                let Some(mut account) = self.accounts.load(&user_id)? else {
                    warn!("Dropping digest for unknown account {user_id}");
                    return Ok(());
                };
                dispatch_digest(
                    &self.client,
                    &self.accounts,
                    &self.store,
                    &mut account,
                    records,
                    unclassified,
                    now_ms(),
                    self.settings.digest_item_cap,
                )
                .await?;
                Ok(())
            }
            Task::GlitchRecheck { user_id, records } => {
                let Some(mut account) = self.accounts.load(&user_id)? else {
                    warn!("Dropping glitch re-check for unknown account {user_id}");
                    return Ok(());
                };

                let count = records.len();
                let refreshed =
                    match reclassify(&self.client, &account.credentials, &user_id, records).await {
                        Ok(refreshed) => refreshed,
                        Err(e) => return Err(self.account_api_error(&mut account, e)),
                    };

                let verdict = resolve_second_pass(refreshed);
                info!(
                    "Glitch re-check for {user_id}: {kept} of {count} confirmed",
                    kept = verdict.notify.len()
                );

                if !verdict.notify.is_empty() {
                    dispatch_digest(
                        &self.client,
                        &self.accounts,
                        &self.store,
                        &mut account,
                        verdict.notify,
                        0,
                        now_ms(),
                        self.settings.digest_item_cap,
                    )
                    .await?;
                }
                Ok(())
            }
        }
    }
}
