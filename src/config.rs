use crate::error_utils::get_env_var_or;
use anyhow::Result;
use std::time::Duration;

/// Tunable engine parameters, read once at startup.
///
/// The historical deployments of this system disagreed on the exact
/// thresholds, so every one of them is an environment variable with the most
/// common value as default rather than a hardcoded constant.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Minimum interval between two poll cycles of the same enabled account.
    pub poll_interval: Duration,
    /// Faster cadence for VIP-tier accounts.
    pub vip_poll_interval: Duration,
    /// Cadence of the recovery loop that re-tests suspended/revoked accounts.
    pub recovery_interval: Duration,
    /// Watchdog bound for one account's full cycle.
    pub cycle_timeout: Duration,
    /// How many accounts a single worker processes concurrently.
    pub account_parallelism: usize,
    /// Number of worker shards.
    pub workers: usize,
    /// Followers per pagination page (API maximum is 5000).
    pub page_size: u32,
    /// At most this many unfollowers get an individual relationship probe per
    /// cycle; the rest are folded into an "and N more" digest line.
    pub classify_batch_cap: usize,
    /// At most this many itemized lines per digest message.
    pub digest_item_cap: usize,
    /// Scheduling margin kept before a rate-limit window reset.
    pub safety_margin: Duration,
    /// Floor for the implausibly-short follow duration that marks a likely
    /// glitch. The effective threshold is max(2 * poll_interval, this floor).
    pub glitch_min_follow_duration_floor: Duration,
    /// Delay before the glitch filter's second classification attempt.
    pub glitch_recheck_delay: Duration,
    /// Queue retry attempts for dispatch and recheck tasks.
    pub task_max_attempts: u32,
    /// Base backoff between queue retries (doubled per attempt).
    pub task_retry_backoff: Duration,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            poll_interval: Duration::from_secs(get_env_var_or("DEFOLLOW_POLL_INTERVAL_SECS", 180)?),
            vip_poll_interval: Duration::from_secs(get_env_var_or(
                "DEFOLLOW_VIP_POLL_INTERVAL_SECS",
                60,
            )?),
            recovery_interval: Duration::from_secs(get_env_var_or(
                "DEFOLLOW_RECOVERY_INTERVAL_SECS",
                4 * 3600,
            )?),
            cycle_timeout: Duration::from_secs(get_env_var_or("DEFOLLOW_CYCLE_TIMEOUT_SECS", 120)?),
            account_parallelism: get_env_var_or("DEFOLLOW_ACCOUNT_PARALLELISM", 15)?,
            workers: get_env_var_or("DEFOLLOW_WORKERS", 4)?,
            page_size: get_env_var_or("DEFOLLOW_PAGE_SIZE", 5000)?,
            classify_batch_cap: get_env_var_or("DEFOLLOW_CLASSIFY_BATCH_CAP", 25)?,
            digest_item_cap: get_env_var_or("DEFOLLOW_DIGEST_ITEM_CAP", 30)?,
            safety_margin: Duration::from_secs(get_env_var_or("DEFOLLOW_SAFETY_MARGIN_SECS", 30)?),
            glitch_min_follow_duration_floor: Duration::from_secs(get_env_var_or(
                "DEFOLLOW_GLITCH_MIN_FOLLOW_SECS",
                7 * 60,
            )?),
            glitch_recheck_delay: Duration::from_secs(get_env_var_or(
                "DEFOLLOW_GLITCH_RECHECK_DELAY_SECS",
                15 * 60,
            )?),
            task_max_attempts: get_env_var_or("DEFOLLOW_TASK_MAX_ATTEMPTS", 3)?,
            task_retry_backoff: Duration::from_secs(get_env_var_or(
                "DEFOLLOW_TASK_RETRY_BACKOFF_SECS",
                60,
            )?),
        })
    }

    /// Effective glitch threshold: a follow shorter than twice the polling
    /// interval can be an artifact of two desynced list reads, but never go
    /// below the configured floor.
    pub fn glitch_min_follow_duration(&self) -> Duration {
        std::cmp::max(self.poll_interval * 2, self.glitch_min_follow_duration_floor)
    }

    pub fn poll_interval_for_vip(&self, vip: bool) -> Duration {
        if vip {
            self.vip_poll_interval
        } else {
            self.poll_interval
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(180),
            vip_poll_interval: Duration::from_secs(60),
            recovery_interval: Duration::from_secs(4 * 3600),
            cycle_timeout: Duration::from_secs(120),
            account_parallelism: 15,
            workers: 4,
            page_size: 5000,
            classify_batch_cap: 25,
            digest_item_cap: 30,
            safety_margin: Duration::from_secs(30),
            glitch_min_follow_duration_floor: Duration::from_secs(7 * 60),
            glitch_recheck_delay: Duration::from_secs(15 * 60),
            task_max_attempts: 3,
            task_retry_backoff: Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glitch_threshold_uses_floor_for_short_intervals() {
        let settings = Settings {
            poll_interval: Duration::from_secs(60),
            ..Settings::default()
        };
        // 2 * 60s is below the 7-minute floor
        assert_eq!(
            settings.glitch_min_follow_duration(),
            Duration::from_secs(7 * 60)
        );
    }

    #[test]
    fn test_glitch_threshold_scales_with_long_intervals() {
        let settings = Settings {
            poll_interval: Duration::from_secs(10 * 60),
            ..Settings::default()
        };
        assert_eq!(
            settings.glitch_min_follow_duration(),
            Duration::from_secs(20 * 60)
        );
    }

    #[test]
    fn test_vip_cadence_is_faster() {
        let settings = Settings::default();
        assert!(settings.poll_interval_for_vip(true) < settings.poll_interval_for_vip(false));
    }
}
