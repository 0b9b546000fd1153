use crate::account::Account;
use crate::ratelimit::QuotaWindow;
use crate::snowflake::follow_time_from_cursor;
use crate::storage::ResumeState;
use crate::twitter::{TwitterApiError, TwitterClient};
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Sentinel cursor for the first page.
pub const CURSOR_START: &str = "-1";
/// Sentinel cursor signalling the final page.
pub const CURSOR_END: &str = "0";

/// Fallback window length when quota is exhausted before any reset header
/// was observed.
const DEFAULT_WINDOW_MS: i64 = 15 * 60 * 1000;

/// A complete, ordered follower-ID list plus everything harvested on the way.
#[derive(Debug, Clone)]
pub struct FetchedList {
    pub ids: Vec<String>,
    /// Cursor-derived (follower id, follow time ms) candidates.
    pub cursor_hints: Vec<(String, i64)>,
    /// Followers whose cursor carried no decodable time; candidates for the
    /// uncachable set.
    pub failed_hints: Vec<String>,
    pub pages: u32,
    /// Quota view of the credential set that served the last page.
    pub quota: QuotaWindow,
}

/// Result of one pagination walk.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Complete(FetchedList),
    /// Both credential sets ran dry mid-walk: partial progress to persist,
    /// and the earliest time a resumed walk can continue.
    Deferred {
        state: ResumeState,
        next_check_at_ms: i64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActiveCredentials {
    Primary,
    Secondary,
}

/// Walks the cursor-based follower-ID pagination for one account, switching
/// to the secondary (notification-sending) credential set at most once when
/// the primary's quota runs out, and handing back resumable state when both
/// are exhausted.
pub struct FollowerFetcher<'a> {
    client: &'a TwitterClient,
    page_size: u32,
}

impl<'a> FollowerFetcher<'a> {
    pub fn new(client: &'a TwitterClient, page_size: u32) -> Self {
        Self { client, page_size }
    }

    pub async fn fetch_all(
        &self,
        account: &Account,
        resume: Option<ResumeState>,
        now_ms: i64,
    ) -> Result<FetchOutcome, TwitterApiError> {
        let user_id = &account.user_id;

        let (mut cursor, mut ids, mut cursor_hints, started_ms) = match resume {
            Some(state) => {
                info!(
                    "Resuming follower fetch for {user_id} at cursor {cursor} with {count} ids already collected",
                    cursor = state.cursor,
                    count = state.ids.len()
                );
                (state.cursor, state.ids, state.cursor_hints, state.started_ms)
            }
            None => (CURSOR_START.to_string(), Vec::new(), Vec::new(), now_ms),
        };

        let mut failed_hints = Vec::new();
        let mut active = ActiveCredentials::Primary;
        let mut switched = false;
        let mut primary_quota = QuotaWindow::default();
        let mut secondary_quota = QuotaWindow::default();
        let mut pages = 0u32;

        loop {
            let creds = match active {
                ActiveCredentials::Primary => &account.credentials,
                ActiveCredentials::Secondary => account
                    .dm_credentials
                    .as_ref()
                    .expect("secondary credentials checked before switching"),
            };

            let page = match self
                .client
                .follower_ids_page(creds, user_id, &cursor, self.page_size)
                .await
            {
                Ok(page) => page,
                Err(TwitterApiError::RateLimited {
                    remaining,
                    reset_at_ms,
                }) => {
                    let quota = match active {
                        ActiveCredentials::Primary => &mut primary_quota,
                        ActiveCredentials::Secondary => &mut secondary_quota,
                    };
                    quota.remaining = remaining.or(Some(0));
                    if reset_at_ms.is_some() {
                        quota.reset_at_ms = reset_at_ms;
                    }

                    if let Some(next) = self.try_switch(account, &mut active, &mut switched) {
                        active = next;
                        continue;
                    }

                    let next_check_at_ms = deferred_until(
                        &primary_quota,
                        &secondary_quota,
                        switched,
                        now_ms,
                    );
                    return Ok(FetchOutcome::Deferred {
                        state: ResumeState {
                            cursor,
                            ids,
                            cursor_hints,
                            started_ms,
                        },
                        next_check_at_ms,
                    });
                }
                Err(e) => return Err(e),
            };

            pages += 1;
            harvest_cursor_hint(&cursor, &page.ids, &mut cursor_hints, &mut failed_hints);
            ids.extend(page.ids);

            let quota = match active {
                ActiveCredentials::Primary => &mut primary_quota,
                ActiveCredentials::Secondary => &mut secondary_quota,
            };
            quota.update(page.rate_limit);
            let active_exhausted = quota.exhausted();

            if page.next_cursor == CURSOR_END {
                debug!(
                    "Completed follower fetch for {user_id}: {count} ids over {pages} pages",
                    count = ids.len()
                );
                return Ok(FetchOutcome::Complete(FetchedList {
                    ids: dedupe_preserving_order(ids),
                    cursor_hints,
                    failed_hints,
                    pages,
                    quota: *quota,
                }));
            }
            cursor = page.next_cursor;

            // Don't spend the last call of a window on the next page; switch
            // or defer before the API starts rejecting us.
            if active_exhausted {
                if let Some(next) = self.try_switch(account, &mut active, &mut switched) {
                    active = next;
                    continue;
                }
                let next_check_at_ms =
                    deferred_until(&primary_quota, &secondary_quota, switched, now_ms);
                warn!(
                    "Quota exhausted mid-walk for {user_id} at cursor {cursor}; deferring with {count} ids collected",
                    count = ids.len()
                );
                return Ok(FetchOutcome::Deferred {
                    state: ResumeState {
                        cursor,
                        ids,
                        cursor_hints,
                        started_ms,
                    },
                    next_check_at_ms,
                });
            }
        }
    }

    /// Switches to the secondary credential set, at most once per walk.
    /// Cycles are independent, so switching back is never needed.
    fn try_switch(
        &self,
        account: &Account,
        active: &mut ActiveCredentials,
        switched: &mut bool,
    ) -> Option<ActiveCredentials> {
        if *switched || *active == ActiveCredentials::Secondary {
            return None;
        }
        account.dm_credentials.as_ref()?;
        *switched = true;
        info!(
            "Primary quota exhausted for {user_id}; continuing on the notification credential set",
            user_id = account.user_id
        );
        Some(ActiveCredentials::Secondary)
    }
}

/// When both credential sets are dry, resume no earlier than the later of
/// the two reset times (only the primary's when the secondary was never
/// used).
fn deferred_until(
    primary: &QuotaWindow,
    secondary: &QuotaWindow,
    switched: bool,
    now_ms: i64,
) -> i64 {
    let fallback = now_ms + DEFAULT_WINDOW_MS;
    let primary_reset = primary.reset_or(fallback);
    if switched {
        primary_reset.max(secondary.reset_or(fallback))
    } else {
        primary_reset
    }
}

/// The cursor used to request a page encodes the creation time of the follow
/// edge at the page boundary; attribute it to the first follower of the page
/// it produced. The start sentinel carries no time and is skipped entirely.
fn harvest_cursor_hint(
    cursor: &str,
    page_ids: &[String],
    hints: &mut Vec<(String, i64)>,
    failed: &mut Vec<String>,
) {
    if cursor == CURSOR_START {
        return;
    }
    let Some(first_id) = page_ids.first() else {
        return;
    };
    match follow_time_from_cursor(cursor) {
        Some(follow_ms) => hints.push((first_id.clone(), follow_ms)),
        None => failed.push(first_id.clone()),
    }
}

/// A resumed walk can observe an id twice when the underlying list shifted
/// between quota windows; keep the first occurrence so ordering stays that
/// of the earliest observation.
fn dedupe_preserving_order(ids: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedupe_preserving_order() {
        let ids: Vec<String> = ["A", "B", "A", "C", "B"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(dedupe_preserving_order(ids), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_harvest_skips_start_cursor() {
        let mut hints = Vec::new();
        let mut failed = Vec::new();
        harvest_cursor_hint(CURSOR_START, &["A".to_string()], &mut hints, &mut failed);
        assert!(hints.is_empty());
        assert!(failed.is_empty());
    }

    #[test]
    fn test_harvest_decodable_cursor() {
        let mut hints = Vec::new();
        let mut failed = Vec::new();
        // 2023-01-01T00:00:00Z encoded as a snowflake-style cursor
        let cursor = ((1_672_531_200_000i64 - 1_288_834_974_657) << 22).to_string();
        harvest_cursor_hint(&cursor, &["A".to_string()], &mut hints, &mut failed);
        assert_eq!(hints, vec![("A".to_string(), 1_672_531_200_000)]);
        assert!(failed.is_empty());
    }

    #[test]
    fn test_harvest_undecodable_cursor_marks_failed() {
        let mut hints = Vec::new();
        let mut failed = Vec::new();
        harvest_cursor_hint("garbage", &["A".to_string()], &mut hints, &mut failed);
        assert!(hints.is_empty());
        assert_eq!(failed, vec!["A".to_string()]);
    }

    #[test]
    fn test_deferred_until_uses_later_reset_when_switched() {
        let primary = QuotaWindow {
            remaining: Some(0),
            reset_at_ms: Some(1_000),
        };
        let secondary = QuotaWindow {
            remaining: Some(0),
            reset_at_ms: Some(5_000),
        };
        assert_eq!(deferred_until(&primary, &secondary, true, 0), 5_000);
        // Secondary never used: only the primary's reset matters.
        assert_eq!(deferred_until(&primary, &secondary, false, 0), 1_000);
    }

    #[test]
    fn test_deferred_until_falls_back_to_default_window() {
        let unknown = QuotaWindow::default();
        let at = deferred_until(&unknown, &unknown, false, 1_000);
        assert_eq!(at, 1_000 + DEFAULT_WINDOW_MS);
    }
}
