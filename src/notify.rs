use crate::account::{Account, AccountCategory, AccountRegistry};
use crate::datetime_utils::relative_duration_phrase;
use crate::diff::{UnfollowKind, UnfollowerRecord};
use crate::storage::{DispatchLedger, SnapshotStore};
use crate::twitter::{TwitterApiError, TwitterClient};
use anyhow::{Context, Result};
use tracing::{debug, info, warn};

/// Outcome of one dispatch attempt.
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchResult {
    pub sent: bool,
    pub items: usize,
}

fn display_name(record: &UnfollowerRecord) -> String {
    match &record.screen_name {
        Some(name) => format!("@{name}"),
        None => format!("A follower (id {id})", id = record.user_id),
    }
}

fn item_sentence(record: &UnfollowerRecord, now_ms: i64) -> String {
    let who = display_name(record);
    let mut sentence = match record.kind {
        UnfollowKind::Unfollowed => format!("{who} unfollowed you."),
        UnfollowKind::Suspended => format!("{who} has been suspended."),
        UnfollowKind::Deleted => format!("{who} deleted their account."),
        UnfollowKind::BlockedBy => format!("{who} blocked you."),
        UnfollowKind::Blocking => format!("{who}, whom you block, unfollowed you."),
        UnfollowKind::Locked => format!("{who}'s account has been locked."),
    };

    let follow_ms = record.best_follow_time_ms();
    if follow_ms > 0 {
        let duration = relative_duration_phrase(now_ms.saturating_sub(follow_ms));
        sentence.push_str(&format!(" They followed you for {duration}."));
    } else {
        sentence.push_str(" They followed you since before you signed up.");
    }

    if record.still_followed {
        sentence.push_str(" You still follow them.");
    }

    sentence
}

/// Builds the outbound digest text. Mutual losses (still followed back) are
/// surfaced first; beyond `item_cap` itemized lines, plus any unclassified
/// overflow, a trailing count summarizes the rest. Returns `None` when there
/// is nothing to say.
pub fn format_digest(
    records: &[UnfollowerRecord],
    unclassified: usize,
    now_ms: i64,
    item_cap: usize,
) -> Option<String> {
    if records.is_empty() && unclassified == 0 {
        return None;
    }

    let mut ordered: Vec<&UnfollowerRecord> = records.iter().collect();
    // Stable: within each group the detection order is preserved.
    ordered.sort_by_key(|r| !r.still_followed);

    let itemized = ordered.len().min(item_cap);
    let folded = ordered.len() - itemized + unclassified;

    let mut lines = Vec::with_capacity(itemized + 2);
    if itemized + folded > 1 {
        lines.push(format!(
            "{total} followers left you:",
            total = ordered.len() + unclassified
        ));
    }
    for record in ordered.iter().take(itemized) {
        lines.push(item_sentence(record, now_ms));
    }
    if folded > 0 {
        lines.push(format!("...and {folded} more."));
    }

    Some(lines.join("\n"))
}

/// Drops records already covered by the ledger so a retried cycle never
/// resends the same loss event.
fn filter_unsent(records: Vec<UnfollowerRecord>, ledger: &DispatchLedger) -> Vec<UnfollowerRecord> {
    records
        .into_iter()
        .filter(|r| r.detected_ms > ledger.last_detected_ms)
        .collect()
}

/// Formats and delivers one digest for an account, recording what was sent.
/// At most one outbound message per call; callers invoke this once per cycle
/// per account with finalized records only.
pub async fn dispatch_digest(
    client: &TwitterClient,
    registry: &AccountRegistry,
    store: &SnapshotStore,
    account: &mut Account,
    records: Vec<UnfollowerRecord>,
    unclassified: usize,
    now_ms: i64,
    item_cap: usize,
) -> Result<DispatchResult> {
    let ledger = store.load_ledger(&account.user_id)?;
    let records = filter_unsent(records, &ledger);

    if records.is_empty() && unclassified == 0 {
        debug!(
            "Nothing new to dispatch for {user_id}",
            user_id = account.user_id
        );
        return Ok(DispatchResult::default());
    }

    let Some(text) = format_digest(&records, unclassified, now_ms, item_cap) else {
        return Ok(DispatchResult::default());
    };

    let items = records.len() + unclassified;
    let send_result = client
        .send_direct_message(account.sending_credentials(), &account.user_id, &text)
        .await;

    match send_result {
        Ok(()) => {}
        Err(TwitterApiError::DmsClosed) => {
            warn!(
                "Direct messages closed for {user_id}; disabling notification channel",
                user_id = account.user_id
            );
            registry.transition(account, AccountCategory::DmClosed)?;
            return Ok(DispatchResult::default());
        }
        Err(TwitterApiError::DuplicateMessage) => {
            // Identical content was already delivered; resending is
            // pointless, but the ledger must still advance.
            debug!(
                "Duplicate digest rejected for {user_id}; dropping",
                user_id = account.user_id
            );
        }
        Err(TwitterApiError::TokenRevoked) => {
            registry.transition(account, AccountCategory::Revoked)?;
            return Ok(DispatchResult::default());
        }
        Err(TwitterApiError::AccountSuspended) => {
            registry.transition(account, AccountCategory::Suspended)?;
            return Ok(DispatchResult::default());
        }
        Err(e) => {
            return Err(e).with_context(|| {
                format!(
                    "Failed to deliver digest to {user_id}",
                    user_id = account.user_id
                )
            });
        }
    }

    let last_detected_ms = records
        .iter()
        .map(|r| r.detected_ms)
        .max()
        .unwrap_or(ledger.last_detected_ms);
    store.save_ledger(
        &account.user_id,
        &DispatchLedger {
            last_detected_ms,
            sent_ms: now_ms,
            item_ids: records.iter().map(|r| r.user_id.clone()).collect(),
        },
    )?;

    info!(
        "Digest with {items} items delivered to {user_id} (@{screen_name})",
        user_id = account.user_id,
        screen_name = account.screen_name
    );

    Ok(DispatchResult { sent: true, items })
}
