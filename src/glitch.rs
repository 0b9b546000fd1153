//! Suppression of false-positive unfollow detections.
//!
//! Two independent API reads back the diff and the classification, and the
//! external service is eventually consistent between them. The two telltale
//! signatures of a transient glitch rather than a real unfollow are: the
//! relationship probe still reports `followed_by`, or an implausibly short
//! follow duration combined with a "deleted" classification (brief
//! deactivations reappear within minutes). Either way the record is held
//! back and re-classified once after a delay; second-try results are final.

use crate::diff::{UnfollowKind, UnfollowerRecord};
use std::time::Duration;
use tracing::debug;

/// Records split into what notifies now and what waits for a second check.
#[derive(Debug, Clone, Default)]
pub struct GlitchVerdict {
    pub notify: Vec<UnfollowerRecord>,
    pub deferred: Vec<UnfollowerRecord>,
}

fn is_likely_glitch(record: &UnfollowerRecord, now_ms: i64, min_follow_ms: i64) -> bool {
    if record.followed_by {
        return true;
    }
    let follow_ms = record.best_follow_time_ms();
    if follow_ms == 0 {
        // Unknown follow time ("before sign-up") cannot be a short follow.
        return false;
    }
    let duration_ms = now_ms.saturating_sub(follow_ms);
    duration_ms < min_follow_ms && record.kind == UnfollowKind::Deleted
}

/// First-pass partition: glitch-suspect records are deferred for one
/// re-check after `recheck_delay`.
pub fn partition_first_pass(
    records: Vec<UnfollowerRecord>,
    now_ms: i64,
    min_follow_duration: Duration,
) -> GlitchVerdict {
    let min_follow_ms = min_follow_duration.as_millis() as i64;
    let mut verdict = GlitchVerdict::default();

    for record in records {
        if is_likely_glitch(&record, now_ms, min_follow_ms) {
            debug!(
                "Deferring suspected glitch for {user_id} (kind {kind:?}, followed_by {followed_by})",
                user_id = record.user_id,
                kind = record.kind,
                followed_by = record.followed_by
            );
            verdict.deferred.push(record);
        } else {
            verdict.notify.push(record);
        }
    }

    verdict
}

/// Second-pass resolution after re-classification. Nothing is deferred
/// again: a record whose probe still says `followed_by` was a confirmed
/// glitch (they still follow) and is dropped; everything else is reported
/// with whatever the second probe said.
pub fn resolve_second_pass(records: Vec<UnfollowerRecord>) -> GlitchVerdict {
    let mut verdict = GlitchVerdict::default();

    for record in records {
        if record.followed_by {
            debug!(
                "Confirmed glitch for {user_id}: still following after re-check, dropping",
                user_id = record.user_id
            );
        } else {
            verdict.notify.push(record);
        }
    }

    verdict
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN_FOLLOW: Duration = Duration::from_secs(7 * 60);

    fn record(kind: UnfollowKind, follow_ms: i64, followed_by: bool) -> UnfollowerRecord {
        UnfollowerRecord {
            user_id: "X".into(),
            screen_name: None,
            follow_detected_ms: follow_ms,
            precise_follow_ms: None,
            detected_ms: 1_000_000,
            kind,
            still_followed: false,
            followed_by,
            probed: true,
        }
    }

    #[test]
    fn test_short_deleted_follow_is_deferred() {
        let now = 1_000_000;
        // Followed 2 minutes ago, probe says deleted.
        let rec = record(UnfollowKind::Deleted, now - 120_000, false);
        let verdict = partition_first_pass(vec![rec], now, MIN_FOLLOW);
        assert!(verdict.notify.is_empty());
        assert_eq!(verdict.deferred.len(), 1);
    }

    #[test]
    fn test_short_plain_unfollow_is_not_deferred() {
        let now = 1_000_000;
        let rec = record(UnfollowKind::Unfollowed, now - 120_000, false);
        let verdict = partition_first_pass(vec![rec], now, MIN_FOLLOW);
        assert_eq!(verdict.notify.len(), 1);
        assert!(verdict.deferred.is_empty());
    }

    #[test]
    fn test_long_deleted_follow_is_notified() {
        let now = 1_000_000_000;
        let rec = record(UnfollowKind::Deleted, now - 86_400_000, false);
        let verdict = partition_first_pass(vec![rec], now, MIN_FOLLOW);
        assert_eq!(verdict.notify.len(), 1);
    }

    #[test]
    fn test_followed_by_is_always_deferred() {
        let now = 1_000_000_000;
        // Even an old plain unfollow defers when the probe contradicts the
        // list fetch.
        let rec = record(UnfollowKind::Unfollowed, now - 86_400_000, true);
        let verdict = partition_first_pass(vec![rec], now, MIN_FOLLOW);
        assert!(verdict.notify.is_empty());
        assert_eq!(verdict.deferred.len(), 1);
    }

    #[test]
    fn test_unknown_follow_time_is_never_short() {
        let now = 1_000_000;
        let rec = record(UnfollowKind::Deleted, 0, false);
        let verdict = partition_first_pass(vec![rec], now, MIN_FOLLOW);
        assert_eq!(verdict.notify.len(), 1);
    }

    #[test]
    fn test_second_pass_drops_still_following_and_keeps_the_rest() {
        let now = 1_000_000;
        let still_following = record(UnfollowKind::Unfollowed, now - 120_000, true);
        let really_gone = record(UnfollowKind::Deleted, now - 120_000, false);
        let verdict = resolve_second_pass(vec![still_following, really_gone]);
        assert_eq!(verdict.notify.len(), 1);
        assert_eq!(verdict.notify[0].kind, UnfollowKind::Deleted);
        assert!(verdict.deferred.is_empty());
    }
}
