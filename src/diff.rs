use crate::storage::FollowerSnapshot;
use crate::twitter::{Credentials, TwitterApiError, TwitterClient};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, warn};

/// Result of comparing a fresh follower list against the stored snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FollowerDiff {
    /// Present in fresh but not stored, in fresh-list order.
    pub new_followers: Vec<String>,
    /// Present in stored but not fresh. Order carries no meaning.
    pub unfollowers: Vec<String>,
}

/// `new = fresh − stored`, `unfollowers = stored − fresh`.
///
/// A `None` snapshot means this is the account's first-ever fetch: every id
/// is new and nothing can be an unfollower, whatever the fresh list holds.
pub fn diff_followers(stored: Option<&[String]>, fresh: &[String]) -> FollowerDiff {
    let Some(stored) = stored else {
        return FollowerDiff {
            new_followers: fresh.to_vec(),
            unfollowers: Vec::new(),
        };
    };

    let stored_set: HashSet<&str> = stored.iter().map(String::as_str).collect();
    let fresh_set: HashSet<&str> = fresh.iter().map(String::as_str).collect();

    FollowerDiff {
        new_followers: fresh
            .iter()
            .filter(|id| !stored_set.contains(id.as_str()))
            .cloned()
            .collect(),
        unfollowers: stored
            .iter()
            .filter(|id| !fresh_set.contains(id.as_str()))
            .cloned()
            .collect(),
    }
}

/// Why a follower disappeared from the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UnfollowKind {
    Unfollowed,
    Suspended,
    /// Account closed/deleted.
    Deleted,
    /// They blocked the monitored account.
    BlockedBy,
    /// The monitored account blocks them.
    Blocking,
    Locked,
}

/// One detected loss of a follower, as it flows through classification, the
/// glitch filter and dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnfollowerRecord {
    pub user_id: String,
    /// Known only when the relationship probe succeeded.
    pub screen_name: Option<String>,
    /// When this follower was first observed following (0 = before the
    /// account signed up).
    pub follow_detected_ms: i64,
    /// Cursor-derived follow time, when the cache had one.
    pub precise_follow_ms: Option<i64>,
    pub detected_ms: i64,
    pub kind: UnfollowKind,
    /// The monitored account still follows them back ("mutual" loss).
    pub still_followed: bool,
    /// The probe still reports them as following, the signature of an
    /// ordering glitch between two independent API reads.
    pub followed_by: bool,
    /// False when the probe could not run (transient error, probe quota).
    pub probed: bool,
}

impl UnfollowerRecord {
    /// Best available follow time for duration computations: precise when
    /// cached, first-observed otherwise.
    pub fn best_follow_time_ms(&self) -> i64 {
        self.precise_follow_ms.unwrap_or(self.follow_detected_ms)
    }
}

/// Classification output: individually probed records plus the count folded
/// into the digest's trailing "and N more" line.
#[derive(Debug, Clone, Default)]
pub struct ClassifiedUnfollowers {
    pub records: Vec<UnfollowerRecord>,
    pub unclassified: usize,
}

/// Maps a failed relationship probe onto a loss classification. `None` means
/// the error concerns the probing account itself (or the app) and must
/// propagate instead of classifying the target.
fn kind_from_probe_error(error: &TwitterApiError) -> Option<UnfollowKind> {
    match error {
        TwitterApiError::NotFound => Some(UnfollowKind::Deleted),
        TwitterApiError::UserSuspended => Some(UnfollowKind::Suspended),
        TwitterApiError::Locked => Some(UnfollowKind::Locked),
        _ => None,
    }
}

/// Classify up to `batch_cap` unfollowers with one relationship probe each.
/// The probe endpoint has its own, tighter limit, so the cap bounds probe
/// spend per cycle; ids beyond it (and ids left when the probe quota runs
/// dry) are only counted, never probed.
pub async fn classify_unfollowers(
    client: &TwitterClient,
    creds: &Credentials,
    source_id: &str,
    unfollower_ids: &[String],
    snapshot: &FollowerSnapshot,
    detected_ms: i64,
    batch_cap: usize,
) -> Result<ClassifiedUnfollowers, TwitterApiError> {
    let to_probe = unfollower_ids.len().min(batch_cap);
    let mut result = ClassifiedUnfollowers {
        records: Vec::with_capacity(to_probe),
        unclassified: unfollower_ids.len() - to_probe,
    };

    for (index, target_id) in unfollower_ids.iter().take(to_probe).enumerate() {
        let (follow_detected_ms, precise_follow_ms) = snapshot.follow_time_of(target_id);
        let mut record = UnfollowerRecord {
            user_id: target_id.clone(),
            screen_name: None,
            follow_detected_ms,
            precise_follow_ms,
            detected_ms,
            kind: UnfollowKind::Unfollowed,
            still_followed: false,
            followed_by: false,
            probed: false,
        };

        match client.relationship(creds, source_id, target_id).await {
            Ok(rel) => {
                record.kind = if rel.blocking {
                    UnfollowKind::Blocking
                } else if rel.blocked_by {
                    UnfollowKind::BlockedBy
                } else {
                    UnfollowKind::Unfollowed
                };
                record.still_followed = rel.following;
                record.followed_by = rel.followed_by;
                record.screen_name = rel.target_screen_name;
                record.probed = true;
            }
            Err(e) => {
                if let Some(kind) = kind_from_probe_error(&e) {
                    record.kind = kind;
                    record.probed = true;
                } else if matches!(e, TwitterApiError::RateLimited { .. }) {
                    // Probe quota dry: fold this id and the rest of the batch
                    // into the unclassified count.
                    warn!(
                        "Relationship probe quota exhausted for {source_id} after {index} probes"
                    );
                    result.unclassified += to_probe - index;
                    return Ok(result);
                } else if e.is_transient() {
                    debug!("Transient probe failure for {target_id}: {e}");
                } else {
                    return Err(e);
                }
            }
        }

        result.records.push(record);
    }

    Ok(result)
}

/// Second-pass classification for glitch-deferred records: re-probes each
/// one and replaces its classification in place. Times and detection data
/// are kept from the first pass.
pub async fn reclassify(
    client: &TwitterClient,
    creds: &Credentials,
    source_id: &str,
    records: Vec<UnfollowerRecord>,
) -> Result<Vec<UnfollowerRecord>, TwitterApiError> {
    let mut refreshed = Vec::with_capacity(records.len());

    for mut record in records {
        match client.relationship(creds, source_id, &record.user_id).await {
            Ok(rel) => {
                record.kind = if rel.blocking {
                    UnfollowKind::Blocking
                } else if rel.blocked_by {
                    UnfollowKind::BlockedBy
                } else {
                    UnfollowKind::Unfollowed
                };
                record.still_followed = rel.following;
                record.followed_by = rel.followed_by;
                if rel.target_screen_name.is_some() {
                    record.screen_name = rel.target_screen_name;
                }
                record.probed = true;
            }
            Err(e) => {
                if let Some(kind) = kind_from_probe_error(&e) {
                    record.kind = kind;
                    record.followed_by = false;
                    record.probed = true;
                } else if e.is_transient() || matches!(e, TwitterApiError::RateLimited { .. }) {
                    debug!(
                        "Second-try probe unavailable for {target}: {e}; keeping first-pass result",
                        target = record.user_id
                    );
                } else {
                    return Err(e);
                }
            }
        }
        refreshed.push(record);
    }

    Ok(refreshed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_simple_unfollow() {
        let stored = ids(&["A", "B", "C"]);
        let fresh = ids(&["A", "C"]);
        let diff = diff_followers(Some(&stored), &fresh);
        assert_eq!(diff.unfollowers, ids(&["B"]));
        assert!(diff.new_followers.is_empty());
    }

    #[test]
    fn test_first_fetch_never_produces_unfollowers() {
        let fresh = ids(&["A", "B"]);
        let diff = diff_followers(None, &fresh);
        assert_eq!(diff.new_followers, fresh);
        assert!(diff.unfollowers.is_empty());
    }

    #[test]
    fn test_new_followers_keep_fresh_order() {
        let stored = ids(&["B"]);
        let fresh = ids(&["Z", "B", "A"]);
        let diff = diff_followers(Some(&stored), &fresh);
        assert_eq!(diff.new_followers, ids(&["Z", "A"]));
    }

    #[test]
    fn test_diff_partition_reconstructs_union() {
        let stored = ids(&["A", "B", "C", "D"]);
        let fresh = ids(&["C", "D", "E", "F"]);
        let diff = diff_followers(Some(&stored), &fresh);

        let stored_set: HashSet<_> = stored.iter().cloned().collect();
        let fresh_set: HashSet<_> = fresh.iter().cloned().collect();
        let common: HashSet<_> = stored_set.intersection(&fresh_set).cloned().collect();

        let mut reconstructed: HashSet<String> = common;
        reconstructed.extend(diff.new_followers.iter().cloned());
        reconstructed.extend(diff.unfollowers.iter().cloned());

        let union: HashSet<_> = stored_set.union(&fresh_set).cloned().collect();
        assert_eq!(reconstructed, union);

        // New followers and unfollowers are disjoint.
        let new_set: HashSet<_> = diff.new_followers.iter().collect();
        assert!(diff.unfollowers.iter().all(|id| !new_set.contains(id)));
    }

    #[test]
    fn test_unchanged_list_is_a_no_op() {
        let stored = ids(&["A", "B"]);
        let diff = diff_followers(Some(&stored), &stored);
        assert_eq!(diff, FollowerDiff::default());
    }

    #[test]
    fn test_kind_from_probe_error() {
        assert_eq!(
            kind_from_probe_error(&TwitterApiError::NotFound),
            Some(UnfollowKind::Deleted)
        );
        assert_eq!(
            kind_from_probe_error(&TwitterApiError::UserSuspended),
            Some(UnfollowKind::Suspended)
        );
        assert_eq!(
            kind_from_probe_error(&TwitterApiError::Locked),
            Some(UnfollowKind::Locked)
        );
        // Owner- and app-level errors must propagate, not classify.
        assert_eq!(kind_from_probe_error(&TwitterApiError::TokenRevoked), None);
        assert_eq!(
            kind_from_probe_error(&TwitterApiError::BadAppCredentials),
            None
        );
    }

    #[test]
    fn test_best_follow_time_prefers_precise() {
        let record = UnfollowerRecord {
            user_id: "X".into(),
            screen_name: None,
            follow_detected_ms: 100,
            precise_follow_ms: Some(50),
            detected_ms: 200,
            kind: UnfollowKind::Unfollowed,
            still_followed: false,
            followed_by: false,
            probed: true,
        };
        assert_eq!(record.best_follow_time_ms(), 50);
    }
}
