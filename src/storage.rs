use crate::error_utils::{parse_json_with_context, serialize_to_json_with_context};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Stored follower state for one account.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowerSnapshot {
    /// Follower ids in the order of the most recent complete fetch. The
    /// API's order is meaningful: list position approximates follow recency
    /// for followers the precise-time cache hasn't reached.
    pub followers: Vec<String>,
    /// Epoch ms when each follower was first observed by this system. A
    /// value of 0 means "already following when the account signed up".
    pub follow_detected_ms: HashMap<String, i64>,
    /// More accurate follow times recovered from pagination-cursor probing.
    pub precise_follow_ms: HashMap<String, i64>,
    /// Followers whose precise-time probe failed persistently; never
    /// retried.
    pub uncachable: HashSet<String>,
    pub updated_ms: i64,
}

impl FollowerSnapshot {
    pub fn count(&self) -> usize {
        self.followers.len()
    }

    /// Best known follow time: the precise cursor-derived value when cached,
    /// otherwise the first-observed timestamp.
    pub fn follow_time_of(&self, follower_id: &str) -> (i64, Option<i64>) {
        let detected = self
            .follow_detected_ms
            .get(follower_id)
            .copied()
            .unwrap_or(0);
        let precise = self.precise_follow_ms.get(follower_id).copied();
        (detected, precise)
    }
}

/// Partial progress of an interrupted pagination walk, persisted so a fetch
/// of a huge account can span several quota windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeState {
    pub cursor: String,
    pub ids: Vec<String>,
    /// Cursor-derived (follower id, follow time ms) candidates harvested so
    /// far during this walk.
    pub cursor_hints: Vec<(String, i64)>,
    pub started_ms: i64,
}

/// What the dispatcher last sent for an account. A retried cycle compares
/// against `last_detected_ms` so the same loss event is never re-sent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchLedger {
    pub last_detected_ms: i64,
    pub sent_ms: i64,
    pub item_ids: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct GlobalStats {
    total_unfollowers: u64,
}

/// Persistent per-account stores: follower snapshots, resumable fetch state,
/// per-account scheduling hints, the dispatch ledger, and a global unfollow
/// counter. Everything is a JSON document under the data directory, written
/// atomically (temp file + rename) so a crashed cycle never leaves a
/// half-updated snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    data_dir: PathBuf,
    stats_lock: Arc<Mutex<()>>,
}

impl SnapshotStore {
    pub fn new(data_dir: &Path) -> Result<Self> {
        for sub in ["snapshots", "pending", "schedule", "ledger"] {
            let dir = data_dir.join(sub);
            fs::create_dir_all(&dir).with_context(|| {
                format!("Failed to create data directory {path}", path = dir.display())
            })?;
        }
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            stats_lock: Arc::new(Mutex::new(())),
        })
    }

    fn snapshot_path(&self, user_id: &str) -> PathBuf {
        self.data_dir.join("snapshots").join(format!("{user_id}.json"))
    }

    fn pending_path(&self, user_id: &str) -> PathBuf {
        self.data_dir.join("pending").join(format!("{user_id}.json"))
    }

    fn schedule_path(&self, user_id: &str) -> PathBuf {
        self.data_dir.join("schedule").join(format!("{user_id}.json"))
    }

    fn ledger_path(&self, user_id: &str) -> PathBuf {
        self.data_dir.join("ledger").join(format!("{user_id}.json"))
    }

    fn stats_path(&self) -> PathBuf {
        self.data_dir.join("stats.json")
    }

    /// Serialize and atomically replace a JSON document.
    fn write_json<T: Serialize>(path: &Path, data: &T, data_desc: &str) -> Result<()> {
        let json = serialize_to_json_with_context(data, data_desc)?;
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, json).with_context(|| {
            format!("Failed to write {data_desc} to {path}", path = tmp_path.display())
        })?;
        fs::rename(&tmp_path, path).with_context(|| {
            format!("Failed to move {data_desc} into place at {path}", path = path.display())
        })?;
        Ok(())
    }

    fn read_json<T: for<'de> Deserialize<'de>>(path: &Path, data_desc: &str) -> Result<Option<T>> {
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {data_desc} from {path}", path = path.display()))?;
        Ok(Some(parse_json_with_context(&json, data_desc)?))
    }

    pub fn load_snapshot(&self, user_id: &str) -> Result<Option<FollowerSnapshot>> {
        Self::read_json(&self.snapshot_path(user_id), "follower snapshot")
    }

    /// Commits the result of one diff cycle as a single atomic write:
    /// replaces the follower list, records detection timestamps for new
    /// followers, merges cursor-derived follow-time hints, drops all
    /// bookkeeping for departed followers, and bumps the global counter.
    ///
    /// `detected_ms` is 0 for the bootstrap fetch so initial followers read
    /// as "following since before sign-up".
    pub fn apply_cycle(
        &self,
        user_id: &str,
        fresh: &[String],
        new_followers: &[String],
        unfollowers: &[String],
        cursor_hints: &[(String, i64)],
        failed_hints: &[String],
        detected_ms: i64,
    ) -> Result<FollowerSnapshot> {
        let mut snapshot = self.load_snapshot(user_id)?.unwrap_or_default();

        snapshot.followers = fresh.to_vec();
        snapshot.updated_ms = crate::datetime_utils::now_ms();

        for id in new_followers {
            snapshot.follow_detected_ms.insert(id.clone(), detected_ms);
        }

        for (id, follow_ms) in cursor_hints {
            if snapshot.uncachable.contains(id) {
                continue;
            }
            snapshot
                .precise_follow_ms
                .entry(id.clone())
                .or_insert(*follow_ms);
        }
        for id in failed_hints {
            if !snapshot.precise_follow_ms.contains_key(id) {
                snapshot.uncachable.insert(id.clone());
            }
        }

        for id in unfollowers {
            snapshot.follow_detected_ms.remove(id);
            snapshot.precise_follow_ms.remove(id);
            snapshot.uncachable.remove(id);
        }

        debug_assert_eq!(snapshot.count(), fresh.len());

        Self::write_json(&self.snapshot_path(user_id), &snapshot, "follower snapshot")?;

        if !unfollowers.is_empty() {
            self.add_unfollowers(unfollowers.len() as u64)?;
        }

        debug!(
            "Committed cycle for {user_id}: {count} followers, +{added} -{removed}",
            count = snapshot.count(),
            added = new_followers.len(),
            removed = unfollowers.len()
        );

        Ok(snapshot)
    }

    pub fn load_resume(&self, user_id: &str) -> Result<Option<ResumeState>> {
        Self::read_json(&self.pending_path(user_id), "resumable fetch state")
    }

    pub fn save_resume(&self, user_id: &str, state: &ResumeState) -> Result<()> {
        info!(
            "Persisting partial fetch for {user_id}: {count} ids, cursor {cursor}",
            count = state.ids.len(),
            cursor = state.cursor
        );
        Self::write_json(&self.pending_path(user_id), state, "resumable fetch state")
    }

    pub fn clear_resume(&self, user_id: &str) -> Result<()> {
        let path = self.pending_path(user_id);
        if path.exists() {
            fs::remove_file(&path).context("Failed to remove resumable fetch state")?;
        }
        Ok(())
    }

    /// Earliest time the account may be polled again without risking quota,
    /// as computed from the latest rate-limit headers.
    pub fn load_next_check_at(&self, user_id: &str) -> Result<Option<i64>> {
        #[derive(Deserialize)]
        struct Schedule {
            next_check_at_ms: i64,
        }
        Ok(
            Self::read_json::<Schedule>(&self.schedule_path(user_id), "poll schedule")?
                .map(|s| s.next_check_at_ms),
        )
    }

    pub fn save_next_check_at(&self, user_id: &str, next_check_at_ms: i64) -> Result<()> {
        #[derive(Serialize)]
        struct Schedule {
            next_check_at_ms: i64,
        }
        Self::write_json(
            &self.schedule_path(user_id),
            &Schedule { next_check_at_ms },
            "poll schedule",
        )
    }

    pub fn load_ledger(&self, user_id: &str) -> Result<DispatchLedger> {
        Ok(Self::read_json(&self.ledger_path(user_id), "dispatch ledger")?.unwrap_or_default())
    }

    pub fn save_ledger(&self, user_id: &str, ledger: &DispatchLedger) -> Result<()> {
        Self::write_json(&self.ledger_path(user_id), ledger, "dispatch ledger")
    }

    /// Monotonic count of every unfollow ever detected. Metrics only; no
    /// decision reads it.
    pub fn total_unfollowers(&self) -> Result<u64> {
        let _guard = self.stats_lock.lock().expect("stats lock poisoned");
        Ok(Self::read_json::<GlobalStats>(&self.stats_path(), "global stats")?
            .unwrap_or_default()
            .total_unfollowers)
    }

    fn add_unfollowers(&self, n: u64) -> Result<()> {
        let _guard = self.stats_lock.lock().expect("stats lock poisoned");
        let mut stats = Self::read_json::<GlobalStats>(&self.stats_path(), "global stats")?
            .unwrap_or_default();
        stats.total_unfollowers += n;
        Self::write_json(&self.stats_path(), &stats, "global stats")
    }

    /// Deletes every per-account document; used when an account is
    /// permanently removed.
    pub fn remove_account_data(&self, user_id: &str) -> Result<()> {
        for path in [
            self.snapshot_path(user_id),
            self.pending_path(user_id),
            self.schedule_path(user_id),
            self.ledger_path(user_id),
        ] {
            if path.exists() {
                fs::remove_file(&path).with_context(|| {
                    format!("Failed to remove {path}", path = path.display())
                })?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_apply_cycle_bootstrap() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();

        let fresh = ids(&["A", "B"]);
        let snapshot = store
            .apply_cycle("1", &fresh, &fresh, &[], &[], &[], 0)
            .unwrap();

        assert_eq!(snapshot.followers, fresh);
        assert_eq!(snapshot.count(), 2);
        assert_eq!(snapshot.follow_detected_ms["A"], 0);
        assert_eq!(store.total_unfollowers().unwrap(), 0);
    }

    #[test]
    fn test_apply_cycle_removes_departed_bookkeeping() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();

        let first = ids(&["A", "B", "C"]);
        store
            .apply_cycle("1", &first, &first, &[], &[("B".into(), 42)], &[], 1000)
            .unwrap();

        let second = ids(&["A", "C"]);
        let snapshot = store
            .apply_cycle("1", &second, &[], &ids(&["B"]), &[], &[], 2000)
            .unwrap();

        assert_eq!(snapshot.followers, second);
        assert!(!snapshot.follow_detected_ms.contains_key("B"));
        assert!(!snapshot.precise_follow_ms.contains_key("B"));
        assert_eq!(store.total_unfollowers().unwrap(), 1);
    }

    #[test]
    fn test_cursor_hints_do_not_overwrite_or_touch_uncachable() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();

        let fresh = ids(&["A", "B"]);
        store
            .apply_cycle("1", &fresh, &fresh, &[], &[("A".into(), 10)], &["B".into()], 0)
            .unwrap();

        // B's probe failed without a cached value: marked uncachable.
        let snapshot = store.load_snapshot("1").unwrap().unwrap();
        assert!(snapshot.uncachable.contains("B"));
        assert_eq!(snapshot.precise_follow_ms["A"], 10);

        // Later hints neither overwrite A nor resurrect B.
        let snapshot = store
            .apply_cycle(
                "1",
                &fresh,
                &[],
                &[],
                &[("A".into(), 99), ("B".into(), 77)],
                &[],
                0,
            )
            .unwrap();
        assert_eq!(snapshot.precise_follow_ms["A"], 10);
        assert!(!snapshot.precise_follow_ms.contains_key("B"));
    }

    #[test]
    fn test_resume_state_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();

        assert!(store.load_resume("1").unwrap().is_none());

        let state = ResumeState {
            cursor: "1510774575156173766".into(),
            ids: ids(&["A", "B"]),
            cursor_hints: vec![("A".into(), 123)],
            started_ms: 5,
        };
        store.save_resume("1", &state).unwrap();

        let loaded = store.load_resume("1").unwrap().unwrap();
        assert_eq!(loaded.cursor, state.cursor);
        assert_eq!(loaded.ids, state.ids);

        store.clear_resume("1").unwrap();
        assert!(store.load_resume("1").unwrap().is_none());
    }

    #[test]
    fn test_schedule_and_ledger() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();

        assert!(store.load_next_check_at("1").unwrap().is_none());
        store.save_next_check_at("1", 123_456).unwrap();
        assert_eq!(store.load_next_check_at("1").unwrap(), Some(123_456));

        let ledger = store.load_ledger("1").unwrap();
        assert_eq!(ledger.last_detected_ms, 0);
        store
            .save_ledger(
                "1",
                &DispatchLedger {
                    last_detected_ms: 999,
                    sent_ms: 1000,
                    item_ids: ids(&["B"]),
                },
            )
            .unwrap();
        assert_eq!(store.load_ledger("1").unwrap().last_detected_ms, 999);
    }

    #[test]
    fn test_remove_account_data() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();

        let fresh = ids(&["A"]);
        store
            .apply_cycle("1", &fresh, &fresh, &[], &[], &[], 0)
            .unwrap();
        store.save_next_check_at("1", 1).unwrap();

        store.remove_account_data("1").unwrap();
        assert!(store.load_snapshot("1").unwrap().is_none());
        assert!(store.load_next_check_at("1").unwrap().is_none());
    }
}
