use crate::datetime_utils::format_ms_for_display;
use crate::storage::SnapshotStore;
use anyhow::Result;
use std::path::Path;

/// Dumps the stored state for one account: snapshot summary, pending fetch
/// progress, scheduling and dispatch ledger.
pub fn execute(user_id: &str, data_dir: &Path) -> Result<()> {
    let store = SnapshotStore::new(data_dir)?;

    match store.load_snapshot(user_id)? {
        Some(snapshot) => {
            println!(
                "Snapshot for {user_id}: {count} followers, updated {updated}",
                count = snapshot.count(),
                updated = format_ms_for_display(snapshot.updated_ms)
            );
            println!(
                "  precise follow times cached: {precise}, uncachable: {uncachable}",
                precise = snapshot.precise_follow_ms.len(),
                uncachable = snapshot.uncachable.len()
            );
            let preview: Vec<&str> = snapshot
                .followers
                .iter()
                .take(10)
                .map(String::as_str)
                .collect();
            println!("  most recent followers: {preview:?}");
        }
        None => println!("No snapshot stored for {user_id}"),
    }

    if let Some(resume) = store.load_resume(user_id)? {
        println!(
            "Pending fetch: {count} ids collected, cursor {cursor}, started {started}",
            count = resume.ids.len(),
            cursor = resume.cursor,
            started = format_ms_for_display(resume.started_ms)
        );
    }

    if let Some(next_check_at) = store.load_next_check_at(user_id)? {
        println!(
            "Next eligible check: {at}",
            at = format_ms_for_display(next_check_at)
        );
    }

    let ledger = store.load_ledger(user_id)?;
    if ledger.sent_ms > 0 {
        println!(
            "Last digest: {items} items sent {at}",
            items = ledger.item_ids.len(),
            at = format_ms_for_display(ledger.sent_ms)
        );
    }

    Ok(())
}
