use crate::account::AccountRegistry;
use crate::storage::SnapshotStore;
use anyhow::{bail, Result};
use std::path::Path;
use tracing::info;

/// Permanently removes an account and every piece of stored state for it:
/// registry entry, snapshot, pending fetch progress, schedule and ledger.
pub fn execute(user_id: &str, data_dir: &Path) -> Result<()> {
    let registry = AccountRegistry::new(data_dir)?;
    let store = SnapshotStore::new(data_dir)?;

    if registry.load(user_id)?.is_none() {
        bail!("Account {user_id} is not registered");
    }

    registry.remove(user_id)?;
    store.remove_account_data(user_id)?;

    info!("Removed account {user_id} and all stored state");
    println!("Account {user_id} removed");
    Ok(())
}
