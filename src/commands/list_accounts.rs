use crate::account::AccountRegistry;
use crate::storage::SnapshotStore;
use anyhow::Result;
use std::path::Path;

/// Prints every registered account with its lifecycle state and stored
/// follower count.
pub fn execute(data_dir: &Path) -> Result<()> {
    let registry = AccountRegistry::new(data_dir)?;
    let store = SnapshotStore::new(data_dir)?;

    let mut accounts = registry.load_all()?;
    if accounts.is_empty() {
        println!("No accounts registered");
        return Ok(());
    }
    accounts.sort_by(|a, b| a.screen_name.cmp(&b.screen_name));

    for account in &accounts {
        let followers = store
            .load_snapshot(&account.user_id)?
            .map(|s| s.count().to_string())
            .unwrap_or_else(|| "-".to_string());
        let dm = if account.dm_credentials.is_some() {
            "separate DM credentials"
        } else {
            "primary credentials for DMs"
        };
        println!(
            "@{screen_name} (id {user_id}): {category:?}, {followers} followers, {dm}",
            screen_name = account.screen_name,
            user_id = account.user_id,
            category = account.category
        );
    }
    println!("{count} accounts total", count = accounts.len());

    Ok(())
}
