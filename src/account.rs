use crate::error_utils::{parse_json_with_context, serialize_to_json_with_context};
use crate::twitter::Credentials;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Lifecycle state of a monitored account. States are mutually exclusive;
/// only `Enabled` and `Vip` are polled by the main cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AccountCategory {
    Enabled,
    /// Priority tier polled at a faster cadence.
    Vip,
    Suspended,
    Revoked,
    Disabled,
    DmClosed,
    AccountClosed,
}

impl AccountCategory {
    /// Polled by the main cycle.
    pub fn is_polled(self) -> bool {
        matches!(self, AccountCategory::Enabled | AccountCategory::Vip)
    }

    /// Re-tested by the slower recovery loop and promoted back to `Enabled`
    /// when the API accepts the credentials again.
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            AccountCategory::Suspended
                | AccountCategory::Revoked
                | AccountCategory::DmClosed
                | AccountCategory::AccountClosed
        )
    }

    pub fn is_vip(self) -> bool {
        matches!(self, AccountCategory::Vip)
    }
}

/// One monitored identity. The `user_id` is an opaque external identifier;
/// it looks numeric but is treated as an arbitrary string everywhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub user_id: String,
    pub screen_name: String,
    pub category: AccountCategory,
    /// Primary token pair used for list fetches and probes.
    pub credentials: Credentials,
    /// Optional secondary pair (possibly a different identity) used to send
    /// notification DMs, and as a fallback quota source mid-pagination.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dm_credentials: Option<Credentials>,
}

impl Account {
    /// The credential set digests are sent with.
    pub fn sending_credentials(&self) -> &Credentials {
        self.dm_credentials.as_ref().unwrap_or(&self.credentials)
    }
}

/// File-backed registry of monitored accounts: one JSON document per account
/// under `<data_dir>/accounts/`.
#[derive(Debug, Clone)]
pub struct AccountRegistry {
    dir: PathBuf,
}

impl AccountRegistry {
    pub fn new(data_dir: &Path) -> Result<Self> {
        let dir = data_dir.join("accounts");
        fs::create_dir_all(&dir).with_context(|| {
            format!(
                "Failed to create account registry directory at {path}",
                path = dir.display()
            )
        })?;
        Ok(Self { dir })
    }

    fn account_path(&self, user_id: &str) -> PathBuf {
        self.dir.join(format!("{user_id}.json"))
    }

    pub fn load(&self, user_id: &str) -> Result<Option<Account>> {
        let path = self.account_path(user_id);
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&path).with_context(|| {
            format!("Failed to read account file {path}", path = path.display())
        })?;
        Ok(Some(parse_json_with_context(&json, "account")?))
    }

    pub fn save(&self, account: &Account) -> Result<()> {
        let path = self.account_path(&account.user_id);
        let json = serialize_to_json_with_context(account, "account")?;
        fs::write(&path, json).with_context(|| {
            format!("Failed to write account file {path}", path = path.display())
        })?;
        debug!(
            "Saved account {user_id} (@{screen_name}, {category:?})",
            user_id = account.user_id,
            screen_name = account.screen_name,
            category = account.category
        );
        Ok(())
    }

    /// Loads every registered account. Unreadable files are skipped with a
    /// log line rather than failing the whole listing.
    pub fn load_all(&self) -> Result<Vec<Account>> {
        let dir_str = self
            .dir
            .to_str()
            .context("Account registry path contains invalid UTF-8")?;
        let pattern = format!("{dir_str}/*.json");

        let mut accounts = Vec::new();
        for path in glob::glob(&pattern)?.flatten() {
            match fs::read_to_string(&path)
                .context("Failed to read account file")
                .and_then(|json| parse_json_with_context::<Account>(&json, "account"))
            {
                Ok(account) => accounts.push(account),
                Err(e) => {
                    info!(
                        "Skipping unreadable account file {path}: {e}",
                        path = path.display()
                    );
                }
            }
        }
        Ok(accounts)
    }

    /// Transition an account to a new lifecycle category and persist it.
    pub fn transition(&self, account: &mut Account, category: AccountCategory) -> Result<()> {
        if account.category == category {
            return Ok(());
        }
        info!(
            "Account {user_id} (@{screen_name}): {from:?} -> {to:?}",
            user_id = account.user_id,
            screen_name = account.screen_name,
            from = account.category,
            to = category
        );
        account.category = category;
        self.save(account)
    }

    pub fn remove(&self, user_id: &str) -> Result<()> {
        let path = self.account_path(user_id);
        if path.exists() {
            fs::remove_file(&path).with_context(|| {
                format!("Failed to remove account file {path}", path = path.display())
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_account(user_id: &str, category: AccountCategory) -> Account {
        Account {
            user_id: user_id.to_string(),
            screen_name: format!("user_{user_id}"),
            category,
            credentials: Credentials {
                token: "tok".into(),
                secret: "sec".into(),
            },
            dm_credentials: None,
        }
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let registry = AccountRegistry::new(dir.path()).unwrap();

        let account = sample_account("123", AccountCategory::Enabled);
        registry.save(&account).unwrap();

        let loaded = registry.load("123").unwrap().unwrap();
        assert_eq!(loaded.user_id, "123");
        assert_eq!(loaded.category, AccountCategory::Enabled);
        assert!(registry.load("999").unwrap().is_none());
    }

    #[test]
    fn test_load_all_and_remove() {
        let dir = TempDir::new().unwrap();
        let registry = AccountRegistry::new(dir.path()).unwrap();

        registry
            .save(&sample_account("1", AccountCategory::Enabled))
            .unwrap();
        registry
            .save(&sample_account("2", AccountCategory::Vip))
            .unwrap();

        let mut all = registry.load_all().unwrap();
        all.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].category, AccountCategory::Vip);

        registry.remove("1").unwrap();
        assert_eq!(registry.load_all().unwrap().len(), 1);
    }

    #[test]
    fn test_transition_persists() {
        let dir = TempDir::new().unwrap();
        let registry = AccountRegistry::new(dir.path()).unwrap();

        let mut account = sample_account("5", AccountCategory::Enabled);
        registry.save(&account).unwrap();
        registry
            .transition(&mut account, AccountCategory::Revoked)
            .unwrap();

        let loaded = registry.load("5").unwrap().unwrap();
        assert_eq!(loaded.category, AccountCategory::Revoked);
        assert!(loaded.category.is_recoverable());
        assert!(!loaded.category.is_polled());
    }

    #[test]
    fn test_sending_credentials_fallback() {
        let mut account = sample_account("7", AccountCategory::Enabled);
        assert_eq!(account.sending_credentials().token, "tok");

        account.dm_credentials = Some(Credentials {
            token: "dm_tok".into(),
            secret: "dm_sec".into(),
        });
        assert_eq!(account.sending_credentials().token, "dm_tok");
    }
}
