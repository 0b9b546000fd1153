use crate::account::{Account, AccountCategory, AccountRegistry};
use crate::twitter::Credentials;
use anyhow::{bail, Result};
use std::path::Path;
use tracing::info;

/// Registers (or replaces) a monitored account.
#[allow(clippy::too_many_arguments)]
pub fn execute(
    data_dir: &Path,
    user_id: &str,
    screen_name: &str,
    token: &str,
    secret: &str,
    dm_token: Option<&str>,
    dm_secret: Option<&str>,
    vip: bool,
) -> Result<()> {
    let registry = AccountRegistry::new(data_dir)?;

    let dm_credentials = match (dm_token, dm_secret) {
        (Some(token), Some(secret)) => Some(Credentials {
            token: token.to_string(),
            secret: secret.to_string(),
        }),
        (None, None) => None,
        _ => bail!("--dm-token and --dm-secret must be provided together"),
    };

    let account = Account {
        user_id: user_id.to_string(),
        screen_name: screen_name.to_string(),
        category: if vip {
            AccountCategory::Vip
        } else {
            AccountCategory::Enabled
        },
        credentials: Credentials {
            token: token.to_string(),
            secret: secret.to_string(),
        },
        dm_credentials,
    };

    registry.save(&account)?;
    info!(
        "Registered account {user_id} (@{screen_name}, {category:?})",
        category = account.category
    );
    println!("Account {user_id} (@{screen_name}) registered");

    Ok(())
}
