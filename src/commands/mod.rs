pub mod add_account;
pub mod check;
pub mod list_accounts;
pub mod remove_account;
pub mod run;
pub mod show_snapshot;
