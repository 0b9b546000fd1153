use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use defollow::commands;
use dotenv::dotenv;
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    name = "defollow",
    version,
    about = "Watch Twitter follower lists and get a DM when someone leaves",
    long_about = "Polls the follower list of every registered account, diffs it against \
                  the stored snapshot and sends the owner a direct message describing \
                  unfollows, suspensions, blocks and deletions."
)]
struct Cli {
    /// Directory holding all persistent state (accounts, snapshots, ledgers)
    #[arg(short, long = "data-dir", env = "DEFOLLOW_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the polling daemon: worker pool, recovery loop and dispatch queue
    Run {
        /// Number of worker shards (overrides DEFOLLOW_WORKERS)
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Run one full poll cycle for a single account
    Check {
        /// External user id of the registered account
        #[arg(required = true)]
        user_id: String,
    },

    /// Register a monitored account
    AddAccount {
        /// External user id (opaque; never parsed as a number)
        #[arg(required = true)]
        user_id: String,

        /// Screen name, for logs and message text
        #[arg(required = true)]
        screen_name: String,

        /// OAuth access token of the account
        #[arg(long, required = true)]
        token: String,

        /// OAuth access token secret of the account
        #[arg(long, required = true)]
        secret: String,

        /// Access token of the separate notification-sending identity
        #[arg(long)]
        dm_token: Option<String>,

        /// Access token secret of the notification-sending identity
        #[arg(long)]
        dm_secret: Option<String>,

        /// Put the account on the faster VIP polling cadence
        #[arg(long)]
        vip: bool,
    },

    /// List registered accounts with their lifecycle state
    ListAccounts,

    /// Permanently remove an account and all its stored state
    RemoveAccount {
        /// External user id of the registered account
        #[arg(required = true)]
        user_id: String,
    },

    /// Show the stored snapshot and scheduling state for one account
    ShowSnapshot {
        /// External user id of the registered account
        #[arg(required = true)]
        user_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenv().ok();

    let args = Cli::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("defollow={default_level}"))),
        )
        .init();

    let data_dir = args
        .data_dir
        .unwrap_or_else(|| PathBuf::from("./defollow-data"));
    std::fs::create_dir_all(&data_dir).with_context(|| {
        format!(
            "Failed to create data directory at {path}",
            path = data_dir.display()
        )
    })?;
    debug!("Using data directory {path}", path = data_dir.display());

    match args.command {
        Commands::Run { workers } => commands::run::execute(&data_dir, workers).await?,
        Commands::Check { user_id } => commands::check::execute(&user_id, &data_dir).await?,
        Commands::AddAccount {
            user_id,
            screen_name,
            token,
            secret,
            dm_token,
            dm_secret,
            vip,
        } => commands::add_account::execute(
            &data_dir,
            &user_id,
            &screen_name,
            &token,
            &secret,
            dm_token.as_deref(),
            dm_secret.as_deref(),
            vip,
        )?,
        Commands::ListAccounts => commands::list_accounts::execute(&data_dir)?,
        Commands::RemoveAccount { user_id } => {
            commands::remove_account::execute(&user_id, &data_dir)?
        }
        Commands::ShowSnapshot { user_id } => commands::show_snapshot::execute(&user_id, &data_dir)?,
    }

    Ok(())
}
