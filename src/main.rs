//! Simple Bank - operator CLI
//!
//! Thin shell over the ledger core for migrations and manual operations.
//!
//! ```text
//! simple_bank [--env dev] migrate
//! simple_bank [--env dev] create-account --owner alice --currency USD [--balance 100]
//! simple_bank [--env dev] account --id 1
//! simple_bank [--env dev] transfer --from 1 --to 2 --amount 10 [--timeout-ms 3000]
//! simple_bank [--env dev] deposit --account 1 --amount 10
//! simple_bank [--env dev] entries --account 1 [--limit 20] [--offset 0]
//! simple_bank [--env dev] transfers --account 1 [--limit 20] [--offset 0]
//! ```
//!
//! Results are printed to stdout as JSON.

use std::time::Duration;

use anyhow::{Context as _, anyhow, bail};
use serde::Serialize;

use simple_bank::config::AppConfig;
use simple_bank::db::Database;
use simple_bank::models::{CreateAccountParams, ListEntriesParams, ListTransfersParams};
use simple_bank::{Context, DepositTxParams, Queries, Store, TransferTxParams};

const DEFAULT_PAGE: i64 = 20;

fn get_env(args: &[String]) -> String {
    get_flag(args, "--env")
        .or_else(|| get_flag(args, "-e"))
        .unwrap_or_else(|| "dev".to_string())
}

fn get_flag(args: &[String], name: &str) -> Option<String> {
    for i in 0..args.len() {
        if args[i] == name && i + 1 < args.len() {
            return Some(args[i + 1].clone());
        }
    }
    None
}

fn require_i64(args: &[String], name: &str) -> anyhow::Result<i64> {
    let raw = get_flag(args, name).ok_or_else(|| anyhow!("missing required flag {}", name))?;
    raw.parse()
        .with_context(|| format!("{} expects an integer, got '{}'", name, raw))
}

fn optional_i64(args: &[String], name: &str, default: i64) -> anyhow::Result<i64> {
    match get_flag(args, name) {
        Some(_) => require_i64(args, name),
        None => Ok(default),
    }
}

/// First positional argument that is not a flag or a flag value
fn get_command(args: &[String]) -> Option<&str> {
    let mut skip = false;
    for arg in args.iter().skip(1) {
        if skip {
            skip = false;
            continue;
        }
        if arg.starts_with('-') {
            skip = true;
            continue;
        }
        return Some(arg.as_str());
    }
    None
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    let env = get_env(&args);
    let app_config = AppConfig::load(&env)?;
    let _log_guard = simple_bank::logging::init_logging(&app_config);

    tracing::info!("Starting Simple Bank CLI in {} mode", env);

    let Some(command) = get_command(&args) else {
        bail!("usage: simple_bank [--env <env>] <migrate|create-account|account|transfer|deposit|entries|transfers> [flags]");
    };

    let database_url = app_config
        .postgres_url
        .clone()
        .ok_or_else(|| anyhow!("postgres_url is not configured (set it or DATABASE_URL)"))?;
    let db = Database::connect_with(&database_url, &app_config.database)
        .await
        .context("Cannot connect to PostgreSQL")?;
    let store = db.store();

    let ctx = match get_flag(&args, "--timeout-ms") {
        Some(_) => {
            let millis = require_i64(&args, "--timeout-ms")?;
            Context::background().with_timeout(Duration::from_millis(millis.max(0) as u64))
        }
        None => Context::background(),
    };

    match command {
        "migrate" => {
            db.migrate().await.context("Schema migration failed")?;
            tracing::info!("Schema is up to date");
        }
        "create-account" => {
            let owner = get_flag(&args, "--owner").ok_or_else(|| anyhow!("missing --owner"))?;
            let currency =
                get_flag(&args, "--currency").ok_or_else(|| anyhow!("missing --currency"))?;
            let balance = optional_i64(&args, "--balance", 0)?;
            let mut conn = store.acquire(&ctx).await?;
            let account = conn
                .create_account(CreateAccountParams {
                    owner,
                    balance,
                    currency,
                })
                .await?;
            print_json(&account)?;
        }
        "account" => {
            let id = require_i64(&args, "--id")?;
            let mut conn = store.acquire(&ctx).await?;
            print_json(&conn.get_account(id).await?)?;
        }
        "transfer" => {
            let params = TransferTxParams {
                from_account_id: require_i64(&args, "--from")?,
                to_account_id: require_i64(&args, "--to")?,
                amount: require_i64(&args, "--amount")?,
            };
            match simple_bank::transfer_tx(&store, &ctx, params).await {
                Ok(result) => print_json(&result)?,
                Err(e) => {
                    tracing::error!(code = e.code(), retryable = e.is_retryable(), "Transfer failed: {}", e);
                    return Err(e.into());
                }
            }
        }
        "deposit" => {
            let params = DepositTxParams {
                account_id: require_i64(&args, "--account")?,
                amount: require_i64(&args, "--amount")?,
            };
            print_json(&simple_bank::deposit_tx(&store, &ctx, params).await?)?;
        }
        "entries" => {
            let mut conn = store.acquire(&ctx).await?;
            let entries = conn
                .list_entries(ListEntriesParams {
                    account_id: require_i64(&args, "--account")?,
                    limit: optional_i64(&args, "--limit", DEFAULT_PAGE)?,
                    offset: optional_i64(&args, "--offset", 0)?,
                })
                .await?;
            print_json(&entries)?;
        }
        "transfers" => {
            let account_id = require_i64(&args, "--account")?;
            let mut conn = store.acquire(&ctx).await?;
            let transfers = conn
                .list_transfers(ListTransfersParams {
                    from_account_id: account_id,
                    to_account_id: account_id,
                    limit: optional_i64(&args, "--limit", DEFAULT_PAGE)?,
                    offset: optional_i64(&args, "--offset", 0)?,
                })
                .await?;
            print_json(&transfers)?;
        }
        other => bail!("unknown command '{}'", other),
    }

    Ok(())
}
