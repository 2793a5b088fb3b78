// ABOUTME: Entry point for the tabsnooze binary.
// ABOUTME: Parses CLI arguments, initializes tracing, opens the store, and dispatches the subcommand.

mod config;
mod surface;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tabsnooze_core::now_millis;
use tabsnooze_scheduler::RestorationScheduler;
use tabsnooze_store::{
    KeyValueStore, MemoryKv, SnoozeRequest, SqliteKv, StorageGateway, TabSnapshot,
};
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::surface::StdoutSurface;

/// tabsnooze: defer tabs until later and reopen them when they are due.
#[derive(Parser)]
#[command(name = "tabsnooze", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Snooze one or more URLs.
    Snooze {
        #[arg(required = true)]
        urls: Vec<String>,
        /// Reopen after this many minutes.
        #[arg(long, conflicts_with = "at")]
        in_minutes: Option<u64>,
        /// Reopen at this RFC 3339 timestamp.
        #[arg(long)]
        at: Option<String>,
        /// Reopen the URLs together in one window.
        #[arg(long)]
        group: bool,
        #[arg(long)]
        title: Option<String>,
    },
    /// List snoozed items, soonest first.
    List,
    /// Remove one snoozed item.
    Remove { id: String },
    /// Remove every item of a window group.
    RemoveGroup { group_id: String },
    /// Merge an exported (or legacy) file into the store.
    Import { file: PathBuf },
    /// Write the store as JSON to a file or stdout.
    Export { file: Option<PathBuf> },
    /// Take a backup snapshot now.
    Backup,
    /// Restore the store from the best available backup.
    Recover,
    /// Reopen due items, periodically or once.
    Run {
        #[arg(long)]
        once: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("tabsnooze=info,tabsnooze_store=info,tabsnooze_scheduler=info")
        }))
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env()?;

    let backend = SqliteKv::open(&config.database_path())
        .with_context(|| format!("opening store at {}", config.database_path().display()))?;
    let session: Arc<dyn KeyValueStore> = Arc::new(MemoryKv::new());
    let gateway = Arc::new(
        StorageGateway::new(Arc::new(backend), config.store.clone()).with_session(session),
    );

    let startup = gateway.initialize().await?;
    if let Some(from) = startup.migrated_from {
        tracing::info!("store upgraded from schema v{}", from);
    }
    if let Some(recovery) = &startup.recovery {
        tracing::warn!("store was recovered at startup: {:?}", recovery);
    }

    let result = dispatch(cli.command, &config, Arc::clone(&gateway)).await;

    if let Err(e) = gateway.backups().flush().await {
        tracing::warn!("final backup failed: {}", e);
    }
    result
}

async fn dispatch(
    command: Command,
    config: &AppConfig,
    gateway: Arc<StorageGateway>,
) -> anyhow::Result<()> {
    match command {
        Command::Snooze {
            urls,
            in_minutes,
            at,
            group,
            title,
        } => {
            let pop_time = pop_time(in_minutes, at.as_deref())?;
            let tabs = urls
                .into_iter()
                .map(|url| TabSnapshot {
                    url,
                    title: title.clone(),
                    favicon: None,
                })
                .collect();
            let outcome = gateway
                .snooze(SnoozeRequest {
                    tabs,
                    pop_time,
                    as_group: group,
                })
                .await?;
            for url in &outcome.skipped {
                eprintln!("skipped unrestorable url: {}", url);
            }
            println!(
                "{}",
                serde_json::json!({
                    "ids": outcome.ids,
                    "groupId": outcome.group_id,
                    "popTime": pop_time,
                })
            );
        }
        Command::List => {
            let container = gateway.read().await?;
            let mut items: Vec<_> = container.items.values().collect();
            items.sort_by_key(|item| (item.pop_time, item.index));
            for item in items {
                println!("{}", serde_json::to_string(item)?);
            }
        }
        Command::Remove { id } => {
            let removed = gateway.remove_item(&id).await?;
            println!("removed {} ({})", removed.id, removed.url);
        }
        Command::RemoveGroup { group_id } => {
            let count = gateway.remove_group(&group_id).await?;
            println!("removed {} item(s) from group {}", count, group_id);
        }
        Command::Import { file } => {
            let raw = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let payload = serde_json::from_str(&raw)
                .with_context(|| format!("parsing {}", file.display()))?;
            let report = gateway.import(payload).await?;
            println!(
                "imported {} item(s), {} reassigned, {} dropped",
                report.imported, report.reassigned, report.dropped
            );
        }
        Command::Export { file } => {
            let exported = serde_json::to_string_pretty(&gateway.export().await?)?;
            match file {
                Some(path) => tokio::fs::write(&path, exported)
                    .await
                    .with_context(|| format!("writing {}", path.display()))?,
                None => println!("{}", exported),
            }
        }
        Command::Backup => match gateway.backups().snapshot_now().await? {
            Some(timestamp) => println!("wrote backup {}", timestamp),
            None => println!("store is not in a valid state; no backup written"),
        },
        Command::Recover => {
            let outcome = gateway.recover().await?;
            println!("{:?}", outcome);
        }
        Command::Run { once } => {
            let scheduler = Arc::new(RestorationScheduler::new(
                Arc::clone(&gateway),
                Arc::new(StdoutSurface::new()),
                config.scheduler.clone(),
            ));
            if once {
                let outcome = scheduler.run_pass().await?;
                tracing::info!("{:?}", outcome);
            } else {
                let handle = scheduler.spawn_periodic();
                tokio::signal::ctrl_c().await?;
                tracing::info!("received Ctrl+C, shutting down");
                handle.abort();
            }
            for failed in gateway.session().failed_restores().await? {
                eprintln!("failed to reopen {} ({})", failed.id, failed.url);
            }
        }
    }
    Ok(())
}

/// Resolve the due time from `--in-minutes` or `--at`; defaults to one hour.
fn pop_time(in_minutes: Option<u64>, at: Option<&str>) -> anyhow::Result<i64> {
    if let Some(at) = at {
        let at: DateTime<Utc> = DateTime::parse_from_rfc3339(at)
            .with_context(|| format!("invalid --at timestamp: {}", at))?
            .with_timezone(&Utc);
        return Ok(at.timestamp_millis());
    }
    let minutes = i64::try_from(in_minutes.unwrap_or(60)).context("--in-minutes is too large")?;
    Ok(now_millis().saturating_add(minutes.saturating_mul(60_000)))
}
