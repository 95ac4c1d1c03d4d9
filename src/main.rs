//! mailmirror - Command-line entry point for the sync engine

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use mailmirror::config::Settings;
use mailmirror::providers::mail::{save_credentials, GmailClient, GmailCredentials};
use mailmirror::services::{SyncCoordinator, SyncEvent, SyncOutcome};
use mailmirror::storage::Database;

const USAGE: &str = "usage: mailmirror --account <email> <command>

commands:
  initial [--installed-at <rfc3339>]   backfill the mailbox
  incremental                          apply changes since the last sync
  retry-abandoned                      fetch abandoned messages again
  status                               show sync diagnostics
  store-credentials                    save GMAIL_CLIENT_ID, GMAIL_CLIENT_SECRET
                                       and GMAIL_REFRESH_TOKEN to the keychain";

enum Command {
    Initial { installed_at: Option<DateTime<Utc>> },
    Incremental,
    RetryAbandoned,
    Status,
    StoreCredentials,
}

struct Args {
    account: String,
    command: Command,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Args> {
    let mut account = std::env::var("MAILMIRROR_ACCOUNT").ok();
    let mut command = None;
    let mut installed_at = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--account" => account = Some(args.next().context("--account needs a value")?),
            "--installed-at" => {
                let raw = args.next().context("--installed-at needs a value")?;
                let parsed = DateTime::parse_from_rfc3339(&raw)
                    .with_context(|| format!("invalid --installed-at: {}", raw))?;
                installed_at = Some(parsed.with_timezone(&Utc));
            }
            "-h" | "--help" => {
                println!("{}", USAGE);
                std::process::exit(0);
            }
            other if command.is_none() => command = Some(other.to_string()),
            other => bail!("unexpected argument: {}\n\n{}", other, USAGE),
        }
    }

    let command = match command.as_deref() {
        Some("initial") => Command::Initial { installed_at },
        Some("incremental") => Command::Incremental,
        Some("retry-abandoned") => Command::RetryAbandoned,
        Some("status") => Command::Status,
        Some("store-credentials") => Command::StoreCredentials,
        Some(other) => bail!("unknown command: {}\n\n{}", other, USAGE),
        None => bail!("{}", USAGE),
    };
    let account = account.context("no account given; pass --account or set MAILMIRROR_ACCOUNT")?;

    Ok(Args { account, command })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = parse_args(std::env::args().skip(1))?;
    let settings = Settings::load_or_default().context("failed to load settings")?;

    if let Command::StoreCredentials = args.command {
        let credentials = GmailCredentials {
            client_id: std::env::var("GMAIL_CLIENT_ID").context("GMAIL_CLIENT_ID not set")?,
            client_secret: std::env::var("GMAIL_CLIENT_SECRET")
                .context("GMAIL_CLIENT_SECRET not set")?,
            refresh_token: std::env::var("GMAIL_REFRESH_TOKEN")
                .context("GMAIL_REFRESH_TOKEN not set")?,
        };
        save_credentials(&settings.gmail.keyring_service, &args.account, &credentials)?;
        println!("credentials stored for {}", args.account);
        return Ok(());
    }

    tracing::info!(account = %args.account, "starting mailmirror");
    let db = Database::open(&settings.storage.database_path)
        .await
        .context("failed to open database")?;
    let client = GmailClient::from_keychain(&settings.gmail, &args.account)?;
    client.authenticate().await?;
    let coordinator = Arc::new(SyncCoordinator::new(db, Arc::new(client), &settings));

    let mut events = coordinator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SyncEvent::Started(kind) => eprintln!("{} sync started", kind),
                SyncEvent::Progress { fraction, status } => {
                    eprintln!("[{:>3.0}%] {}", fraction * 100.0, status)
                }
                SyncEvent::Failed { status, error, .. } => eprintln!("{}: {}", status, error),
                SyncEvent::Completed(_) | SyncEvent::Cancelled(_) => {}
            }
        }
    });

    {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                coordinator.cancel_sync();
            }
        });
    }

    let outcome = match args.command {
        Command::Initial { installed_at } => coordinator.perform_initial_sync(installed_at).await?,
        Command::Incremental => coordinator.perform_incremental_sync().await?,
        Command::RetryAbandoned => coordinator.retry_abandoned().await?,
        Command::Status => {
            print_status(&coordinator).await?;
            return Ok(());
        }
        Command::StoreCredentials => return Ok(()),
    };

    match outcome {
        SyncOutcome::Completed(report) | SyncOutcome::Cancelled(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        SyncOutcome::Skipped => println!("a sync is already running"),
    }
    Ok(())
}

async fn print_status(coordinator: &SyncCoordinator) -> Result<()> {
    let last = coordinator.last_successful_sync().await?;
    println!(
        "last successful sync: {}",
        last.map(|t| t.to_rfc3339()).unwrap_or_else(|| "never".to_string())
    );
    println!(
        "consecutive failed passes: {}",
        coordinator.consecutive_failures().await?
    );
    let abandoned = coordinator.abandoned_messages().await?;
    println!("abandoned messages: {}", abandoned.len());
    for message in abandoned {
        println!(
            "  {} ({} retries) {}",
            message.message_id, message.retry_count, message.reason
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Result<Args> {
        parse_args(raw.iter().map(|s| s.to_string()))
    }

    #[test]
    fn parses_initial_with_install_time() {
        let parsed = args(&[
            "--account",
            "me@example.com",
            "initial",
            "--installed-at",
            "2024-03-01T10:00:00Z",
        ])
        .unwrap();
        assert_eq!(parsed.account, "me@example.com");
        match parsed.command {
            Command::Initial { installed_at } => {
                assert_eq!(installed_at.map(|t| t.timestamp()), Some(1_709_287_200));
            }
            _ => panic!("expected initial"),
        }
    }

    #[test]
    fn rejects_unknown_command() {
        assert!(args(&["--account", "me@example.com", "explode"]).is_err());
    }
}
