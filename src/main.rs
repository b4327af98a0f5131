//! Site backup and restore tool
//!
//! Backs up a site's database, dataroot and file store to remote storage and
//! restores it onto another site.

// sitevault/src/main.rs
mod backup;
mod checks;
mod config;
mod db;
mod dryrun;
mod errors;
mod filestore;
mod host;
mod operation;
mod pipeline;
mod remote;
mod restore;
mod schema;
mod site;
#[cfg(test)]
mod test_support;
mod utils;
mod worker;

use anyhow::{Context, Result};
use config::AppConfig;
use operation::{Operation, OperationStatus};
use site::Site;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "Usage: sitevault <backup | restore <backupkey> | dryrun <backupkey> | list | status <id> | worker>";

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run_app().await {
        Ok(_) => {
            println!("✅ Operation completed successfully.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<()> {
    let config_path = env::var("SITEVAULT_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.json"));
    let app_config = AppConfig::load_from_json(&config_path)
        .context(format!("Failed to load application configuration from {}", config_path.display()))?;

    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        anyhow::bail!("No command given. {}", USAGE);
    };
    let argument = args.next();

    let site = Site::connect(&app_config)
        .await
        .context("Failed to connect to the site database")?;

    match (command.as_str(), argument.as_deref()) {
        ("backup", _) => {
            println!("🚀 Starting Backup Process...");
            let operation = backup::schedule(&site).await?;
            report(&site, backup::execute(&site, operation.id).await?).await?;
        }
        ("restore", Some(key)) => {
            println!("🔄 Starting Restore of backup {}...", key);
            let operation = restore::schedule(&site, key).await?;
            report(&site, restore::execute(&site, operation.id).await?).await?;
        }
        ("dryrun", Some(key)) => {
            println!("🔍 Checking whether backup {} can be restored...", key);
            let operation = dryrun::schedule(&site, key).await?;
            let done = dryrun::execute(&site, operation.id).await?;
            let failed = done.status != OperationStatus::Finished;
            report(&site, done).await?;
            if failed {
                anyhow::bail!("Backup {} cannot be restored on this site", key);
            }
        }
        ("list", _) => list_backups(&site).await?,
        ("status", Some(id)) => {
            let id: i64 = id.parse().with_context(|| format!("Invalid operation id: {}", id))?;
            let operation = site.registry.get(id).await?;
            report(&site, operation).await?;
        }
        ("worker", _) => {
            let ran = worker::run_once(&site).await?;
            if ran.is_empty() {
                println!("Nothing to do.");
            }
            for operation in ran {
                println!("⚙️ {} {}: {}", operation.kind, operation.id, operation.status);
            }
        }
        _ => {
            println!("❌ Invalid command. {}", USAGE);
            anyhow::bail!("Invalid command: {}", command);
        }
    }
    Ok(())
}

/// Prints an operation's status and its full log.
async fn report(site: &Site, operation: Operation) -> Result<()> {
    println!(
        "{} {} {}: {}",
        match operation.status {
            OperationStatus::Finished => "✅",
            OperationStatus::Failed | OperationStatus::FailedToStart => "❌",
            _ => "⏳",
        },
        operation.kind,
        operation.id,
        operation.status
    );
    if let Some(key) = &operation.backupkey {
        println!("Backup key: {}", key);
    }
    for entry in site.registry.logs(operation.id).await? {
        println!("{}", entry.format_line());
    }
    Ok(())
}

async fn list_backups(site: &Site) -> Result<()> {
    let backups = site.remote()?.list().await?;
    if backups.is_empty() {
        println!("No backups found.");
    }
    for backup in backups {
        println!(
            "{}  {}  {}  {}  {}",
            backup.backupkey,
            backup.status,
            backup.timecreated.format("%Y-%m-%d %H:%M:%S"),
            utils::display_size(backup.size_bytes),
            backup
                .metadata
                .get(operation::MetaKey::WwwRoot)
                .unwrap_or_default()
        );
    }
    Ok(())
}
