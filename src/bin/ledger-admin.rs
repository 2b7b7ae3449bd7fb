//! Operator CLI for the feature ledger
//!
//! Runs recovery sweeps and inspects or adjusts user accounts against the
//! configured store.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use feature_ledger::config::{ConfigLoader, ENV_PREFIX};
use feature_ledger::metrics::{init_tracing_with_filter, MetricsCollector};
use feature_ledger::{build_manager, feature_registry, open_store, PlanTier};
use tracing::info;

/// Feature ledger administration
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML, YAML or JSON); environment overrides apply on top
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Finalize executions stuck in pending
    Recover,

    /// Print a user's point balance
    Balance { user: String },

    /// Credit points to a user
    Grant {
        user: String,
        amount: i64,
        #[arg(long, default_value = "manual grant")]
        reason: String,
    },

    /// Assign a plan tier (free, tier_a, tier_b)
    SetPlan { user: String, tier: PlanTier },

    /// Print a user's point transactions as JSON lines
    History { user: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => ConfigLoader::from_file_with_env(path, ENV_PREFIX)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ConfigLoader::from_env().context("loading configuration from environment")?,
    };

    let metrics = Arc::new(MetricsCollector::new()?);
    init_tracing_with_filter(metrics.clone(), &config.service.log_level)?;

    let store = Arc::new(open_store(&config.database).await?);
    let executor = Arc::new(feature_registry(&config));
    let manager = build_manager(&config, store, executor, Some(metrics))?;
    let now = Utc::now();

    match args.command {
        Command::Recover => {
            let report = manager.recover_stale(now).await?;
            info!(recovered = report.recovered(), "recovery complete");
            println!(
                "scanned={} refunded={} failed={} errors={} points_returned={}",
                report.scanned,
                report.refunded.len(),
                report.failed.len(),
                report.errors.len(),
                report.points_returned
            );
            for (execution_id, error) in &report.errors {
                eprintln!("{execution_id}: {error}");
            }
        }
        Command::Balance { user } => {
            println!("{}", manager.balance(&user).await?);
        }
        Command::Grant {
            user,
            amount,
            reason,
        } => {
            let balance = manager.grant_points(&user, amount, &reason, now).await?;
            println!("{balance}");
        }
        Command::SetPlan { user, tier } => {
            manager.set_plan(&user, tier, now).await?;
            println!("{user}: {tier}");
        }
        Command::History { user } => {
            for entry in manager.history(&user).await? {
                println!("{}", serde_json::to_string(&entry)?);
            }
        }
    }

    Ok(())
}
