use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::{ArgAction, Args, Parser, Subcommand};
use sea_orm_migration::MigratorTrait;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::info;

use storefront_checkout::{
    config::{self, AppConfig},
    db::{self, DbPool},
    events::{self, EventSender},
    handlers::AppServices,
    migrator::Migrator,
    notifications,
};

#[derive(Parser)]
#[command(
    name = "checkout-cli",
    about = "Operational commands for the storefront checkout service",
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        action = ArgAction::SetTrue,
        help = "Render command output as pretty JSON when available"
    )]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(subcommand)]
    Migrate(MigrateCommands),
    /// Cancel unpaid gateway orders older than the payment window
    SweepStale(SweepArgs),
}

#[derive(Subcommand)]
enum MigrateCommands {
    /// Apply all pending migrations
    Up,
    /// Roll back the most recent migrations
    Down {
        #[arg(long, default_value_t = 1, help = "Number of migrations to roll back")]
        steps: u32,
    },
    /// Show applied and pending migrations
    Status,
}

#[derive(Args)]
struct SweepArgs {
    #[arg(
        long,
        help = "Age in minutes after which an unpaid order is stale (defaults to the payment link lifetime)"
    )]
    older_than_minutes: Option<i64>,
    #[arg(long, action = ArgAction::SetTrue, help = "List stale orders without cancelling them")]
    dry_run: bool,
}

#[derive(Serialize)]
struct StaleOrderRow {
    id: uuid::Uuid,
    order_number: String,
    created_at: chrono::DateTime<Utc>,
    total_amount: rust_decimal::Decimal,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config().context("failed to load configuration")?;
    config::init_tracing(cfg.log_level(), cfg.log_json);

    let pool = db::establish_connection_from_app_config(&cfg)
        .await
        .context("failed to connect to database")?;

    match cli.command {
        Commands::Migrate(command) => handle_migrate(&pool, command).await?,
        Commands::SweepStale(args) => handle_sweep(cfg, pool, args, cli.json).await?,
    }

    Ok(())
}

async fn handle_migrate(pool: &DbPool, command: MigrateCommands) -> Result<()> {
    match command {
        MigrateCommands::Up => {
            Migrator::up(pool, None).await.context("migration failed")?;
            println!("Migrations applied");
        }
        MigrateCommands::Down { steps } => {
            Migrator::down(pool, Some(steps))
                .await
                .context("rollback failed")?;
            println!("Rolled back {} migration(s)", steps);
        }
        MigrateCommands::Status => {
            Migrator::status(pool)
                .await
                .context("failed to read migration status")?;
        }
    }
    Ok(())
}

async fn handle_sweep(cfg: AppConfig, pool: DbPool, args: SweepArgs, json: bool) -> Result<()> {
    let minutes = args
        .older_than_minutes
        .unwrap_or(cfg.payment.expire_minutes)
        .max(1);
    let cutoff = Utc::now() - Duration::minutes(minutes);

    let (event_tx, event_rx) = mpsc::channel(cfg.event_channel_capacity);
    let notifier = notifications::notifier_from_config(&cfg.notifier)
        .context("failed to build status notifier")?;
    let worker = tokio::spawn(events::process_events(event_rx, notifier));

    let services = AppServices::new(
        Arc::new(pool),
        Arc::new(EventSender::new(event_tx)),
        &cfg,
    );

    if args.dry_run {
        let stale = services.lifecycle.find_stale_unpaid(cutoff).await?;
        let rows: Vec<StaleOrderRow> = stale
            .into_iter()
            .map(|o| StaleOrderRow {
                id: o.id,
                order_number: o.order_number,
                created_at: o.created_at,
                total_amount: o.total_amount,
            })
            .collect();
        if json {
            println!("{}", serde_json::to_string_pretty(&rows)?);
        } else if rows.is_empty() {
            println!("No unpaid orders older than {} minutes", minutes);
        } else {
            for row in &rows {
                println!(
                    "{}  {}  {}  {}",
                    row.id, row.order_number, row.created_at, row.total_amount
                );
            }
        }
        return Ok(());
    }

    let report = services.lifecycle.sweep_stale_unpaid(cutoff).await?;

    // Flush queued notifications before exiting.
    drop(services);
    worker.await.context("event worker panicked")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "Examined {}, cancelled {}, skipped {}",
            report.examined, report.cancelled, report.skipped
        );
    }
    info!(cutoff = %cutoff, "Sweep complete");
    Ok(())
}
