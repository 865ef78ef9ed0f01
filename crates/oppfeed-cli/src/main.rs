use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use oppfeed_publish::TelegramPublisher;
use oppfeed_store::{MemoryRecordStore, PgRecordStore, RecordStore};
use oppfeed_sync::{build_scheduler, maybe_build_scheduler, parse_target_date, DailyTasks, Pipeline, SyncConfig};
use oppfeed_web::AppState;
use tracing::{info, warn};
use tracing_subscriber::{fmt as tfmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "oppfeed")]
#[command(about = "Opportunity feed crawler, publisher and API")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl one listing date (default: yesterday) and store new opportunities.
    Sync {
        /// YYYY/MM/DD or YYYY-MM-DD
        #[arg(long, value_parser = parse_date_arg)]
        date: Option<NaiveDate>,
        /// Use an in-memory store instead of the database.
        #[arg(long)]
        dry_run: bool,
    },
    /// Post unposted opportunities to the Telegram channel.
    Post,
    /// Delete opportunities older than N days.
    Purge {
        #[arg(long)]
        days: Option<i64>,
    },
    Migrate,
    /// Run the daily task scheduler until interrupted.
    Schedule,
    /// Migrate, start the scheduler when enabled, and serve HTTP.
    Serve,
}

fn parse_date_arg(raw: &str) -> Result<NaiveDate, String> {
    parse_target_date(raw).map_err(|e| e.to_string())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();
}

async fn connect_postgres(config: &SyncConfig) -> Result<PgRecordStore> {
    let url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL is not set")?;
    PgRecordStore::connect(url).await
}

async fn open_store(config: &SyncConfig, dry_run: bool, migrate: bool) -> Result<Arc<dyn RecordStore>> {
    if dry_run || config.database_url.is_none() {
        warn!("no database configured; records are kept in memory for this process only");
        return Ok(Arc::new(MemoryRecordStore::new()));
    }
    let store = connect_postgres(config).await?;
    if migrate {
        store.migrate().await?;
    }
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync {
        date: None,
        dry_run: false,
    }) {
        Commands::Sync { date, dry_run } => {
            let store = open_store(&config, dry_run, false).await?;
            let crawl = config.crawl_config().await?;
            let pipeline = Pipeline::from_config(crawl, store)?;
            let summary = pipeline.run_with_report(date).await;
            println!(
                "sync complete: run_id={} date={} created={} duplicates={} skipped={}",
                summary.run_id,
                summary.target_date,
                summary.stats.created,
                summary.stats.duplicates,
                summary.stats.invalid_links
                    + summary.stats.fetch_failures
                    + summary.stats.store_failures
                    + summary.stats.crashed
            );
            for record in &summary.records {
                println!("  + {} -> {}", record.title, record.apply_link);
            }
        }
        Commands::Post => {
            let store = open_store(&config, false, false).await?;
            let publisher = TelegramPublisher::new(config.telegram.clone())?;
            let stats = publisher.publish_unposted(store.as_ref()).await?;
            println!(
                "post complete: attempted={} posted={} failed={}",
                stats.attempted, stats.posted, stats.failed
            );
        }
        Commands::Purge { days } => {
            let store = connect_postgres(&config).await?;
            let days = days.unwrap_or(config.purge_days);
            let deleted = store.purge_older_than(days).await?;
            println!("purge complete: deleted={deleted} older_than_days={days}");
        }
        Commands::Migrate => {
            connect_postgres(&config).await?.migrate().await?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            let store = open_store(&config, false, false).await?;
            let tasks = Arc::new(DailyTasks::new(
                config.crawl_config().await?,
                config.purge_days,
                store,
                config.telegram.clone(),
            )?);
            let mut sched = build_scheduler(tasks, &config.sync_crons).await?;
            sched.start().await.context("starting scheduler")?;
            info!(crons = ?config.sync_crons, "scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Serve => {
            let store = open_store(&config, false, true).await?;
            let tasks = Arc::new(DailyTasks::new(
                config.crawl_config().await?,
                config.purge_days,
                store.clone(),
                config.telegram.clone(),
            )?);
            let _scheduler = match maybe_build_scheduler(&config, tasks).await? {
                Some(sched) => {
                    sched.start().await.context("starting scheduler")?;
                    info!(crons = ?config.sync_crons, "scheduler started");
                    Some(sched)
                }
                None => None,
            };
            oppfeed_web::serve(AppState::new(store), config.web_port).await?;
        }
    }

    Ok(())
}
