mod cache;
mod config;
mod db;
mod dedupe;
mod error;
mod fetcher;
mod parser;
mod pipeline;
mod scheduler;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};

use crate::cache::RecentCache;
use crate::config::Settings;
use crate::db::{RecordKind, Store};
use crate::pipeline::Pipeline;

#[derive(Parser)]
#[command(name = "release_scraper", about = "Game release and news ingestion")]
struct Cli {
    /// TOML config file (optional; RELEASES__* env vars override it)
    #[arg(short, long, global = true, default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one ingestion cycle over every configured source
    Run {
        /// Bypass local snapshots and refetch
        #[arg(short, long)]
        force: bool,
    },
    /// Run a forced cycle every day at the configured hour (UTC)
    Schedule,
    /// Most recent stored rows
    List {
        #[arg(short, long, value_enum, default_value = "releases")]
        kind: KindArg,
        /// Max rows to display
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
    },
    /// All stored rows as JSON
    Export {
        #[arg(short, long, value_enum, default_value = "releases")]
        kind: KindArg,
    },
    /// Row counts per table
    Stats,
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Releases,
    News,
}

impl From<KindArg> for RecordKind {
    fn from(k: KindArg) -> Self {
        match k {
            KindArg::Releases => RecordKind::Releases,
            KindArg::News => RecordKind::News,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let settings = Settings::load(&cli.config)
        .with_context(|| format!("loading config {}", cli.config.display()))?;
    let store = Arc::new(
        Store::open(&settings.db_path, settings.identity)
            .with_context(|| format!("opening store {}", settings.db_path.display()))?,
    );
    let cache = Arc::new(RecentCache::new(settings.cache_ttl()));

    let result = match cli.command {
        Commands::Run { force } => {
            let pipeline = Pipeline::new(&settings, store, cache).context("building pipeline")?;
            if pipeline.sources().is_empty() {
                println!("No sources configured in {}.", cli.config.display());
                return Ok(());
            }

            let pb = ProgressBar::new(pipeline.sources().len() as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("[{elapsed_precise}] {bar:40} {pos}/{len} sources")?
                    .progress_chars("=> "),
            );
            let summary = pipeline.run_cycle(force, &pb).await;
            pb.finish_and_clear();

            println!(
                "{:<20} | {:<8} | {:>4} | {:<11} | {:>9} | {:>8} | {}",
                "Source", "Status", "HTTP", "Strategy", "Extracted", "Inserted", "Error"
            );
            println!("{}", "-".repeat(90));
            for r in &summary.reports {
                println!(
                    "{:<20} | {:<8} | {:>4} | {:<11} | {:>9} | {:>8} | {}",
                    truncate(&r.source, 20),
                    r.status.to_string(),
                    r.http_status.map(|s| s.to_string()).unwrap_or_else(|| "-".into()),
                    r.strategy.map(|s| s.to_string()).unwrap_or_else(|| "-".into()),
                    r.extracted,
                    r.inserted,
                    r.error.as_deref().map(|e| truncate(e, 60)).unwrap_or_default(),
                );
            }
            println!(
                "\n{} extracted, {} inserted, {} of {} sources failed, {} partial ({})",
                summary.total_extracted(),
                summary.total_inserted(),
                summary.failed(),
                summary.reports.len(),
                summary.partial(),
                summary.run_date,
            );

            if summary.all_failed() {
                Err(anyhow::anyhow!("every source failed; stored data is stale"))
            } else {
                Ok(())
            }
        }
        Commands::Schedule => {
            let pipeline = Arc::new(Pipeline::new(&settings, store, cache).context("building pipeline")?);
            println!(
                "Scheduling {} sources daily at {:02}:00 UTC.",
                pipeline.sources().len(),
                settings.schedule_hour
            );
            scheduler::run_daemon(pipeline, settings.schedule_hour).await
        }
        Commands::List { kind, limit } => {
            let kind = RecordKind::from(kind);
            let rows = cache.list_recent(&store, kind, limit)?;
            if rows.is_empty() {
                println!("No {} stored. Run 'run' first.", kind.table());
                return Ok(());
            }

            println!(
                "{:>3} | {:<28} | {:<14} | {:<12} | {:<18} | {:<10}",
                "#", "Name", "Release", "Category", "Source", "Fetched"
            );
            println!("{}", "-".repeat(100));
            for (i, row) in rows.iter().enumerate() {
                let r = &row.record;
                println!(
                    "{:>3} | {:<28} | {:<14} | {:<12} | {:<18} | {:<10}",
                    i + 1,
                    truncate(&r.name, 28),
                    truncate(&r.release, 14),
                    truncate(&r.category, 12),
                    truncate(&r.attribution, 18),
                    r.fetched_on,
                );
            }
            println!("\n{} {}", rows.len(), kind.table());
            Ok(())
        }
        Commands::Export { kind } => {
            let rows = store.export_all(kind.into())?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
            Ok(())
        }
        Commands::Stats => {
            for s in store.stats()? {
                println!(
                    "{:<9} {:>6} rows  (latest fetch: {})",
                    format!("{}:", s.kind.table()),
                    s.rows,
                    s.latest.as_deref().unwrap_or("-"),
                );
            }
            println!("Identity: {:?}", store.identity());
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        eprintln!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
