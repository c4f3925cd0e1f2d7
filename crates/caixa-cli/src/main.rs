use std::path::PathBuf;

use anyhow::{Context, Result};
use caixa_core::format_brl;
use caixa_sync::{Pipeline, PipelineConfig};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "caixa")]
#[command(version, about = "Caixa property auction ledger")]
struct Cli {
    /// YAML file overriding environment configuration
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log JSON lines instead of text
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape every region, merge into the ledger, and write reports
    Run {
        /// Use the per-region CSV snapshots already on disk
        #[arg(long)]
        skip_download: bool,
        /// Geocode records without coordinates after the merge
        #[arg(long)]
        geo: bool,
        /// Run date (YYYY-MM-DD); defaults to today
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Geocode the existing ledger only
    Geocode,
    /// Summarize the existing ledger
    Report,
    /// Export the ledger and upload it to the Internet Archive
    Publish {
        #[arg(long)]
        identifier: Option<String>,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Run on the configured cron schedule until interrupted
    Schedule,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut config = PipelineConfig::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command.unwrap_or(Commands::Run {
        skip_download: false,
        geo: false,
        date: None,
    }) {
        Commands::Run {
            skip_download,
            geo,
            date,
        } => {
            config.skip_download |= skip_download;
            config.geocode |= geo;
            if date.is_some() {
                config.run_date = date;
            }
            let pipeline = Pipeline::new(config)?;
            pipeline.install_ctrl_c_stop();
            let run = pipeline.run_once().await?;
            println!(
                "run complete: run_id={} date={} regions={} failed={} inserted={} refreshed={} dormant={} issues={} reports={}",
                run.run_id,
                run.run_date,
                run.regions_fetched,
                run.regions_failed.len(),
                run.merge.inserted,
                run.merge.refreshed,
                run.merge.dormant,
                run.issues,
                run.reports_dir
            );
        }
        Commands::Geocode => {
            let pipeline = Pipeline::new(config)?;
            pipeline.install_ctrl_c_stop();
            let pass = pipeline.geocode_only().await?;
            let s = pass.stats;
            println!(
                "geocode complete: candidates={} cache_hits={} lookups={} resolved={} not_found={} failed={} skipped={}{}",
                s.candidates,
                s.cache_hits,
                s.lookups,
                s.resolved,
                s.not_found,
                s.failed,
                s.skipped,
                if pass.stopped_early { " (interrupted)" } else { "" }
            );
        }
        Commands::Report => {
            let out = Pipeline::new(config)?.report().await?;
            for region in &out.summary.regions {
                println!(
                    "{:<3} {:>6} listings {:>6} active  mean {:>16}  geocoded {}",
                    region.region,
                    region.count,
                    region.active,
                    format_brl(region.mean_price),
                    region.geocoded
                );
            }
            println!("report written to {}", out.dir.display());
        }
        Commands::Publish {
            identifier,
            title,
            description,
            dry_run,
        } => {
            if let Some(v) = identifier {
                config.archive_identifier = v;
            }
            if let Some(v) = title {
                config.archive_title = v;
            }
            if let Some(v) = description {
                config.archive_description = v;
            }
            let report = Pipeline::new(config)?.publish(dry_run).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Schedule => {
            config.scheduler_enabled = true;
            let pipeline = Pipeline::new(config)?;
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %pipeline.config().schedule_cron, "scheduler running; Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
