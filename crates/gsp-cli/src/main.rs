use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use gsp_core::SystemRegistry;
use gsp_storage::{apply_retention, build_http_client, plan_retention, Archive, HttpClientConfig};
use gsp_sync::{
    db, load_all_manifests, prune_hot_window, run_collect, run_poller, PipelineConfig,
};

#[derive(Debug, Parser)]
#[command(name = "gsp")]
#[command(about = "GBFS snapshot pipeline: collect, load, and retain feed history")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply the relational schema to the configured database.
    Migrate,
    /// Run one collection pass for a system.
    Collect {
        #[arg(long)]
        system: String,
        /// Restrict to specific feed names; default is every feed with a parser.
        #[arg(long)]
        feed: Vec<String>,
    },
    /// Collect on a TTL-derived schedule.
    Poll {
        #[arg(long)]
        system: String,
        #[arg(long)]
        feed: Vec<String>,
        /// Stop after this many cycles; default is to run until interrupted.
        #[arg(long)]
        cycles: Option<u64>,
    },
    /// Load every archived manifest into the relational history.
    Load {
        /// Restrict loading to one system's manifests.
        #[arg(long)]
        system: Option<String>,
    },
    /// Trim the archive and the relational hot window.
    Prune {
        /// Delete archived files older than this many days.
        #[arg(long)]
        retention_days: Option<i64>,
        /// Keep total archive size under this many bytes, oldest out first.
        #[arg(long)]
        max_archive_bytes: Option<u64>,
        /// Delete relational hot-window rows older than this many days.
        #[arg(long)]
        db_retention_days: Option<i64>,
        /// Restrict the relational prune to one system.
        #[arg(long)]
        system: Option<String>,
        /// Report what would be deleted without deleting anything.
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command {
        Commands::Migrate => {
            let pool = db::connect(&config.database_url).await?;
            db::migrate(&pool).await?;
            println!("schema applied: {}", config.database_url);
        }
        Commands::Collect { system, feed } => {
            let registry = load_registry(&config)?;
            let target = registry.get(&system)?;
            let client = build_http_client(&HttpClientConfig {
                timeout: config.http_timeout(),
                user_agent: Some(config.user_agent.clone()),
            })?;
            let archive = Archive::new(&config.archive_dir);
            let summary = run_collect(&client, &archive, target, &feed).await?;
            println!(
                "collected {}: run_id={} feeds_ok={} feeds_failed={} new={} deduped={}",
                summary.system_id,
                summary.run_id,
                summary.feeds_ok,
                summary.feeds_failed,
                summary.objects_new,
                summary.objects_deduped
            );
        }
        Commands::Poll {
            system,
            feed,
            cycles,
        } => {
            let registry = load_registry(&config)?;
            let target = registry.get(&system)?;
            let client = build_http_client(&HttpClientConfig {
                timeout: config.http_timeout(),
                user_agent: Some(config.user_agent.clone()),
            })?;
            let archive = Archive::new(&config.archive_dir);
            let summary = run_poller(
                &client,
                &archive,
                target,
                &feed,
                config.poller_config(),
                cycles,
            )
            .await?;
            println!(
                "poll finished: cycles={} ok={} failed={}",
                summary.cycles_run, summary.collected_ok, summary.collect_failures
            );
        }
        Commands::Load { system } => {
            let pool = db::connect(&config.database_url).await?;
            db::migrate(&pool).await?;
            let summary =
                load_all_manifests(&pool, &config.archive_dir, system.as_deref()).await?;
            println!(
                "load finished: scanned={} loaded={} deduped={} conflicts={} skipped={} failed={}",
                summary.scanned,
                summary.loaded,
                summary.deduped,
                summary.conflicts,
                summary.skipped,
                summary.failed
            );
        }
        Commands::Prune {
            retention_days,
            max_archive_bytes,
            db_retention_days,
            system,
            dry_run,
        } => {
            if retention_days == Some(0) || db_retention_days == Some(0) {
                bail!("a retention of 0 days would delete data still being written; refusing");
            }
            if retention_days.is_none() && max_archive_bytes.is_none() && db_retention_days.is_none()
            {
                bail!("nothing to prune: pass --retention-days, --max-archive-bytes, or --db-retention-days");
            }
            let now = Utc::now();

            if retention_days.is_some() || max_archive_bytes.is_some() {
                let plan =
                    plan_retention(&config.archive_dir, retention_days, max_archive_bytes, now)?;
                if dry_run {
                    for entry in &plan.delete_set {
                        println!("would delete {} ({} bytes)", entry.path.display(), entry.bytes);
                    }
                    println!(
                        "archive dry run: {} of {} files selected",
                        plan.delete_set.len(),
                        plan.total_files_before
                    );
                } else {
                    let outcome = apply_retention(&plan)?;
                    println!(
                        "archive pruned: files={} bytes={}",
                        outcome.deleted_files, outcome.deleted_bytes
                    );
                }
            }

            if let Some(days) = db_retention_days {
                if dry_run {
                    println!("db dry run: rows older than {days} days would be pruned");
                } else {
                    let cutoff = now
                        .checked_sub_signed(Duration::days(days))
                        .context("retention window does not fit in a timestamp")?;
                    let pool = db::connect(&config.database_url).await?;
                    let registry = load_registry(&config)?;
                    let targets: Vec<String> = match &system {
                        Some(id) => vec![registry.get(id)?.system_id.clone()],
                        None => registry.systems().map(|s| s.system_id.clone()).collect(),
                    };
                    for system_id in targets {
                        let summary = prune_hot_window(&pool, &system_id, cutoff).await?;
                        println!(
                            "{system_id}: snapshots={} station_rows={} aggregates={} manifests={} attempts={}",
                            summary.logical_snapshots,
                            summary.snapshot_station_rows,
                            summary.bucket_aggregates,
                            summary.raw_manifests,
                            summary.fetch_attempts
                        );
                    }
                }
            }
        }
    }

    Ok(())
}

fn load_registry(config: &PipelineConfig) -> Result<SystemRegistry> {
    let registry = SystemRegistry::load(
        &config.registry_path,
        Some(&config.registry_overlay_path),
    )
    .with_context(|| {
        format!(
            "loading system registry from {}",
            config.registry_path.display()
        )
    })?;
    if registry.is_empty() {
        bail!(
            "system registry {} defines no systems",
            config.registry_path.display()
        );
    }
    Ok(registry)
}
