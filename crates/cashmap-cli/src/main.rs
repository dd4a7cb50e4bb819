use anyhow::{Context, Result};
use cashmap_storage::PgCampaignRepository;
use cashmap_sync::{load_source_registry, report_daily_markdown, SyncConfig, SyncPipeline};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cashmap")]
#[command(about = "Cashback campaign aggregator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl every enabled source, merge into the store and publish the snapshot.
    Sync,
    /// Rebuild the search snapshot from the store without crawling.
    Snapshot,
    /// List configured sources and their crawl units.
    Sources,
    /// Summarize the latest run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    /// Create the campaigns table in `DATABASE_URL`.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; stopping crawl");
                    on_signal.cancel();
                }
            });

            let pipeline = SyncPipeline::from_config(config).await?;
            let summary = pipeline.run_once(cancel).await?;
            let report = &summary.report;
            println!(
                "sync {}: run_id={} units={}/{} unique={} snapshot={} reports={}",
                report.status.as_str(),
                summary.run_id,
                report.units_completed(),
                report.units.len(),
                report.unique_records,
                summary.snapshot_path.display(),
                summary.reports_dir.display()
            );
        }
        Commands::Snapshot => {
            let pipeline = SyncPipeline::from_config(config).await?;
            let snapshot = pipeline.publish_snapshot().await?;
            println!(
                "snapshot written: campaigns={} version={} path={}",
                snapshot.metadata.total_campaigns,
                snapshot.metadata.version,
                pipeline.config().resolved_snapshot_path().display()
            );
        }
        Commands::Sources => {
            let registry = load_source_registry(&config.workspace_root).await?;
            for source in &registry.sources {
                let devices = source
                    .profiles()
                    .iter()
                    .map(|p| p.device.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                println!(
                    "{} ({}) enabled={} devices={} categories={}",
                    source.name,
                    source.display_name,
                    source.enabled,
                    devices,
                    source
                        .categories
                        .iter()
                        .map(|c| c.key.as_str())
                        .collect::<Vec<_>>()
                        .join(",")
                );
            }
        }
        Commands::Report { runs } => {
            println!("{}", report_daily_markdown(runs, Some(config.workspace_root))?);
        }
        Commands::Migrate => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL must be set to migrate")?;
            let repo = PgCampaignRepository::connect(url).await?;
            repo.ensure_schema().await?;
            println!("campaign schema is up to date");
        }
    }

    Ok(())
}
