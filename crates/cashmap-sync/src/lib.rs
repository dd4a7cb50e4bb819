//! Sync run orchestration: crawl every (source × category) unit in a bounded worker pool,
//! then normalize, deduplicate, merge into the store and publish the search snapshot.

use std::collections::BTreeSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use cashmap_adapters::{
    crawl_unit, normalize_observation, AdapterRegistry, CrawlContext, CrawlUnit, DeviceClassifier,
    RewardRuleTable, SiteAdapter, UnitOutcome,
};
use cashmap_core::{CampaignObservation, SourceRegistry};
use cashmap_storage::{
    CampaignRepository, HttpClientConfig, HttpFetcher, JsonFileCampaignRepository,
    PgCampaignRepository,
};
use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use tokio::fs;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod dedup;
pub mod merge;
pub mod report;
pub mod snapshot;

pub use dedup::{completeness, dedup_intra_pass, DedupOutcome};
pub use merge::{plan_merge, MergeAction, MergeEngine, MergeError, MergePlan, MergePolicy, MergeSummary, Scope};
pub use report::{report_daily_markdown, write_run_report, RunReport, RunStatus, SnapshotInfo};
pub use snapshot::{build_snapshot, write_snapshot, SearchSnapshot};

pub const CRATE_NAME: &str = "cashmap-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Directory holding `sources.yaml`; relative store, snapshot and report paths hang
    /// off it.
    pub workspace_root: PathBuf,
    pub database_url: Option<String>,
    pub store_path: PathBuf,
    pub snapshot_path: PathBuf,
    pub miss_threshold: u32,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub max_parallel_units: usize,
    pub unit_timeout_secs: u64,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub touch_interval_hours: i64,
    pub error_sample_limit: usize,
    /// Overall request rate cap; unset means only the concurrency limits apply.
    pub requests_per_second: Option<f64>,
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl SyncConfig {
    /// Defaults for a workspace, without consulting the environment.
    pub fn with_workspace(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            database_url: None,
            store_path: PathBuf::from("data/campaigns.json"),
            snapshot_path: PathBuf::from("public/search-data.json"),
            miss_threshold: 3,
            global_concurrency: 8,
            per_source_concurrency: 2,
            max_parallel_units: 4,
            unit_timeout_secs: 900,
            http_timeout_secs: 30,
            user_agent: "cashmap-bot/0.1".to_string(),
            touch_interval_hours: 24,
            error_sample_limit: 20,
            requests_per_second: None,
        }
    }

    pub fn from_env() -> Self {
        let defaults = Self::with_workspace(
            std::env::var("CASHMAP_WORKSPACE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
        );
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            store_path: std::env::var("CASHMAP_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.store_path.clone()),
            snapshot_path: std::env::var("CASHMAP_SNAPSHOT_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.snapshot_path.clone()),
            miss_threshold: env_or("CASHMAP_MISS_THRESHOLD", defaults.miss_threshold),
            global_concurrency: env_or("CASHMAP_GLOBAL_CONCURRENCY", defaults.global_concurrency),
            per_source_concurrency: env_or(
                "CASHMAP_PER_SOURCE_CONCURRENCY",
                defaults.per_source_concurrency,
            ),
            max_parallel_units: env_or("CASHMAP_MAX_PARALLEL_UNITS", defaults.max_parallel_units),
            unit_timeout_secs: env_or("CASHMAP_UNIT_TIMEOUT_SECS", defaults.unit_timeout_secs),
            http_timeout_secs: env_or("CASHMAP_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            user_agent: std::env::var("CASHMAP_USER_AGENT").unwrap_or(defaults.user_agent.clone()),
            touch_interval_hours: env_or(
                "CASHMAP_TOUCH_INTERVAL_HOURS",
                defaults.touch_interval_hours,
            ),
            error_sample_limit: env_or("CASHMAP_ERROR_SAMPLE_LIMIT", defaults.error_sample_limit),
            requests_per_second: std::env::var("CASHMAP_REQUESTS_PER_SECOND")
                .ok()
                .and_then(|v| v.parse().ok()),
            ..defaults
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_root.join(path)
        }
    }

    pub fn resolved_store_path(&self) -> PathBuf {
        self.resolve(&self.store_path)
    }

    pub fn resolved_snapshot_path(&self) -> PathBuf {
        self.resolve(&self.snapshot_path)
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            default_user_agent: Some(self.user_agent.clone()),
            global_concurrency: self.global_concurrency.max(1),
            per_source_concurrency: self.per_source_concurrency.max(1),
            requests_per_second: self.requests_per_second,
            ..Default::default()
        }
    }

    pub fn merge_policy(&self) -> MergePolicy {
        MergePolicy {
            miss_threshold: self.miss_threshold.max(1),
            touch_interval: ChronoDuration::hours(self.touch_interval_hours),
        }
    }
}

pub async fn load_source_registry(workspace_root: &Path) -> Result<SourceRegistry> {
    let path = workspace_root.join("sources.yaml");
    let text = fs::read_to_string(&path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let registry: SourceRegistry =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;

    let mut seen = BTreeSet::new();
    for source in &registry.sources {
        if !seen.insert(source.name.as_str()) {
            bail!("duplicate source name {:?} in {}", source.name, path.display());
        }
    }
    Ok(registry)
}

/// Postgres when `DATABASE_URL` is set, otherwise the JSON file store.
pub async fn open_repository(config: &SyncConfig) -> Result<Arc<dyn CampaignRepository>> {
    match &config.database_url {
        Some(url) => {
            let repo = PgCampaignRepository::connect(url)
                .await
                .context("connecting to campaign database")?;
            Ok(Arc::new(repo))
        }
        None => {
            let path = config.resolved_store_path();
            let repo = JsonFileCampaignRepository::open(&path)
                .await
                .with_context(|| format!("opening campaign store {}", path.display()))?;
            Ok(Arc::new(repo))
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub reports_dir: PathBuf,
    pub snapshot_path: PathBuf,
    pub report: RunReport,
}

pub struct SyncPipeline {
    config: SyncConfig,
    registry: SourceRegistry,
    adapters: AdapterRegistry,
    repository: Arc<dyn CampaignRepository>,
    fetcher: Arc<HttpFetcher>,
    rules: RewardRuleTable,
    classifier: DeviceClassifier,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        registry: SourceRegistry,
        repository: Arc<dyn CampaignRepository>,
    ) -> Result<Self> {
        let adapters =
            AdapterRegistry::from_sources(&registry).context("building site adapters")?;
        let fetcher = HttpFetcher::new(config.http_client_config())?;
        Ok(Self {
            config,
            registry,
            adapters,
            repository,
            fetcher: Arc::new(fetcher),
            rules: RewardRuleTable::standard(),
            classifier: DeviceClassifier::new(),
        })
    }

    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let registry = load_source_registry(&config.workspace_root).await?;
        let repository = open_repository(&config).await?;
        Self::new(config, registry, repository)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn repository(&self) -> Arc<dyn CampaignRepository> {
        self.repository.clone()
    }

    /// Crawl units in configuration order: enabled sources, then their categories.
    fn units(&self) -> Vec<(CrawlUnit, Arc<dyn SiteAdapter>)> {
        let mut units = Vec::new();
        for source in self.registry.enabled() {
            let Some(adapter) = self.adapters.get(&source.name) else {
                warn!(source = %source.name, "no adapter registered; skipping source");
                continue;
            };
            for category in &source.categories {
                let unit_index = units.len() as u32;
                units.push((
                    CrawlUnit {
                        source: source.name.clone(),
                        category: category.clone(),
                        unit_index,
                    },
                    adapter.clone(),
                ));
            }
        }
        units
    }

    /// One full run. Cancellation stops crawling; whatever was extracted is still merged,
    /// without counting any absences. A merge conflict fails the run after its report is
    /// written.
    pub async fn run_once(&self, cancel: CancellationToken) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id);
        self.run_inner(run_id, cancel).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, cancel: CancellationToken) -> Result<SyncRunSummary> {
        let mut report = RunReport::new(run_id, Utc::now(), self.config.error_sample_limit);

        let outcomes = self.crawl_all(run_id, &cancel).await?;
        for outcome in &outcomes {
            report.record_unit(outcome);
        }
        report.settle_status();
        let complete_scopes = outcomes
            .iter()
            .filter(|o| o.is_complete())
            .map(|o| (o.source.clone(), o.category.clone()))
            .collect::<BTreeSet<Scope>>();
        info!(
            units = outcomes.len(),
            completed = complete_scopes.len(),
            records = report.raw_records,
            "crawl finished"
        );

        let observations = self.normalize(&outcomes, &mut report);
        let deduped = dedup_intra_pass(observations);
        report.unique_records = deduped.unique.len();
        report.collapsed_duplicates = deduped.collapsed;
        info!(
            unique = deduped.unique.len(),
            collapsed = deduped.collapsed,
            ambiguities = report.parse_ambiguities,
            "observations deduplicated"
        );

        let engine = MergeEngine::new(self.repository.clone(), self.config.merge_policy());
        match engine
            .merge(&deduped.unique, &complete_scopes, run_id, Utc::now())
            .await
        {
            Ok(summary) => report.merge = Some(summary),
            Err(err) => {
                warn!(error = %err, "merge aborted");
                report.status = RunStatus::Failed;
                report.errors.push(format!("merge: {err}"));
                report.finished_at = Some(Utc::now());
                let reports_dir = write_run_report(&self.config.workspace_root, &report).await?;
                return Err(anyhow::Error::new(err).context(format!(
                    "run {run_id} failed; report in {}",
                    reports_dir.display()
                )));
            }
        }

        let snapshot_path = self.config.resolved_snapshot_path();
        let snapshot = write_snapshot(
            self.repository.as_ref(),
            &self.registry,
            &snapshot_path,
            Utc::now(),
        )
        .await?;
        report.snapshot = Some(SnapshotInfo {
            path: snapshot_path.display().to_string(),
            version: snapshot.metadata.version.clone(),
            total_campaigns: snapshot.metadata.total_campaigns,
        });

        report.finished_at = Some(Utc::now());
        let reports_dir = write_run_report(&self.config.workspace_root, &report).await?;
        info!(status = report.status.as_str(), reports = %reports_dir.display(), "sync run finished");

        Ok(SyncRunSummary {
            run_id,
            reports_dir,
            snapshot_path,
            report,
        })
    }

    /// Rebuild the snapshot from the store without crawling.
    pub async fn publish_snapshot(&self) -> Result<SearchSnapshot> {
        write_snapshot(
            self.repository.as_ref(),
            &self.registry,
            &self.config.resolved_snapshot_path(),
            Utc::now(),
        )
        .await
    }

    async fn crawl_all(&self, run_id: Uuid, cancel: &CancellationToken) -> Result<Vec<UnitOutcome>> {
        let ctx = Arc::new(CrawlContext {
            run_id,
            fetcher: self.fetcher.clone(),
        });
        let permits = Arc::new(Semaphore::new(self.config.max_parallel_units.max(1)));
        let unit_timeout = Duration::from_secs(self.config.unit_timeout_secs);

        let mut tasks = JoinSet::new();
        for (unit, adapter) in self.units() {
            let ctx = ctx.clone();
            let permits = permits.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .expect("unit semaphore is never closed");
                // The time budget starts once the unit actually runs.
                let deadline = tokio::time::Instant::now() + unit_timeout;
                let crawl = {
                    let unit = unit.clone();
                    async move { crawl_unit(&ctx, adapter, &unit, &cancel, Some(deadline)).await }
                };
                supervise(unit, crawl).await
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => warn!(error = %err, "crawl worker exited without an outcome"),
            }
        }
        outcomes.sort_by_key(|o| o.unit_index);
        Ok(outcomes)
    }

    fn normalize(&self, outcomes: &[UnitOutcome], report: &mut RunReport) -> Vec<CampaignObservation> {
        let mut observations = Vec::new();
        for outcome in outcomes {
            let Some(source) = self.registry.find(&outcome.source) else {
                continue;
            };
            for raw in &outcome.records {
                match normalize_observation(raw, source, &self.rules, &self.classifier) {
                    Ok(normalized) => {
                        if let Some(ambiguity) = normalized.ambiguity {
                            warn!(source = %raw.source_site, error = %ambiguity, "reward parse ambiguity");
                            report.parse_ambiguities += 1;
                            report
                                .ambiguity_samples
                                .push(format!("{}: {ambiguity}", raw.source_site));
                        }
                        observations.push(normalized.observation);
                    }
                    Err(err) => {
                        warn!(source = %raw.source_site, error = %err, "dropping record");
                        report.dropped_records += 1;
                        report
                            .errors
                            .push(format!("{}/{}: {err}", outcome.source, outcome.category));
                    }
                }
            }
        }
        report.normalized_records = observations.len();
        observations
    }
}

pub async fn run_sync_once_from_env(cancel: CancellationToken) -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    let pipeline = SyncPipeline::from_config(config).await?;
    pipeline.run_once(cancel).await
}

/// Run one unit's crawl on a task of its own. A panic fails that unit and nothing else.
async fn supervise<F>(unit: CrawlUnit, crawl: F) -> UnitOutcome
where
    F: Future<Output = UnitOutcome> + Send + 'static,
{
    match tokio::spawn(crawl).await {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(
                source = %unit.source,
                category = %unit.category.key,
                error = %err,
                "crawl unit task failed"
            );
            UnitOutcome::failed(&unit, format!("crawl task failed: {err}"))
        }
    }
}
