//! Watch-run orchestration: change detection, digest assembly, run reports.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use jobwatch_adapters::{
    amazon_jobs_spec, spec_for_source, AmazonSearchParams, JobSource, SourceAdapter, SourceSpec,
};
use jobwatch_core::{Job, TitleFilter};
use jobwatch_storage::{
    PageClient, PageClientConfig, SeenIdStore, SnapshotStore, Transport, DEFAULT_USER_AGENT,
};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobwatch-engine";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceEntry>,
}

/// One `sources.yaml` entry. Everything beyond `source_id` and `enabled`
/// overlays the built-in spec for that source.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceEntry {
    pub source_id: String,
    pub enabled: bool,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub include_titles: Vec<String>,
    #[serde(default)]
    pub exclude_titles: Vec<String>,
}

impl SourceRegistry {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceEntry> {
        self.sources.iter().filter(|entry| entry.enabled)
    }
}

impl SourceEntry {
    /// Overlays this entry onto a built-in spec: query values replace keys
    /// of the same name, unknown keys are appended, and a non-empty title
    /// keyword list replaces the spec's filter.
    pub fn apply_to(&self, mut spec: SourceSpec) -> SourceSpec {
        if let Some(name) = &self.display_name {
            spec.display_name = name.clone();
        }
        for (key, value) in &self.query {
            match spec.query.iter_mut().find(|(existing, _)| existing == key) {
                Some(slot) => slot.1 = value.clone(),
                None => spec.query.push((key.clone(), value.clone())),
            }
        }
        if !self.include_titles.is_empty() || !self.exclude_titles.is_empty() {
            spec.title_filter = TitleFilter {
                include: self.include_titles.clone(),
                exclude: self.exclude_titles.clone(),
            };
        }
        spec
    }
}

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub state_dir: PathBuf,
    pub registry_path: PathBuf,
    pub workspace_root: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub source_deadline_secs: u64,
    pub archive_snapshots: bool,
    pub amazon: AmazonSearchParams,
}

impl WatchConfig {
    pub fn from_env() -> Self {
        Self {
            state_dir: std::env::var("JOBWATCH_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./state")),
            registry_path: std::env::var("JOBWATCH_SOURCES")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./sources.yaml")),
            workspace_root: PathBuf::from("."),
            user_agent: std::env::var("JOBWATCH_USER_AGENT")
                .unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string()),
            http_timeout_secs: std::env::var("JOBWATCH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            source_deadline_secs: std::env::var("JOBWATCH_SOURCE_DEADLINE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(90),
            archive_snapshots: std::env::var("JOBWATCH_ARCHIVE_SNAPSHOTS")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(true),
            amazon: amazon_params_from_env(),
        }
    }
}

fn amazon_params_from_env() -> AmazonSearchParams {
    let defaults = AmazonSearchParams::default();
    AmazonSearchParams {
        base_query: std::env::var("AMAZON_BASE_QUERY").unwrap_or(defaults.base_query),
        sort: std::env::var("AMAZON_SORT").unwrap_or(defaults.sort),
        offset: std::env::var("AMAZON_OFFSET").unwrap_or(defaults.offset),
        result_limit: std::env::var("AMAZON_RESULT_LIMIT").unwrap_or(defaults.result_limit),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceStatus {
    /// The fetch produced records and at least one id was unseen.
    NewJobs,
    /// The fetch produced records but every id was already known.
    NoNewJobs,
    /// The fetch produced nothing; prior state was left untouched.
    SourceEmpty,
}

impl SourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceStatus::NewJobs => "new-jobs",
            SourceStatus::NoNewJobs => "no-new-jobs",
            SourceStatus::SourceEmpty => "source-empty",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceRunReport {
    pub source_id: String,
    pub display_name: String,
    /// Records the fetch produced, new or not.
    pub found: usize,
    /// Unseen postings in the order the adapter returned them.
    pub new_jobs: Vec<Job>,
    pub status: SourceStatus,
}

impl SourceRunReport {
    fn empty(source: &dyn JobSource) -> Self {
        Self {
            source_id: source.source_id().to_string(),
            display_name: source.display_name().to_string(),
            found: 0,
            new_jobs: Vec::new(),
            status: SourceStatus::SourceEmpty,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WatchRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources_checked: usize,
    pub total_found: usize,
    pub total_new: usize,
    pub reports: Vec<SourceRunReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reports_dir: Option<String>,
}

/// Runs one source against the store: load, fetch, diff, persist, report.
///
/// An empty fetch leaves the on-disk state exactly as it was. A non-empty
/// fetch always writes the union of old and new ids back, which also
/// rewrites a corrupt or missing state file into the canonical format.
pub async fn run_source(source: &dyn JobSource, store: &SeenIdStore) -> Result<SourceRunReport> {
    let source_id = source.source_id().to_string();
    let display_name = source.display_name().to_string();

    let mut known = store.load(&source_id).await;
    let fetched = source.fetch().await;

    if fetched.is_empty() {
        debug!(source_id = %source_id, "fetch produced no records, keeping prior state");
        return Ok(SourceRunReport {
            source_id,
            display_name,
            found: 0,
            new_jobs: Vec::new(),
            status: SourceStatus::SourceEmpty,
        });
    }

    let mut new_jobs = Vec::new();
    for job in &fetched {
        if known.insert(job.id.clone()) {
            new_jobs.push(job.clone());
        }
    }

    store
        .save(&source_id, &known)
        .await
        .with_context(|| format!("persisting known ids for {source_id}"))?;

    let status = if new_jobs.is_empty() {
        SourceStatus::NoNewJobs
    } else {
        SourceStatus::NewJobs
    };
    debug!(
        source_id = %source_id,
        found = fetched.len(),
        new = new_jobs.len(),
        "source run finished"
    );
    Ok(SourceRunReport {
        source_id,
        display_name,
        found: fetched.len(),
        new_jobs,
        status,
    })
}

/// Runs every source concurrently, each under a hard wall-clock ceiling.
///
/// A source that errors or overruns its deadline contributes an empty
/// report for this run; the other sources are unaffected. Report order
/// matches the input order.
pub async fn run_all(
    sources: &[Arc<dyn JobSource>],
    store: &SeenIdStore,
    source_deadline: Duration,
) -> WatchRunSummary {
    let started_at = Utc::now();
    let run_id = Uuid::new_v4();

    let runs = sources.iter().map(|source| {
        let source = Arc::clone(source);
        async move {
            match timeout(source_deadline, run_source(source.as_ref(), store)).await {
                Ok(Ok(report)) => report,
                Ok(Err(err)) => {
                    warn!(source_id = %source.source_id(), error = %err, "source run failed");
                    SourceRunReport::empty(source.as_ref())
                }
                Err(_) => {
                    warn!(
                        source_id = %source.source_id(),
                        deadline_secs = source_deadline.as_secs(),
                        "source run exceeded its deadline"
                    );
                    SourceRunReport::empty(source.as_ref())
                }
            }
        }
    });
    let reports = join_all(runs).await;

    let finished_at = Utc::now();
    let total_found = reports.iter().map(|report| report.found).sum();
    let total_new = reports.iter().map(|report| report.new_jobs.len()).sum();
    WatchRunSummary {
        run_id,
        started_at,
        finished_at,
        sources_checked: reports.len(),
        total_found,
        total_new,
        reports,
        reports_dir: None,
    }
}

/// New postings grouped per source, in run-report order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Digest {
    pub total_new: usize,
    pub groups: Vec<DigestGroup>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DigestGroup {
    pub source_id: String,
    pub display_name: String,
    pub count: usize,
    pub jobs: Vec<Job>,
}

impl Digest {
    pub fn is_empty(&self) -> bool {
        self.total_new == 0
    }

    pub fn source_labels(&self) -> Vec<&str> {
        self.groups
            .iter()
            .map(|group| group.display_name.as_str())
            .collect()
    }
}

/// Groups each report's new postings under its source. Both the report
/// order and each source's arrival order are preserved; sources without
/// new postings get no group.
pub fn build_digest(reports: &[SourceRunReport]) -> Digest {
    let mut groups = Vec::new();
    let mut total_new = 0usize;
    for report in reports {
        if report.new_jobs.is_empty() {
            continue;
        }
        total_new += report.new_jobs.len();
        groups.push(DigestGroup {
            source_id: report.source_id.clone(),
            display_name: report.display_name.clone(),
            count: report.new_jobs.len(),
            jobs: report.new_jobs.clone(),
        });
    }
    Digest { total_new, groups }
}

/// Ties the registry, the adapters, the id store and the reports directory
/// into one runnable unit.
pub struct WatchPipeline {
    config: WatchConfig,
    store: SeenIdStore,
    transport: Arc<dyn Transport>,
}

impl WatchPipeline {
    pub fn new(config: WatchConfig) -> Result<Self> {
        let store = SeenIdStore::new(config.state_dir.clone());
        let client = PageClient::new(PageClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: config.user_agent.clone(),
            ..Default::default()
        })?;
        Ok(Self {
            config,
            store,
            transport: Arc::new(client),
        })
    }

    /// Swaps the transport every adapter fetches through.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    pub async fn load_registry(&self) -> Result<SourceRegistry> {
        SourceRegistry::load(&self.config.registry_path).await
    }

    /// Builds one adapter per enabled registry entry. Entries without a
    /// built-in spec are skipped with a warning.
    pub fn adapters_for(&self, registry: &SourceRegistry) -> Vec<Arc<dyn JobSource>> {
        let mut sources: Vec<Arc<dyn JobSource>> = Vec::new();
        for entry in registry.enabled() {
            let Some(spec) = self.resolve_spec(entry) else {
                warn!(source_id = %entry.source_id, "no built-in spec for source, skipping");
                continue;
            };
            let mut adapter = SourceAdapter::new(spec, Arc::clone(&self.transport));
            if self.config.archive_snapshots {
                adapter = adapter
                    .with_snapshots(SnapshotStore::new(self.config.state_dir.join("snapshots")));
            }
            sources.push(Arc::new(adapter));
        }
        sources
    }

    fn resolve_spec(&self, entry: &SourceEntry) -> Option<SourceSpec> {
        let base = match entry.source_id.as_str() {
            "amazon-jobs" => Some(amazon_jobs_spec(&self.config.amazon)),
            other => spec_for_source(other),
        };
        base.map(|spec| entry.apply_to(spec))
    }

    /// One full watch run: registry, concurrent source runs, report files.
    /// Notification is the caller's step, taken only after this returns.
    pub async fn run_once(&self) -> Result<WatchRunSummary> {
        let registry = self.load_registry().await?;
        let sources = self.adapters_for(&registry);
        info!(sources = sources.len(), "starting watch run");

        let deadline = Duration::from_secs(self.config.source_deadline_secs);
        let mut summary = run_all(&sources, &self.store, deadline).await;

        let reports_dir = self.write_reports(&summary).await?;
        summary.reports_dir = Some(reports_dir.display().to_string());
        info!(
            run_id = %summary.run_id,
            total_found = summary.total_found,
            total_new = summary.total_new,
            "watch run finished"
        );
        Ok(summary)
    }

    async fn write_reports(&self, summary: &WatchRunSummary) -> Result<PathBuf> {
        let reports_dir = self
            .config
            .workspace_root
            .join("reports")
            .join(summary.run_id.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let per_source = summary
            .reports
            .iter()
            .map(|report| {
                format!(
                    "- {} ({}): {} seen, {} new, {}",
                    report.display_name,
                    report.source_id,
                    report.found,
                    report.new_jobs.len(),
                    report.status.as_str()
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        let brief = format!(
            "# Jobwatch Run Brief\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Sources checked: {}\n- Postings seen: {}\n- New postings: {}\n\n## Per Source\n{}\n",
            summary.run_id,
            summary.started_at,
            summary.finished_at,
            summary.sources_checked,
            summary.total_found,
            summary.total_new,
            per_source
        );
        fs::write(reports_dir.join("run_brief.md"), brief)
            .await
            .context("writing run_brief.md")?;

        let delta = serde_json::json!({
            "run_id": summary.run_id,
            "started_at": summary.started_at,
            "finished_at": summary.finished_at,
            "sources": summary.reports,
        });
        let bytes = serde_json::to_vec_pretty(&delta).context("serializing new-jobs delta")?;
        fs::write(reports_dir.join("new_jobs.json"), bytes)
            .await
            .context("writing new_jobs.json")?;

        Ok(reports_dir)
    }
}
