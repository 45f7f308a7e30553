//! Collection passes and dual-pass reconciliation.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use mapsnap_adapters::{CatalogSource, CatalogSpec, FixtureCatalogSource, HtmlCatalogSource, SourceError};
use mapsnap_archive::{extract_flat, pack_dir};
use mapsnap_core::{
    CatalogItem, ItemOutcome, ItemStatus, ReconciliationDecision, RunLabel, RunResult,
    GLOBAL_OUTCOME, PACK_OUTCOME,
};
use mapsnap_storage::{
    sha256_file, write_atomic, FetcherConfig, HttpFetcher, RetryPolicy, StagingArea, Workspace,
    DEFAULT_ARCHIVE_STEM,
};
use serde::Serialize;
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mapsnap-sync";

const CATALOG_SPEC_FILE: &str = "catalog.yaml";

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub workspace_root: PathBuf,
    pub archive_stem: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_retries: u32,
    pub retry_pause: Duration,
    pub fixture_dir: Option<PathBuf>,
    pub schedule_cron: String,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            archive_stem: DEFAULT_ARCHIVE_STEM.to_string(),
            user_agent: "mapsnap/0.1".to_string(),
            http_timeout_secs: 30,
            http_retries: RetryPolicy::default().retries,
            retry_pause: Duration::from_secs(1),
            fixture_dir: None,
            schedule_cron: "0 0 4 * * *".to_string(),
        }
    }
}

impl HarvestConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            workspace_root: std::env::var("MAPSNAP_WORKSPACE")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            archive_stem: std::env::var("MAPSNAP_ARCHIVE_STEM").unwrap_or(defaults.archive_stem),
            user_agent: std::env::var("MAPSNAP_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: std::env::var("MAPSNAP_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            http_retries: std::env::var("MAPSNAP_HTTP_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_retries),
            retry_pause: std::env::var("MAPSNAP_RETRY_PAUSE_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_pause),
            fixture_dir: std::env::var("MAPSNAP_FIXTURE_DIR").ok().map(PathBuf::from),
            schedule_cron: std::env::var("MAPSNAP_SCHEDULE_CRON").unwrap_or(defaults.schedule_cron),
        }
    }

    pub fn workspace(&self) -> Workspace {
        Workspace::new(self.workspace_root.clone(), self.archive_stem.clone())
    }
}

/// Reads `catalog.yaml` from the workspace root, falling back to built-in endpoints.
pub fn load_catalog_spec(workspace_root: &Path) -> Result<CatalogSpec> {
    let path = workspace_root.join(CATALOG_SPEC_FILE);
    if !path.exists() {
        return Ok(CatalogSpec::default());
    }
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

pub fn build_source(config: &HarvestConfig) -> Result<Arc<dyn CatalogSource>> {
    if let Some(dir) = &config.fixture_dir {
        info!(dir = %dir.display(), "using fixture catalog");
        return Ok(Arc::new(FixtureCatalogSource::new(dir.clone())));
    }
    let spec = load_catalog_spec(&config.workspace_root)?;
    let http = HttpFetcher::new(FetcherConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: config.user_agent.clone(),
        retry: RetryPolicy {
            retries: config.http_retries,
            ..RetryPolicy::default()
        },
        ..FetcherConfig::default()
    })?;
    Ok(Arc::new(HtmlCatalogSource::new(spec, http)))
}

/// Maps a collaborator failure onto the item status recorded in the run report.
pub fn classify_source_error(err: SourceError) -> ItemStatus {
    match err {
        SourceError::LinkMissing(_) => ItemStatus::LinkMissing,
        SourceError::FetchFailed { status, .. } => ItemStatus::FetchFailed { code: status },
        SourceError::CatalogUnavailable(message) | SourceError::Other(message) => {
            ItemStatus::Other { message }
        }
        SourceError::Anyhow(err) => ItemStatus::Other {
            message: format!("{err:#}"),
        },
    }
}

#[derive(Debug, Serialize)]
struct RunReport<'a> {
    generated_at: DateTime<Utc>,
    source_id: &'a str,
    result: &'a RunResult,
}

/// One end-to-end pass: list, fetch and extract each item, then pack and fingerprint.
#[derive(Clone)]
pub struct CollectionRun {
    source: Arc<dyn CatalogSource>,
    workspace: Workspace,
}

impl CollectionRun {
    pub fn new(source: Arc<dyn CatalogSource>, workspace: Workspace) -> Self {
        Self { source, workspace }
    }

    pub async fn run(&self, label: RunLabel, staging: &StagingArea) -> Result<RunResult> {
        let run_id = Uuid::new_v4();
        let span = info_span!("collection_run", %run_id, label = label.as_str());
        self.run_inner(run_id, label, staging).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, label: RunLabel, staging: &StagingArea) -> Result<RunResult> {
        let started_at = Utc::now();
        let mut outcomes = Vec::new();
        let mut total_items = 0usize;

        match self.source.list_catalog().await {
            Ok(items) => {
                total_items = items.len();
                info!(items = total_items, "catalog listed");
                let mut claimed_dirs = HashSet::new();
                for item in &items {
                    let status = if claimed_dirs.insert(staging_key(staging, &item.name)) {
                        self.collect_item(item, staging)
                            .instrument(info_span!("collect_item", item = %item.name))
                            .await
                    } else {
                        ItemStatus::Other {
                            message: format!(
                                "staging directory for {} is already used by an earlier item",
                                item.name
                            ),
                        }
                    };
                    if !status.is_ok() {
                        warn!(item = %item.name, status = %status, "item failed");
                    }
                    outcomes.push(ItemOutcome::new(item.name.clone(), status));
                }
            }
            Err(err) => {
                let message = match err {
                    SourceError::CatalogUnavailable(_) => err.to_string(),
                    other => format!("catalog unavailable: {other}"),
                };
                error!(%message, "could not list catalog");
                outcomes.push(ItemOutcome::new(GLOBAL_OUTCOME, ItemStatus::Other { message }));
            }
        }

        let archive_path = self.workspace.archive_path(label);
        let fingerprint = match self.pack_and_fingerprint(staging, &archive_path).await {
            Ok(digest) => {
                if let Err(err) = self.workspace.write_digest(label, &digest).await {
                    error!(error = %format!("{err:#}"), "could not record pass digest");
                }
                info!(fingerprint = %digest, archive = %archive_path.display(), "archive fingerprinted");
                Some(digest)
            }
            Err(err) => {
                error!(error = %format!("{err:#}"), "packing failed");
                outcomes.push(ItemOutcome::new(
                    PACK_OUTCOME,
                    ItemStatus::Other {
                        message: format!("{} packing failed: {err:#}", archive_path.display()),
                    },
                ));
                None
            }
        };

        let has_error = outcomes.iter().any(|o| !o.status.is_ok());
        let result = RunResult {
            label,
            run_id,
            started_at,
            finished_at: Utc::now(),
            total_items,
            outcomes,
            has_error,
            archive_path,
            fingerprint,
        };
        if let Err(err) = self.write_run_report(&result).await {
            error!(error = %format!("{err:#}"), "could not write run report");
        }
        Ok(result)
    }

    async fn collect_item(&self, item: &CatalogItem, staging: &StagingArea) -> ItemStatus {
        if item.source_url.trim().is_empty() {
            return ItemStatus::LinkMissing;
        }
        let link = match self.source.resolve_download_link(item).await {
            Ok(link) if !link.trim().is_empty() => link,
            Ok(_) => return ItemStatus::LinkMissing,
            Err(err) => return classify_source_error(err),
        };
        let bytes = match self.source.download(&link).await {
            Ok(bytes) => bytes,
            Err(err) => return classify_source_error(err),
        };

        let target = staging.item_dir(&item.name);
        match tokio::task::spawn_blocking(move || extract_flat(&bytes, &target)).await {
            Ok(Ok(summary)) => {
                debug!(
                    written = summary.written,
                    skipped = summary.skipped,
                    overwritten = summary.overwritten,
                    "extracted"
                );
                ItemStatus::Ok
            }
            Ok(Err(err)) => {
                warn!(error = %err, "extraction failed");
                ItemStatus::ExtractFailed
            }
            Err(err) => ItemStatus::Other {
                message: format!("extraction task failed: {err}"),
            },
        }
    }

    async fn pack_and_fingerprint(&self, staging: &StagingArea, archive_path: &Path) -> Result<String> {
        let source_dir = staging.path().to_path_buf();
        let archive = archive_path.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<String> {
            let summary = pack_dir(&source_dir, &archive)?;
            debug!(entries = summary.entries, bytes_in = summary.bytes_in, "packed staging tree");
            sha256_file(&archive)
        })
        .await
        .context("joining pack task")?
    }

    async fn write_run_report(&self, result: &RunResult) -> Result<()> {
        let reports_dir = self.workspace.reports_dir();
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;
        let report = RunReport {
            generated_at: Utc::now(),
            source_id: self.source.source_id(),
            result,
        };
        let bytes = serde_json::to_vec_pretty(&report).context("serializing run report")?;
        write_atomic(&self.workspace.report_path(result.label), &bytes).await
    }
}

/// Case-folded: names differing only in case share a directory on case-insensitive
/// filesystems.
fn staging_key(staging: &StagingArea, item_name: &str) -> String {
    staging
        .item_dir(item_name)
        .to_string_lossy()
        .to_lowercase()
}

/// Drives up to two collection passes and decides whether the result can be trusted.
pub struct Reconciler {
    workspace: Workspace,
    collection: CollectionRun,
    retry_pause: Duration,
}

impl Reconciler {
    pub fn new(source: Arc<dyn CatalogSource>, workspace: Workspace, retry_pause: Duration) -> Self {
        Self {
            collection: CollectionRun::new(source, workspace.clone()),
            workspace,
            retry_pause,
        }
    }

    pub fn from_config(config: &HarvestConfig) -> Result<Self> {
        let source = build_source(config)?;
        Ok(Self::new(source, config.workspace(), config.retry_pause))
    }

    pub async fn reconcile(&self) -> Result<ReconciliationDecision> {
        self.workspace.ensure_root().await?;
        self.workspace.clear_previous().await?;

        let staging = self.workspace.reset_staging().await?;
        let first = self.collection.run(RunLabel::First, &staging).await?;
        staging.release().await?;

        if !first.has_error {
            info!("first pass clean; accepting without a second pass");
            let decision = self.accept(RunLabel::First, first, None).await?;
            self.write_decision_report(&decision).await?;
            return Ok(decision);
        }

        info!(
            failed = first.failed_outcomes().count(),
            pause_ms = self.retry_pause.as_millis() as u64,
            "first pass had errors; retrying"
        );
        tokio::time::sleep(self.retry_pause).await;

        let staging = self.workspace.reset_staging().await?;
        let second = self.collection.run(RunLabel::Second, &staging).await?;
        staging.release().await?;

        let decision = match (&first.fingerprint, &second.fingerprint) {
            (Some(a), Some(b)) if a == b => {
                warn!(
                    fingerprint = %a,
                    "both passes reported errors but produced identical archives; accepting first pass"
                );
                self.accept(RunLabel::First, first, Some(second)).await?
            }
            (a, b) => {
                error!(first = ?a, second = ?b, "pass fingerprints disagree; rejecting");
                ReconciliationDecision::rejected(first, Some(second))
            }
        };
        self.write_decision_report(&decision).await?;
        Ok(decision)
    }

    async fn accept(
        &self,
        label: RunLabel,
        first: RunResult,
        second: Option<RunResult>,
    ) -> Result<ReconciliationDecision> {
        let chosen = match (label, &second) {
            (RunLabel::Second, Some(second)) => second.clone(),
            _ => first.clone(),
        };
        let digest = chosen
            .fingerprint
            .as_deref()
            .with_context(|| format!("{label} pass has no fingerprint to promote"))?;
        self.workspace
            .promote(label, digest)
            .await
            .with_context(|| format!("promoting {label} pass archive"))?;
        Ok(ReconciliationDecision::accepted(&chosen, first, second))
    }

    async fn write_decision_report(&self, decision: &ReconciliationDecision) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(decision).context("serializing decision")?;
        write_atomic(&self.workspace.decision_report_path(), &bytes).await
    }
}

pub fn render_run_report(result: &RunResult) -> String {
    let mut lines = vec![
        format!("===== {} pass =====", result.label),
        format!("total {} items", result.total_items),
    ];
    for outcome in &result.outcomes {
        lines.push(format!("{}: {}", outcome.name, outcome.status));
    }
    match &result.fingerprint {
        Some(digest) => lines.push(format!("fingerprint: {digest}")),
        None => lines.push("fingerprint: <none>".to_string()),
    }
    lines.join("\n")
}

pub fn render_decision(decision: &ReconciliationDecision) -> String {
    let mut sections = vec![render_run_report(&decision.first)];
    if let Some(second) = &decision.second {
        sections.push(render_run_report(second));

        let fp = |r: &RunResult| r.fingerprint.clone().unwrap_or_else(|| "<none>".to_string());
        let verdict = if decision.accepted {
            "fingerprints match"
        } else {
            "fingerprints differ"
        };
        sections.push(format!(
            "===== comparison =====\nfirst:  {} ({})\nsecond: {} ({})\n{verdict}",
            fp(&decision.first),
            decision.first.archive_path.display(),
            fp(second),
            second.archive_path.display(),
        ));
    }
    let outcome = match (&decision.final_archive_path, decision.accepted) {
        (Some(path), true) => format!("decision: ACCEPTED ({})", path.display()),
        _ => "decision: REJECTED".to_string(),
    };
    sections.push(outcome);
    sections.join("\n\n")
}

/// Registers a cron job that reconciles on every tick; overlapping ticks are skipped.
pub async fn build_scheduler(config: HarvestConfig) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let config = Arc::new(config);
    let running = Arc::new(Mutex::new(()));
    let cron = config.schedule_cron.clone();

    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let config = Arc::clone(&config);
        let running = Arc::clone(&running);
        Box::pin(async move {
            let Ok(_guard) = running.try_lock() else {
                warn!("previous reconcile still running; skipping tick");
                return;
            };
            match Reconciler::from_config(&config) {
                Ok(reconciler) => match reconciler.reconcile().await {
                    Ok(decision) => info!(
                        accepted = decision.accepted,
                        fingerprint = ?decision.final_fingerprint,
                        "scheduled reconcile finished"
                    ),
                    Err(err) => error!(error = %format!("{err:#}"), "scheduled reconcile failed"),
                },
                Err(err) => error!(error = %format!("{err:#}"), "could not build reconciler"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}
