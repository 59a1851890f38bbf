//! Paginated, idempotent field backfill over one collection.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use backfill_core::{Document, Patch};
use backfill_jobs::{BackfillJob, Plan, SkipReason};
use backfill_storage::{
    DocumentStore, FirestoreConfig, FirestoreStore, Page, ServiceAccount, StoreError,
};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::fs;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "backfill-runner";
pub const DEFAULT_PAGE_SIZE: usize = 200;

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub page_size: usize,
    pub dry_run: bool,
    pub reports_dir: Option<PathBuf>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            dry_run: false,
            reports_dir: None,
        }
    }
}

impl RunnerConfig {
    pub fn from_env() -> Self {
        Self {
            page_size: std::env::var("BACKFILL_PAGE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(DEFAULT_PAGE_SIZE),
            dry_run: std::env::var("BACKFILL_DRY_RUN")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            reports_dir: std::env::var("BACKFILL_REPORTS_DIR")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub job: String,
    pub collection: String,
    pub page_size: usize,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pages: usize,
    pub scanned: usize,
    pub patched: usize,
    pub skipped: usize,
    pub missing_references: usize,
    pub failed: usize,
    pub report_path: Option<String>,
}

impl RunSummary {
    fn start(job: &dyn BackfillJob, config: &RunnerConfig) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            job: job.name().to_string(),
            collection: job.collection().to_string(),
            page_size: config.page_size,
            dry_run: config.dry_run,
            started_at: now,
            finished_at: now,
            pages: 0,
            scanned: 0,
            patched: 0,
            skipped: 0,
            missing_references: 0,
            failed: 0,
            report_path: None,
        }
    }
}

/// What happened to one record while its page was being prepared.
#[derive(Debug)]
enum Outcome {
    Skipped(SkipReason),
    MissingReference,
    Failed,
    Ready(Patch),
}

pub struct BackfillRunner {
    config: RunnerConfig,
    store: Arc<dyn DocumentStore>,
    job: Box<dyn BackfillJob>,
}

impl BackfillRunner {
    pub fn new(
        config: RunnerConfig,
        store: Arc<dyn DocumentStore>,
        job: Box<dyn BackfillJob>,
    ) -> Self {
        let config = RunnerConfig {
            page_size: config.page_size.max(1),
            ..config
        };
        Self { config, store, job }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Walks the whole collection once; per-record failures are counted, not
    /// returned. Only a failed page scan or report write aborts the run.
    pub async fn run(&self) -> Result<RunSummary> {
        let mut summary = RunSummary::start(self.job.as_ref(), &self.config);
        let collection = self.job.collection();
        let page_size = self.config.page_size;
        info!(
            run_id = %summary.run_id,
            job = %summary.job,
            collection,
            page_size,
            dry_run = self.config.dry_run,
            "starting backfill"
        );

        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .store
                .list_page(collection, cursor.as_deref(), page_size)
                .await
                .with_context(|| {
                    format!(
                        "scanning {collection} after {}",
                        cursor.as_deref().unwrap_or("<start>")
                    )
                })?;
            if page.is_empty() {
                break;
            }

            summary.pages += 1;
            summary.scanned += page.len();
            self.process_page(summary.pages, &page, &mut summary).await;

            if page.len() < page_size {
                break;
            }
            cursor = page.last_id;
            if cursor.is_none() {
                break;
            }
        }

        summary.finished_at = Utc::now();
        if let Some(dir) = &self.config.reports_dir {
            let path = write_report(dir, &summary).await?;
            summary.report_path = Some(path.display().to_string());
        }
        info!(
            patched = summary.patched,
            scanned = summary.scanned,
            pages = summary.pages,
            failed = summary.failed,
            missing_references = summary.missing_references,
            "backfill complete"
        );
        Ok(summary)
    }

    #[instrument(skip_all, fields(collection = self.job.collection(), page = page_no))]
    async fn process_page(&self, page_no: usize, page: &Page, summary: &mut RunSummary) {
        for rejected in &page.rejected {
            error!(doc_id = %rejected.id, reason = %rejected.reason, "skipping undecodable document");
            summary.failed += 1;
        }

        let outcomes = join_all(page.documents.iter().map(|doc| self.prepare(doc))).await;

        let mut writes: Vec<(&Document, Patch)> = Vec::new();
        for (doc, outcome) in page.documents.iter().zip(outcomes) {
            match outcome {
                Outcome::Ready(patch) => {
                    info!(doc_id = %doc.id, %patch, "will update");
                    writes.push((doc, patch));
                }
                Outcome::Skipped(reason) => {
                    debug!(doc_id = %doc.id, reason = reason.as_str(), "skipping");
                    summary.skipped += 1;
                }
                Outcome::MissingReference => summary.missing_references += 1,
                Outcome::Failed => summary.failed += 1,
            }
        }

        if writes.is_empty() {
            info!("no updates needed in this page");
            return;
        }
        if self.config.dry_run {
            info!(count = writes.len(), "dry run; skipping writes for this page");
            summary.patched += writes.len();
            return;
        }

        let collection = self.job.collection();
        let results = join_all(writes.iter().map(|(doc, patch)| async move {
            self.store.merge_write(collection, &doc.id, patch).await
        }))
        .await;

        let mut committed = 0usize;
        for ((doc, _), result) in writes.iter().zip(results) {
            match result {
                Ok(()) => committed += 1,
                Err(err) => {
                    error!(doc_id = %doc.id, error = %err, "failed to write patch");
                    summary.failed += 1;
                }
            }
        }
        summary.patched += committed;
        info!(committed, "committed updates in this page");
    }

    async fn prepare(&self, doc: &Document) -> Outcome {
        let lookup = match self.job.plan(doc) {
            Plan::Skip(reason) => return Outcome::Skipped(reason),
            Plan::Write(patch) => return Outcome::Ready(patch),
            Plan::Lookup(lookup) => lookup,
        };

        match self.store.get(&lookup.collection, &lookup.id).await {
            Ok(Some(reference)) => {
                let patch = self.job.derive(doc, &lookup, &reference);
                if patch.is_empty() {
                    Outcome::Skipped(SkipReason::NoDerivableValue)
                } else {
                    Outcome::Ready(patch)
                }
            }
            Ok(None) => {
                warn!(
                    doc_id = %doc.id,
                    reference = %format!("{}/{}", lookup.collection, lookup.id),
                    "reference document not found"
                );
                Outcome::MissingReference
            }
            Err(err) => {
                error!(
                    doc_id = %doc.id,
                    reference = %format!("{}/{}", lookup.collection, lookup.id),
                    error = %err,
                    "failed to read reference document"
                );
                Outcome::Failed
            }
        }
    }
}

async fn write_report(dir: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let run_dir = dir.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;
    let path = run_dir.join("summary.json");
    let bytes = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

/// Credentials plus Firestore client from the environment. Failures here are
/// setup errors: nothing has been read or written yet.
pub fn open_firestore_from_env() -> Result<Arc<dyn DocumentStore>, StoreError> {
    let account = ServiceAccount::from_env()?;
    let config = FirestoreConfig::from_env(&account);
    info!(
        project = %config.project_id,
        database = %config.database,
        emulator = config.emulator_host.as_deref().unwrap_or("-"),
        "opening firestore client"
    );
    Ok(Arc::new(FirestoreStore::new(config, account)?))
}

/// Runs `job` to completion and closes the store afterwards, whatever the
/// outcome of the run.
pub async fn run_job(
    config: RunnerConfig,
    store: Arc<dyn DocumentStore>,
    job: Box<dyn BackfillJob>,
) -> Result<RunSummary> {
    let runner = BackfillRunner::new(config, store.clone(), job);
    let result = runner.run().await;
    if let Err(err) = store.close().await {
        warn!(error = %err, "closing document store");
    }
    result
}
