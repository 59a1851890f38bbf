//! Process-level wiring shared by the backfill binaries: tracing setup, store
//! selection, and the mapping from failures to exit codes.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use backfill_jobs::{job_for_name, BackfillJob};
use backfill_runner::{open_firestore_from_env, run_job, RunSummary, RunnerConfig};
use backfill_storage::{DocumentStore, InMemoryStore};
use tracing::error;
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

pub const EXIT_SETUP: u8 = 1;
pub const EXIT_RUN: u8 = 2;

/// Installs the global fmt subscriber; `RUST_LOG` overrides `default_filter`.
pub fn init_tracing(default_filter: &str) -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {}", e))
}

#[derive(Debug)]
pub enum Failure {
    /// Nothing was read or written: bad job name, credentials, or fixture.
    Setup(anyhow::Error),
    /// The run started and then hit an error it could not contain.
    Run(anyhow::Error),
}

impl Failure {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Setup(_) => EXIT_SETUP,
            Self::Run(_) => EXIT_RUN,
        }
    }
}

#[derive(Debug)]
pub struct Outcome {
    pub summary: RunSummary,
    /// Final state of the job's collection for fixture runs.
    pub fixture_result: Option<serde_json::Value>,
}

/// Runs one job against Firestore, or against an in-memory copy of `fixture`
/// when one is given.
pub async fn execute(
    job_name: &str,
    config: RunnerConfig,
    fixture: Option<&Path>,
) -> Result<Outcome, Failure> {
    let job = job_for_name(job_name)
        .map_err(anyhow::Error::from)
        .map_err(Failure::Setup)?;
    let collection = job.collection().to_string();

    let Some(fixture) = fixture else {
        let store = open_firestore_from_env()
            .context("opening firestore")
            .map_err(Failure::Setup)?;
        let summary = run_on_store(config, store, job).await?;
        return Ok(Outcome {
            summary,
            fixture_result: None,
        });
    };

    let memory = Arc::new(
        InMemoryStore::from_json_file(fixture)
            .await
            .map_err(Failure::Setup)?,
    );
    let summary = run_on_store(config, memory.clone(), job).await?;
    Ok(Outcome {
        summary,
        fixture_result: Some(memory.collection_json(&collection).await),
    })
}

/// Once a store is open every escaping error is a run failure.
pub async fn run_on_store(
    config: RunnerConfig,
    store: Arc<dyn DocumentStore>,
    job: Box<dyn BackfillJob>,
) -> Result<RunSummary, Failure> {
    run_job(config, store, job).await.map_err(Failure::Run)
}

pub fn report(outcome: &Outcome) {
    let s = &outcome.summary;
    println!(
        "backfill complete: job={} run_id={} pages={} scanned={} patched={} skipped={} missing_references={} failed={}{}",
        s.job,
        s.run_id,
        s.pages,
        s.scanned,
        s.patched,
        s.skipped,
        s.missing_references,
        s.failed,
        if s.dry_run { " (dry run)" } else { "" }
    );
    if let Some(path) = &s.report_path {
        println!("report: {path}");
    }
    if let Some(result) = &outcome.fixture_result {
        match serde_json::to_string_pretty(result) {
            Ok(text) => println!("{text}"),
            Err(err) => error!(error = %err, "rendering fixture result"),
        }
    }
}

pub fn exit_with(result: Result<Outcome, Failure>) -> ExitCode {
    match result {
        Ok(outcome) => {
            report(&outcome);
            ExitCode::SUCCESS
        }
        Err(failure) => {
            match &failure {
                Failure::Setup(err) => error!("setup failed: {err:#}"),
                Failure::Run(err) => error!("backfill failed: {err:#}"),
            }
            ExitCode::from(failure.exit_code())
        }
    }
}

/// Entry point of the zero-argument binaries: env-only configuration.
pub async fn run_standalone(job_name: &str) -> ExitCode {
    if let Err(err) = init_tracing("info") {
        eprintln!("{err:#}");
    }
    exit_with(execute(job_name, RunnerConfig::from_env(), None).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use backfill_core::{Document, Patch};
    use backfill_storage::{Page, StoreError, CREDENTIALS_ENV};

    fn config() -> RunnerConfig {
        RunnerConfig {
            page_size: 2,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn fixture_run_returns_patched_collection() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fixture.json");
        std::fs::write(
            &path,
            r#"{
                "products": { "p1": { "farmerId": "u1" }, "p2": {} },
                "users": { "u1": { "fullName": "Alice", "address": "Valley" } }
            }"#,
        )
        .expect("write");

        let outcome = execute("products", config(), Some(&path)).await.expect("run");
        assert_eq!(outcome.summary.patched, 1);
        assert_eq!(
            outcome.fixture_result.expect("fixture result"),
            serde_json::json!({
                "p1": { "farmerId": "u1", "ownerName": "Alice", "ownerLocation": "Valley" },
                "p2": {}
            })
        );
    }

    #[tokio::test]
    async fn unknown_job_and_missing_fixture_are_setup_failures() {
        let err = execute("orders", config(), None).await.unwrap_err();
        assert_eq!(err.exit_code(), EXIT_SETUP);

        let dir = tempfile::tempdir().expect("tempdir");
        let err = execute("chats", config(), Some(&dir.path().join("absent.json")))
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), EXIT_SETUP);
    }

    #[tokio::test]
    async fn missing_credentials_is_a_setup_failure() {
        // Only test in this crate that touches the process environment.
        std::env::remove_var(CREDENTIALS_ENV);
        let err = execute("products", config(), None).await.unwrap_err();
        assert_eq!(err.exit_code(), EXIT_SETUP);
        let Failure::Setup(cause) = err else {
            panic!("expected a setup failure");
        };
        assert!(format!("{cause:#}").contains(CREDENTIALS_ENV));
    }

    struct BrokenStore;

    #[async_trait]
    impl DocumentStore for BrokenStore {
        async fn list_page(
            &self,
            _collection: &str,
            _after: Option<&str>,
            _limit: usize,
        ) -> Result<Page, StoreError> {
            Err(StoreError::Message("deadline exceeded".to_string()))
        }

        async fn get(&self, _collection: &str, _id: &str) -> Result<Option<Document>, StoreError> {
            Ok(None)
        }

        async fn merge_write(
            &self,
            _collection: &str,
            _id: &str,
            _patch: &Patch,
        ) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_scan_is_a_run_failure() {
        let job = job_for_name("chats").expect("job");
        let err = run_on_store(config(), Arc::new(BrokenStore), job)
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), EXIT_RUN);
        assert!(matches!(err, Failure::Run(_)));
    }

    #[tokio::test]
    async fn unwritable_report_dir_is_a_run_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fixture = dir.path().join("fixture.json");
        std::fs::write(&fixture, r#"{"chats": {"c1": {"buyerId": "b1"}}}"#).expect("write");
        let not_a_dir = dir.path().join("reports");
        std::fs::write(&not_a_dir, "").expect("write");

        let config = RunnerConfig {
            reports_dir: Some(not_a_dir),
            ..config()
        };
        let err = execute("chats", config, Some(&fixture)).await.unwrap_err();
        assert_eq!(err.exit_code(), EXIT_RUN);
    }
}
