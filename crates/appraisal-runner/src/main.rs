//! appraisal-runner: Pull financial events from the feed and value them.
//!
//! For each subject, fetches recent events, runs tracker Phase 1 + Phase 2
//! over the target publications, then evaluates the quantitative and
//! qualitative metric trees per event and writes results to the
//! `event_valuations` table.
//!
//! Usage:
//!   cargo run -p appraisal-runner -- --subjects AAPL MSFT GOOGL
//!   cargo run -p appraisal-runner -- --all --events 10
//!   cargo run -p appraisal-runner -- --all --dry-run
//!   cargo run -p appraisal-runner -- --fetch-subjects --limit 500

mod catalog;
mod store;

use anyhow::Result;
use appraisal_core::UpdateMode;
use appraisal_orchestrator::{ValuationConfig, ValuationOrchestrator};
use consensus_tracker::{ChangeTracker, RevisionScope};
use feed_client::{FeedClient, FetchOrchestrator};
use metric_engine::{MetricEvaluator, MetricRegistry};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use store::SqliteStore;
use tokio::sync::Semaphore;

const DEFAULT_SUBJECTS: &[&str] = &[
    // Mega-cap tech
    "AAPL", "MSFT", "GOOGL", "AMZN", "NVDA", "META", "TSLA", "AVGO",
    // Software / cloud
    "CRM", "ORCL", "ADBE", "NOW", "INTU", "SNOW",
    // Semiconductors
    "AMD", "QCOM", "TXN", "MU", "AMAT",
    // Financials
    "JPM", "BAC", "GS", "MS", "V", "MA",
    // Healthcare
    "UNH", "JNJ", "LLY", "PFE", "ABBV",
    // Consumer
    "WMT", "COST", "HD", "MCD", "NKE",
    // Energy / industrials
    "XOM", "CVX", "CAT", "BA", "GE",
];

const DEFAULT_CONCURRENCY: usize = 4;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "appraisal_runner=info,feed_client=warn".into()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let dry_run = args.iter().any(|a| a == "--dry-run");
    let use_all = args.iter().any(|a| a == "--all");
    let fetch_subjects = args.iter().any(|a| a == "--fetch-subjects");
    let replace = args.iter().any(|a| a == "--replace");
    let rederive_all = args.iter().any(|a| a == "--rederive-all");

    let limit: usize = args
        .iter()
        .position(|a| a == "--limit")
        .and_then(|i| args.get(i + 1))
        .and_then(|v| v.parse().ok())
        .unwrap_or(500);

    let events_per_subject: u32 = args
        .iter()
        .position(|a| a == "--events")
        .and_then(|i| args.get(i + 1))
        .and_then(|v| v.parse().ok())
        .unwrap_or(20);

    let concurrency: usize = args
        .iter()
        .position(|a| a == "--concurrency")
        .and_then(|i| args.get(i + 1))
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_CONCURRENCY);

    let db_path = args
        .iter()
        .position(|a| a == "--db")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("appraisal.db");

    let metrics_path = args
        .iter()
        .position(|a| a == "--metrics")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let api_key = std::env::var("FEED_API_KEY").expect("FEED_API_KEY must be set");
    let client = FeedClient::new(api_key);

    let subjects: Vec<String> = if fetch_subjects {
        tracing::info!("Fetching active subjects from the feed (limit: {})...", limit);
        let subjects = client.list_subjects(limit).await?;
        tracing::info!("Fetched {} subjects", subjects.len());
        subjects
    } else if use_all {
        DEFAULT_SUBJECTS.iter().map(|s| s.to_string()).collect()
    } else if let Some(idx) = args.iter().position(|a| a == "--subjects") {
        args[idx + 1..]
            .iter()
            .take_while(|a| !a.starts_with("--"))
            .cloned()
            .collect()
    } else {
        eprintln!("Usage:");
        eprintln!("  appraisal-runner --subjects AAPL MSFT ...  Value events for specific subjects");
        eprintln!("  appraisal-runner --all                     Use the built-in subject list");
        eprintln!("  appraisal-runner --fetch-subjects          Pull the subject list from the feed");
        eprintln!("  appraisal-runner --fetch-subjects --limit N  Cap the fetched list (default 500)");
        eprintln!();
        eprintln!("Options:");
        eprintln!("  --events N         Events per subject (default: 20)");
        eprintln!("  --db PATH          SQLite DB path (default: appraisal.db)");
        eprintln!("  --metrics PATH     Metric definition feed file (default: built-in catalog)");
        eprintln!("  --replace          Overwrite stored value trees instead of filling nulls");
        eprintln!("  --rederive-all     Recompute derived consensus fields for every partition");
        eprintln!("  --concurrency N    Max parallel event fetches (default: {})", DEFAULT_CONCURRENCY);
        eprintln!("  --dry-run          Run against an in-memory store, write nothing");
        std::process::exit(1);
    };

    let records = match metrics_path {
        Some(path) => {
            tracing::info!("Loading metric definitions from {}", path);
            catalog::load_catalog(path)?
        }
        None => catalog::default_catalog()?,
    };
    let registry = MetricRegistry::from_records(records)?;
    tracing::info!("Metric catalog: {} definitions", registry.len());
    let evaluator = MetricEvaluator::new(Arc::new(registry))?;

    let store = if dry_run {
        tracing::info!("Dry run: using an in-memory store, {} stays untouched", db_path);
        Arc::new(SqliteStore::in_memory().await?)
    } else {
        Arc::new(SqliteStore::connect(db_path).await?)
    };
    let tracker = ChangeTracker::new(Arc::clone(&store));
    let fetcher = FetchOrchestrator::new(Arc::new(client.clone()), client.governor());
    let orchestrator =
        ValuationOrchestrator::new(fetcher, evaluator, tracker, ValuationConfig::default());

    let total_subjects = subjects.len();
    tracing::info!(
        "appraisal-runner: {} subjects, {} events each, db={}, dry_run={}",
        total_subjects, events_per_subject, db_path, dry_run
    );

    let completed = Arc::new(AtomicU64::new(0));
    let failed = Arc::new(AtomicU64::new(0));
    let semaphore = Arc::new(Semaphore::new(concurrency));

    let mut handles = Vec::with_capacity(total_subjects);

    for subject in subjects {
        let client = client.clone();
        let completed = Arc::clone(&completed);
        let failed = Arc::clone(&failed);
        let semaphore = Arc::clone(&semaphore);

        let handle = tokio::spawn(async move {
            let _permit = semaphore.acquire().await.unwrap();

            let fetched = client.get_events(&subject, events_per_subject).await;
            let done = completed.fetch_add(1, Ordering::Relaxed) + 1;

            match fetched {
                Ok(events) => {
                    tracing::info!(
                        "[{}/{}] {} => {} events",
                        done, total_subjects, subject, events.len()
                    );
                    events
                }
                Err(e) => {
                    failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("[{}/{}] {} failed: {}", done, total_subjects, subject, e);
                    Vec::new()
                }
            }
        });
        handles.push(handle);
    }

    let mut events = Vec::new();
    for handle in handles {
        events.extend(handle.await?);
    }

    if events.is_empty() {
        tracing::warn!("No events fetched, nothing to value");
        return Ok(());
    }

    tracing::info!("Valuing {} events...", events.len());
    let summary = orchestrator.process_batch(&events).await;

    let mode = if replace {
        UpdateMode::Replace
    } else {
        UpdateMode::FillNull
    };
    let mut stored = 0usize;
    if dry_run {
        tracing::info!("Dry run: skipping valuation writes");
    } else {
        for result in &summary.results {
            match store.save_valuation(result, mode).await {
                Ok(()) => stored += 1,
                Err(e) => {
                    tracing::warn!("{}: failed to store valuation: {}", result.event_id, e)
                }
            }
        }
    }

    if rederive_all {
        tracing::info!("Re-deriving consensus history for every partition...");
        let derive = orchestrator.tracker().derive(RevisionScope::All).await?;
        tracing::info!(
            "Re-derive: {} partitions, {} records updated, {} failed",
            derive.partitions_processed, derive.records_updated, derive.partitions_failed
        );
    }

    if let Some(fetch) = &summary.fetch {
        tracing::info!(
            "Feed usage: {} requests, {} upstream calls, {} deduplicated, {} failures",
            fetch.requests, fetch.upstream_calls, fetch.deduplicated, fetch.failures
        );
    }

    tracing::info!(
        "Done! {} events valued ({} failed), {} stored, {} observations recorded ({} skipped), {} partitions derived, {} subject fetches failed",
        summary.results.len(),
        summary.events_failed,
        stored,
        summary.observations_recorded,
        summary.observations_skipped,
        summary.derive.partitions_processed,
        failed.load(Ordering::Relaxed)
    );

    Ok(())
}
