//! Ingestion pipeline against a real SQLite index and checkpoint table.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use tempfile::TempDir;

use common::{days_ago, ticket, FakeTracker, LetterProvider};
use ticket_flow::checkpoints::Checkpoints;
use ticket_flow::config::{Config, IngestionConfig};
use ticket_flow::db;
use ticket_flow::ingest::{IngestionError, IngestionPipeline, ScopeLocks};
use ticket_flow::migrate;
use ticket_flow::sqlite_index::SqliteIndex;
use ticket_flow_core::index::{IndexEntry, ScopeFilter, SimilarityIndex};

// ─── Helpers ────────────────────────────────────────────────────────

fn test_config(tmp: &TempDir) -> Config {
    let db_path = tmp.path().join("tflow.sqlite");
    let config_content = format!(
        r#"
[db]
path = "{}"

[ingestion]
projects = ["OPS"]
page_size = 2
batch_size = 2
max_retries = 1
backoff_base_ms = 1
"#,
        db_path.display()
    );
    toml::from_str(&config_content).unwrap()
}

struct Fixture {
    _tmp: TempDir,
    tracker: Arc<FakeTracker>,
    embedder: Arc<LetterProvider>,
    index: Arc<SqliteIndex>,
    checkpoints: Checkpoints,
    locks: Arc<ScopeLocks>,
    pipeline: IngestionPipeline,
}

async fn fixture() -> Fixture {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    let pool = db::connect(&cfg).await.unwrap();
    migrate::migrate_pool(&pool).await.unwrap();

    let tracker = FakeTracker::new(vec![
        ticket("OPS-1", "Checkout page blank", "Open", days_ago(5)),
        ticket("OPS-2", "Login loop", "In Progress", days_ago(4)),
        ticket("OPS-3", "Old outage", "Done", days_ago(200)),
        ticket("OPS-4", "Recently fixed crash", "Done", days_ago(2)),
        ticket("WEB-1", "Footer misaligned", "Open", days_ago(1)),
    ]);
    let embedder = Arc::new(LetterProvider::default());
    let index = Arc::new(SqliteIndex::new(pool.clone()));
    let checkpoints = Checkpoints::new(pool);
    let locks = ScopeLocks::new();
    let pipeline = IngestionPipeline::new(
        tracker.clone(),
        embedder.clone(),
        index.clone(),
        checkpoints.clone(),
        locks.clone(),
        cfg.ingestion.clone(),
    );
    Fixture {
        _tmp: tmp,
        tracker,
        embedder,
        index,
        checkpoints,
        locks,
        pipeline,
    }
}

async fn indexed_ids(index: &SqliteIndex, project: &str) -> Vec<String> {
    let mut ids: Vec<String> = index
        .list(&ScopeFilter::project(project))
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.ticket_id)
        .collect();
    ids.sort();
    ids
}

// ─── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_backfill_indexes_eligible_tickets() {
    let f = fixture().await;

    let stats = f.pipeline.backfill("OPS", false).await.unwrap();
    assert_eq!(stats.fetched, 4);
    assert_eq!(stats.embedded, 3);
    assert_eq!(stats.pages, 2);
    assert_eq!(
        indexed_ids(&f.index, "OPS").await,
        vec!["OPS-1", "OPS-2", "OPS-4"]
    );
    // Other projects are untouched.
    assert!(indexed_ids(&f.index, "WEB").await.is_empty());

    assert!(f.checkpoints.backfill_offset("OPS").await.unwrap().is_none());
    let checkpoint = f.checkpoints.incremental("OPS").await.unwrap().unwrap();
    assert!(checkpoint.last_modified > days_ago(3));
}

#[tokio::test]
async fn test_second_backfill_reembeds_nothing() {
    let f = fixture().await;
    f.pipeline.backfill("OPS", false).await.unwrap();
    let embedded = f.embedder.embedded();

    let stats = f.pipeline.backfill("OPS", false).await.unwrap();
    assert_eq!(stats.embedded, 0);
    assert_eq!(stats.unchanged, 3);
    assert_eq!(f.embedder.embedded(), embedded);
}

#[tokio::test]
async fn test_backfill_resumes_from_saved_page() {
    let f = fixture().await;
    f.checkpoints.set_backfill_offset("OPS", 2).await.unwrap();

    let stats = f.pipeline.backfill("OPS", false).await.unwrap();
    assert_eq!(stats.fetched, 2);
    assert_eq!(indexed_ids(&f.index, "OPS").await, vec!["OPS-2", "OPS-4"]);

    let stats = f.pipeline.backfill("OPS", true).await.unwrap();
    assert_eq!(stats.fetched, 4);
}

#[tokio::test]
async fn test_full_backfill_removes_tickets_missing_from_tracker() {
    let f = fixture().await;
    f.pipeline.backfill("OPS", false).await.unwrap();

    f.tracker.remove("OPS-2");
    let stats = f.pipeline.backfill("OPS", false).await.unwrap();
    assert_eq!(stats.deleted, 1);
    assert_eq!(indexed_ids(&f.index, "OPS").await, vec!["OPS-1", "OPS-4"]);
}

#[tokio::test]
async fn test_incremental_picks_up_modified_ticket() {
    let f = fixture().await;
    f.pipeline.backfill("OPS", false).await.unwrap();
    let before = f.checkpoints.incremental("OPS").await.unwrap().unwrap();

    f.tracker
        .upsert(ticket("OPS-1", "Checkout page blank on Safari", "Open", days_ago(0)));
    let stats = f.pipeline.sync_incremental("OPS").await.unwrap();
    assert_eq!(stats.embedded, 1);

    let entry = f
        .index
        .list(&ScopeFilter::project("OPS"))
        .await
        .unwrap()
        .into_iter()
        .find(|e| e.ticket_id == "OPS-1")
        .unwrap();
    assert_eq!(entry.title, "Checkout page blank on Safari");

    let after = f.checkpoints.incremental("OPS").await.unwrap().unwrap();
    assert!(after.last_modified > before.last_modified);
}

#[tokio::test]
async fn test_incremental_survives_edit_between_pages() {
    let f = fixture().await;
    // Live order: OPS-3, OPS-1 | OPS-2, OPS-4. Editing OPS-1 after the
    // first page moves it to the end; an offset-based second page would
    // start at OPS-4 and never see OPS-2.
    *f.tracker.edit_after_search.lock().unwrap() = Some((
        1,
        ticket("OPS-1", "Checkout page blank on Safari", "Open", days_ago(0)),
    ));

    let stats = f.pipeline.sync_incremental("OPS").await.unwrap();
    assert_eq!(
        indexed_ids(&f.index, "OPS").await,
        vec!["OPS-1", "OPS-2", "OPS-4"]
    );
    // OPS-1 is embedded twice: once as first seen, once after the edit.
    assert_eq!(stats.embedded, 4);

    let entry = f
        .index
        .list(&ScopeFilter::project("OPS"))
        .await
        .unwrap()
        .into_iter()
        .find(|e| e.ticket_id == "OPS-1")
        .unwrap();
    assert_eq!(entry.title, "Checkout page blank on Safari");

    let checkpoint = f.checkpoints.incremental("OPS").await.unwrap().unwrap();
    assert_eq!(
        checkpoint.last_modified.timestamp_millis(),
        entry.last_modified.timestamp_millis()
    );
}

#[tokio::test]
async fn test_incremental_pages_through_identical_timestamps() {
    let f = fixture().await;
    let at = days_ago(1);
    for i in 10..15 {
        f.tracker
            .upsert(ticket(&format!("OPS-{i}"), &format!("Same minute {i}"), "Open", at));
    }

    let stats = f.pipeline.sync_incremental("OPS").await.unwrap();
    let ids = indexed_ids(&f.index, "OPS").await;
    assert_eq!(ids.len(), 8);
    assert!(ids.contains(&"OPS-14".to_string()));
    assert_eq!(stats.failed, 0);

    // Nothing new: the next sweep only re-reads tickets at the checkpoint.
    let stats = f.pipeline.sync_incremental("OPS").await.unwrap();
    assert_eq!(stats.embedded, 0);
}

#[tokio::test]
async fn test_status_change_replaces_entry() {
    let f = fixture().await;
    f.pipeline.backfill("OPS", false).await.unwrap();

    f.tracker
        .upsert(ticket("OPS-2", "Login loop", "Done", days_ago(0)));
    let stats = f.pipeline.sync_incremental("OPS").await.unwrap();
    assert_eq!(stats.embedded, 1);

    let entry = f
        .index
        .list(&ScopeFilter::project("OPS"))
        .await
        .unwrap()
        .into_iter()
        .find(|e| e.ticket_id == "OPS-2")
        .unwrap();
    assert_eq!(entry.status, "Done");
}

#[tokio::test]
async fn test_prune_removes_old_closed_entries() {
    let f = fixture().await;
    f.pipeline.backfill("OPS", false).await.unwrap();
    f.index
        .upsert(IndexEntry {
            ticket_id: "OPS-9".to_string(),
            project: "OPS".to_string(),
            title: "Ancient".to_string(),
            status: "Closed".to_string(),
            last_modified: days_ago(365),
            content_hash: "h".to_string(),
            model: "letters".to_string(),
            vector: LetterProvider::vector("ancient"),
        })
        .await
        .unwrap();

    let removed = f.pipeline.prune("OPS").await.unwrap();
    assert_eq!(removed, 1);
    assert_eq!(
        indexed_ids(&f.index, "OPS").await,
        vec!["OPS-1", "OPS-2", "OPS-4"]
    );
}

#[tokio::test]
async fn test_rejected_record_is_skipped() {
    let f = fixture().await;
    f.tracker
        .upsert(ticket("OPS-5", "Poison payload", "Open", days_ago(3)));

    let stats = f.pipeline.backfill("OPS", false).await.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.embedded, 3);
    let ids = indexed_ids(&f.index, "OPS").await;
    assert!(!ids.contains(&"OPS-5".to_string()));
    assert!(ids.contains(&"OPS-1".to_string()));
}

#[tokio::test]
async fn test_provider_outage_keeps_checkpoint() {
    let f = fixture().await;
    f.pipeline.backfill("OPS", false).await.unwrap();
    let before = f.checkpoints.incremental("OPS").await.unwrap().unwrap();

    f.tracker
        .upsert(ticket("OPS-1", "Checkout page blank again", "Open", days_ago(0)));
    f.embedder.unavailable.store(true, Ordering::SeqCst);
    let err = f.pipeline.sync_incremental("OPS").await.unwrap_err();
    assert!(matches!(err, IngestionError::ProviderUnavailable(_)));
    let unchanged = f.checkpoints.incremental("OPS").await.unwrap().unwrap();
    assert_eq!(unchanged.last_modified, before.last_modified);

    f.embedder.unavailable.store(false, Ordering::SeqCst);
    let stats = f.pipeline.sync_incremental("OPS").await.unwrap();
    assert_eq!(stats.embedded, 1);
    let after = f.checkpoints.incremental("OPS").await.unwrap().unwrap();
    assert!(after.last_modified > before.last_modified);
}

#[tokio::test]
async fn test_second_run_on_same_project_is_refused() {
    let f = fixture().await;
    let _held = f.locks.try_acquire("OPS").unwrap();

    let err = f.pipeline.sync_incremental("OPS").await.unwrap_err();
    assert!(matches!(err, IngestionError::AlreadyRunning(ref p) if p == "OPS"));
    // Other projects still run.
    let stats = f.pipeline.sync_incremental("WEB").await.unwrap();
    assert_eq!(stats.embedded, 1);
}

#[tokio::test]
async fn test_sync_all_reports_each_project() {
    let f = fixture().await;
    let projects = vec!["OPS".to_string(), "WEB".to_string()];
    let results = f.pipeline.sync_all(&projects).await;
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|(_, r)| r.is_ok()));
    assert_eq!(f.index.count().await.unwrap(), 4);
}

#[test]
fn test_ingestion_defaults() {
    let cfg = IngestionConfig::default();
    assert_eq!(cfg.closed_retention_days, 90);
    assert!(cfg.closed_statuses.contains(&"Done".to_string()));
}
