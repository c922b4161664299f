//! End-to-end worker flow: seed a database, load a queue, run the
//! orchestrator and check what came out the other side. Uses the in-process
//! queue so redelivery semantics are real, not mocked.

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use rusqlite::params;

use position_keeper::config::Config;
use position_keeper::db::Db;
use position_keeper::lock::LockStore;
use position_keeper::model::TransactionStatus;
use position_keeper::orchestrator::{Orchestrator, StartOutcome, StopOutcome};
use position_keeper::queue::MemoryQueue;
use position_keeper::sandbox::SandboxMode;

fn test_config() -> Config {
    Config {
        queue_url: "http://localhost:9324/queue/pk".to_string(),
        node_id: "i-test".to_string(),
        sqlite_path: ":memory:".to_string(),
        node_control_url: None,
        lock_id: "v2 Position Keeper".to_string(),
        lock_ttl_secs: 60,
        idle_timeout_secs: 900,
        poll_interval_secs: 5,
        receive_wait_secs: 20,
        receive_max_messages: 5,
        visibility_timeout_secs: 30,
        error_backoff_secs: 10,
        system_user_id: 1,
        server_bind: "127.0.0.1:0".to_string(),
    }
}

fn seeded_db() -> Db {
    let db = Db::open_in_memory().unwrap();
    db.init().unwrap();
    db.conn()
        .execute_batch(
            "INSERT INTO entities (entity_id, name, entity_type_id) VALUES
                (10, 'Growth Fund', 1), (20, 'Broker LLC', 2), (30, 'ACME 5% Bond', 3);
             INSERT INTO transaction_types (transaction_type_id, name, properties) VALUES
                (7, 'Buy', '{\"position_keeping_actions\":[{\"name\":\"add_to_portfolio\"}]}');
             INSERT INTO users (user_id, name, email) VALUES (1, 'system', 'system@example.com');",
        )
        .unwrap();
    db
}

fn insert_transaction(db: &Db, id: i64, type_id: i64, status: TransactionStatus) {
    db.conn()
        .execute(
            "INSERT INTO transactions (transaction_id, transaction_type_id, transaction_status_id,
                portfolio_entity_id, contra_entity_id, instrument_entity_id, trade_date, settle_date)
             VALUES (?1, ?2, ?3, 10, 20, 30, '2025-01-01', '2025-01-03')",
            params![id, type_id, status.id()],
        )
        .unwrap();
}

fn status_of(db: &Db, id: i64) -> i64 {
    db.transaction_by_id(id).unwrap().unwrap().transaction_status_id
}

// ---------------------------------------------------------------------------
// Full run: sandbox grid, queue drain, orphan sweep, lock released at the end
// ---------------------------------------------------------------------------
#[tokio::test]
async fn start_runs_end_to_end() {
    let db = seeded_db();
    insert_transaction(&db, 1, 7, TransactionStatus::New);
    // Queued-but-never-delivered transaction: becomes the orphan.
    insert_transaction(&db, 2, 7, TransactionStatus::New);

    let queue = Arc::new(MemoryQueue::new(Duration::from_secs(30)));
    queue.push(r#"{"operation":"create","transaction_id":1}"#);
    queue.push("definitely not json");

    let mut orch = Orchestrator::new(test_config(), db, queue.clone());
    let outcome = orch.start(SandboxMode::FullRefresh).await.unwrap();

    let stats = match outcome {
        StartOutcome::Started(stats) => stats,
        StartOutcome::Conflict { holder, .. } => panic!("unexpected conflict with {}", holder),
    };

    // 2025-01-01..2025-01-03 = 3 days, 2 position types, pairs (10,30) and (20,30).
    assert_eq!(stats.sandbox_rows, 3 * 2 * 2);
    // Both messages were deleted: one handled, one unparseable.
    assert_eq!(stats.messages_processed, 2);
    assert_eq!(stats.messages_retained, 0);
    // Transaction 2 never saw a message and was still NEW after the drain.
    assert_eq!(stats.orphans_swept, 1);

    assert!(queue.is_empty());
    assert_eq!(status_of(orch.db(), 1), TransactionStatus::Processed.id());
    assert_eq!(status_of(orch.db(), 2), TransactionStatus::Unknown.id());
    // Lock released: a second run is allowed.
    assert!(LockStore::new(orch.db()).status("v2 Position Keeper").unwrap().is_none());
}

// ---------------------------------------------------------------------------
// Single-pair grid: a contra-less transaction spans days x 2 types x 1 pair
// ---------------------------------------------------------------------------
#[tokio::test]
async fn single_pair_transaction_yields_six_rows() {
    let db = seeded_db();
    db.conn()
        .execute(
            "INSERT INTO transactions (transaction_id, transaction_type_id, transaction_status_id,
                portfolio_entity_id, contra_entity_id, instrument_entity_id, trade_date, settle_date)
             VALUES (1, 7, 2, 10, NULL, 30, '2025-01-01', '2025-01-03')",
            params![],
        )
        .unwrap();

    let queue = Arc::new(MemoryQueue::new(Duration::from_secs(30)));
    let mut orch = Orchestrator::new(test_config(), db, queue);
    match orch.start(SandboxMode::FullRefresh).await.unwrap() {
        StartOutcome::Started(stats) => assert_eq!(stats.sandbox_rows, 3 * 2 * 1),
        StartOutcome::Conflict { .. } => panic!("unexpected conflict"),
    }
}

// ---------------------------------------------------------------------------
// Cache refresh messages flow through a run like any other event
// ---------------------------------------------------------------------------
#[tokio::test]
async fn refresh_cache_messages_are_drained() {
    let db = seeded_db();
    insert_transaction(&db, 1, 7, TransactionStatus::New);
    db.conn()
        .execute("UPDATE entities SET name = 'Value Fund' WHERE entity_id = 10", params![])
        .unwrap();
    db.conn().execute("DELETE FROM entities WHERE entity_id = 20", params![]).unwrap();

    let queue = Arc::new(MemoryQueue::new(Duration::from_secs(30)));
    queue.push(r#"{"operation":"refresh_cache","table":"entities","primary_key":10}"#);
    queue.push(r#"{"operation":"refresh_cache","table":"entities","primary_key":20}"#);
    queue.push(r#"{"operation":"create","transaction_id":1}"#);

    let mut orch = Orchestrator::new(test_config(), db, queue.clone());
    match orch.start(SandboxMode::FullRefresh).await.unwrap() {
        StartOutcome::Started(stats) => {
            assert_eq!(stats.messages_processed, 3);
            assert_eq!(stats.messages_retained, 0);
        }
        StartOutcome::Conflict { .. } => panic!("unexpected conflict"),
    }
    assert!(queue.is_empty());
    assert_eq!(status_of(orch.db(), 1), TransactionStatus::Processed.id());
}

// ---------------------------------------------------------------------------
// Conflict: an active lock turns start into a 409-shaped outcome
// ---------------------------------------------------------------------------
#[tokio::test]
async fn start_reports_conflict_without_stealing() {
    let db = seeded_db();
    let queue = Arc::new(MemoryQueue::new(Duration::from_secs(30)));
    let mut orch = Orchestrator::new(test_config(), db, queue);

    assert!(LockStore::new(orch.db())
        .acquire("v2 Position Keeper", "other-host:1", ChronoDuration::minutes(5))
        .unwrap());

    match orch.start(SandboxMode::FullRefresh).await.unwrap() {
        StartOutcome::Conflict { holder, expires_at } => {
            assert_eq!(holder, "other-host:1");
            assert!(!expires_at.is_empty());
        }
        StartOutcome::Started(_) => panic!("started despite active lock"),
    }
    assert_eq!(
        LockStore::new(orch.db()).status("v2 Position Keeper").unwrap().unwrap().holder,
        "other-host:1"
    );
}

// ---------------------------------------------------------------------------
// Retained message redelivery: missing reference data heals across runs
// ---------------------------------------------------------------------------
#[tokio::test]
async fn retained_message_is_processed_after_reference_data_arrives() {
    let db = seeded_db();
    // Type 99 is not in transaction_types yet.
    insert_transaction(&db, 1, 99, TransactionStatus::New);

    let queue = Arc::new(MemoryQueue::new(Duration::from_millis(200)));
    queue.push(r#"{"operation":"create","transaction_id":1}"#);

    let mut orch = Orchestrator::new(test_config(), db, queue.clone());
    let first = orch.start(SandboxMode::FullRefresh).await.unwrap();
    match first {
        StartOutcome::Started(stats) => {
            assert_eq!(stats.messages_retained, 1);
            assert_eq!(stats.messages_processed, 0);
        }
        StartOutcome::Conflict { .. } => panic!("unexpected conflict"),
    }
    assert_eq!(queue.len(), 1);
    assert_eq!(status_of(orch.db(), 1), TransactionStatus::New.id());

    // The missing type lands, the visibility window lapses, the next run's
    // cache warm-up sees it and the redelivered message goes through.
    orch.db()
        .conn()
        .execute(
            "INSERT INTO transaction_types (transaction_type_id, name, properties)
             VALUES (99, 'Transfer', '{\"position_keeping_actions\":[{\"name\":\"move\"}]}')",
            params![],
        )
        .unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;

    let second = orch.start(SandboxMode::FullRefresh).await.unwrap();
    match second {
        StartOutcome::Started(stats) => assert_eq!(stats.messages_processed, 1),
        StartOutcome::Conflict { .. } => panic!("unexpected conflict"),
    }
    assert!(queue.is_empty());
    assert_eq!(status_of(orch.db(), 1), TransactionStatus::Processed.id());
}

// ---------------------------------------------------------------------------
// Incremental mode refuses to run and releases the lock on the way out
// ---------------------------------------------------------------------------
#[tokio::test]
async fn incremental_start_fails_and_releases_lock() {
    let db = seeded_db();
    insert_transaction(&db, 1, 7, TransactionStatus::New);
    let queue = Arc::new(MemoryQueue::new(Duration::from_secs(30)));
    let mut orch = Orchestrator::new(test_config(), db, queue);

    let err = orch.start(SandboxMode::Incremental).await.unwrap_err();
    assert!(err.to_string().contains("not implemented"));
    assert!(LockStore::new(orch.db()).status("v2 Position Keeper").unwrap().is_none());
}

// ---------------------------------------------------------------------------
// Stop and status lifecycle
// ---------------------------------------------------------------------------
#[tokio::test]
async fn stop_and_status_track_the_lock() {
    let db = seeded_db();
    let queue = Arc::new(MemoryQueue::new(Duration::from_secs(30)));
    let orch = Orchestrator::new(test_config(), db, queue);

    assert_eq!(orch.stop().unwrap(), StopOutcome::WasNotRunning);

    let report = orch.status().unwrap();
    assert!(!report.running);
    assert!(report.holder.is_none());

    assert!(LockStore::new(orch.db())
        .acquire("v2 Position Keeper", "host-a:42", ChronoDuration::minutes(5))
        .unwrap());
    let report = orch.status().unwrap();
    assert!(report.running);
    assert_eq!(report.holder.as_deref(), Some("host-a:42"));
    assert!(report.expires_at.is_some());

    assert_eq!(orch.stop().unwrap(), StopOutcome::Stopped);
    assert_eq!(orch.stop().unwrap(), StopOutcome::WasNotRunning);
    assert!(!orch.status().unwrap().running);
}

// ---------------------------------------------------------------------------
// An expired lock from a crashed run does not block the next start
// ---------------------------------------------------------------------------
#[tokio::test]
async fn stale_lock_is_reclaimed_on_start() {
    let db = seeded_db();
    insert_transaction(&db, 1, 7, TransactionStatus::New);
    let queue = Arc::new(MemoryQueue::new(Duration::from_secs(30)));
    let mut orch = Orchestrator::new(test_config(), db, queue);

    assert!(LockStore::new(orch.db())
        .acquire("v2 Position Keeper", "crashed-host:9", ChronoDuration::seconds(-1))
        .unwrap());

    match orch.start(SandboxMode::FullRefresh).await.unwrap() {
        StartOutcome::Started(stats) => assert_eq!(stats.sandbox_rows, 12),
        StartOutcome::Conflict { holder, .. } => {
            panic!("expired lock held by {} blocked the run", holder)
        }
    }
}
