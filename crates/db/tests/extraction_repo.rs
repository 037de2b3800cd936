//! Integration tests for extraction creation, reuse lookup and finalize.

use std::collections::BTreeMap;

use quantimage_core::extraction::{ExtractionScope, FeatureConfig, TaskError, TaskErrorKind};
use quantimage_core::status::TaskStatus;
use quantimage_db::models::task::TaskTransition;
use quantimage_db::repositories::{ExtractionRepo, TaskRepo};
use serde_json::json;
use sqlx::PgPool;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn album(id: &str) -> ExtractionScope {
    ExtractionScope::Album {
        album_id: id.to_string(),
    }
}

fn config(bin_width: i64) -> FeatureConfig {
    let mut families = BTreeMap::new();
    families.insert("pyradiomics".to_string(), json!({ "binWidth": bin_width }));
    FeatureConfig { families }
}

fn studies(uids: &[&str]) -> Vec<String> {
    uids.iter().map(|s| s.to_string()).collect()
}

fn internal_error() -> TaskError {
    TaskError::new(TaskErrorKind::Internal, "ExecutorLost", "worker vanished")
}

// ---------------------------------------------------------------------------
// Creation
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "./migrations")]
async fn test_create_writes_one_created_task_per_study(pool: PgPool) {
    let (extraction, tasks) = ExtractionRepo::create_with_tasks(
        &pool,
        "alice",
        &album("lung"),
        &config(25),
        &studies(&["1.1", "1.2"]),
    )
    .await
    .unwrap();

    assert_eq!(extraction.owner, "alice");
    assert_eq!(extraction.scope_kind, "album");
    assert!(extraction.finalized_at.is_none());
    assert_eq!(tasks.len(), 2);
    for task in &tasks {
        assert_eq!(task.extraction_id, extraction.id);
        assert_eq!(task.status_id, TaskStatus::Created.id());
        assert!(task.external_job_token.is_none());
    }
}

#[sqlx::test(migrations = "./migrations")]
async fn test_duplicate_study_rolls_back_the_extraction(pool: PgPool) {
    let result = ExtractionRepo::create_with_tasks(
        &pool,
        "alice",
        &album("lung"),
        &config(25),
        &studies(&["1.1", "1.1"]),
    )
    .await;
    assert!(result.is_err(), "unique (extraction_id, study_uid) should reject");

    let listed = ExtractionRepo::list_by_owner(&pool, "alice").await.unwrap();
    assert!(listed.is_empty(), "failed creation should leave no extraction behind");
}

// ---------------------------------------------------------------------------
// Reuse lookup
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "./migrations")]
async fn test_find_active_matches_identical_config_only(pool: PgPool) {
    let (extraction, _) = ExtractionRepo::create_with_tasks(
        &pool,
        "alice",
        &album("lung"),
        &config(25),
        &studies(&["1.1"]),
    )
    .await
    .unwrap();

    let same = ExtractionRepo::find_active(&pool, "alice", &album("lung"), &config(25))
        .await
        .unwrap();
    assert_eq!(same.map(|e| e.id), Some(extraction.id));

    let other_config = ExtractionRepo::find_active(&pool, "alice", &album("lung"), &config(50))
        .await
        .unwrap();
    assert!(other_config.is_none(), "different config should not be reused");

    let other_owner = ExtractionRepo::find_active(&pool, "bob", &album("lung"), &config(25))
        .await
        .unwrap();
    assert!(other_owner.is_none(), "other owners never share extractions");
}

#[sqlx::test(migrations = "./migrations")]
async fn test_find_active_skips_terminal_extractions(pool: PgPool) {
    let (_, tasks) = ExtractionRepo::create_with_tasks(
        &pool,
        "alice",
        &album("lung"),
        &config(25),
        &studies(&["1.1"]),
    )
    .await
    .unwrap();

    TaskRepo::transition(
        &pool,
        tasks[0].id,
        &[TaskStatus::Created],
        &TaskTransition::failed(internal_error()),
    )
    .await
    .unwrap()
    .expect("created task should accept a failure");

    let found = ExtractionRepo::find_active(&pool, "alice", &album("lung"), &config(25))
        .await
        .unwrap();
    assert!(found.is_none(), "an extraction with only terminal tasks is not active");
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "./migrations")]
async fn test_list_by_owner_is_newest_first(pool: PgPool) {
    let (first, _) = ExtractionRepo::create_with_tasks(
        &pool,
        "alice",
        &album("lung"),
        &config(25),
        &studies(&["1.1"]),
    )
    .await
    .unwrap();
    ExtractionRepo::create_with_tasks(&pool, "bob", &album("lung"), &config(25), &studies(&["1.1"]))
        .await
        .unwrap();
    let (second, _) = ExtractionRepo::create_with_tasks(
        &pool,
        "alice",
        &ExtractionScope::Study {
            study_uid: "9.9".to_string(),
        },
        &config(25),
        &studies(&["9.9"]),
    )
    .await
    .unwrap();

    let ids: Vec<i64> = ExtractionRepo::list_by_owner(&pool, "alice")
        .await
        .unwrap()
        .iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(ids, vec![second.id, first.id]);

    let latest = ExtractionRepo::find_latest_by_owner_and_study(&pool, "alice", "1.1")
        .await
        .unwrap();
    assert_eq!(latest.map(|e| e.id), Some(first.id));
}

// ---------------------------------------------------------------------------
// Finalize
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "./migrations")]
async fn test_mark_finalized_succeeds_once(pool: PgPool) {
    let (extraction, _) = ExtractionRepo::create_with_tasks(
        &pool,
        "alice",
        &album("lung"),
        &config(25),
        &studies(&["1.1"]),
    )
    .await
    .unwrap();

    let first = ExtractionRepo::mark_finalized(&pool, extraction.id).await.unwrap();
    assert!(first, "first finalize should win");

    let second = ExtractionRepo::mark_finalized(&pool, extraction.id).await.unwrap();
    assert!(!second, "second finalize should be a no-op");

    let row = ExtractionRepo::find_by_id(&pool, extraction.id)
        .await
        .unwrap()
        .unwrap();
    assert!(row.finalized_at.is_some());
}
