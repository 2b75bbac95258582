mod common;

use common::{local_storage, FakeConnector};
use data_extractors::db;
use data_extractors::extractor::ExtractionProfile;
use data_extractors::jobs::{self, LogManager, PipelineRequest};
use data_extractors::model::{ExtractionType, PipelineState, Provider};
use serde_json::json;

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

fn request(connection_id: Option<i64>, objects: &[&str]) -> PipelineRequest {
    PipelineRequest {
        connection_id,
        objects: objects.iter().map(|s| s.to_string()).collect(),
        extraction_type: ExtractionType::Full,
        since: None,
        profile: ExtractionProfile::defaults(Provider::GitHub),
    }
}

#[tokio::test]
async fn completed_run_is_recorded_and_streamed() {
    let pool = setup_pool().await;
    let dir = tempfile::tempdir().unwrap();
    let storage = local_storage(dir.path());
    let source = FakeConnector::reachable()
        .with_records("octo/hello", vec![json!({"id": 1, "title": "Bug"})]);
    let cid = db::create_connection(&pool, "github", "octo").await.unwrap();
    let logs = LogManager::new();
    let req = request(Some(cid), &["octo/hello"]);

    let job_id = jobs::create_pipeline(&pool, &req).await.unwrap();
    let mut sub = logs.subscribe(&job_id);
    let summary = jobs::execute_pipeline(&pool, &logs, &job_id, &source, &storage, &req)
        .await
        .unwrap();
    assert!(summary.success);

    let row = db::get_pipeline(&pool, &job_id).await.unwrap().unwrap();
    assert_eq!(row.state, PipelineState::Completed);
    assert_eq!(row.provider, "github");
    assert_eq!(row.summary.unwrap().total_records(), 1);
    assert!(row.error.is_none());

    let mut lines = Vec::new();
    while let Ok(ev) = sub.receiver.try_recv() {
        lines.push(ev.content().to_string());
    }
    assert!(lines[0].starts_with("Starting full extraction from Fake"));
    assert!(lines.iter().any(|l| l == "octo/hello: 1 records"));
    assert_eq!(
        lines.last().map(String::as_str),
        Some("Extraction finished: 1 records from 1 objects")
    );

    let runs = db::list_pipelines(&pool, cid).await.unwrap();
    assert_eq!(runs.len(), 1);
}

#[tokio::test]
async fn failed_run_keeps_error_and_partial_summary() {
    let pool = setup_pool().await;
    let dir = tempfile::tempdir().unwrap();
    let storage = local_storage(dir.path());
    let source = FakeConnector::default();
    let logs = LogManager::new();

    let (job_id, summary) =
        jobs::run_pipeline(&pool, &logs, &source, &storage, &request(None, &["octo/x"]))
            .await
            .unwrap();
    assert!(!summary.success);

    let row = db::get_pipeline(&pool, &job_id).await.unwrap().unwrap();
    assert_eq!(row.state, PipelineState::Failed);
    assert_eq!(row.error.as_deref(), Some("Failed to connect to Fake"));
    assert!(row.summary.is_some());
    assert!(row.finished_at.is_some());
}
