//! Pipeline runs and per-job log fan-out.
use anyhow::Result;
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

use crate::connector::Connector;
use crate::db;
use crate::extractor::{ExtractionProfile, Extractor};
use crate::model::{ExtractionSummary, ExtractionType};
use crate::storage::StorageManager;

const SUBSCRIBER_BUFFER: usize = 256;

/// Message delivered to job subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LogEvent {
    Log { content: String },
}

impl LogEvent {
    pub fn content(&self) -> &str {
        match self {
            LogEvent::Log { content } => content,
        }
    }
}

/// Receiving end handed out by [`LogManager::subscribe`].
#[derive(Debug)]
pub struct Subscription {
    pub id: u64,
    pub receiver: mpsc::Receiver<LogEvent>,
}

/// Fan-out of job log lines to any number of live subscribers per job.
///
/// Subscribers that fall behind (full buffer) or went away (closed receiver)
/// are dropped on the next publish; a job with no subscribers left is forgotten.
#[derive(Debug, Default)]
pub struct LogManager {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<String, Vec<(u64, mpsc::Sender<LogEvent>)>>>,
}

impl LogManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, job_id: &str) -> Subscription {
        self.subscribe_with_capacity(job_id, SUBSCRIBER_BUFFER)
    }

    pub fn subscribe_with_capacity(&self, job_id: &str, capacity: usize) -> Subscription {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subs.entry(job_id.to_string()).or_default().push((id, tx));
        Subscription { id, receiver: rx }
    }

    pub fn unsubscribe(&self, job_id: &str, subscription_id: u64) {
        let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(set) = subs.get_mut(job_id) {
            set.retain(|(id, _)| *id != subscription_id);
            if set.is_empty() {
                subs.remove(job_id);
            }
        }
    }

    /// Deliver `line` to every subscriber of `job_id`; returns how many received it.
    pub fn publish(&self, job_id: &str, line: impl Into<String>) -> usize {
        let event = LogEvent::Log {
            content: line.into(),
        };
        let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        let Some(set) = subs.get_mut(job_id) else {
            return 0;
        };
        let before = set.len();
        set.retain(|(_, tx)| tx.try_send(event.clone()).is_ok());
        let delivered = set.len();
        if delivered < before {
            warn!(job_id, dropped = before - delivered, "dropped stalled log subscribers");
        }
        if set.is_empty() {
            subs.remove(job_id);
        }
        delivered
    }

    pub fn subscriber_count(&self, job_id: &str) -> usize {
        let subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subs.get(job_id).map(Vec::len).unwrap_or(0)
    }
}

/// What to extract in one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub connection_id: Option<i64>,
    pub objects: Vec<String>,
    pub extraction_type: ExtractionType,
    pub since: Option<String>,
    pub profile: ExtractionProfile,
}

/// Record a `PENDING` run so callers can subscribe to its logs before it starts.
#[instrument(skip_all)]
pub async fn create_pipeline(pool: &SqlitePool, req: &PipelineRequest) -> Result<String> {
    db::create_pipeline(
        pool,
        req.connection_id,
        req.profile.provider.as_str(),
        &req.objects,
        req.extraction_type,
    )
    .await
}

/// Run a previously created pipeline to completion and record the outcome.
///
/// Extraction failures are recorded on the row and returned in the summary;
/// the `Err` path is reserved for bookkeeping failures.
#[instrument(skip_all, fields(job_id = %job_id))]
pub async fn execute_pipeline(
    pool: &SqlitePool,
    logs: &LogManager,
    job_id: &str,
    connector: &dyn Connector,
    storage: &dyn StorageManager,
    req: &PipelineRequest,
) -> Result<ExtractionSummary> {
    db::mark_pipeline_running(pool, job_id).await?;
    logs.publish(
        job_id,
        format!(
            "Starting {} extraction from {} ({} objects)",
            req.extraction_type.as_str(),
            connector.name(),
            req.objects.len()
        ),
    );

    let sink = |line: String| {
        logs.publish(job_id, line);
    };
    let extractor =
        Extractor::new(connector, storage, req.profile.clone()).with_progress(&sink);
    let summary = extractor
        .extract(&req.objects, req.extraction_type, req.since.as_deref())
        .await;

    if summary.success {
        db::complete_pipeline(pool, job_id, &summary).await?;
        logs.publish(
            job_id,
            format!(
                "Extraction finished: {} records from {} objects",
                summary.total_records(),
                summary.successful_objects()
            ),
        );
        info!(records = summary.total_records(), "pipeline completed");
    } else {
        let error = summary.errors.join("; ");
        db::fail_pipeline(pool, job_id, &error, Some(&summary)).await?;
        logs.publish(job_id, format!("Extraction failed: {}", error));
        warn!(%error, "pipeline failed");
    }
    Ok(summary)
}

/// Create and run a pipeline in one go; returns the job id with the summary.
pub async fn run_pipeline(
    pool: &SqlitePool,
    logs: &LogManager,
    connector: &dyn Connector,
    storage: &dyn StorageManager,
    req: &PipelineRequest,
) -> Result<(String, ExtractionSummary)> {
    let job_id = create_pipeline(pool, req).await?;
    let summary = execute_pipeline(pool, logs, &job_id, connector, storage, req).await?;
    Ok((job_id, summary))
}
