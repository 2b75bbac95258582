//! Rows returned by the bookkeeping repository.
//!
//! Keep these structs focused on stored data. Orchestration lives in `jobs`.

use crate::model::{ExtractionSummary, ExtractionType, PipelineState};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// A configured source the user has connected.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Connection {
    pub id: i64,
    pub provider: String,
    pub name: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// One extraction run and its outcome.
#[derive(Debug, Clone, Serialize)]
pub struct Pipeline {
    pub id: String,
    pub connection_id: Option<i64>,
    pub provider: String,
    pub objects: Vec<String>,
    pub extraction_type: ExtractionType,
    pub state: PipelineState,
    pub summary: Option<ExtractionSummary>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KnowledgeBase {
    pub connection_id: i64,
    pub is_indexed: bool,
    pub is_indexing: bool,
    pub last_indexed_at: Option<DateTime<Utc>>,
}
