use super::model::{Connection, KnowledgeBase, Pipeline};
use crate::model::{ExtractionSummary, ExtractionType, PipelineState};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use sqlx::SqlitePool;
use tracing::instrument;
use uuid::Uuid;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized)
        .await
        .with_context(|| format!("failed to open {}", normalized))?;
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA foreign_keys=ON;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// For file-backed SQLite URLs, expand a leading `~/`, make sure the parent
/// directory exists and ask SQLite to create the file. In-memory URLs pass through.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path_part.to_string(),
    };
    if let Some(parent) = std::path::Path::new(&expanded).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = format!("sqlite://{}", expanded);
    match query_part {
        Some(q) if q.contains("mode=") => {
            rebuilt.push('?');
            rebuilt.push_str(q);
        }
        Some(q) => {
            rebuilt.push('?');
            rebuilt.push_str(q);
            rebuilt.push_str("&mode=rwc");
        }
        None => rebuilt.push_str("?mode=rwc"),
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// --- connections -----------------------------------------------------------

fn connection_from_row(row: &SqliteRow) -> Result<Connection> {
    Ok(Connection {
        id: row.try_get("id")?,
        provider: row.try_get("provider")?,
        name: row.try_get("name")?,
        status: row.try_get("status")?,
        created_at: row.try_get("created_at")?,
    })
}

#[instrument(skip_all)]
pub async fn create_connection(pool: &Pool, provider: &str, name: &str) -> Result<i64> {
    let now = Utc::now();
    let rec = sqlx::query(
        "INSERT INTO connections (provider, name, status, created_at, updated_at) VALUES (?, ?, 'active', ?, ?) RETURNING id",
    )
    .bind(provider)
    .bind(name)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await
    .context("failed to insert connection")?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn list_connections(pool: &Pool) -> Result<Vec<Connection>> {
    let rows = sqlx::query(
        "SELECT id, provider, name, status, created_at FROM connections ORDER BY id ASC",
    )
    .fetch_all(pool)
    .await?;
    rows.iter().map(connection_from_row).collect()
}

#[instrument(skip_all)]
pub async fn get_connection(pool: &Pool, id: i64) -> Result<Option<Connection>> {
    let row = sqlx::query("SELECT id, provider, name, status, created_at FROM connections WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(connection_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn update_connection_status(pool: &Pool, id: i64, status: &str) -> Result<()> {
    let done = sqlx::query("UPDATE connections SET status = ?, updated_at = ? WHERE id = ?")
        .bind(status)
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
    if done.rows_affected() == 0 {
        return Err(anyhow!("connection {} not found", id));
    }
    Ok(())
}

/// Remove a connection together with its pipeline history and KB row.
#[instrument(skip_all)]
pub async fn delete_connection(pool: &Pool, id: i64) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM pipelines WHERE connection_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM knowledge_bases WHERE connection_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    let done = sqlx::query("DELETE FROM connections WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    if done.rows_affected() == 0 {
        return Err(anyhow!("connection {} not found", id));
    }
    tx.commit().await?;
    Ok(())
}

// --- pipelines -------------------------------------------------------------

const PIPELINE_COLUMNS: &str = "id, connection_id, provider, objects, extraction_type, state, summary, error, created_at, started_at, finished_at";

fn pipeline_from_row(row: &SqliteRow) -> Result<Pipeline> {
    let id: String = row.try_get("id")?;
    let objects: String = row.try_get("objects")?;
    let extraction_type: String = row.try_get("extraction_type")?;
    let state: String = row.try_get("state")?;
    let summary: Option<String> = row.try_get("summary")?;
    let summary = summary
        .map(|s| serde_json::from_str::<ExtractionSummary>(&s))
        .transpose()
        .with_context(|| format!("pipeline {} has an unreadable summary", id))?;

    Ok(Pipeline {
        connection_id: row.try_get("connection_id")?,
        provider: row.try_get("provider")?,
        objects: serde_json::from_str(&objects)
            .with_context(|| format!("pipeline {} has unreadable objects", id))?,
        extraction_type: extraction_type
            .parse::<ExtractionType>()
            .map_err(|e| anyhow!("pipeline {}: {}", id, e))?,
        state: PipelineState::parse_state(&state)
            .ok_or_else(|| anyhow!("pipeline {} has unknown state {}", id, state))?,
        summary,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        id,
    })
}

/// Record a new run in `PENDING` state and return its id.
#[instrument(skip_all)]
pub async fn create_pipeline(
    pool: &Pool,
    connection_id: Option<i64>,
    provider: &str,
    objects: &[String],
    extraction_type: ExtractionType,
) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO pipelines (id, connection_id, provider, objects, extraction_type, state, created_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(connection_id)
    .bind(provider)
    .bind(serde_json::to_string(objects)?)
    .bind(extraction_type.as_str())
    .bind(PipelineState::Pending.as_str())
    .bind(Utc::now())
    .execute(pool)
    .await
    .context("failed to insert pipeline")?;
    Ok(id)
}

async fn transition(
    pool: &Pool,
    id: &str,
    from: &[PipelineState],
    to: PipelineState,
    sql: &str,
    extras: Vec<Option<String>>,
    at: DateTime<Utc>,
) -> Result<()> {
    let mut tx = pool.begin().await?;
    let current: Option<String> = sqlx::query_scalar("SELECT state FROM pipelines WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
    let Some(current) = current else {
        return Err(anyhow!("pipeline {} not found", id));
    };
    let current = PipelineState::parse_state(&current)
        .ok_or_else(|| anyhow!("pipeline {} has unknown state {}", id, current))?;
    if !from.contains(&current) {
        return Err(anyhow!(
            "pipeline {} cannot move from {} to {}",
            id,
            current.as_str(),
            to.as_str()
        ));
    }
    let mut q = sqlx::query(sql).bind(to.as_str());
    for extra in extras {
        q = q.bind(extra);
    }
    q.bind(at).bind(id).execute(&mut *tx).await?;
    tx.commit().await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn mark_pipeline_running(pool: &Pool, id: &str) -> Result<()> {
    transition(
        pool,
        id,
        &[PipelineState::Pending],
        PipelineState::Running,
        "UPDATE pipelines SET state = ?, started_at = ? WHERE id = ?",
        Vec::new(),
        Utc::now(),
    )
    .await
}

#[instrument(skip_all)]
pub async fn complete_pipeline(pool: &Pool, id: &str, summary: &ExtractionSummary) -> Result<()> {
    transition(
        pool,
        id,
        &[PipelineState::Pending, PipelineState::Running],
        PipelineState::Completed,
        "UPDATE pipelines SET state = ?, summary = ?, finished_at = ? WHERE id = ?",
        vec![Some(serde_json::to_string(summary)?)],
        Utc::now(),
    )
    .await
}

/// Mark a run failed. A partial summary is kept when the run got that far.
#[instrument(skip_all)]
pub async fn fail_pipeline(
    pool: &Pool,
    id: &str,
    error: &str,
    summary: Option<&ExtractionSummary>,
) -> Result<()> {
    let summary = summary.map(serde_json::to_string).transpose()?;
    transition(
        pool,
        id,
        &[PipelineState::Pending, PipelineState::Running],
        PipelineState::Failed,
        "UPDATE pipelines SET state = ?, error = ?, summary = ?, finished_at = ? WHERE id = ?",
        vec![Some(error.to_string()), summary],
        Utc::now(),
    )
    .await
}

#[instrument(skip_all)]
pub async fn get_pipeline(pool: &Pool, id: &str) -> Result<Option<Pipeline>> {
    let sql = format!("SELECT {} FROM pipelines WHERE id = ?", PIPELINE_COLUMNS);
    let row = sqlx::query(&sql).bind(id).fetch_optional(pool).await?;
    row.as_ref().map(pipeline_from_row).transpose()
}

/// Runs of one connection, newest first.
#[instrument(skip_all)]
pub async fn list_pipelines(pool: &Pool, connection_id: i64) -> Result<Vec<Pipeline>> {
    let sql = format!(
        "SELECT {} FROM pipelines WHERE connection_id = ? ORDER BY created_at DESC, rowid DESC",
        PIPELINE_COLUMNS
    );
    let rows = sqlx::query(&sql).bind(connection_id).fetch_all(pool).await?;
    rows.iter().map(pipeline_from_row).collect()
}

// --- knowledge bases -------------------------------------------------------

fn kb_from_row(row: &SqliteRow) -> Result<KnowledgeBase> {
    Ok(KnowledgeBase {
        connection_id: row.try_get("connection_id")?,
        is_indexed: row.try_get("is_indexed")?,
        is_indexing: row.try_get("is_indexing")?,
        last_indexed_at: row.try_get("last_indexed_at")?,
    })
}

/// Ensure a KB row exists for the connection; existing flags are kept.
#[instrument(skip_all)]
pub async fn upsert_knowledge_base(pool: &Pool, connection_id: i64) -> Result<KnowledgeBase> {
    sqlx::query(
        "INSERT INTO knowledge_bases (connection_id, updated_at) VALUES (?, ?) ON CONFLICT(connection_id) DO NOTHING",
    )
    .bind(connection_id)
    .bind(Utc::now())
    .execute(pool)
    .await
    .context("failed to upsert knowledge base")?;
    get_knowledge_base(pool, connection_id)
        .await?
        .ok_or_else(|| anyhow!("knowledge base {} vanished", connection_id))
}

#[instrument(skip_all)]
pub async fn get_knowledge_base(pool: &Pool, connection_id: i64) -> Result<Option<KnowledgeBase>> {
    let row = sqlx::query(
        "SELECT connection_id, is_indexed, is_indexing, last_indexed_at FROM knowledge_bases WHERE connection_id = ?",
    )
    .bind(connection_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(kb_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn set_kb_indexing(pool: &Pool, connection_id: i64, indexing: bool) -> Result<()> {
    let done = sqlx::query(
        "UPDATE knowledge_bases SET is_indexing = ?, updated_at = ? WHERE connection_id = ?",
    )
    .bind(indexing)
    .bind(Utc::now())
    .bind(connection_id)
    .execute(pool)
    .await?;
    if done.rows_affected() == 0 {
        return Err(anyhow!("knowledge base {} not found", connection_id));
    }
    Ok(())
}

/// Mark indexing finished: sets `is_indexed`, clears `is_indexing`, stamps the time.
#[instrument(skip_all)]
pub async fn set_kb_indexed(pool: &Pool, connection_id: i64) -> Result<()> {
    let now = Utc::now();
    let done = sqlx::query(
        "UPDATE knowledge_bases SET is_indexed = 1, is_indexing = 0, last_indexed_at = ?, updated_at = ? WHERE connection_id = ?",
    )
    .bind(now)
    .bind(now)
    .bind(connection_id)
    .execute(pool)
    .await?;
    if done.rows_affected() == 0 {
        return Err(anyhow!("knowledge base {} not found", connection_id));
    }
    Ok(())
}
