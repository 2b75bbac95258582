//! Postgres table sink: one TEXT column per field of the first record.
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::fmt;
use std::time::Duration;
use tracing::{info, instrument, warn};

use super::{Payload, RetrieveAs, Retrieved, StorageManager};
use crate::error::{StorageError, StorageResult};
use crate::model::Record;

static IDENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^[^"\x00]+$"#).expect("valid regex"));
/// Postgres truncates identifiers longer than this many bytes.
const MAX_IDENT_BYTES: usize = 63;

pub struct PostgresStorage {
    url: String,
    pool: Option<PgPool>,
}

impl fmt::Debug for PostgresStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresStorage")
            .field("connected", &self.pool.is_some())
            .finish_non_exhaustive()
    }
}

/// Double-quoted identifier; rejects names Postgres could not hold.
pub fn quote_ident(name: &str) -> StorageResult<String> {
    if name.len() > MAX_IDENT_BYTES || !IDENT_RE.is_match(name) {
        return Err(StorageError::InvalidInput(format!("invalid identifier: {:?}", name)));
    }
    Ok(format!("\"{}\"", name))
}

pub fn create_table_sql(table: &str, columns: &[String]) -> StorageResult<String> {
    let defs = columns
        .iter()
        .map(|c| Ok(format!("{} TEXT", quote_ident(c)?)))
        .collect::<StorageResult<Vec<_>>>()?;
    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_ident(table)?,
        defs.join(", ")
    ))
}

pub fn insert_sql(table: &str, columns: &[String]) -> StorageResult<String> {
    let cols = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<StorageResult<Vec<_>>>()?;
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${}", i)).collect();
    Ok(format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(table)?,
        cols.join(", "),
        placeholders.join(", ")
    ))
}

/// Column text for one field: strings verbatim, missing or null as "", the rest as JSON.
pub fn encode_value(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn payload_records(payload: Payload) -> StorageResult<Vec<Record>> {
    match payload {
        Payload::Records(r) => Ok(r),
        Payload::Json(Value::Array(items)) => items
            .into_iter()
            .map(|v| match v {
                Value::Object(m) => Ok(m),
                _ => Err(StorageError::InvalidInput("expected an array of objects".into())),
            })
            .collect(),
        _ => Err(StorageError::Unsupported("postgres storage only accepts records")),
    }
}

impl PostgresStorage {
    pub fn new(url: String) -> Self {
        Self { url, pool: None }
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            url: String::new(),
            pool: Some(pool),
        }
    }

    fn pool(&self) -> StorageResult<&PgPool> {
        self.pool
            .as_ref()
            .ok_or_else(|| StorageError::Validation("postgres storage is not connected".into()))
    }

    /// Create `table` if needed and insert every record in one transaction.
    #[instrument(skip(self, records))]
    pub async fn save(&self, records: &[Record], table: &str) -> StorageResult<usize> {
        let Some(first) = records.first() else {
            warn!(table, "no records to store");
            return Err(StorageError::InvalidInput(format!("no records to store in {}", table)));
        };
        let columns: Vec<String> = first.keys().cloned().collect();
        let create = create_table_sql(table, &columns)?;
        let insert = insert_sql(table, &columns)?;

        let mut tx = self.pool()?.begin().await?;
        sqlx::query(&create).execute(&mut *tx).await?;
        for record in records {
            let mut q = sqlx::query(&insert);
            for col in &columns {
                q = q.bind(encode_value(record.get(col)));
            }
            q.execute(&mut *tx).await?;
        }
        tx.commit().await?;
        info!(table, count = records.len(), "stored records in postgres");
        Ok(records.len())
    }
}

#[async_trait]
impl StorageManager for PostgresStorage {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn connect(&mut self) -> StorageResult<()> {
        if self.pool.is_none() {
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .acquire_timeout(Duration::from_secs(10))
                .connect(&self.url)
                .await?;
            self.pool = Some(pool);
        }
        Ok(())
    }

    async fn validate(&self) -> StorageResult<()> {
        sqlx::query("SELECT 1").execute(self.pool()?).await?;
        Ok(())
    }

    async fn store(
        &self,
        payload: Payload,
        path: &str,
        _metadata: Option<&Map<String, Value>>,
    ) -> StorageResult<String> {
        let records = payload_records(payload)?;
        self.save(&records, path).await?;
        Ok(path.to_string())
    }

    async fn retrieve(&self, _path: &str, _as_type: RetrieveAs) -> StorageResult<Retrieved> {
        Err(StorageError::Unsupported("retrieve is not available for postgres storage"))
    }

    async fn list(&self, _path: &str) -> StorageResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn close(&mut self) -> StorageResult<()> {
        if let Some(pool) = self.pool.take() {
            pool.close().await;
        }
        Ok(())
    }
}
