//! Storage manager contract and its local, S3 and Postgres backends.
use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::config::Config;
use crate::error::{StorageError, StorageResult};
use crate::model::Record;

pub mod local;
pub mod postgres;
pub mod s3;
mod sigv4;

pub use local::LocalStorage;
pub use postgres::PostgresStorage;
pub use s3::S3Storage;

/// What gets written by `store`.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Records(Vec<Record>),
    Json(Value),
    Text(String),
    Bytes(Vec<u8>),
}

impl Payload {
    pub fn is_json(&self) -> bool {
        matches!(self, Payload::Records(_) | Payload::Json(_))
    }

    /// Number of records carried, when the payload is a record list or JSON array.
    pub fn record_count(&self) -> Option<usize> {
        match self {
            Payload::Records(r) => Some(r.len()),
            Payload::Json(Value::Array(a)) => Some(a.len()),
            _ => None,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Payload::Records(_) | Payload::Json(_) => "application/json",
            Payload::Text(_) => "text/plain",
            Payload::Bytes(_) => "application/octet-stream",
        }
    }

    /// Serialized body; JSON payloads are pretty printed.
    pub fn to_bytes(&self) -> StorageResult<Vec<u8>> {
        Ok(match self {
            Payload::Records(r) => serde_json::to_vec_pretty(r)?,
            Payload::Json(v) => serde_json::to_vec_pretty(v)?,
            Payload::Text(t) => t.clone().into_bytes(),
            Payload::Bytes(b) => b.clone(),
        })
    }
}

/// How `retrieve` should interpret stored bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrieveAs {
    Json,
    Text,
    Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Retrieved {
    Json(Value),
    Text(String),
    Bytes(Vec<u8>),
}

impl Retrieved {
    pub fn into_json(self) -> Option<Value> {
        match self {
            Retrieved::Json(v) => Some(v),
            _ => None,
        }
    }
}

#[async_trait]
pub trait StorageManager: Send + Sync {
    fn name(&self) -> &'static str;

    /// Establish the backend connection (create base dir, check bucket, open pool).
    async fn connect(&mut self) -> StorageResult<()>;

    async fn validate(&self) -> StorageResult<()>;

    /// Write `payload` under `path` and return where it landed.
    async fn store(
        &self,
        payload: Payload,
        path: &str,
        metadata: Option<&Map<String, Value>>,
    ) -> StorageResult<String>;

    async fn retrieve(&self, path: &str, as_type: RetrieveAs) -> StorageResult<Retrieved>;

    async fn list(&self, path: &str) -> StorageResult<Vec<String>>;

    async fn close(&mut self) -> StorageResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Local,
    S3,
    Postgres,
}

impl std::str::FromStr for StorageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(StorageKind::Local),
            "s3" => Ok(StorageKind::S3),
            "postgres" | "postgresql" => Ok(StorageKind::Postgres),
            other => Err(format!("unknown storage type: {}", other)),
        }
    }
}

/// Build and connect the configured backend of `kind`.
pub async fn from_config(kind: StorageKind, cfg: &Config) -> StorageResult<Box<dyn StorageManager>> {
    let mut manager: Box<dyn StorageManager> = match kind {
        StorageKind::Local => Box::new(LocalStorage::new(cfg.storage.local.clone().ok_or(
            StorageError::Validation("storage.local is not configured".into()),
        )?)),
        StorageKind::S3 => Box::new(S3Storage::new(cfg.storage.s3.clone().ok_or(
            StorageError::Validation("storage.s3 is not configured".into()),
        )?)?),
        StorageKind::Postgres => Box::new(PostgresStorage::new(
            cfg.storage
                .postgres
                .clone()
                .ok_or(StorageError::Validation("storage.postgres is not configured".into()))?
                .connection_url,
        )),
    };
    manager.connect().await?;
    Ok(manager)
}
