//! Filesystem storage under a base directory, with JSON metadata sidecars.
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{error, info, warn};

use super::{Payload, RetrieveAs, Retrieved, StorageManager};
use crate::config::LocalStorageConfig;
use crate::error::{StorageError, StorageResult};

const METADATA_SUFFIX: &str = ".metadata.json";

#[derive(Debug, Clone)]
pub struct LocalStorage {
    base_path: PathBuf,
    create_dirs: bool,
    timestamp_dirs: bool,
}

impl LocalStorage {
    pub fn new(cfg: LocalStorageConfig) -> Self {
        Self {
            base_path: PathBuf::from(cfg.base_path),
            create_dirs: cfg.create_dirs,
            timestamp_dirs: cfg.timestamp_dirs,
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// `{base}/[YYYY-MM-DD/]{path}`
    fn full_path(&self, path: &str) -> PathBuf {
        let path = path.trim_start_matches('/');
        if self.timestamp_dirs {
            self.base_path
                .join(Utc::now().format("%Y-%m-%d").to_string())
                .join(path)
        } else {
            self.base_path.join(path)
        }
    }

    async fn ensure_parent(&self, file: &Path) -> StorageResult<()> {
        let Some(dir) = file.parent() else {
            return Ok(());
        };
        if fs::metadata(dir).await.is_ok() {
            return Ok(());
        }
        if !self.create_dirs {
            return Err(StorageError::Validation(format!(
                "directory does not exist and create_dirs is off: {}",
                dir.display()
            )));
        }
        fs::create_dir_all(dir).await?;
        Ok(())
    }
}

#[async_trait]
impl StorageManager for LocalStorage {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn connect(&mut self) -> StorageResult<()> {
        self.validate().await
    }

    async fn validate(&self) -> StorageResult<()> {
        match fs::metadata(&self.base_path).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(StorageError::Validation(format!(
                    "base path is not a directory: {}",
                    self.base_path.display()
                )))
            }
            Err(_) if self.create_dirs => {
                fs::create_dir_all(&self.base_path).await?;
                info!(path = %self.base_path.display(), "created base directory");
            }
            Err(_) => {
                return Err(StorageError::Validation(format!(
                    "base directory does not exist: {}",
                    self.base_path.display()
                )))
            }
        }
        let meta = fs::metadata(&self.base_path).await?;
        if meta.permissions().readonly() {
            return Err(StorageError::Validation(format!(
                "base directory is not writable: {}",
                self.base_path.display()
            )));
        }
        Ok(())
    }

    async fn store(
        &self,
        payload: Payload,
        path: &str,
        metadata: Option<&Map<String, Value>>,
    ) -> StorageResult<String> {
        self.validate().await?;
        let mut full = self.full_path(path);
        if payload.is_json() && full.extension().map_or(true, |e| e != "json") {
            let mut name = full.into_os_string();
            name.push(".json");
            full = PathBuf::from(name);
        }
        self.ensure_parent(&full).await?;

        let body = payload.to_bytes()?;
        fs::write(&full, body).await.map_err(|e| {
            error!(path = %full.display(), error = %e, "failed to write file");
            e
        })?;

        if let Some(meta) = metadata {
            let mut sidecar = Map::new();
            sidecar.insert("timestamp".into(), json!(Utc::now().timestamp()));
            sidecar.insert(
                "record_count".into(),
                json!(payload.record_count().unwrap_or(0)),
            );
            sidecar.extend(meta.clone());
            let mut meta_path = full.clone().into_os_string();
            meta_path.push(METADATA_SUFFIX);
            fs::write(&meta_path, serde_json::to_vec_pretty(&Value::Object(sidecar))?).await?;
        }

        let location = full.to_string_lossy().into_owned();
        info!(path = %location, "stored data");
        Ok(location)
    }

    async fn retrieve(&self, path: &str, as_type: RetrieveAs) -> StorageResult<Retrieved> {
        let full = self.full_path(path);
        let bytes = match fs::read(&full).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(full.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let is_json_file = path.ends_with(".json");
        match as_type {
            RetrieveAs::Bytes => Ok(Retrieved::Bytes(bytes)),
            RetrieveAs::Text => Ok(Retrieved::Text(String::from_utf8_lossy(&bytes).into_owned())),
            RetrieveAs::Json if !is_json_file => {
                Ok(Retrieved::Text(String::from_utf8_lossy(&bytes).into_owned()))
            }
            RetrieveAs::Json => match serde_json::from_slice(&bytes) {
                Ok(v) => Ok(Retrieved::Json(v)),
                Err(_) => {
                    warn!(path = %full.display(), "stored file is not valid JSON");
                    Ok(Retrieved::Text(String::from_utf8_lossy(&bytes).into_owned()))
                }
            },
        }
    }

    /// Entries directly under `path`, relative to the base directory, sidecars skipped.
    async fn list(&self, path: &str) -> StorageResult<Vec<String>> {
        let full = self.full_path(path);
        let meta = match fs::metadata(&full).await {
            Ok(m) => m,
            Err(_) => return Ok(Vec::new()),
        };
        if meta.is_file() {
            return Ok(full
                .file_name()
                .map(|n| vec![n.to_string_lossy().into_owned()])
                .unwrap_or_default());
        }
        let mut entries = fs::read_dir(&full).await?;
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let p = entry.path();
            let name = p.to_string_lossy();
            if name.ends_with(METADATA_SUFFIX) {
                continue;
            }
            let rel = p.strip_prefix(&self.base_path).unwrap_or(&p);
            out.push(rel.to_string_lossy().into_owned());
        }
        out.sort();
        Ok(out)
    }
}
