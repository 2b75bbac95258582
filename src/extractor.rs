//! Extraction orchestration: connector -> data-quality check -> storage.
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::time::Instant;
use tracing::{error, info, instrument, warn};

use crate::config::ExtractionOverrides;
use crate::connector::{salesforce, Connector};
use crate::model::{
    DataQuality, ExtractionSummary, ExtractionType, ObjectResult, Provider, QueryParams, Record,
};
use crate::storage::{Payload, StorageManager};

/// Per-provider defaults for an extraction run.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionProfile {
    pub provider: Provider,
    pub batch_size: u32,
    pub schema_extract: bool,
    pub extract_path: String,
    pub important_fields: Vec<String>,
    /// Field list per object; objects not listed use `default_fields`.
    pub fields: BTreeMap<String, Vec<String>>,
    pub default_fields: Vec<String>,
}

impl ExtractionProfile {
    pub fn defaults(provider: Provider) -> Self {
        let (batch_size, important, default_fields): (u32, &str, Vec<String>) = match provider {
            Provider::Salesforce => (
                2000,
                "Id",
                salesforce::DEFAULT_FIELDS.iter().map(|f| f.to_string()).collect(),
            ),
            Provider::Zoho => (200, "id", Vec::new()),
            Provider::SugarCrm => (100, "id", Vec::new()),
            Provider::MetaAds => (100, "id", Vec::new()),
            Provider::GitHub => (100, "id", Vec::new()),
            Provider::Notion => (100, "id", Vec::new()),
        };
        Self {
            provider,
            batch_size,
            schema_extract: true,
            extract_path: provider.as_str().to_string(),
            important_fields: vec![important.to_string()],
            fields: BTreeMap::new(),
            default_fields,
        }
    }

    pub fn with_overrides(mut self, o: &ExtractionOverrides) -> Self {
        if let Some(b) = o.batch_size {
            self.batch_size = b;
        }
        if let Some(s) = o.schema_extract {
            self.schema_extract = s;
        }
        if let Some(p) = o.extract_path.as_ref().filter(|p| !p.trim().is_empty()) {
            self.extract_path = p.trim_end_matches('/').to_string();
        }
        if let Some(f) = &o.important_fields {
            self.important_fields = f.clone();
        }
        self.fields.extend(o.fields.clone());
        self
    }

    pub fn fields_for(&self, object: &str) -> Vec<String> {
        self.fields
            .get(object)
            .cloned()
            .unwrap_or_else(|| self.default_fields.clone())
    }

    pub fn full_query(&self, object: &str) -> QueryParams {
        let mut q = QueryParams::with_fields(self.fields_for(object));
        match self.provider {
            Provider::Salesforce => {
                q.order_by = Some("Id ASC".into());
                q.limit = Some(self.batch_size);
            }
            Provider::Zoho => {}
            _ => q.limit = Some(self.batch_size),
        }
        q
    }

    /// Query selecting records changed since `since`; `None` when the source has
    /// no change filter and a full extraction must be used instead.
    pub fn incremental_query(&self, object: &str, since: &str) -> Option<QueryParams> {
        let mut q = QueryParams::with_fields(self.fields_for(object));
        match self.provider {
            Provider::Salesforce => {
                q.where_clause = Some(format!("LastModifiedDate >= {}", since));
                q.order_by = Some("LastModifiedDate ASC".into());
                q.limit = Some(self.batch_size);
            }
            Provider::Zoho => {
                q.filters = Some(json!({"Modified_Time": {"gt": since}}));
            }
            Provider::SugarCrm => {
                q.filters = Some(json!({"date_modified": {"$gte": since}}));
                q.limit = Some(self.batch_size);
            }
            Provider::MetaAds => {
                let day: String = since.chars().take(10).collect();
                q.filters = Some(json!({
                    "time_range": {
                        "since": day,
                        "until": Utc::now().format("%Y-%m-%d").to_string(),
                    },
                    "updated_since": since,
                }));
                q.limit = Some(self.batch_size);
            }
            Provider::GitHub => {
                q.filters = Some(json!({"since": since}));
                q.limit = Some(self.batch_size);
            }
            Provider::Notion => return None,
        }
        Some(q)
    }
}

/// Null/missing counts per important field plus duplicate values of the first one.
pub fn validate_data_quality(records: &[Record], important_fields: &[String]) -> DataQuality {
    let mut null_values = BTreeMap::new();
    if !records.is_empty() {
        for field in important_fields {
            let nulls = records
                .iter()
                .filter(|r| r.get(field).map_or(true, Value::is_null))
                .count();
            null_values.insert(field.clone(), nulls);
        }
    }

    let duplicate_keys = match important_fields.first() {
        Some(key) => {
            let mut seen = HashSet::new();
            records
                .iter()
                .filter_map(|r| r.get(key).filter(|v| !v.is_null()))
                .filter(|v| !seen.insert(v.to_string()))
                .count()
        }
        None => 0,
    };

    DataQuality {
        total_records: records.len(),
        null_values,
        duplicate_keys,
        validation_timestamp: Utc::now(),
    }
}

type Progress<'a> = &'a (dyn Fn(String) + Send + Sync);

/// Runs extractions for one connector into one storage backend.
pub struct Extractor<'a> {
    connector: &'a dyn Connector,
    storage: &'a dyn StorageManager,
    profile: ExtractionProfile,
    progress: Option<Progress<'a>>,
}

impl<'a> Extractor<'a> {
    pub fn new(
        connector: &'a dyn Connector,
        storage: &'a dyn StorageManager,
        profile: ExtractionProfile,
    ) -> Self {
        Self {
            connector,
            storage,
            profile,
            progress: None,
        }
    }

    /// Report human-readable progress lines to `sink` (job log fan-out).
    pub fn with_progress(mut self, sink: Progress<'a>) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn profile(&self) -> &ExtractionProfile {
        &self.profile
    }

    fn report(&self, line: String) {
        if let Some(sink) = self.progress {
            sink(line);
        }
    }

    #[instrument(skip_all, fields(source = self.connector.name(), kind = extraction_type.as_str()))]
    pub async fn extract(
        &self,
        objects: &[String],
        extraction_type: ExtractionType,
        since: Option<&str>,
    ) -> ExtractionSummary {
        let started = Instant::now();
        let mut summary = ExtractionSummary {
            success: true,
            extraction_type,
            start_time: Utc::now(),
            end_time: None,
            object_results: BTreeMap::new(),
            errors: Vec::new(),
            execution_time_seconds: 0.0,
        };

        if let Err(err) = self.connector.validate_connection().await {
            error!(?err, "connection check failed");
            summary.success = false;
            summary
                .errors
                .push(format!("Failed to connect to {}", self.connector.name()));
            self.report(format!("Failed to connect to {}: {}", self.connector.name(), err));
            summary.end_time = Some(Utc::now());
            return summary;
        }

        for object in objects {
            info!(object = %object, "extracting");
            self.report(format!("Extracting {} ({})", object, extraction_type.as_str()));
            if self.profile.schema_extract {
                self.extract_schema(object).await;
            }
            let result = match (extraction_type, since) {
                (ExtractionType::Incremental, Some(since)) => {
                    self.extract_incremental(object, since).await
                }
                _ => self.extract_full(object).await,
            };
            if result.success {
                self.report(format!("{}: {} records", object, result.record_count));
            } else {
                summary.success = false;
                let msg = match &result.error {
                    Some(e) => format!("Error extracting {}: {}", object, e),
                    None => format!("Failed to extract {}", object),
                };
                self.report(msg.clone());
                summary.errors.push(msg);
            }
            summary.object_results.insert(object.clone(), result);
        }

        let end = Utc::now();
        summary.end_time = Some(end);
        summary.execution_time_seconds = (started.elapsed().as_secs_f64() * 100.0).round() / 100.0;

        let path = format!(
            "{}/extraction_summary_{}.json",
            self.profile.extract_path,
            end.timestamp()
        );
        match serde_json::to_value(&summary) {
            Ok(v) => {
                if let Err(err) = self.storage.store(Payload::Json(v), &path, None).await {
                    warn!(?err, "failed to store extraction summary");
                    summary
                        .errors
                        .push(format!("Failed to store extraction summary: {}", err));
                }
            }
            Err(err) => warn!(?err, "failed to serialize extraction summary"),
        }
        summary
    }

    pub async fn extract_full(&self, object: &str) -> ObjectResult {
        let params = self.profile.full_query(object);
        self.run(object, ExtractionType::Full, None, params).await
    }

    /// Changed-since extraction; sources without a change filter run a full extraction.
    pub async fn extract_incremental(&self, object: &str, since: &str) -> ObjectResult {
        match self.profile.incremental_query(object, since) {
            Some(params) => {
                self.run(object, ExtractionType::Incremental, Some(since), params)
                    .await
            }
            None => {
                info!(object, "no incremental filter for source; running full extraction");
                self.extract_full(object).await
            }
        }
    }

    async fn run(
        &self,
        object: &str,
        kind: ExtractionType,
        since: Option<&str>,
        params: QueryParams,
    ) -> ObjectResult {
        let mut result = ObjectResult::started(object, kind, since);

        let records = match self.connector.fetch_data(object, &params).await {
            Ok(r) => r,
            Err(err) => {
                error!(object, ?err, "extraction failed");
                result.error = Some(err.to_string());
                result.end_time = Some(Utc::now());
                return result;
            }
        };

        if records.is_empty() {
            result.success = true;
            result.message = Some(match since {
                Some(s) => format!("No updated records found for {} since {}", object, s),
                None => format!("No records found for {}", object),
            });
            result.end_time = Some(Utc::now());
            return result;
        }

        result.data_quality = Some(validate_data_quality(
            &records,
            &self.profile.important_fields,
        ));
        let count = records.len();
        let path = format!(
            "{}/{}/{}_{}",
            self.profile.extract_path,
            object,
            kind.as_str(),
            Utc::now().timestamp()
        );
        let mut meta = Map::new();
        meta.insert("extraction_type".into(), kind.as_str().into());
        meta.insert("object_name".into(), object.into());
        if let Some(s) = since {
            meta.insert("since_date".into(), s.into());
        }

        match self
            .storage
            .store(Payload::Records(records), &path, Some(&meta))
            .await
        {
            Ok(location) => {
                result.success = true;
                result.record_count = count;
                result.storage_path = Some(location);
                info!(object, count, kind = kind.as_str(), "extracted records");
            }
            Err(err) => {
                error!(object, ?err, "failed to store records");
                result.record_count = count;
                result.error = Some(err.to_string());
            }
        }
        result.end_time = Some(Utc::now());
        result
    }

    async fn extract_schema(&self, object: &str) -> bool {
        let schema = match self.connector.fetch_schema(object).await {
            Ok(s) => s,
            Err(err) => {
                warn!(object, ?err, "failed to fetch schema");
                return false;
            }
        };
        let value = match serde_json::to_value(&schema) {
            Ok(v) => v,
            Err(err) => {
                warn!(object, ?err, "failed to serialize schema");
                return false;
            }
        };
        let path = format!(
            "{}/schemas/{}_schema_{}",
            self.profile.extract_path,
            object,
            Utc::now().timestamp()
        );
        match self.storage.store(Payload::Json(value), &path, None).await {
            Ok(_) => {
                info!(object, "stored schema");
                true
            }
            Err(err) => {
                warn!(object, ?err, "fetched but failed to store schema");
                false
            }
        }
    }
}
