#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use data_extractors::config::LocalStorageConfig;
use data_extractors::connector::Connector;
use data_extractors::error::{ConnectorError, ConnectorResult};
use data_extractors::model::{FieldInfo, ObjectSchema, QueryParams, Record};
use data_extractors::storage::local::LocalStorage;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;

/// In-memory source that records every query it receives.
#[derive(Default)]
pub struct FakeConnector {
    pub reachable: bool,
    pub data: HashMap<String, Vec<Record>>,
    pub broken: Vec<String>,
    pub calls: Mutex<Vec<(String, QueryParams)>>,
}

impl FakeConnector {
    pub fn reachable() -> Self {
        Self {
            reachable: true,
            ..Default::default()
        }
    }

    pub fn with_records(mut self, object: &str, rows: Vec<Value>) -> Self {
        let rows = rows
            .into_iter()
            .filter_map(|v| v.as_object().cloned())
            .collect();
        self.data.insert(object.to_string(), rows);
        self
    }

    pub fn failing_on(mut self, object: &str) -> Self {
        self.broken.push(object.to_string());
        self
    }

    pub fn calls(&self) -> Vec<(String, QueryParams)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    fn name(&self) -> &'static str {
        "Fake"
    }

    async fn authenticate(&self) -> ConnectorResult<()> {
        if self.reachable {
            Ok(())
        } else {
            Err(ConnectorError::Authentication("unreachable".into()))
        }
    }

    async fn validate_connection(&self) -> ConnectorResult<()> {
        self.authenticate().await
    }

    async fn fetch_schema(&self, object: &str) -> ConnectorResult<ObjectSchema> {
        let mut fields = BTreeMap::new();
        fields.insert("Id".to_string(), FieldInfo::typed("id"));
        Ok(ObjectSchema {
            name: object.to_string(),
            label: None,
            fields,
            timestamp: Utc::now(),
        })
    }

    async fn fetch_data(&self, object: &str, params: &QueryParams) -> ConnectorResult<Vec<Record>> {
        self.calls
            .lock()
            .unwrap()
            .push((object.to_string(), params.clone()));
        if self.broken.iter().any(|b| b == object) {
            return Err(ConnectorError::DataExtraction(format!("{} exploded", object)));
        }
        Ok(self.data.get(object).cloned().unwrap_or_default())
    }
}

pub fn local_storage(dir: &Path) -> LocalStorage {
    LocalStorage::new(LocalStorageConfig {
        base_path: dir.to_string_lossy().into_owned(),
        create_dirs: true,
        timestamp_dirs: false,
    })
}
