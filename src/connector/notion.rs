//! Notion connector: databases as objects, flattened pages as records.
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, RequestBuilder, Url};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{info, instrument, warn};

use super::{http_client, Connector};
use crate::error::{ConnectorError, ConnectorResult};
use crate::model::{FieldInfo, ObjectInfo, ObjectSchema, QueryParams, Record};

const NOTION_API_BASE: &str = "https://api.notion.com/";
pub const DEFAULT_VERSION: &str = "2022-06-28";

#[derive(Clone)]
pub struct NotionConnector {
    http: Client,
    base_url: Url,
    token: String,
    version: String,
}

impl fmt::Debug for NotionConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotionConnector")
            .field("base_url", &self.base_url)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize, Debug)]
pub struct DatabaseProperty {
    pub id: String,
    #[serde(rename = "type")]
    pub typ: String,
}

#[derive(Deserialize, Debug)]
pub struct RetrieveDatabaseResp {
    pub id: String,
    #[serde(default)]
    pub title: Vec<Value>,
    #[serde(default)]
    pub properties: BTreeMap<String, DatabaseProperty>,
}

#[derive(Deserialize)]
struct ListResp {
    #[serde(default)]
    results: Vec<Value>,
    #[serde(default)]
    has_more: bool,
    next_cursor: Option<String>,
}

impl NotionConnector {
    pub fn new(token: String, version: String) -> Self {
        let base_url = Url::parse(NOTION_API_BASE).expect("valid default Notion URL");
        Self::with_base_url(token, version, base_url)
    }

    pub fn with_base_url(token: String, version: String, base_url: Url) -> Self {
        Self {
            http: http_client(),
            base_url,
            token,
            version,
        }
    }

    fn endpoint(&self, path: &str) -> ConnectorResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| ConnectorError::DataExtraction(e.to_string()))
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Notion-Version", &self.version)
    }

    pub async fn is_token_valid(&self) -> bool {
        let Ok(url) = self.endpoint("v1/users/me") else {
            return false;
        };
        match self.authed(self.http.get(url)).send().await {
            Ok(res) => res.status().is_success(),
            Err(err) => {
                warn!(?err, "Notion token check failed");
                false
            }
        }
    }

    pub async fn retrieve_database(&self, database_id: &str) -> ConnectorResult<RetrieveDatabaseResp> {
        let url = self.endpoint(&format!("v1/databases/{}", database_id))?;
        let res = self.authed(self.http.get(url)).send().await?;
        if !res.status().is_success() {
            return Err(ConnectorError::from_response("Notion", res).await);
        }
        Ok(res.json().await?)
    }

    /// POST `path` with `body`, following `next_cursor` while `has_more`.
    async fn post_paginated(&self, path: &str, body: Value) -> ConnectorResult<Vec<Value>> {
        let url = self.endpoint(path)?;
        let mut results = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut page_body = body.clone();
            if let Some(c) = &cursor {
                page_body["start_cursor"] = Value::String(c.clone());
            }
            let res = self
                .authed(self.http.post(url.clone()))
                .json(&page_body)
                .send()
                .await?;
            if !res.status().is_success() {
                return Err(ConnectorError::from_response("Notion", res).await);
            }
            let page: ListResp = res.json().await?;
            results.extend(page.results);
            match page.next_cursor {
                Some(next) if page.has_more => cursor = Some(next),
                _ => break,
            }
        }
        Ok(results)
    }
}

/// Title of a database: its first `plain_text`, else its id.
pub fn database_title(db: &Value) -> String {
    db["title"][0]["plain_text"]
        .as_str()
        .map(str::to_string)
        .or_else(|| db["id"].as_str().map(str::to_string))
        .unwrap_or_default()
}

fn first_plain_text(items: &Value) -> Value {
    Value::String(items[0]["plain_text"].as_str().unwrap_or_default().to_string())
}

fn join_names(items: &Value) -> Value {
    let names: Vec<&str> = items
        .as_array()
        .map(|a| a.iter().map(|i| i["name"].as_str().unwrap_or("")).collect())
        .unwrap_or_default();
    Value::String(names.join(", "))
}

/// Plain value of one page property.
pub fn extract_value(prop: &Value) -> Value {
    let typ = prop["type"].as_str().unwrap_or_default();
    let inner = &prop[typ];
    match typ {
        "title" | "rich_text" => first_plain_text(inner),
        "select" => Value::String(inner["name"].as_str().unwrap_or_default().to_string()),
        "multi_select" | "people" => join_names(inner),
        "number" | "checkbox" => inner.clone(),
        "date" => Value::String(inner["start"].as_str().unwrap_or_default().to_string()),
        _ => match inner {
            Value::Null | Value::Bool(false) => Value::String(String::new()),
            Value::String(s) if s.is_empty() => Value::String(String::new()),
            Value::Array(a) if a.is_empty() => Value::String(String::new()),
            Value::Object(o) if o.is_empty() => Value::String(String::new()),
            Value::String(s) => Value::String(s.clone()),
            other => Value::String(other.to_string()),
        },
    }
}

/// `{id, <property>: <plain value>...}` for one database page.
pub fn flatten_page(page: &Value) -> Record {
    let mut flat = Map::new();
    flat.insert("id".into(), page["id"].clone());
    if let Some(props) = page["properties"].as_object() {
        for (key, val) in props {
            flat.insert(key.clone(), extract_value(val));
        }
    }
    flat
}

#[async_trait]
impl Connector for NotionConnector {
    fn name(&self) -> &'static str {
        "Notion"
    }

    async fn authenticate(&self) -> ConnectorResult<()> {
        if self.is_token_valid().await {
            Ok(())
        } else {
            Err(ConnectorError::Authentication("Invalid Notion token".into()))
        }
    }

    async fn validate_connection(&self) -> ConnectorResult<()> {
        self.authenticate().await
    }

    #[instrument(skip_all)]
    async fn list_objects(&self) -> ConnectorResult<Vec<ObjectInfo>> {
        let body = json!({"filter": {"property": "object", "value": "database"}});
        let dbs = self.post_paginated("v1/search", body).await?;
        info!(count = dbs.len(), "listed Notion databases");
        Ok(dbs
            .iter()
            .map(|db| ObjectInfo {
                id: db["id"].as_str().unwrap_or_default().to_string(),
                name: database_title(db),
            })
            .collect())
    }

    async fn fetch_schema(&self, object: &str) -> ConnectorResult<ObjectSchema> {
        let db = self.retrieve_database(object).await?;
        let label = db.title.first().and_then(|t| t["plain_text"].as_str()).map(str::to_string);
        let fields = db
            .properties
            .into_iter()
            .map(|(name, p)| (name, FieldInfo::typed(&p.typ)))
            .collect();
        Ok(ObjectSchema {
            name: db.id,
            label,
            fields,
            timestamp: Utc::now(),
        })
    }

    #[instrument(skip(self, params))]
    async fn fetch_data(&self, object: &str, params: &QueryParams) -> ConnectorResult<Vec<Record>> {
        let mut body = json!({});
        if let Some(filter) = &params.filters {
            body["filter"] = filter.clone();
        }
        if let Some(limit) = params.limit {
            body["page_size"] = json!(limit.min(100));
        }
        let pages = self
            .post_paginated(&format!("v1/databases/{}/query", object), body)
            .await?;
        let records: Vec<Record> = pages
            .iter()
            .map(|p| {
                let mut flat = flatten_page(p);
                if !params.fields.is_empty() {
                    flat.retain(|k, _| k == "id" || params.fields.contains(k));
                }
                flat
            })
            .collect();
        info!(count = records.len(), database = object, "fetched Notion pages");
        Ok(records)
    }
}
