//! SugarCRM REST v11 connector.
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{error, info, instrument};

use super::{http_client, Connector, RateLimiter, TokenCell};
use crate::config::SugarCrmCredentials;
use crate::error::{ConnectorError, ConnectorResult};
use crate::model::{FieldInfo, ObjectSchema, QueryParams, Record};

const DEFAULT_LIMIT: u32 = 100;

pub struct SugarCrmConnector {
    http: Client,
    creds: SugarCrmCredentials,
    token: TokenCell,
    limiter: RateLimiter,
}

impl fmt::Debug for SugarCrmConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SugarCrmConnector")
            .field("base_url", &self.creds.base_url)
            .finish_non_exhaustive()
    }
}

impl SugarCrmConnector {
    pub fn new(creds: SugarCrmCredentials) -> Self {
        Self {
            http: http_client(),
            creds,
            token: TokenCell::default(),
            limiter: RateLimiter::sugarcrm(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.creds.base_url.trim_end_matches('/'), path)
    }
}

/// Request body for `POST /rest/v11/{module}/filter`.
pub fn filter_body(params: &QueryParams) -> Value {
    let mut body = json!({
        "max_num": params.limit.unwrap_or(DEFAULT_LIMIT),
    });
    if let Some(filters) = &params.filters {
        body["filter"] = match filters {
            Value::Array(_) => filters.clone(),
            other => json!([other]),
        };
    }
    if !params.fields.is_empty() {
        body["fields"] = Value::String(params.fields.join(","));
    }
    body
}

#[async_trait]
impl Connector for SugarCrmConnector {
    fn name(&self) -> &'static str {
        "SugarCRM"
    }

    #[instrument(skip_all)]
    async fn authenticate(&self) -> ConnectorResult<()> {
        let form = [
            ("grant_type", "password"),
            ("client_id", self.creds.client_id.as_str()),
            ("client_secret", self.creds.client_secret.as_str()),
            ("username", self.creds.username.as_str()),
            ("password", self.creds.password.as_str()),
        ];
        let res = self
            .http
            .post(self.url("oauth2/token"))
            .form(&form)
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            error!(%status, "SugarCRM authentication failed");
            return Err(ConnectorError::Authentication(format!("{}: {}", status, body)));
        }
        let body: Value = res.json().await?;
        let token = body["access_token"]
            .as_str()
            .ok_or_else(|| ConnectorError::Authentication("no access_token in response".into()))?;
        self.token.set(token.to_string()).await;
        info!("authenticated with SugarCRM");
        Ok(())
    }

    async fn validate_connection(&self) -> ConnectorResult<()> {
        let Some(token) = self.token.get().await else {
            return self.authenticate().await;
        };
        let res = self
            .http
            .get(self.url("rest/v11/me"))
            .bearer_auth(token)
            .send()
            .await?;
        match res.status() {
            s if s.is_success() => Ok(()),
            StatusCode::UNAUTHORIZED => self.authenticate().await,
            _ => Err(ConnectorError::from_response("SugarCRM", res).await),
        }
    }

    async fn fetch_schema(&self, object: &str) -> ConnectorResult<ObjectSchema> {
        self.validate_connection().await?;
        let token = self.token.require().await?;
        self.limiter.acquire().await;
        let res = self
            .http
            .get(self.url(&format!("rest/v11/{}/fields", object)))
            .bearer_auth(token)
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(ConnectorError::from_response("SugarCRM", res).await);
        }
        let body: Value = res.json().await?;
        let fields: BTreeMap<String, FieldInfo> = body["fields"]
            .as_object()
            .map(|fields| {
                fields
                    .iter()
                    .map(|(name, def)| {
                        (
                            name.clone(),
                            FieldInfo {
                                typ: def["type"].as_str().map(str::to_string),
                                label: def["vname"].as_str().map(str::to_string),
                                length: def["len"]
                                    .as_i64()
                                    .or_else(|| def["len"].as_str().and_then(|s| s.parse().ok())),
                                nillable: def["required"].as_bool().map(|r| !r),
                                ..Default::default()
                            },
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(ObjectSchema {
            name: object.to_string(),
            label: None,
            fields,
            timestamp: Utc::now(),
        })
    }

    #[instrument(skip(self, params))]
    async fn fetch_data(&self, object: &str, params: &QueryParams) -> ConnectorResult<Vec<Record>> {
        self.validate_connection().await?;
        let token = self.token.require().await?;
        self.limiter.acquire().await;

        let req = if params.filters.is_some() {
            self.http
                .post(self.url(&format!("rest/v11/{}/filter", object)))
                .json(&filter_body(params))
        } else {
            let mut query = vec![(
                "max_num".to_string(),
                params.limit.unwrap_or(DEFAULT_LIMIT).to_string(),
            )];
            if !params.fields.is_empty() {
                query.push(("fields".to_string(), params.fields.join(",")));
            }
            self.http
                .get(self.url(&format!("rest/v11/{}", object)))
                .query(&query)
        };
        let res = req.bearer_auth(token).send().await?;
        if !res.status().is_success() {
            return Err(ConnectorError::from_response("SugarCRM", res).await);
        }
        let body: Value = res.json().await?;
        let records: Vec<Record> = body["records"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|r| r.as_object().cloned())
                    .collect()
            })
            .unwrap_or_default();
        info!(count = records.len(), object, "fetched SugarCRM records");
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_body_wraps_single_filter() {
        let params = QueryParams {
            fields: vec!["id".into(), "name".into()],
            limit: Some(50),
            filters: Some(json!({"date_modified": {"$gte": "2024-01-01"}})),
            ..Default::default()
        };
        let body = filter_body(&params);
        assert_eq!(body["max_num"], 50);
        assert_eq!(body["filter"][0]["date_modified"]["$gte"], "2024-01-01");
        assert_eq!(body["fields"], "id,name");
    }

    #[test]
    fn filter_body_defaults_limit() {
        let body = filter_body(&QueryParams::default());
        assert_eq!(body["max_num"], 100);
        assert!(body.get("filter").is_none());
    }
}
