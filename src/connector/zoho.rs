//! Zoho CRM v2 connector.
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use tracing::{error, info, instrument};

use super::{http_client, Connector, RateLimiter, TokenCell};
use crate::config::ZohoCredentials;
use crate::error::{ConnectorError, ConnectorResult};
use crate::model::{FieldInfo, ObjectInfo, ObjectSchema, QueryParams, Record};

const API_DOMAIN: &str = "https://www.zohoapis.com/";
const ACCOUNTS_URL: &str = "https://accounts.zoho.com/";
const PER_PAGE: u32 = 200;

pub struct ZohoConnector {
    http: Client,
    creds: ZohoCredentials,
    api_domain: Url,
    accounts_url: Url,
    token: TokenCell,
    limiter: RateLimiter,
}

impl fmt::Debug for ZohoConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZohoConnector")
            .field("api_domain", &self.api_domain)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct PageInfo {
    #[serde(default)]
    more_records: bool,
}

#[derive(Deserialize)]
struct RecordsPage {
    #[serde(default)]
    data: Vec<Record>,
    info: Option<PageInfo>,
}

impl ZohoConnector {
    pub fn new(creds: ZohoCredentials) -> Self {
        let api = Url::parse(API_DOMAIN).expect("valid Zoho API URL");
        let accounts = Url::parse(ACCOUNTS_URL).expect("valid Zoho accounts URL");
        Self::with_endpoints(creds, api, accounts)
    }

    pub fn with_endpoints(creds: ZohoCredentials, api_domain: Url, accounts_url: Url) -> Self {
        let token = TokenCell::new(creds.access_token.clone());
        Self {
            http: http_client(),
            creds,
            api_domain,
            accounts_url,
            token,
            limiter: RateLimiter::zoho(),
        }
    }

    fn url(&self, path: &str) -> ConnectorResult<Url> {
        self.api_domain
            .join(path)
            .map_err(|e| ConnectorError::DataExtraction(e.to_string()))
    }

    async fn authed(&self, builder: RequestBuilder) -> ConnectorResult<RequestBuilder> {
        let token = self.token.require().await?;
        Ok(builder.header("Authorization", format!("Zoho-oauthtoken {}", token)))
    }

    async fn get_json(&self, url: Url) -> ConnectorResult<Option<Value>> {
        self.limiter.acquire().await;
        let res = self.authed(self.http.get(url)).await?.send().await?;
        // Zoho answers 204 for an empty module.
        if res.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !res.status().is_success() {
            return Err(ConnectorError::from_response("Zoho", res).await);
        }
        Ok(Some(res.json().await?))
    }
}

/// `Modified_Time > since` from the incremental filter, if present.
fn modified_since(params: &QueryParams) -> Option<String> {
    params
        .filters
        .as_ref()?
        .get("Modified_Time")?
        .get("gt")?
        .as_str()
        .map(str::to_string)
}

#[async_trait]
impl Connector for ZohoConnector {
    fn name(&self) -> &'static str {
        "Zoho"
    }

    #[instrument(skip_all)]
    async fn authenticate(&self) -> ConnectorResult<()> {
        let url = self
            .accounts_url
            .join("oauth/v2/token")
            .map_err(|e| ConnectorError::Authentication(e.to_string()))?;
        let params = [
            ("refresh_token", self.creds.refresh_token.as_str()),
            ("client_id", self.creds.client_id.as_str()),
            ("client_secret", self.creds.client_secret.as_str()),
            ("grant_type", "refresh_token"),
        ];
        let res = self.http.post(url).query(&params).send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            error!(%status, "Zoho authentication failed");
            return Err(ConnectorError::Authentication(format!("{}: {}", status, body)));
        }
        let body: Value = res.json().await?;
        let Some(token) = body["access_token"].as_str() else {
            let reason = body["error"].as_str().unwrap_or("no access_token in response");
            return Err(ConnectorError::Authentication(reason.to_string()));
        };
        self.token.set(token.to_string()).await;
        info!("Zoho authentication successful");
        Ok(())
    }

    async fn validate_connection(&self) -> ConnectorResult<()> {
        if self.token.get().await.is_none() {
            return self.authenticate().await;
        }
        let res = self
            .authed(self.http.get(self.url("crm/v2/users")?))
            .await?
            .send()
            .await?;
        match res.status() {
            s if s.is_success() => Ok(()),
            StatusCode::UNAUTHORIZED => {
                info!("Zoho access token expired, reauthenticating");
                self.authenticate().await
            }
            _ => Err(ConnectorError::from_response("Zoho", res).await),
        }
    }

    async fn list_objects(&self) -> ConnectorResult<Vec<ObjectInfo>> {
        self.validate_connection().await?;
        let body = self
            .get_json(self.url("crm/v2/settings/modules")?)
            .await?
            .unwrap_or_default();
        Ok(body["modules"]
            .as_array()
            .map(|mods| {
                mods.iter()
                    .filter_map(|m| {
                        let api_name = m["api_name"].as_str()?;
                        Some(ObjectInfo {
                            id: api_name.to_string(),
                            name: m["module_name"].as_str().unwrap_or(api_name).to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fetch_schema(&self, object: &str) -> ConnectorResult<ObjectSchema> {
        self.validate_connection().await?;
        let mut url = self.url("crm/v2/settings/fields")?;
        url.query_pairs_mut().append_pair("module", object);
        let body = self.get_json(url).await?.unwrap_or_default();
        let fields = body["fields"]
            .as_array()
            .map(|fields| {
                fields
                    .iter()
                    .filter_map(|f| {
                        let api_name = f["api_name"].as_str()?;
                        Some((
                            api_name.to_string(),
                            FieldInfo {
                                typ: f["data_type"].as_str().map(str::to_string),
                                label: f["field_label"].as_str().map(str::to_string),
                                length: f["length"].as_i64(),
                                nillable: Some(!f["system_mandatory"].as_bool().unwrap_or(false)),
                                ..Default::default()
                            },
                        ))
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(ObjectSchema {
            name: object.to_string(),
            label: Some(object.to_string()),
            fields,
            timestamp: Utc::now(),
        })
    }

    #[instrument(skip(self, params))]
    async fn fetch_data(&self, object: &str, params: &QueryParams) -> ConnectorResult<Vec<Record>> {
        self.validate_connection().await?;
        let since = modified_since(params);
        let mut records = Vec::new();
        let mut page = 1u32;

        loop {
            let mut url = self.url(&format!("crm/v2/{}", object))?;
            {
                let mut q = url.query_pairs_mut();
                q.append_pair("per_page", &PER_PAGE.to_string());
                q.append_pair("page", &page.to_string());
                if !params.fields.is_empty() {
                    q.append_pair("fields", &params.fields.join(","));
                }
            }

            self.limiter.acquire().await;
            let mut req = self.authed(self.http.get(url)).await?;
            if let Some(since) = &since {
                req = req.header("If-Modified-Since", since);
            }
            let res = req.send().await?;
            match res.status() {
                StatusCode::NO_CONTENT | StatusCode::NOT_MODIFIED => break,
                s if s.is_success() => {
                    let body: RecordsPage = res.json().await?;
                    records.extend(body.data);
                    if !body.info.map(|i| i.more_records).unwrap_or(false) {
                        break;
                    }
                    page += 1;
                }
                _ => {
                    let err = ConnectorError::from_response("Zoho", res).await;
                    if records.is_empty() {
                        return Err(err);
                    }
                    error!(?err, page, "failed to fetch page; returning partial result");
                    break;
                }
            }
        }

        info!(count = records.len(), object, "fetched Zoho records");
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn modified_since_reads_incremental_filter() {
        let params = QueryParams {
            filters: Some(json!({"Modified_Time": {"gt": "2024-05-01T00:00:00+00:00"}})),
            ..Default::default()
        };
        assert_eq!(modified_since(&params).as_deref(), Some("2024-05-01T00:00:00+00:00"));
        assert_eq!(modified_since(&QueryParams::default()), None);
    }
}
