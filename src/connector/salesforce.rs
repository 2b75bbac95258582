//! Salesforce REST connector: password-grant OAuth, SOQL queries, sObject describe.
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument};

use super::{http_client, Connector, RateLimiter};
use crate::config::SalesforceCredentials;
use crate::error::{ConnectorError, ConnectorResult};
use crate::model::{FieldInfo, ObjectInfo, ObjectSchema, QueryParams, Record};

const LOGIN_URL: &str = "https://login.salesforce.com/";
const SANDBOX_LOGIN_URL: &str = "https://test.salesforce.com/";
pub const DEFAULT_FIELDS: [&str; 4] = ["Id", "Name", "CreatedDate", "LastModifiedDate"];

pub struct SalesforceConnector {
    http: Client,
    creds: SalesforceCredentials,
    login_url: Url,
    session: RwLock<Option<Session>>,
    limiter: RateLimiter,
}

#[derive(Debug, Clone)]
struct Session {
    access_token: String,
    instance_url: String,
}

impl fmt::Debug for SalesforceConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SalesforceConnector")
            .field("login_url", &self.login_url)
            .field("username", &self.creds.username)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    instance_url: Option<String>,
}

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(default)]
    records: Vec<Record>,
    #[serde(rename = "nextRecordsUrl")]
    next_records_url: Option<String>,
}

#[derive(Deserialize)]
struct DescribeResponse {
    name: Option<String>,
    label: Option<String>,
    #[serde(default)]
    fields: Vec<DescribeField>,
}

#[derive(Deserialize)]
struct DescribeField {
    name: String,
    #[serde(rename = "type")]
    typ: String,
    label: Option<String>,
    length: Option<i64>,
    nillable: Option<bool>,
    createable: Option<bool>,
    updateable: Option<bool>,
}

impl SalesforceConnector {
    pub fn new(creds: SalesforceCredentials) -> Self {
        let login = if creds.sandbox { SANDBOX_LOGIN_URL } else { LOGIN_URL };
        let login_url = Url::parse(login).expect("valid Salesforce login URL");
        Self::with_login_url(creds, login_url)
    }

    pub fn with_login_url(creds: SalesforceCredentials, login_url: Url) -> Self {
        Self {
            http: http_client(),
            creds,
            login_url,
            session: RwLock::new(None),
            limiter: RateLimiter::salesforce(),
        }
    }

    async fn session(&self) -> ConnectorResult<Session> {
        self.session
            .read()
            .await
            .clone()
            .ok_or_else(|| ConnectorError::Authentication("no Salesforce session".into()))
    }

    fn data_url(&self, session: &Session, suffix: &str) -> String {
        format!(
            "{}/services/data/v{}/{}",
            session.instance_url.trim_end_matches('/'),
            self.creds.api_version,
            suffix
        )
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: &str) -> ConnectorResult<T> {
        let session = self.session().await?;
        self.limiter.acquire().await;
        let res = self
            .http
            .get(url)
            .bearer_auth(&session.access_token)
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(ConnectorError::from_response("Salesforce", res).await);
        }
        Ok(res.json::<T>().await?)
    }
}

/// Build the SOQL statement for `object`.
pub fn build_soql(object: &str, params: &QueryParams) -> String {
    let fields = if params.fields.is_empty() {
        DEFAULT_FIELDS.join(", ")
    } else {
        params.fields.join(", ")
    };
    let mut query = format!("SELECT {} FROM {}", fields, object);
    if let Some(w) = params.where_clause.as_deref().filter(|w| !w.is_empty()) {
        query.push_str(" WHERE ");
        query.push_str(w);
    }
    if let Some(o) = params.order_by.as_deref().filter(|o| !o.is_empty()) {
        query.push_str(" ORDER BY ");
        query.push_str(o);
    }
    if let Some(limit) = params.limit {
        query.push_str(&format!(" LIMIT {}", limit));
    }
    query
}

#[async_trait]
impl Connector for SalesforceConnector {
    fn name(&self) -> &'static str {
        "Salesforce"
    }

    #[instrument(skip_all)]
    async fn authenticate(&self) -> ConnectorResult<()> {
        let url = self
            .login_url
            .join("services/oauth2/token")
            .map_err(|e| ConnectorError::Authentication(e.to_string()))?;
        let mut password = self.creds.password.clone();
        if let Some(token) = &self.creds.security_token {
            password.push_str(token);
        }
        let form = [
            ("grant_type", "password"),
            ("client_id", self.creds.client_id.as_str()),
            ("client_secret", self.creds.client_secret.as_str()),
            ("username", self.creds.username.as_str()),
            ("password", password.as_str()),
        ];
        let res = self.http.post(url).form(&form).send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            error!(%status, "Salesforce authentication failed");
            return Err(ConnectorError::Authentication(format!("{}: {}", status, body)));
        }
        let token: TokenResponse = res.json().await?;
        let instance_url = token
            .instance_url
            .or_else(|| self.creds.instance_url.clone())
            .unwrap_or_default();
        *self.session.write().await = Some(Session {
            access_token: token.access_token,
            instance_url,
        });
        info!("authenticated with Salesforce");
        Ok(())
    }

    async fn validate_connection(&self) -> ConnectorResult<()> {
        let Some(session) = self.session.read().await.clone() else {
            return self.authenticate().await;
        };
        let res = self
            .http
            .get(self.data_url(&session, "sobjects"))
            .bearer_auth(&session.access_token)
            .send()
            .await?;
        match res.status() {
            s if s.is_success() => Ok(()),
            StatusCode::UNAUTHORIZED => {
                info!("Salesforce access token expired, reauthenticating");
                self.authenticate().await
            }
            _ => Err(ConnectorError::from_response("Salesforce", res).await),
        }
    }

    async fn list_objects(&self) -> ConnectorResult<Vec<ObjectInfo>> {
        self.validate_connection().await?;
        let session = self.session().await?;
        let body: Value = self.get_json(&self.data_url(&session, "sobjects")).await?;
        let objects = body["sobjects"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|o| {
                        let name = o["name"].as_str()?;
                        Some(ObjectInfo {
                            id: name.to_string(),
                            name: o["label"].as_str().unwrap_or(name).to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(objects)
    }

    #[instrument(skip(self))]
    async fn fetch_schema(&self, object: &str) -> ConnectorResult<ObjectSchema> {
        self.validate_connection().await?;
        let session = self.session().await?;
        let url = self.data_url(&session, &format!("sobjects/{}/describe", object));
        let describe: DescribeResponse = self.get_json(&url).await?;
        let fields: BTreeMap<String, FieldInfo> = describe
            .fields
            .into_iter()
            .map(|f| {
                (
                    f.name,
                    FieldInfo {
                        typ: Some(f.typ),
                        label: f.label,
                        length: f.length,
                        nillable: Some(f.nillable.unwrap_or(true)),
                        createable: Some(f.createable.unwrap_or(false)),
                        updateable: Some(f.updateable.unwrap_or(false)),
                        description: None,
                    },
                )
            })
            .collect();
        Ok(ObjectSchema {
            name: describe.name.unwrap_or_else(|| object.to_string()),
            label: describe.label,
            fields,
            timestamp: Utc::now(),
        })
    }

    #[instrument(skip(self, params))]
    async fn fetch_data(&self, object: &str, params: &QueryParams) -> ConnectorResult<Vec<Record>> {
        self.validate_connection().await?;
        let session = self.session().await?;
        let soql = build_soql(object, params);
        debug!(%soql, "SOQL query");

        let mut url = Url::parse(&self.data_url(&session, "query"))
            .map_err(|e| ConnectorError::DataExtraction(e.to_string()))?;
        url.query_pairs_mut().append_pair("q", &soql);
        let first: QueryResponse = self.get_json(url.as_str()).await?;
        let mut records = first.records;
        let mut next = first.next_records_url;

        while let Some(path) = next.take() {
            debug!(%path, "fetching next batch");
            let next_url = format!("{}{}", session.instance_url.trim_end_matches('/'), path);
            match self.get_json::<QueryResponse>(&next_url).await {
                Ok(page) => {
                    records.extend(page.records);
                    next = page.next_records_url;
                }
                Err(err) => {
                    error!(?err, "error fetching next batch; returning partial result");
                    break;
                }
            }
        }

        for record in records.iter_mut() {
            record.remove("attributes");
        }
        info!(count = records.len(), object, "fetched Salesforce records");
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn soql_uses_default_fields() {
        let q = build_soql("Account", &QueryParams::default());
        assert_eq!(q, "SELECT Id, Name, CreatedDate, LastModifiedDate FROM Account");
    }

    #[test]
    fn soql_includes_all_clauses_in_order() {
        let params = QueryParams {
            fields: vec!["Id".into(), "Email".into()],
            where_clause: Some("LastModifiedDate >= 2024-01-01T00:00:00Z".into()),
            order_by: Some("LastModifiedDate ASC".into()),
            limit: Some(2000),
            filters: None,
        };
        assert_eq!(
            build_soql("Contact", &params),
            "SELECT Id, Email FROM Contact WHERE LastModifiedDate >= 2024-01-01T00:00:00Z ORDER BY LastModifiedDate ASC LIMIT 2000"
        );
    }

    #[test]
    fn sandbox_uses_test_login_host() {
        let creds = SalesforceCredentials {
            client_id: "id".into(),
            client_secret: "secret".into(),
            username: "u".into(),
            password: "p".into(),
            security_token: None,
            sandbox: true,
            instance_url: None,
            api_version: "57.0".into(),
        };
        let c = SalesforceConnector::new(creds);
        assert_eq!(c.login_url.host_str(), Some("test.salesforce.com"));
    }
}
