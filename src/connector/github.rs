//! GitHub connector: personal access token, repositories as objects, issues as records.
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::Deserialize;
use std::fmt;
use tracing::{info, instrument, warn};

use super::{http_client, Connector};
use crate::error::{ConnectorError, ConnectorResult};
use crate::model::{FieldInfo, ObjectInfo, ObjectSchema, QueryParams, Record};

const GITHUB_API_BASE: &str = "https://api.github.com/";
const ACCEPT: &str = "application/vnd.github.v3+json";

pub struct GitHubConnector {
    http: Client,
    base_url: Url,
    token: String,
}

impl fmt::Debug for GitHubConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitHubConnector")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct Repo {
    full_name: String,
}

impl GitHubConnector {
    pub fn new(token: String) -> Self {
        let base_url = Url::parse(GITHUB_API_BASE).expect("valid GitHub API URL");
        Self::with_base_url(token, base_url)
    }

    pub fn with_base_url(token: String, base_url: Url) -> Self {
        Self {
            http: http_client(),
            base_url,
            token,
        }
    }

    fn get(&self, path: &str) -> ConnectorResult<RequestBuilder> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| ConnectorError::DataExtraction(e.to_string()))?;
        Ok(self
            .http
            .get(url)
            .header("Authorization", format!("token {}", self.token))
            .header("Accept", ACCEPT))
    }

    /// A PAT is valid iff `GET /user` answers 200.
    pub async fn is_token_valid(&self) -> bool {
        let req = match self.get("user") {
            Ok(req) => req,
            Err(_) => return false,
        };
        match req.send().await {
            Ok(res) => res.status() == StatusCode::OK,
            Err(err) => {
                warn!(?err, "GitHub token check failed");
                false
            }
        }
    }
}

#[async_trait]
impl Connector for GitHubConnector {
    fn name(&self) -> &'static str {
        "GitHub"
    }

    async fn authenticate(&self) -> ConnectorResult<()> {
        if self.is_token_valid().await {
            Ok(())
        } else {
            Err(ConnectorError::Authentication("Invalid token".into()))
        }
    }

    async fn validate_connection(&self) -> ConnectorResult<()> {
        self.authenticate().await
    }

    #[instrument(skip_all)]
    async fn list_objects(&self) -> ConnectorResult<Vec<ObjectInfo>> {
        let res = self.get("user/repos")?.send().await?;
        if !res.status().is_success() {
            return Err(ConnectorError::from_response("GitHub", res).await);
        }
        let repos: Vec<Repo> = res.json().await?;
        info!(count = repos.len(), "listed GitHub repositories");
        Ok(repos
            .into_iter()
            .map(|r| ObjectInfo {
                id: r.full_name.clone(),
                name: r.full_name,
            })
            .collect())
    }

    async fn fetch_schema(&self, object: &str) -> ConnectorResult<ObjectSchema> {
        let fields = [
            ("title", "string"),
            ("state", "string"),
            ("created_at", "datetime"),
        ]
        .into_iter()
        .map(|(name, typ)| (name.to_string(), FieldInfo::typed(typ)))
        .collect();
        Ok(ObjectSchema {
            name: object.to_string(),
            label: None,
            fields,
            timestamp: Utc::now(),
        })
    }

    /// Issues of the repository `owner/name`; `filters.since` narrows to recently updated ones.
    #[instrument(skip(self, params))]
    async fn fetch_data(&self, object: &str, params: &QueryParams) -> ConnectorResult<Vec<Record>> {
        let mut req = self.get(&format!("repos/{}/issues", object))?;
        if let Some(since) = params
            .filters
            .as_ref()
            .and_then(|f| f.get("since"))
            .and_then(|s| s.as_str())
        {
            req = req.query(&[("since", since)]);
        }
        if let Some(limit) = params.limit {
            req = req.query(&[("per_page", limit.min(100))]);
        }
        let res = req.send().await?;
        if !res.status().is_success() {
            return Err(ConnectorError::from_response("GitHub", res).await);
        }
        let issues: Vec<Record> = res.json().await?;
        info!(count = issues.len(), repo = object, "fetched GitHub issues");
        Ok(issues)
    }
}
