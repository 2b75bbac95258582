//! Meta Marketing API (Graph API) connector for ad accounts.
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tokio::sync::RwLock;
use tracing::{error, info, instrument, warn};

use super::{http_client, Connector, RateLimiter};
use crate::config::MetaAdsCredentials;
use crate::error::{ConnectorError, ConnectorResult};
use crate::model::{FieldInfo, ObjectInfo, ObjectSchema, QueryParams, Record};

const GRAPH_API_BASE: &str = "https://graph.facebook.com/";
/// Graph error code for an invalid or expired access token.
const INVALID_TOKEN_CODE: i64 = 190;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdObject {
    Campaigns,
    AdSets,
    Ads,
    Insights,
}

impl AdObject {
    pub const ALL: [AdObject; 4] = [
        AdObject::Campaigns,
        AdObject::AdSets,
        AdObject::Ads,
        AdObject::Insights,
    ];

    pub fn edge(&self) -> &'static str {
        match self {
            AdObject::Campaigns => "campaigns",
            AdObject::AdSets => "adsets",
            AdObject::Ads => "ads",
            AdObject::Insights => "insights",
        }
    }

    fn record_type(&self) -> &'static str {
        match self {
            AdObject::Campaigns => "campaign",
            AdObject::AdSets => "adset",
            AdObject::Ads => "ad",
            AdObject::Insights => "insights",
        }
    }

    pub fn default_fields(&self) -> &'static [&'static str] {
        match self {
            AdObject::Campaigns => &[
                "id", "name", "status", "objective", "created_time", "updated_time",
                "start_time", "stop_time", "budget_remaining", "daily_budget", "lifetime_budget",
            ],
            AdObject::AdSets => &[
                "id", "name", "status", "campaign_id", "created_time", "updated_time",
                "start_time", "end_time", "daily_budget", "lifetime_budget", "bid_strategy",
                "optimization_goal", "targeting",
            ],
            AdObject::Ads => &[
                "id", "name", "status", "campaign_id", "adset_id", "created_time",
                "updated_time", "creative", "tracking_specs", "conversion_specs",
            ],
            AdObject::Insights => &[
                "impressions", "clicks", "spend", "reach", "frequency", "cpm", "cpc", "ctr",
                "conversions", "conversion_rate_ranking", "quality_ranking",
                "engagement_rate_ranking", "video_play_actions", "video_p25_watched_actions",
                "video_p50_watched_actions", "video_p75_watched_actions",
                "video_p100_watched_actions",
            ],
        }
    }

    fn schema_fields(&self) -> BTreeMap<String, FieldInfo> {
        let defs: &[(&str, &str, &str)] = match self {
            AdObject::Campaigns => &[
                ("id", "string", "Campaign ID"),
                ("name", "string", "Campaign name"),
                ("status", "string", "Campaign status"),
                ("objective", "string", "Campaign objective"),
                ("created_time", "datetime", "Creation timestamp"),
                ("updated_time", "datetime", "Last update timestamp"),
                ("start_time", "datetime", "Campaign start time"),
                ("stop_time", "datetime", "Campaign stop time"),
                ("budget_remaining", "number", "Remaining budget"),
                ("daily_budget", "number", "Daily budget"),
                ("lifetime_budget", "number", "Lifetime budget"),
            ],
            AdObject::AdSets => &[
                ("id", "string", "Adset ID"),
                ("name", "string", "Adset name"),
                ("status", "string", "Adset status"),
                ("campaign_id", "string", "Parent campaign ID"),
                ("created_time", "datetime", "Creation timestamp"),
                ("updated_time", "datetime", "Last update timestamp"),
                ("optimization_goal", "string", "Optimization goal"),
                ("bid_strategy", "string", "Bidding strategy"),
                ("targeting", "object", "Targeting criteria"),
            ],
            AdObject::Ads => &[
                ("id", "string", "Ad ID"),
                ("name", "string", "Ad name"),
                ("status", "string", "Ad status"),
                ("campaign_id", "string", "Parent campaign ID"),
                ("adset_id", "string", "Parent adset ID"),
                ("created_time", "datetime", "Creation timestamp"),
                ("creative", "object", "Ad creative information"),
            ],
            AdObject::Insights => &[
                ("impressions", "number", "Number of impressions"),
                ("clicks", "number", "Number of clicks"),
                ("spend", "number", "Amount spent"),
                ("reach", "number", "Number of people reached"),
                ("cpm", "number", "Cost per thousand impressions"),
                ("cpc", "number", "Cost per click"),
                ("ctr", "number", "Click-through rate"),
                ("conversions", "number", "Number of conversions"),
            ],
        };
        defs.iter()
            .map(|(name, typ, desc)| (name.to_string(), FieldInfo::described(typ, desc)))
            .collect()
    }
}

impl FromStr for AdObject {
    type Err = ConnectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "campaigns" => Ok(AdObject::Campaigns),
            "adsets" => Ok(AdObject::AdSets),
            "ads" => Ok(AdObject::Ads),
            "insights" => Ok(AdObject::Insights),
            other => Err(ConnectorError::DataExtraction(format!(
                "unsupported object type: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdAccount {
    pub id: Option<String>,
    pub name: Option<String>,
    #[serde(alias = "account_status")]
    pub status: Option<i64>,
    pub currency: Option<String>,
    #[serde(alias = "timezone_name")]
    pub timezone: Option<String>,
}

pub struct MetaAdsConnector {
    http: Client,
    creds: MetaAdsCredentials,
    ad_account_id: String,
    base_url: Url,
    verified: RwLock<bool>,
    limiter: RateLimiter,
}

impl fmt::Debug for MetaAdsConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetaAdsConnector")
            .field("ad_account_id", &self.ad_account_id)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct GraphPage {
    #[serde(default)]
    data: Vec<Record>,
    paging: Option<Paging>,
}

#[derive(Deserialize)]
struct Paging {
    next: Option<String>,
}

/// Ad account ids are addressed as `act_<id>`.
pub fn normalize_account_id(id: &str) -> String {
    let id = id.trim();
    if id.starts_with("act_") {
        id.to_string()
    } else {
        format!("act_{}", id)
    }
}

/// `appsecret_proof` is HMAC-SHA256 of the access token keyed by the app secret.
pub fn appsecret_proof(app_secret: &str, access_token: &str) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(app_secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(access_token.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

impl MetaAdsConnector {
    pub fn new(creds: MetaAdsCredentials) -> Self {
        let base = Url::parse(GRAPH_API_BASE)
            .and_then(|u| u.join(&format!("{}/", creds.api_version)))
            .expect("valid Graph API URL");
        Self::with_base_url(creds, base)
    }

    pub fn with_base_url(creds: MetaAdsCredentials, base_url: Url) -> Self {
        let ad_account_id = normalize_account_id(&creds.ad_account_id);
        Self {
            http: http_client(),
            creds,
            ad_account_id,
            base_url,
            verified: RwLock::new(false),
            limiter: RateLimiter::meta_ads(),
        }
    }

    pub fn ad_account_id(&self) -> &str {
        &self.ad_account_id
    }

    fn auth_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![("access_token".to_string(), self.creds.access_token.clone())];
        if let Some(secret) = self.creds.app_secret.as_deref().filter(|s| !s.is_empty()) {
            pairs.push((
                "appsecret_proof".to_string(),
                appsecret_proof(secret, &self.creds.access_token),
            ));
        }
        pairs
    }

    async fn graph_get(&self, url: Url, query: &[(String, String)]) -> ConnectorResult<Value> {
        self.limiter.acquire().await;
        let res = self.http.get(url).query(query).send().await?;
        if res.status().is_success() {
            return Ok(res.json().await?);
        }
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        let code = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v["error"]["code"].as_i64());
        if code == Some(INVALID_TOKEN_CODE) {
            error!("Meta access token is invalid or expired");
            return Err(ConnectorError::Authentication(body));
        }
        Err(ConnectorError::Api {
            provider: "Meta Ads",
            status,
            body,
        })
    }

    /// Follow `paging.next` until exhausted. Only a first-page failure is an
    /// error; later failures keep what was already fetched.
    async fn collect_pages(&self, url: Url, query: Vec<(String, String)>) -> ConnectorResult<Vec<Record>> {
        let mut page: GraphPage = serde_json::from_value(self.graph_get(url, &query).await?)
            .map_err(|e| ConnectorError::Transformation(e.to_string()))?;
        let mut records = std::mem::take(&mut page.data);
        while let Some(next) = page.paging.take().and_then(|p| p.next) {
            match self.next_page(&next).await {
                Ok(mut next_page) => {
                    records.append(&mut next_page.data);
                    page = next_page;
                }
                Err(e) => {
                    error!(error = %e, fetched = records.len(), "Meta paging stopped early");
                    break;
                }
            }
        }
        Ok(records)
    }

    async fn next_page(&self, next: &str) -> ConnectorResult<GraphPage> {
        let url = Url::parse(next).map_err(|e| ConnectorError::DataExtraction(e.to_string()))?;
        serde_json::from_value(self.graph_get(url, &[]).await?)
            .map_err(|e| ConnectorError::Transformation(e.to_string()))
    }

    /// Ad accounts visible to the authenticated user.
    pub async fn ad_accounts(&self) -> ConnectorResult<Vec<AdAccount>> {
        self.validate_connection().await?;
        let url = self
            .base_url
            .join("me/adaccounts")
            .map_err(|e| ConnectorError::DataExtraction(e.to_string()))?;
        let mut query = self.auth_pairs();
        query.push((
            "fields".into(),
            "id,name,account_status,currency,timezone_name".into(),
        ));
        let records = self.collect_pages(url, query).await?;
        records
            .into_iter()
            .map(|r| {
                serde_json::from_value(Value::Object(r))
                    .map_err(|e| ConnectorError::Transformation(e.to_string()))
            })
            .collect()
    }
}

/// RFC 3339 timestamp or bare `YYYY-MM-DD` date as Unix seconds.
fn unix_seconds(since: &str) -> Option<i64> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(since) {
        return Some(ts.timestamp());
    }
    let day: String = since.chars().take(10).collect();
    NaiveDate::parse_from_str(&day, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp())
}

/// Query for an ad object edge: insights get level and date window, the
/// other edges an `updated_time` filter when `updated_since` is set.
pub fn edge_query(object: AdObject, params: &QueryParams) -> Vec<(String, String)> {
    let fields = if params.fields.is_empty() {
        object.default_fields().join(",")
    } else {
        params.fields.join(",")
    };
    let mut query = vec![("fields".to_string(), fields)];
    if let Some(limit) = params.limit {
        query.push(("limit".into(), limit.to_string()));
    }
    if object != AdObject::Insights {
        let since = params
            .filters
            .as_ref()
            .and_then(|f| f["updated_since"].as_str())
            .and_then(unix_seconds);
        if let Some(since) = since {
            let filtering = json!([{
                "field": "updated_time",
                "operator": "GREATER_THAN",
                "value": since,
            }]);
            query.push(("filtering".into(), filtering.to_string()));
        }
    }
    if object == AdObject::Insights {
        let filters = params.filters.as_ref();
        let level = filters
            .and_then(|f| f["level"].as_str())
            .unwrap_or("ad")
            .to_string();
        query.push(("level".into(), level));
        match filters.map(|f| &f["time_range"]).filter(|v| v.is_object()) {
            Some(range) => query.push(("time_range".into(), range.to_string())),
            None => {
                let preset = filters
                    .and_then(|f| f["date_preset"].as_str())
                    .unwrap_or("last_30d");
                query.push(("date_preset".into(), preset.to_string()));
            }
        }
    }
    query
}

#[async_trait]
impl Connector for MetaAdsConnector {
    fn name(&self) -> &'static str {
        "Meta Ads"
    }

    #[instrument(skip_all)]
    async fn authenticate(&self) -> ConnectorResult<()> {
        let url = self
            .base_url
            .join("me")
            .map_err(|e| ConnectorError::Authentication(e.to_string()))?;
        let mut query = self.auth_pairs();
        query.push(("fields".into(), "id".into()));
        self.graph_get(url, &query).await?;
        *self.verified.write().await = true;
        info!("authenticated with Meta Ads API");
        Ok(())
    }

    async fn validate_connection(&self) -> ConnectorResult<()> {
        if !*self.verified.read().await {
            return self.authenticate().await;
        }
        let url = self
            .base_url
            .join(&self.ad_account_id)
            .map_err(|e| ConnectorError::DataExtraction(e.to_string()))?;
        let mut query = self.auth_pairs();
        query.push(("fields".into(), "name,account_status".into()));
        let info = self.graph_get(url, &query).await?;
        info!(account = info["name"].as_str().unwrap_or_default(), "Meta connection valid");
        Ok(())
    }

    async fn list_objects(&self) -> ConnectorResult<Vec<ObjectInfo>> {
        Ok(AdObject::ALL
            .iter()
            .map(|o| ObjectInfo {
                id: o.edge().to_string(),
                name: o.edge().to_string(),
            })
            .collect())
    }

    async fn fetch_schema(&self, object: &str) -> ConnectorResult<ObjectSchema> {
        let fields = match object.parse::<AdObject>() {
            Ok(o) => o.schema_fields(),
            Err(_) => {
                warn!(object, "no static schema for object type");
                BTreeMap::new()
            }
        };
        Ok(ObjectSchema {
            name: object.to_string(),
            label: Some(self.ad_account_id.clone()),
            fields,
            timestamp: Utc::now(),
        })
    }

    #[instrument(skip(self, params))]
    async fn fetch_data(&self, object: &str, params: &QueryParams) -> ConnectorResult<Vec<Record>> {
        let ad_object: AdObject = object.parse()?;
        self.validate_connection().await?;

        let url = self
            .base_url
            .join(&format!("{}/{}", self.ad_account_id, ad_object.edge()))
            .map_err(|e| ConnectorError::DataExtraction(e.to_string()))?;
        let mut query = self.auth_pairs();
        query.extend(edge_query(ad_object, params));
        let level = query
            .iter()
            .find(|(k, _)| k == "level")
            .map(|(_, v)| v.clone());

        let mut records = self.collect_pages(url, query).await?;
        let extracted_at = Utc::now().to_rfc3339();
        for record in records.iter_mut() {
            record.insert("_object_type".into(), ad_object.record_type().into());
            record.insert("_ad_account_id".into(), self.ad_account_id.clone().into());
            record.insert("_extracted_at".into(), extracted_at.clone().into());
            if let Some(level) = &level {
                record.insert("_level".into(), level.clone().into());
            }
        }
        info!(count = records.len(), object, "fetched Meta Ads records");
        Ok(records)
    }
}
