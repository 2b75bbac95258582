//! API connector contract shared by every source system.
//!
//! A connector owns its HTTP client, credentials and any token it obtained.
//! Methods take `&self`; tokens live behind async locks so a single connector
//! can be shared by an extractor and a job runner.

use async_trait::async_trait;
use reqwest::Client;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::Config;
use crate::error::{ConnectorError, ConnectorResult};
use crate::model::{ObjectInfo, ObjectSchema, Provider, QueryParams, Record};

pub mod github;
pub mod meta_ads;
pub mod notion;
pub mod salesforce;
pub mod sugarcrm;
pub mod zoho;

pub use github::GitHubConnector;
pub use meta_ads::MetaAdsConnector;
pub use notion::NotionConnector;
pub use salesforce::SalesforceConnector;
pub use sugarcrm::SugarCrmConnector;
pub use zoho::ZohoConnector;

#[async_trait]
pub trait Connector: Send + Sync {
    /// Human-readable source name used in logs and summaries.
    fn name(&self) -> &'static str;

    /// Obtain (or re-obtain) an access token from the configured credentials.
    async fn authenticate(&self) -> ConnectorResult<()>;

    /// Make sure the connector holds a working token, authenticating once if needed.
    async fn validate_connection(&self) -> ConnectorResult<()>;

    /// Objects this source can extract (repos, databases, modules...).
    async fn list_objects(&self) -> ConnectorResult<Vec<ObjectInfo>> {
        Ok(Vec::new())
    }

    async fn fetch_schema(&self, object: &str) -> ConnectorResult<ObjectSchema>;

    async fn fetch_data(&self, object: &str, params: &QueryParams) -> ConnectorResult<Vec<Record>>;
}

/// Build the connector for `provider` from its credential block.
pub fn from_config(provider: Provider, cfg: &Config) -> ConnectorResult<Box<dyn Connector>> {
    let c = &cfg.connectors;
    let connector: Box<dyn Connector> = match provider {
        Provider::Salesforce => Box::new(SalesforceConnector::new(
            c.salesforce
                .clone()
                .ok_or(ConnectorError::NotConfigured("connectors.salesforce"))?,
        )),
        Provider::Zoho => Box::new(ZohoConnector::new(
            c.zoho
                .clone()
                .ok_or(ConnectorError::NotConfigured("connectors.zoho"))?,
        )),
        Provider::SugarCrm => Box::new(SugarCrmConnector::new(
            c.sugarcrm
                .clone()
                .ok_or(ConnectorError::NotConfigured("connectors.sugarcrm"))?,
        )),
        Provider::MetaAds => Box::new(MetaAdsConnector::new(
            c.meta_ads
                .clone()
                .ok_or(ConnectorError::NotConfigured("connectors.meta_ads"))?,
        )),
        Provider::GitHub => {
            let gh = c
                .github
                .as_ref()
                .ok_or(ConnectorError::NotConfigured("connectors.github"))?;
            Box::new(GitHubConnector::new(gh.token.clone()))
        }
        Provider::Notion => {
            let n = c
                .notion
                .as_ref()
                .ok_or(ConnectorError::NotConfigured("connectors.notion"))?;
            Box::new(NotionConnector::new(n.token.clone(), n.version.clone()))
        }
    };
    Ok(connector)
}

pub(crate) fn http_client() -> Client {
    Client::builder()
        .user_agent(concat!("data-extractors/", env!("CARGO_PKG_VERSION")))
        .no_proxy()
        .build()
        .expect("reqwest client")
}

/// Bearer token slot filled in by `authenticate`.
#[derive(Debug, Default)]
pub(crate) struct TokenCell(RwLock<Option<String>>);

impl TokenCell {
    pub(crate) fn new(initial: Option<String>) -> Self {
        Self(RwLock::new(initial.filter(|t| !t.trim().is_empty())))
    }

    pub(crate) async fn get(&self) -> Option<String> {
        self.0.read().await.clone()
    }

    pub(crate) async fn require(&self) -> ConnectorResult<String> {
        self.get()
            .await
            .ok_or_else(|| ConnectorError::Authentication("not authenticated".into()))
    }

    pub(crate) async fn set(&self, token: String) {
        *self.0.write().await = Some(token);
    }
}

/// Client-side throttle: a minimum gap between requests plus a burst cap
/// after which the caller cools down and the counter resets.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    burst_limit: u32,
    cooldown: Duration,
    state: Mutex<LimiterState>,
}

#[derive(Debug, Default)]
struct LimiterState {
    last: Option<Instant>,
    count: u32,
}

impl RateLimiter {
    pub fn new(min_interval: Duration, burst_limit: u32, cooldown: Duration) -> Self {
        Self {
            min_interval,
            burst_limit,
            cooldown,
            state: Mutex::new(LimiterState::default()),
        }
    }

    pub fn salesforce() -> Self {
        Self::new(Duration::from_millis(100), 100, Duration::from_secs(5))
    }

    pub fn zoho() -> Self {
        Self::new(Duration::from_millis(100), 100, Duration::from_secs(5))
    }

    pub fn sugarcrm() -> Self {
        Self::new(Duration::from_millis(200), 100, Duration::from_secs(3))
    }

    pub fn meta_ads() -> Self {
        Self::new(Duration::from_millis(100), 200, Duration::from_secs(3600))
    }

    /// Record a request issued at `now` and return how long the caller must wait first.
    pub fn reserve(&self, now: Instant) -> Duration {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if self.burst_limit > 0 && st.count >= self.burst_limit {
            st.count = 0;
            st.last = Some(now + self.cooldown);
            return self.cooldown;
        }
        let wait = match st.last {
            Some(last) if last > now => last - now + self.min_interval,
            Some(last) => self.min_interval.saturating_sub(now - last),
            None => Duration::ZERO,
        };
        st.last = Some(now + wait);
        st.count += 1;
        wait
    }

    pub async fn acquire(&self) {
        let wait = self.reserve(Instant::now());
        if !wait.is_zero() {
            debug!(wait_ms = wait.as_millis() as u64, "rate limiting");
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;

    #[test]
    fn limiter_spaces_requests() {
        let rl = RateLimiter::new(Duration::from_millis(100), 0, Duration::ZERO);
        let t0 = Instant::now();
        assert_eq!(rl.reserve(t0), Duration::ZERO);
        assert_eq!(rl.reserve(t0), Duration::from_millis(100));
        // Well after the gap: no wait.
        assert_eq!(rl.reserve(t0 + Duration::from_secs(5)), Duration::ZERO);
    }

    #[test]
    fn limiter_cools_down_after_burst() {
        let rl = RateLimiter::new(Duration::ZERO, 3, Duration::from_secs(5));
        let t0 = Instant::now();
        for i in 0..3 {
            assert_eq!(rl.reserve(t0 + Duration::from_secs(i)), Duration::ZERO);
        }
        assert_eq!(rl.reserve(t0 + Duration::from_secs(3)), Duration::from_secs(5));
        // Counter reset: the next request only waits out the cool-down remainder.
        assert_eq!(
            rl.reserve(t0 + Duration::from_secs(20)),
            Duration::ZERO
        );
    }

    #[test]
    fn factory_requires_credentials() {
        let cfg: Config = serde_yaml::from_str(config::example()).unwrap();
        let gh = from_config(Provider::GitHub, &cfg).unwrap();
        assert_eq!(gh.name(), "GitHub");

        let bare: Config = serde_yaml::from_str("app:\n  data_dir: \"/tmp\"\n").unwrap();
        let err = from_config(Provider::Notion, &bare).err().unwrap();
        assert!(matches!(err, ConnectorError::NotConfigured("connectors.notion")));
    }

    #[tokio::test]
    async fn token_cell_ignores_blank_initial() {
        let cell = TokenCell::new(Some("  ".into()));
        assert!(cell.get().await.is_none());
        assert!(cell.require().await.unwrap_err().is_auth());
        cell.set("abc".into()).await;
        assert_eq!(cell.require().await.unwrap(), "abc");
    }
}
