//! OAuth 2.0 authorization-code exchange for connector onboarding.
//!
//! Each call is independent: the caller keeps `state` and the PKCE verifier
//! between building the authorize URL and exchanging the returned code.
use base64::{engine::general_purpose::STANDARD, engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::{error, info, instrument};

use crate::config::{Config, OAuthClient};
use crate::connector::http_client;

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("unsupported OAuth provider: {0}")]
    UnknownProvider(String),
    #[error("no OAuth client configured for {0}")]
    NotConfigured(&'static str),
    #[error("missing parameter: {0}")]
    MissingParameter(&'static str),
    #[error("{provider} token endpoint returned {status}: {body}")]
    Provider {
        provider: &'static str,
        status: StatusCode,
        body: String,
    },
    #[error("no access_token in token response")]
    MissingToken,
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type OAuthResult<T> = std::result::Result<T, OAuthError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OAuthProvider {
    Salesforce,
    HubSpot,
    Zoho,
    MetaAds,
    Airtable,
    GoogleAnalytics,
}

impl OAuthProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            OAuthProvider::Salesforce => "salesforce",
            OAuthProvider::HubSpot => "hubspot",
            OAuthProvider::Zoho => "zoho",
            OAuthProvider::MetaAds => "meta_ads",
            OAuthProvider::Airtable => "airtable",
            OAuthProvider::GoogleAnalytics => "google_analytics",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            OAuthProvider::Salesforce => "Salesforce",
            OAuthProvider::HubSpot => "HubSpot",
            OAuthProvider::Zoho => "Zoho",
            OAuthProvider::MetaAds => "Meta Ads",
            OAuthProvider::Airtable => "Airtable",
            OAuthProvider::GoogleAnalytics => "Google Analytics",
        }
    }

    pub fn endpoints(&self) -> Endpoints {
        let (authorize, token) = match self {
            OAuthProvider::Salesforce => (
                "https://login.salesforce.com/services/oauth2/authorize",
                "https://login.salesforce.com/services/oauth2/token",
            ),
            OAuthProvider::HubSpot => (
                "https://app.hubspot.com/oauth/authorize",
                "https://api.hubapi.com/oauth/v1/token",
            ),
            OAuthProvider::Zoho => (
                "https://accounts.zoho.com/oauth/v2/auth",
                "https://accounts.zoho.com/oauth/v2/token",
            ),
            OAuthProvider::MetaAds => (
                "https://www.facebook.com/v19.0/dialog/oauth",
                "https://graph.facebook.com/v19.0/oauth/access_token",
            ),
            OAuthProvider::Airtable => (
                "https://airtable.com/oauth2/v1/authorize",
                "https://airtable.com/oauth2/v1/token",
            ),
            OAuthProvider::GoogleAnalytics => (
                "https://accounts.google.com/o/oauth2/v2/auth",
                "https://oauth2.googleapis.com/token",
            ),
        };
        Endpoints {
            authorize: Url::parse(authorize).expect("valid authorize URL"),
            token: Url::parse(token).expect("valid token URL"),
        }
    }

    pub fn default_scopes(&self) -> &'static [&'static str] {
        match self {
            OAuthProvider::Salesforce => &["api", "refresh_token"],
            OAuthProvider::HubSpot => &[
                "crm.objects.contacts.read",
                "crm.objects.companies.read",
                "crm.objects.deals.read",
            ],
            OAuthProvider::Zoho => &["ZohoCRM.modules.ALL", "ZohoCRM.settings.ALL"],
            OAuthProvider::MetaAds => &["ads_read", "ads_management"],
            OAuthProvider::Airtable => &["data.records:read", "schema.bases:read"],
            OAuthProvider::GoogleAnalytics => &["https://www.googleapis.com/auth/analytics.readonly"],
        }
    }

    fn scope_separator(&self) -> &'static str {
        match self {
            OAuthProvider::Zoho | OAuthProvider::MetaAds => ",",
            _ => " ",
        }
    }

    pub fn requires_pkce(&self) -> bool {
        matches!(self, OAuthProvider::Airtable)
    }
}

impl fmt::Display for OAuthProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OAuthProvider {
    type Err = OAuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "salesforce" => Ok(OAuthProvider::Salesforce),
            "hubspot" => Ok(OAuthProvider::HubSpot),
            "zoho" => Ok(OAuthProvider::Zoho),
            "meta" | "meta_ads" | "metaads" | "facebook" => Ok(OAuthProvider::MetaAds),
            "airtable" => Ok(OAuthProvider::Airtable),
            "google_analytics" | "googleanalytics" | "ga" => Ok(OAuthProvider::GoogleAnalytics),
            _ => Err(OAuthError::UnknownProvider(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub authorize: Url,
    pub token: Url,
}

/// RFC 7636 S256 verifier/challenge pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pkce {
    pub verifier: String,
    pub challenge: String,
}

impl Pkce {
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self::from_verifier(URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn from_verifier(verifier: String) -> Self {
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
        Self {
            verifier,
            challenge,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
    pub instance_url: Option<String>,
    pub api_domain: Option<String>,
    pub token_type: Option<String>,
    pub scope: Option<String>,
    /// Full token response as returned by the provider.
    pub raw: Value,
}

fn opt_str(v: &Value, key: &str) -> Option<String> {
    v.get(key).and_then(Value::as_str).map(str::to_string)
}

impl OAuthToken {
    /// Pull the known fields out of a token response; `expires_in` may be a number or a string.
    pub fn from_response(raw: Value) -> OAuthResult<Self> {
        let access_token = opt_str(&raw, "access_token")
            .filter(|t| !t.is_empty())
            .ok_or(OAuthError::MissingToken)?;
        let expires_in = match raw.get("expires_in") {
            Some(Value::Number(n)) => n.as_i64(),
            Some(Value::String(s)) => s.parse().ok(),
            _ => None,
        };
        Ok(Self {
            access_token,
            refresh_token: opt_str(&raw, "refresh_token"),
            expires_in,
            instance_url: opt_str(&raw, "instance_url"),
            api_domain: opt_str(&raw, "api_domain"),
            token_type: opt_str(&raw, "token_type"),
            scope: opt_str(&raw, "scope"),
            raw,
        })
    }
}

pub struct OAuthFlow {
    http: Client,
    provider: OAuthProvider,
    client: OAuthClient,
    endpoints: Endpoints,
}

impl fmt::Debug for OAuthFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthFlow")
            .field("provider", &self.provider)
            .field("client_id", &self.client.client_id)
            .field("redirect_uri", &self.client.redirect_uri)
            .finish_non_exhaustive()
    }
}

impl OAuthFlow {
    pub fn new(provider: OAuthProvider, client: OAuthClient) -> Self {
        Self::with_endpoints(provider, client, provider.endpoints())
    }

    pub fn with_endpoints(provider: OAuthProvider, client: OAuthClient, endpoints: Endpoints) -> Self {
        Self {
            http: http_client(),
            provider,
            client,
            endpoints,
        }
    }

    /// Flow for `provider` using the `oauth.<provider>` client from config.
    pub fn from_config(provider: OAuthProvider, cfg: &Config) -> OAuthResult<Self> {
        let client = cfg
            .oauth
            .get(provider.as_str())
            .cloned()
            .ok_or(OAuthError::NotConfigured(provider.label()))?;
        Ok(Self::new(provider, client))
    }

    pub fn provider(&self) -> OAuthProvider {
        self.provider
    }

    fn scopes(&self) -> String {
        if self.client.scopes.is_empty() {
            self.provider
                .default_scopes()
                .join(self.provider.scope_separator())
        } else {
            self.client.scopes.join(self.provider.scope_separator())
        }
    }

    /// URL the user is redirected to for consent.
    pub fn authorize_url(&self, state: &str, pkce: Option<&Pkce>) -> OAuthResult<Url> {
        if self.provider.requires_pkce() && pkce.is_none() {
            return Err(OAuthError::MissingParameter("code_challenge"));
        }
        let mut url = self.endpoints.authorize.clone();
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("client_id", &self.client.client_id)
                .append_pair("redirect_uri", &self.client.redirect_uri)
                .append_pair("response_type", "code")
                .append_pair("scope", &self.scopes())
                .append_pair("state", state);
            match self.provider {
                OAuthProvider::Zoho => {
                    q.append_pair("access_type", "offline");
                }
                OAuthProvider::GoogleAnalytics => {
                    q.append_pair("access_type", "offline").append_pair("prompt", "consent");
                }
                _ => {}
            }
            if let Some(p) = pkce {
                q.append_pair("code_challenge", &p.challenge)
                    .append_pair("code_challenge_method", "S256");
            }
        }
        Ok(url)
    }

    #[instrument(skip_all, fields(provider = self.provider.as_str()))]
    pub async fn exchange_code(&self, code: &str, code_verifier: Option<&str>) -> OAuthResult<OAuthToken> {
        if code.trim().is_empty() {
            return Err(OAuthError::MissingParameter("code"));
        }
        let mut params: Vec<(&str, String)> = vec![
            ("grant_type", "authorization_code".into()),
            ("code", code.to_string()),
            ("redirect_uri", self.client.redirect_uri.clone()),
        ];
        if self.provider.requires_pkce() {
            let verifier = code_verifier.ok_or(OAuthError::MissingParameter("code_verifier"))?;
            params.push(("code_verifier", verifier.to_string()));
        }
        let token = self.token_request(params).await?;
        info!("authorization code exchanged");
        Ok(token)
    }

    #[instrument(skip_all, fields(provider = self.provider.as_str()))]
    pub async fn refresh(&self, refresh_token: &str) -> OAuthResult<OAuthToken> {
        if refresh_token.trim().is_empty() {
            return Err(OAuthError::MissingParameter("refresh_token"));
        }
        let params = match self.provider {
            // Meta has no refresh grant; long-lived tokens are re-exchanged.
            OAuthProvider::MetaAds => vec![
                ("grant_type", "fb_exchange_token".to_string()),
                ("fb_exchange_token", refresh_token.to_string()),
            ],
            _ => vec![
                ("grant_type", "refresh_token".to_string()),
                ("refresh_token", refresh_token.to_string()),
            ],
        };
        self.token_request(params).await
    }

    async fn token_request(&self, mut params: Vec<(&str, String)>) -> OAuthResult<OAuthToken> {
        let req = match self.provider {
            OAuthProvider::MetaAds => {
                params.push(("client_id", self.client.client_id.clone()));
                params.push(("client_secret", self.client.client_secret.clone()));
                self.http.get(self.endpoints.token.clone()).query(&params)
            }
            OAuthProvider::Airtable => {
                let basic = STANDARD.encode(format!(
                    "{}:{}",
                    self.client.client_id, self.client.client_secret
                ));
                params.push(("client_id", self.client.client_id.clone()));
                self.http
                    .post(self.endpoints.token.clone())
                    .header("Authorization", format!("Basic {}", basic))
                    .form(&params)
            }
            _ => {
                params.push(("client_id", self.client.client_id.clone()));
                params.push(("client_secret", self.client.client_secret.clone()));
                self.http.post(self.endpoints.token.clone()).form(&params)
            }
        };

        let res = req.send().await?;
        let status = res.status();
        let body = res.text().await?;
        if !status.is_success() {
            error!(%status, "token endpoint rejected the request");
            return Err(OAuthError::Provider {
                provider: self.provider.label(),
                status,
                body,
            });
        }
        let raw: Value = serde_json::from_str(&body).map_err(|_| OAuthError::Provider {
            provider: self.provider.label(),
            status,
            body: body.clone(),
        })?;
        // Zoho reports grant errors with a 200 and an `error` field.
        if raw.get("access_token").is_none() && raw.get("error").is_some() {
            return Err(OAuthError::Provider {
                provider: self.provider.label(),
                status,
                body,
            });
        }
        OAuthToken::from_response(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client() -> OAuthClient {
        OAuthClient {
            client_id: "cid".into(),
            client_secret: "secret".into(),
            redirect_uri: "https://app.example.com/callback".into(),
            scopes: Vec::new(),
        }
    }

    fn query(url: &Url, key: &str) -> Option<String> {
        url.query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    #[test]
    fn provider_names_parse() {
        assert_eq!("HubSpot".parse::<OAuthProvider>().unwrap(), OAuthProvider::HubSpot);
        assert_eq!("google-analytics".parse::<OAuthProvider>().unwrap(), OAuthProvider::GoogleAnalytics);
        assert_eq!("meta".parse::<OAuthProvider>().unwrap(), OAuthProvider::MetaAds);
        assert!(matches!(
            "dropbox".parse::<OAuthProvider>(),
            Err(OAuthError::UnknownProvider(_))
        ));
    }

    #[test]
    fn authorize_url_carries_client_and_scopes() {
        let flow = OAuthFlow::new(OAuthProvider::Zoho, client());
        let url = flow.authorize_url("st-1", None).unwrap();
        assert_eq!(url.host_str(), Some("accounts.zoho.com"));
        assert_eq!(query(&url, "client_id").as_deref(), Some("cid"));
        assert_eq!(query(&url, "state").as_deref(), Some("st-1"));
        assert_eq!(query(&url, "access_type").as_deref(), Some("offline"));
        assert_eq!(
            query(&url, "scope").as_deref(),
            Some("ZohoCRM.modules.ALL,ZohoCRM.settings.ALL")
        );
    }

    #[test]
    fn airtable_requires_pkce() {
        let flow = OAuthFlow::new(OAuthProvider::Airtable, client());
        assert!(matches!(
            flow.authorize_url("s", None),
            Err(OAuthError::MissingParameter("code_challenge"))
        ));
        let pkce = Pkce::generate();
        let url = flow.authorize_url("s", Some(&pkce)).unwrap();
        assert_eq!(query(&url, "code_challenge"), Some(pkce.challenge.clone()));
        assert_eq!(query(&url, "code_challenge_method").as_deref(), Some("S256"));
    }

    #[test]
    fn pkce_challenge_matches_rfc_example() {
        // RFC 7636 appendix B.
        let p = Pkce::from_verifier("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk".into());
        assert_eq!(p.challenge, "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM");
        assert_eq!(Pkce::generate().verifier.len(), 43);
    }

    #[test]
    fn token_parsing_accepts_string_expiry() {
        let t = OAuthToken::from_response(json!({
            "access_token": "at",
            "expires_in": "3600",
            "api_domain": "https://www.zohoapis.eu"
        }))
        .unwrap();
        assert_eq!(t.expires_in, Some(3600));
        assert_eq!(t.api_domain.as_deref(), Some("https://www.zohoapis.eu"));
        assert!(matches!(
            OAuthToken::from_response(json!({"token_type": "bearer"})),
            Err(OAuthError::MissingToken)
        ));
    }

    #[test]
    fn config_without_client_is_not_configured() {
        let cfg: Config = serde_yaml::from_str("app:\n  data_dir: \"/tmp\"\n").unwrap();
        assert!(matches!(
            OAuthFlow::from_config(OAuthProvider::HubSpot, &cfg),
            Err(OAuthError::NotConfigured("HubSpot"))
        ));
    }
}
