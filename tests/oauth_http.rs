use data_extractors::config::OAuthClient;
use data_extractors::oauth::{Endpoints, OAuthError, OAuthFlow, OAuthProvider, Pkce};
use reqwest::Url;
use serde_json::json;
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client() -> OAuthClient {
    OAuthClient {
        client_id: "cid".into(),
        client_secret: "csecret".into(),
        redirect_uri: "https://app.example.com/oauth/callback".into(),
        scopes: Vec::new(),
    }
}

fn flow(server: &MockServer, provider: OAuthProvider) -> OAuthFlow {
    let endpoints = Endpoints {
        authorize: Url::parse(&format!("{}/authorize", server.uri())).unwrap(),
        token: Url::parse(&format!("{}/token", server.uri())).unwrap(),
    };
    OAuthFlow::with_endpoints(provider, client(), endpoints)
}

#[tokio::test]
async fn hubspot_exchange_posts_form_with_client_secret() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .and(body_string_contains("code=abc"))
        .and(body_string_contains("client_secret=csecret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "hs-access",
            "refresh_token": "hs-refresh",
            "expires_in": 1800,
            "token_type": "bearer",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let token = flow(&server, OAuthProvider::HubSpot)
        .exchange_code("abc", None)
        .await
        .unwrap();
    assert_eq!(token.access_token, "hs-access");
    assert_eq!(token.refresh_token.as_deref(), Some("hs-refresh"));
    assert_eq!(token.expires_in, Some(1800));
}

#[tokio::test]
async fn meta_exchange_uses_get_with_query() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/token"))
        .and(query_param("code", "fb-code"))
        .and(query_param("client_id", "cid"))
        .and(query_param("redirect_uri", "https://app.example.com/oauth/callback"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "EAAB",
            "token_type": "bearer",
            "expires_in": "5183944",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let token = flow(&server, OAuthProvider::MetaAds)
        .exchange_code("fb-code", None)
        .await
        .unwrap();
    assert_eq!(token.access_token, "EAAB");
    assert_eq!(token.expires_in, Some(5_183_944));
}

#[tokio::test]
async fn airtable_exchange_sends_basic_auth_and_verifier() {
    let server = MockServer::start().await;
    // base64("cid:csecret")
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(header("Authorization", "Basic Y2lkOmNzZWNyZXQ="))
        .and(body_string_contains("code_verifier=verifier-123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "at-1",
            "refresh_token": "rt-1",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let airtable = flow(&server, OAuthProvider::Airtable);
    assert!(matches!(
        airtable.exchange_code("code", None).await,
        Err(OAuthError::MissingParameter("code_verifier"))
    ));

    let pkce = Pkce::from_verifier("verifier-123".into());
    let url = airtable.authorize_url("state-1", Some(&pkce)).unwrap();
    assert!(url.query_pairs().any(|(k, v)| k == "code_challenge" && v == pkce.challenge));

    let token = airtable
        .exchange_code("code", Some(&pkce.verifier))
        .await
        .unwrap();
    assert_eq!(token.access_token, "at-1");
}

#[tokio::test]
async fn zoho_error_with_ok_status_is_provider_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"error": "invalid_code"})))
        .mount(&server)
        .await;

    let err = flow(&server, OAuthProvider::Zoho)
        .exchange_code("stale", None)
        .await
        .unwrap_err();
    match err {
        OAuthError::Provider { body, .. } => assert!(body.contains("invalid_code")),
        other => panic!("unexpected: {:?}", other),
    }
}

#[tokio::test]
async fn rejected_refresh_surfaces_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
        .mount(&server)
        .await;

    let err = flow(&server, OAuthProvider::Salesforce)
        .refresh("old-refresh")
        .await
        .unwrap_err();
    match err {
        OAuthError::Provider { status, .. } => assert_eq!(status.as_u16(), 401),
        other => panic!("unexpected: {:?}", other),
    }
}

#[tokio::test]
async fn missing_access_token_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token_type": "bearer"})))
        .mount(&server)
        .await;

    let err = flow(&server, OAuthProvider::GoogleAnalytics)
        .exchange_code("c", None)
        .await
        .unwrap_err();
    assert!(matches!(err, OAuthError::MissingToken));
}
