use data_extractors::config::{
    MetaAdsCredentials, SalesforceCredentials, SugarCrmCredentials, ZohoCredentials,
};
use data_extractors::connector::github::GitHubConnector;
use data_extractors::connector::meta_ads::{appsecret_proof, MetaAdsConnector};
use data_extractors::connector::notion::NotionConnector;
use data_extractors::connector::salesforce::SalesforceConnector;
use data_extractors::connector::sugarcrm::SugarCrmConnector;
use data_extractors::connector::zoho::ZohoConnector;
use data_extractors::connector::Connector;
use data_extractors::error::ConnectorError;
use data_extractors::model::QueryParams;
use reqwest::Url;
use serde_json::json;
use wiremock::matchers::{body_partial_json, body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn base(server: &MockServer) -> Url {
    Url::parse(&format!("{}/", server.uri())).unwrap()
}

fn sf_creds() -> SalesforceCredentials {
    serde_yaml::from_str(
        r#"
client_id: "cid"
client_secret: "csecret"
username: "ann@example.com"
password: "pw"
security_token: "TOK"
"#,
    )
    .unwrap()
}

#[tokio::test]
async fn salesforce_authenticates_and_follows_next_records_url() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/services/oauth2/token"))
        .and(body_string_contains("grant_type=password"))
        .and(body_string_contains("password=pwTOK"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "sf-token",
            "instance_url": server.uri(),
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/services/data/v57.0/sobjects"))
        .and(header("Authorization", "Bearer sf-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"sobjects": []})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/services/data/v57.0/query"))
        .and(query_param("q", "SELECT Id, Name FROM Account"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "done": false,
            "records": [{"attributes": {"type": "Account"}, "Id": "001A", "Name": "Acme"}],
            "nextRecordsUrl": "/services/data/v57.0/query/01gB-2000",
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/services/data/v57.0/query/01gB-2000"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "done": true,
            "records": [{"attributes": {"type": "Account"}, "Id": "001B", "Name": "Globex"}],
        })))
        .expect(1)
        .mount(&server)
        .await;

    let sf = SalesforceConnector::with_login_url(sf_creds(), base(&server));
    let params = QueryParams::with_fields(vec!["Id".into(), "Name".into()]);
    let records = sf.fetch_data("Account", &params).await.unwrap();

    assert_eq!(records.len(), 2);
    assert_eq!(records[1]["Name"], "Globex");
    assert!(records.iter().all(|r| !r.contains_key("attributes")));
}

#[tokio::test]
async fn salesforce_login_failure_is_authentication_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/services/oauth2/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({"error": "invalid_grant"})))
        .mount(&server)
        .await;

    let sf = SalesforceConnector::with_login_url(sf_creds(), base(&server));
    let err = sf.validate_connection().await.unwrap_err();
    assert!(matches!(err, ConnectorError::Authentication(_)), "{:?}", err);
}

#[tokio::test]
async fn github_lists_repos_and_issues_with_token_header() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/user"))
        .and(header("Authorization", "token ghp_test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"login": "octo"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/user/repos"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"full_name": "octo/hello", "private": false},
            {"full_name": "octo/tools", "private": true},
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/repos/octo/hello/issues"))
        .and(query_param("since", "2024-03-01T00:00:00Z"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"number": 7, "title": "Crash on start", "state": "open"},
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let gh = GitHubConnector::with_base_url("ghp_test".into(), base(&server));
    assert!(gh.is_token_valid().await);

    let repos = gh.list_objects().await.unwrap();
    let names: Vec<_> = repos.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(names, ["octo/hello", "octo/tools"]);

    let params = QueryParams {
        filters: Some(json!({"since": "2024-03-01T00:00:00Z"})),
        ..Default::default()
    };
    let issues = gh.fetch_data("octo/hello", &params).await.unwrap();
    assert_eq!(issues[0]["title"], "Crash on start");
}

#[tokio::test]
async fn github_rejected_token_is_invalid() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/user"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"message": "Bad credentials"})))
        .mount(&server)
        .await;

    let gh = GitHubConnector::with_base_url("nope".into(), base(&server));
    assert!(!gh.is_token_valid().await);
    match gh.authenticate().await {
        Err(ConnectorError::Authentication(msg)) => assert_eq!(msg, "Invalid token"),
        other => panic!("unexpected: {:?}", other),
    }
}

#[tokio::test]
async fn notion_query_follows_cursor_and_flattens_pages() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/databases/db-1/query"))
        .and(body_partial_json(json!({"start_cursor": "cur-2"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [{"id": "p2", "properties": {
                "Name": {"type": "title", "title": [{"plain_text": "Second"}]}
            }}],
            "has_more": false,
            "next_cursor": null,
        })))
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/databases/db-1/query"))
        .and(header("Notion-Version", "2022-06-28"))
        .and(header("Authorization", "Bearer secret_abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [{"id": "p1", "properties": {
                "Name": {"type": "title", "title": [{"plain_text": "First"}]},
                "Tags": {"type": "multi_select", "multi_select": [{"name": "x"}, {"name": "y"}]}
            }}],
            "has_more": true,
            "next_cursor": "cur-2",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let notion = NotionConnector::with_base_url(
        "secret_abc".into(),
        "2022-06-28".into(),
        base(&server),
    );
    let rows = notion.fetch_data("db-1", &QueryParams::default()).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["Name"], "First");
    assert_eq!(rows[0]["Tags"], "x, y");
    assert_eq!(rows[1]["id"], "p2");
}

#[tokio::test]
async fn notion_search_lists_databases_by_title() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/search"))
        .and(body_partial_json(json!({"filter": {"property": "object", "value": "database"}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [
                {"id": "db-1", "title": [{"plain_text": "Roadmap"}]},
                {"id": "db-2", "title": []}
            ],
            "has_more": false,
        })))
        .mount(&server)
        .await;

    let notion = NotionConnector::with_base_url("t".into(), "2022-06-28".into(), base(&server));
    let dbs = notion.list_objects().await.unwrap();
    assert_eq!(dbs[0].name, "Roadmap");
    assert_eq!(dbs[1].name, "db-2");
}

#[tokio::test]
async fn salesforce_reauthenticates_once_on_expired_session() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/services/oauth2/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "old-token",
            "instance_url": server.uri(),
        })))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/services/oauth2/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "new-token",
            "instance_url": server.uri(),
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/services/data/v57.0/sobjects"))
        .and(header("Authorization", "Bearer old-token"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let sf = SalesforceConnector::with_login_url(sf_creds(), base(&server));
    sf.authenticate().await.unwrap();
    sf.validate_connection().await.unwrap();
}

fn zoho_creds(access_token: Option<&str>) -> ZohoCredentials {
    ZohoCredentials {
        client_id: "zcid".into(),
        client_secret: "zsecret".into(),
        refresh_token: "zrefresh".into(),
        access_token: access_token.map(str::to_string),
    }
}

#[tokio::test]
async fn zoho_refreshes_expired_token_and_pages_modified_records() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/crm/v2/users"))
        .and(header("Authorization", "Zoho-oauthtoken stale"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"code": "INVALID_TOKEN"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/oauth/v2/token"))
        .and(query_param("grant_type", "refresh_token"))
        .and(query_param("refresh_token", "zrefresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "fresh"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/crm/v2/Leads"))
        .and(query_param("page", "1"))
        .and(query_param("per_page", "200"))
        .and(header("Authorization", "Zoho-oauthtoken fresh"))
        .and(header("If-Modified-Since", "2024-03-01T00:00:00Z"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"id": "L1", "Last_Name": "Ng"}],
            "info": {"more_records": true},
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/crm/v2/Leads"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"id": "L2", "Last_Name": "Okafor"}],
            "info": {"more_records": false},
        })))
        .expect(1)
        .mount(&server)
        .await;

    let zoho = ZohoConnector::with_endpoints(zoho_creds(Some("stale")), base(&server), base(&server));
    let params = QueryParams {
        filters: Some(json!({"Modified_Time": {"gt": "2024-03-01T00:00:00Z"}})),
        ..Default::default()
    };
    let rows = zoho.fetch_data("Leads", &params).await.unwrap();
    let ids: Vec<_> = rows.iter().map(|r| r["id"].as_str().unwrap()).collect();
    assert_eq!(ids, ["L1", "L2"]);
}

#[tokio::test]
async fn zoho_keeps_earlier_pages_when_a_later_page_fails() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/crm/v2/users"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"users": []})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/crm/v2/Deals"))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"id": "D1"}],
            "info": {"more_records": true},
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/crm/v2/Deals"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(500).set_body_string("down"))
        .mount(&server)
        .await;

    let zoho = ZohoConnector::with_endpoints(zoho_creds(Some("tok")), base(&server), base(&server));
    let rows = zoho.fetch_data("Deals", &QueryParams::default()).await.unwrap();
    assert_eq!(rows.len(), 1);
}

fn sugar_creds(server: &MockServer) -> SugarCrmCredentials {
    SugarCrmCredentials {
        base_url: server.uri(),
        client_id: "sugar".into(),
        client_secret: "".into(),
        username: "ann".into(),
        password: "pw".into(),
    }
}

#[tokio::test]
async fn sugarcrm_password_grant_then_filter_post() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .and(body_string_contains("grant_type=password"))
        .and(body_string_contains("username=ann"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "sg-1"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rest/v11/Accounts/filter"))
        .and(header("Authorization", "Bearer sg-1"))
        .and(body_partial_json(json!({
            "max_num": 100,
            "filter": [{"date_modified": {"$gte": "2024-03-01"}}],
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "records": [{"id": "a1", "name": "Acme"}, {"id": "a2", "name": "Globex"}],
            "next_offset": -1,
        })))
        .expect(1)
        .mount(&server)
        .await;

    let sugar = SugarCrmConnector::new(sugar_creds(&server));
    let params = QueryParams {
        limit: Some(100),
        filters: Some(json!({"date_modified": {"$gte": "2024-03-01"}})),
        ..Default::default()
    };
    let rows = sugar.fetch_data("Accounts", &params).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1]["name"], "Globex");
}

#[tokio::test]
async fn sugarcrm_reauthenticates_once_on_expired_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "sg-old"})))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "sg-new"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/v11/me"))
        .and(header("Authorization", "Bearer sg-old"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/v11/Contacts"))
        .and(header("Authorization", "Bearer sg-new"))
        .and(query_param("max_num", "100"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "records": [{"id": "c1"}],
        })))
        .expect(1)
        .mount(&server)
        .await;

    let sugar = SugarCrmConnector::new(sugar_creds(&server));
    sugar.authenticate().await.unwrap();
    let rows = sugar.fetch_data("Contacts", &QueryParams::default()).await.unwrap();
    assert_eq!(rows[0]["id"], "c1");
}

fn meta_creds() -> MetaAdsCredentials {
    MetaAdsCredentials {
        access_token: "tok".into(),
        ad_account_id: "42".into(),
        app_id: None,
        app_secret: Some("shh".into()),
        api_version: "v19.0".into(),
    }
}

fn graph_base(server: &MockServer) -> Url {
    Url::parse(&format!("{}/v19.0/", server.uri())).unwrap()
}

async fn mount_graph_me(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/v19.0/me"))
        .and(query_param("access_token", "tok"))
        .and(query_param("appsecret_proof", appsecret_proof("shh", "tok").as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "1001"})))
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn meta_campaigns_filter_on_updated_time_and_keep_partial_pages() {
    let server = MockServer::start().await;
    mount_graph_me(&server).await;
    Mock::given(method("GET"))
        .and(path("/v19.0/act_42/campaigns"))
        .and(query_param("after", "cur-2"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v19.0/act_42/campaigns"))
        .and(query_param(
            "filtering",
            r#"[{"field":"updated_time","operator":"GREATER_THAN","value":1709251200}]"#,
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"id": "c1", "name": "Spring"}],
            "paging": {"next": format!("{}/v19.0/act_42/campaigns?after=cur-2", server.uri())},
        })))
        .expect(1)
        .mount(&server)
        .await;

    let meta = MetaAdsConnector::with_base_url(meta_creds(), graph_base(&server));
    let params = QueryParams {
        filters: Some(json!({"updated_since": "2024-03-01T00:00:00Z"})),
        ..Default::default()
    };
    let rows = meta.fetch_data("campaigns", &params).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["_object_type"], "campaign");
    assert_eq!(rows[0]["_ad_account_id"], "act_42");
    assert!(rows[0].contains_key("_extracted_at"));
    assert!(!rows[0].contains_key("_level"));
}

#[tokio::test]
async fn meta_insights_first_page_failure_is_an_error() {
    let server = MockServer::start().await;
    mount_graph_me(&server).await;
    Mock::given(method("GET"))
        .and(path("/v19.0/act_42/insights"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let meta = MetaAdsConnector::with_base_url(meta_creds(), graph_base(&server));
    let err = meta
        .fetch_data("insights", &QueryParams::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectorError::Api { status, .. } if status.as_u16() == 500), "{:?}", err);
}

#[tokio::test]
async fn meta_lists_ad_accounts() {
    let server = MockServer::start().await;
    mount_graph_me(&server).await;
    Mock::given(method("GET"))
        .and(path("/v19.0/me/adaccounts"))
        .and(query_param("fields", "id,name,account_status,currency,timezone_name"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{
                "id": "act_42",
                "name": "Main",
                "account_status": 1,
                "currency": "EUR",
                "timezone_name": "Europe/Berlin",
            }],
        })))
        .mount(&server)
        .await;

    let meta = MetaAdsConnector::with_base_url(meta_creds(), graph_base(&server));
    let accounts = meta.ad_accounts().await.unwrap();
    assert_eq!(accounts.len(), 1);
    assert_eq!(accounts[0].status, Some(1));
    assert_eq!(accounts[0].timezone.as_deref(), Some("Europe/Berlin"));
}
