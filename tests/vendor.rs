//! Vendor token endpoints and the retry rules around them, against a mock
//! HTTP server.
//!
//! Run with: cargo test --test vendor

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use wxkit::WxError;
use wxkit::credential::storage::{KeyValueCache, MemoryCache};
use wxkit::credential::{
    ApiHost, CacheConfig, ConfigPreset, CredentialKind, CredentialSource, KeyNamespacer,
    TicketKind, TokenCache, TokenEndpoint, VendorClient, call_with_token,
};

// =============================================================================
// Test Helpers
// =============================================================================

fn vendor(server: &MockServer) -> VendorClient {
    VendorClient::with_base_urls(&server.uri(), &server.uri()).unwrap()
}

fn official_endpoint() -> TokenEndpoint {
    TokenEndpoint::OfficialAccount {
        app_id: "wx_app".to_string(),
        app_secret: "s3cret".to_string(),
    }
}

fn build(
    cache: &Arc<dyn KeyValueCache>,
    kind: CredentialKind,
    ids: &[&str],
    source: CredentialSource,
) -> Arc<TokenCache> {
    Arc::new(
        TokenCache::builder(KeyNamespacer::new().keys(kind, ids), Arc::clone(cache), source)
            .with_config(CacheConfig::from(ConfigPreset::Testing))
            .build(),
    )
}

fn busy_response() -> serde_json::Value {
    json!({"errcode": -1, "errmsg": "system error"})
}

async fn mount_token(server: &MockServer, token: &str, times: Option<u64>) {
    let mock = Mock::given(method("GET"))
        .and(path("/cgi-bin/token"))
        .and(query_param("grant_type", "client_credential"))
        .and(query_param("appid", "wx_app"))
        .and(query_param("secret", "s3cret"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"access_token": token, "expires_in": 7200})),
        );
    match times {
        Some(n) => mock.up_to_n_times(n).mount(server).await,
        None => mock.mount(server).await,
    }
}

// =============================================================================
// Token Endpoints
// =============================================================================

#[tokio::test]
async fn test_official_account_token_cached() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/cgi-bin/token"))
        .and(query_param("appid", "wx_app"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"access_token": "ACCESS", "expires_in": 7200})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let cache: Arc<dyn KeyValueCache> = Arc::new(MemoryCache::new());
    let tokens = build(
        &cache,
        CredentialKind::AccessToken,
        &["wx_app"],
        vendor(&server).official_account_source("wx_app", "s3cret"),
    );

    assert_eq!(tokens.get_access_token().await.unwrap(), "ACCESS");
    assert_eq!(tokens.get_access_token().await.unwrap(), "ACCESS");
    let ttl = tokens.remaining_ttl().await.unwrap().unwrap();
    assert!(ttl <= Duration::from_secs(6900));
}

#[tokio::test]
async fn test_busy_vendor_retried_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/cgi-bin/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(busy_response()))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    mount_token(&server, "AFTER_RETRY", None).await;

    let fetched = vendor(&server).fetch_token(&official_endpoint()).await.unwrap();
    assert_eq!(fetched.value, "AFTER_RETRY");
    assert_eq!(fetched.expires_in, Duration::from_secs(7200));
}

#[tokio::test]
async fn test_persistently_busy_vendor_gives_up() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/cgi-bin/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(busy_response()))
        .expect(2)
        .mount(&server)
        .await;

    let err = vendor(&server).fetch_token(&official_endpoint()).await.unwrap_err();
    assert_eq!(err.vendor_code(), Some(-1));
}

#[tokio::test]
async fn test_rejection_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/cgi-bin/token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"errcode": 40013, "errmsg": "invalid appid"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let cache: Arc<dyn KeyValueCache> = Arc::new(MemoryCache::new());
    let tokens = build(
        &cache,
        CredentialKind::AccessToken,
        &["wx_app"],
        vendor(&server).official_account_source("wx_app", "s3cret"),
    );

    let err = tokens.get_access_token().await.unwrap_err();
    assert!(matches!(
        err,
        WxError::VendorRejected { code: 40013, ref message } if message == "invalid appid"
    ));
    assert_eq!(cache.get(&tokens.keys().cache_key).await.unwrap(), None);
    assert!(!cache.exists(&tokens.keys().lock_key).await.unwrap());
}

#[tokio::test]
async fn test_missing_expires_in_defaults() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/cgi-bin/gettoken"))
        .and(query_param("corpid", "ww_corp"))
        .and(query_param("corpsecret", "agent-secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errcode": 0,
            "errmsg": "ok",
            "access_token": "CORP"
        })))
        .mount(&server)
        .await;

    let fetched = vendor(&server)
        .fetch_token(&TokenEndpoint::Corp {
            corp_id: "ww_corp".to_string(),
            corp_secret: "agent-secret".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(fetched.value, "CORP");
    assert_eq!(fetched.expires_in, Duration::from_secs(7200));
}

#[tokio::test]
async fn test_http_failure_maps_to_http_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/cgi-bin/token"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let err = vendor(&server).fetch_token(&official_endpoint()).await.unwrap_err();
    assert!(matches!(err, WxError::Http(_)));
}

// =============================================================================
// Ticket-Bound Chains
// =============================================================================

#[tokio::test]
async fn test_component_token_from_pushed_ticket() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/cgi-bin/component/api_component_token"))
        .and(body_partial_json(json!({
            "component_appid": "wx_component",
            "component_verify_ticket": "VT-1"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "component_access_token": "CAT",
            "expires_in": 7200
        })))
        .expect(1)
        .mount(&server)
        .await;

    let cache: Arc<dyn KeyValueCache> = Arc::new(MemoryCache::new());
    let ticket = build(
        &cache,
        CredentialKind::ComponentVerifyTicket,
        &["wx_component"],
        CredentialSource::read_only(),
    );
    let component = build(
        &cache,
        CredentialKind::ComponentAccessToken,
        &["wx_component"],
        vendor(&server).component_source("wx_component", "c-secret", Arc::clone(&ticket)),
    );

    ticket
        .update_access_token("VT-1", Duration::from_secs(43200))
        .await
        .unwrap();
    assert_eq!(component.get_access_token().await.unwrap(), "CAT");
    assert_eq!(component.get_access_token().await.unwrap(), "CAT");
}

#[tokio::test]
async fn test_authorizer_refresh_token_rotation() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/cgi-bin/component/api_authorizer_token"))
        .and(query_param("component_access_token", "CAT"))
        .and(body_partial_json(json!({
            "authorizer_appid": "wx_authorizer",
            "authorizer_refresh_token": "RT-1"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "authorizer_access_token": "AAT",
            "expires_in": 7200,
            "authorizer_refresh_token": "RT-2"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let cache: Arc<dyn KeyValueCache> = Arc::new(MemoryCache::new());
    let component = build(
        &cache,
        CredentialKind::ComponentAccessToken,
        &["wx_component"],
        CredentialSource::read_only(),
    );
    let refresh_token = build(
        &cache,
        CredentialKind::AuthorizerRefreshToken,
        &["wx_component", "wx_authorizer"],
        CredentialSource::read_only(),
    );
    let authorizer = build(
        &cache,
        CredentialKind::AuthorizerAccessToken,
        &["wx_component", "wx_authorizer"],
        vendor(&server).authorizer_source(
            Arc::clone(&component),
            "wx_component",
            "wx_authorizer",
            Arc::clone(&refresh_token),
        ),
    );

    component
        .update_access_token("CAT", Duration::from_secs(7200))
        .await
        .unwrap();
    refresh_token
        .update_access_token("RT-1", Duration::from_secs(30 * 24 * 3600))
        .await
        .unwrap();

    assert_eq!(authorizer.get_access_token().await.unwrap(), "AAT");
    assert_eq!(refresh_token.get_access_token().await.unwrap(), "RT-2");
}

#[tokio::test]
async fn test_jsapi_ticket_from_access_token() {
    let server = MockServer::start().await;
    mount_token(&server, "ACCESS", None).await;
    Mock::given(method("GET"))
        .and(path("/cgi-bin/ticket/getticket"))
        .and(query_param("type", "jsapi"))
        .and(query_param("access_token", "ACCESS"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errcode": 0,
            "errmsg": "ok",
            "ticket": "JSAPI",
            "expires_in": 7200
        })))
        .expect(1)
        .mount(&server)
        .await;

    let cache: Arc<dyn KeyValueCache> = Arc::new(MemoryCache::new());
    let vendor = vendor(&server);
    let access = build(
        &cache,
        CredentialKind::AccessToken,
        &["wx_app"],
        vendor.official_account_source("wx_app", "s3cret"),
    );
    let jsapi = build(
        &cache,
        CredentialKind::JsapiTicket,
        &["wx_app"],
        vendor.ticket_source(TicketKind::Jsapi, Arc::clone(&access)),
    );

    assert_eq!(jsapi.get_access_token().await.unwrap(), "JSAPI");
    assert_eq!(jsapi.get_access_token().await.unwrap(), "JSAPI");
}

// =============================================================================
// API Calls With Token Retry
// =============================================================================

#[tokio::test]
async fn test_invalid_token_refreshed_and_retried() {
    let server = MockServer::start().await;
    mount_token(&server, "OLD", Some(1)).await;
    mount_token(&server, "NEW", None).await;

    Mock::given(method("GET"))
        .and(path("/cgi-bin/menu/get"))
        .and(query_param("access_token", "OLD"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errcode": 40014,
            "errmsg": "invalid access_token"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/cgi-bin/menu/get"))
        .and(query_param("access_token", "NEW"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"menu": {"button": []}})))
        .expect(1)
        .mount(&server)
        .await;

    let cache: Arc<dyn KeyValueCache> = Arc::new(MemoryCache::new());
    let vendor = vendor(&server);
    let tokens = build(
        &cache,
        CredentialKind::AccessToken,
        &["wx_app"],
        vendor.official_account_source("wx_app", "s3cret"),
    );

    let api = &vendor;
    let menu = call_with_token(&tokens, |token| async move {
        api.call_api(ApiHost::Official, "/cgi-bin/menu/get", &token, None)
            .await
    })
    .await
    .unwrap();
    assert!(menu.get("menu").is_some());
    assert_eq!(tokens.get_access_token().await.unwrap(), "NEW");
}

#[tokio::test]
async fn test_busy_api_retried_with_same_token() {
    let server = MockServer::start().await;
    mount_token(&server, "ACCESS", None).await;

    Mock::given(method("POST"))
        .and(path("/cgi-bin/message/custom/send"))
        .and(query_param("access_token", "ACCESS"))
        .respond_with(ResponseTemplate::new(200).set_body_json(busy_response()))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/cgi-bin/message/custom/send"))
        .and(query_param("access_token", "ACCESS"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"errcode": 0, "errmsg": "ok"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let cache: Arc<dyn KeyValueCache> = Arc::new(MemoryCache::new());
    let vendor = vendor(&server);
    let tokens = build(
        &cache,
        CredentialKind::AccessToken,
        &["wx_app"],
        vendor.official_account_source("wx_app", "s3cret"),
    );
    let body = json!({"touser": "openid", "msgtype": "text", "text": {"content": "hi"}});

    let (api, body) = (&vendor, &body);
    let result = call_with_token(&tokens, |token| async move {
        api.call_api(ApiHost::Official, "/cgi-bin/message/custom/send", &token, Some(body))
            .await
    })
    .await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_other_errors_not_retried() {
    let server = MockServer::start().await;
    mount_token(&server, "ACCESS", None).await;
    Mock::given(method("GET"))
        .and(path("/cgi-bin/user/info"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errcode": 40003,
            "errmsg": "invalid openid"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let cache: Arc<dyn KeyValueCache> = Arc::new(MemoryCache::new());
    let vendor = vendor(&server);
    let tokens = build(
        &cache,
        CredentialKind::AccessToken,
        &["wx_app"],
        vendor.official_account_source("wx_app", "s3cret"),
    );

    let api = &vendor;
    let err = call_with_token(&tokens, |token| async move {
        api.call_api(ApiHost::Official, "/cgi-bin/user/info", &token, None)
            .await
    })
    .await
    .unwrap_err();
    assert_eq!(err.vendor_code(), Some(40003));
}
