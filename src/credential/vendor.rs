//! Vendor token endpoints and the retry policy for calls that carry a token.
//!
//! Response field names are fixed by the vendor and differ per endpoint:
//! `access_token`, `component_access_token`, `suite_access_token`,
//! `provider_access_token`, `authorizer_access_token` or `ticket`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::source::{CredentialSource, FetchedToken};
use super::TokenCache;
use crate::WxError;
use crate::error::{ERRCODE_INVALID_TOKEN, ERRCODE_SYSTEM_BUSY};

/// Official account / open platform API host.
pub const OFFICIAL_API_BASE: &str = "https://api.weixin.qq.com";
/// Enterprise API host.
pub const WORK_API_BASE: &str = "https://qyapi.weixin.qq.com";

/// Lifetime assumed when a token response carries no `expires_in`.
const DEFAULT_EXPIRES_IN: u64 = 7200;

/// How long a rotated authorizer refresh token or permanent code is kept.
/// Neither expires on the vendor side; they are overwritten on rotation.
pub const LONG_LIVED_CREDENTIAL: Duration = Duration::from_secs(30 * 24 * 3600);

/// Which API host a request goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiHost {
    /// `api.weixin.qq.com`
    Official,
    /// `qyapi.weixin.qq.com`
    Work,
}

/// A token or ticket endpoint together with the parameters it needs.
#[derive(Debug, Clone)]
pub enum TokenEndpoint {
    /// `GET /cgi-bin/token` with the account's own secret
    OfficialAccount {
        /// `appid`
        app_id: String,
        /// `secret`
        app_secret: String,
    },
    /// `GET /cgi-bin/gettoken` for a self-built enterprise application
    Corp {
        /// `corpid`
        corp_id: String,
        /// `corpsecret`
        corp_secret: String,
    },
    /// `POST /cgi-bin/component/api_component_token`
    Component {
        /// `component_appid`
        component_app_id: String,
        /// `component_appsecret`
        component_app_secret: String,
        /// `component_verify_ticket`, pushed by the vendor
        verify_ticket: String,
    },
    /// `POST /cgi-bin/component/api_authorizer_token`
    Authorizer {
        /// Component access token the call is made with
        component_access_token: String,
        /// `component_appid`
        component_app_id: String,
        /// `authorizer_appid`
        authorizer_app_id: String,
        /// `authorizer_refresh_token`
        refresh_token: String,
    },
    /// `POST /cgi-bin/service/get_suite_token`
    Suite {
        /// `suite_id`
        suite_id: String,
        /// `suite_secret`
        suite_secret: String,
        /// `suite_ticket`, pushed by the vendor
        suite_ticket: String,
    },
    /// `POST /cgi-bin/service/get_corp_token`
    ThirdPartyCorp {
        /// Suite access token the call is made with
        suite_access_token: String,
        /// `auth_corpid`
        auth_corp_id: String,
        /// `permanent_code`
        permanent_code: String,
    },
    /// `POST /cgi-bin/service/get_provider_token`
    Provider {
        /// `corpid`
        corp_id: String,
        /// `provider_secret`
        provider_secret: String,
    },
    /// `GET /cgi-bin/ticket/getticket?type=jsapi`
    JsapiTicket {
        /// Access token the call is made with
        access_token: String,
    },
    /// `GET /cgi-bin/ticket/getticket?type=wx_card`
    CardTicket {
        /// Access token the call is made with
        access_token: String,
    },
    /// `GET /cgi-bin/get_jsapi_ticket` on the enterprise host
    WorkJsapiTicket {
        /// Access token the call is made with
        access_token: String,
    },
    /// `GET /cgi-bin/ticket/get?type=agent_config` on the enterprise host
    AgentJsapiTicket {
        /// Access token the call is made with
        access_token: String,
    },
}

/// The endpoint families that issue JS-SDK style tickets against an access token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketKind {
    /// Official account JS-SDK ticket
    Jsapi,
    /// Card ticket
    Card,
    /// Enterprise JS-SDK ticket
    WorkJsapi,
    /// Enterprise per-agent JS-SDK ticket
    AgentJsapi,
}

impl TicketKind {
    fn endpoint(self, access_token: String) -> TokenEndpoint {
        match self {
            Self::Jsapi => TokenEndpoint::JsapiTicket { access_token },
            Self::Card => TokenEndpoint::CardTicket { access_token },
            Self::WorkJsapi => TokenEndpoint::WorkJsapiTicket { access_token },
            Self::AgentJsapi => TokenEndpoint::AgentJsapiTicket { access_token },
        }
    }
}

struct EndpointRequest {
    host: ApiHost,
    path: &'static str,
    query: Vec<(&'static str, String)>,
    body: Option<Value>,
}

impl TokenEndpoint {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::OfficialAccount { .. } => "official_account",
            Self::Corp { .. } => "corp",
            Self::Component { .. } => "component",
            Self::Authorizer { .. } => "authorizer",
            Self::Suite { .. } => "suite",
            Self::ThirdPartyCorp { .. } => "third_party_corp",
            Self::Provider { .. } => "provider",
            Self::JsapiTicket { .. } => "jsapi_ticket",
            Self::CardTicket { .. } => "card_ticket",
            Self::WorkJsapiTicket { .. } => "work_jsapi_ticket",
            Self::AgentJsapiTicket { .. } => "agent_jsapi_ticket",
        }
    }

    fn request(&self) -> EndpointRequest {
        match self {
            Self::OfficialAccount { app_id, app_secret } => EndpointRequest {
                host: ApiHost::Official,
                path: "/cgi-bin/token",
                query: vec![
                    ("grant_type", "client_credential".to_string()),
                    ("appid", app_id.clone()),
                    ("secret", app_secret.clone()),
                ],
                body: None,
            },
            Self::Corp {
                corp_id,
                corp_secret,
            } => EndpointRequest {
                host: ApiHost::Work,
                path: "/cgi-bin/gettoken",
                query: vec![
                    ("corpid", corp_id.clone()),
                    ("corpsecret", corp_secret.clone()),
                ],
                body: None,
            },
            Self::Component {
                component_app_id,
                component_app_secret,
                verify_ticket,
            } => EndpointRequest {
                host: ApiHost::Official,
                path: "/cgi-bin/component/api_component_token",
                query: vec![],
                body: Some(json!({
                    "component_appid": component_app_id,
                    "component_appsecret": component_app_secret,
                    "component_verify_ticket": verify_ticket,
                })),
            },
            Self::Authorizer {
                component_access_token,
                component_app_id,
                authorizer_app_id,
                refresh_token,
            } => EndpointRequest {
                host: ApiHost::Official,
                path: "/cgi-bin/component/api_authorizer_token",
                query: vec![("component_access_token", component_access_token.clone())],
                body: Some(json!({
                    "component_appid": component_app_id,
                    "authorizer_appid": authorizer_app_id,
                    "authorizer_refresh_token": refresh_token,
                })),
            },
            Self::Suite {
                suite_id,
                suite_secret,
                suite_ticket,
            } => EndpointRequest {
                host: ApiHost::Work,
                path: "/cgi-bin/service/get_suite_token",
                query: vec![],
                body: Some(json!({
                    "suite_id": suite_id,
                    "suite_secret": suite_secret,
                    "suite_ticket": suite_ticket,
                })),
            },
            Self::ThirdPartyCorp {
                suite_access_token,
                auth_corp_id,
                permanent_code,
            } => EndpointRequest {
                host: ApiHost::Work,
                path: "/cgi-bin/service/get_corp_token",
                query: vec![("suite_access_token", suite_access_token.clone())],
                body: Some(json!({
                    "auth_corpid": auth_corp_id,
                    "permanent_code": permanent_code,
                })),
            },
            Self::Provider {
                corp_id,
                provider_secret,
            } => EndpointRequest {
                host: ApiHost::Work,
                path: "/cgi-bin/service/get_provider_token",
                query: vec![],
                body: Some(json!({
                    "corpid": corp_id,
                    "provider_secret": provider_secret,
                })),
            },
            Self::JsapiTicket { access_token } => EndpointRequest {
                host: ApiHost::Official,
                path: "/cgi-bin/ticket/getticket",
                query: vec![
                    ("access_token", access_token.clone()),
                    ("type", "jsapi".to_string()),
                ],
                body: None,
            },
            Self::CardTicket { access_token } => EndpointRequest {
                host: ApiHost::Official,
                path: "/cgi-bin/ticket/getticket",
                query: vec![
                    ("access_token", access_token.clone()),
                    ("type", "wx_card".to_string()),
                ],
                body: None,
            },
            Self::WorkJsapiTicket { access_token } => EndpointRequest {
                host: ApiHost::Work,
                path: "/cgi-bin/get_jsapi_ticket",
                query: vec![("access_token", access_token.clone())],
                body: None,
            },
            Self::AgentJsapiTicket { access_token } => EndpointRequest {
                host: ApiHost::Work,
                path: "/cgi-bin/ticket/get",
                query: vec![
                    ("access_token", access_token.clone()),
                    ("type", "agent_config".to_string()),
                ],
                body: None,
            },
        }
    }
}

/// Token endpoint response. Only the field matching the endpoint is set.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenResponse {
    /// Official account, corp and third-party corp tokens
    #[serde(default)]
    pub access_token: Option<String>,
    /// Component token
    #[serde(default)]
    pub component_access_token: Option<String>,
    /// Suite token
    #[serde(default)]
    pub suite_access_token: Option<String>,
    /// Provider token
    #[serde(default)]
    pub provider_access_token: Option<String>,
    /// Authorizer token
    #[serde(default)]
    pub authorizer_access_token: Option<String>,
    /// Rotated authorizer refresh token
    #[serde(default)]
    pub authorizer_refresh_token: Option<String>,
    /// JS-SDK and card tickets
    #[serde(default)]
    pub ticket: Option<String>,
    /// Lifetime in seconds
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// Zero or absent on success
    #[serde(default)]
    pub errcode: Option<i64>,
    /// Vendor message
    #[serde(default)]
    pub errmsg: Option<String>,
}

impl TokenResponse {
    /// The credential value for `endpoint`.
    pub fn value_for(&self, endpoint: &TokenEndpoint) -> Option<&str> {
        let field = match endpoint {
            TokenEndpoint::OfficialAccount { .. }
            | TokenEndpoint::Corp { .. }
            | TokenEndpoint::ThirdPartyCorp { .. } => &self.access_token,
            TokenEndpoint::Component { .. } => &self.component_access_token,
            TokenEndpoint::Authorizer { .. } => &self.authorizer_access_token,
            TokenEndpoint::Suite { .. } => &self.suite_access_token,
            TokenEndpoint::Provider { .. } => &self.provider_access_token,
            TokenEndpoint::JsapiTicket { .. }
            | TokenEndpoint::CardTicket { .. }
            | TokenEndpoint::WorkJsapiTicket { .. }
            | TokenEndpoint::AgentJsapiTicket { .. } => &self.ticket,
        };
        field.as_deref().filter(|v| !v.is_empty())
    }

    fn check(self) -> Result<Self, WxError> {
        match self.errcode {
            Some(code) if code != 0 => Err(WxError::VendorRejected {
                code,
                message: self.errmsg.unwrap_or_default(),
            }),
            _ => Ok(self),
        }
    }
}

/// Maps a non-zero `errcode` in a JSON response to [`WxError::VendorRejected`].
pub fn check_errcode(body: Value) -> Result<Value, WxError> {
    let code = body.get("errcode").and_then(Value::as_i64).unwrap_or(0);
    if code == 0 {
        return Ok(body);
    }
    let message = body
        .get("errmsg")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Err(WxError::VendorRejected { code, message })
}

/// HTTP client for the vendor's token endpoints.
///
/// # Example
///
/// ```rust,no_run
/// use wxkit::credential::{TokenEndpoint, VendorClient};
///
/// # async fn example() -> Result<(), wxkit::WxError> {
/// let vendor = VendorClient::new()?;
/// let token = vendor
///     .fetch_token(&TokenEndpoint::OfficialAccount {
///         app_id: "wx123".to_string(),
///         app_secret: "secret".to_string(),
///     })
///     .await?;
/// println!("expires in {:?}", token.expires_in);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct VendorClient {
    http: Client,
    official_base: String,
    work_base: String,
}

impl VendorClient {
    /// Client for the production hosts.
    pub fn new() -> Result<Self, WxError> {
        Self::with_base_urls(OFFICIAL_API_BASE, WORK_API_BASE)
    }

    /// Client for custom hosts (proxies, test servers).
    pub fn with_base_urls(official_base: &str, work_base: &str) -> Result<Self, WxError> {
        let http = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            http,
            official_base: official_base.trim_end_matches('/').to_string(),
            work_base: work_base.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, host: ApiHost, path: &str) -> String {
        let base = match host {
            ApiHost::Official => &self.official_base,
            ApiHost::Work => &self.work_base,
        };
        format!("{base}{path}")
    }

    /// Calls a token endpoint and returns the checked response.
    ///
    /// A `-1` (system busy) answer is retried once.
    pub async fn fetch_response(&self, endpoint: &TokenEndpoint) -> Result<TokenResponse, WxError> {
        match self.fetch_once(endpoint).await {
            Err(e) if e.vendor_code() == Some(ERRCODE_SYSTEM_BUSY) => {
                warn!(endpoint = endpoint.name(), "Vendor busy, retrying token request once");
                self.fetch_once(endpoint).await
            }
            other => other,
        }
    }

    /// Calls a token endpoint and extracts the credential.
    pub async fn fetch_token(&self, endpoint: &TokenEndpoint) -> Result<FetchedToken, WxError> {
        let response = self.fetch_response(endpoint).await?;
        let value = response.value_for(endpoint).ok_or_else(|| WxError::VendorRejected {
            code: 0,
            message: format!("{} response carries no credential", endpoint.name()),
        })?;
        let expires_in = response.expires_in.unwrap_or(DEFAULT_EXPIRES_IN);
        info!(endpoint = endpoint.name(), expires_in, "Vendor issued credential");
        Ok(FetchedToken::new(value, expires_in))
    }

    async fn fetch_once(&self, endpoint: &TokenEndpoint) -> Result<TokenResponse, WxError> {
        let request = endpoint.request();
        let url = self.url(request.host, request.path);
        debug!(endpoint = endpoint.name(), url = %url, "Requesting credential");

        let builder = match &request.body {
            Some(body) => self.http.post(&url).json(body),
            None => self.http.get(&url),
        };
        let response: TokenResponse = builder
            .query(&request.query)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        response.check()
    }

    /// Calls an arbitrary API with `access_token` as query parameter.
    ///
    /// `body` selects POST with a JSON body, otherwise GET. A non-zero
    /// `errcode` becomes [`WxError::VendorRejected`].
    pub async fn call_api(
        &self,
        host: ApiHost,
        path: &str,
        access_token: &str,
        body: Option<&Value>,
    ) -> Result<Value, WxError> {
        let url = self.url(host, path);
        let builder = match body {
            Some(body) => self.http.post(&url).json(body),
            None => self.http.get(&url),
        };
        let response: Value = builder
            .query(&[("access_token", access_token)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        check_errcode(response)
    }

    /// Official account token fetched with the account's own secret.
    pub fn official_account_source(&self, app_id: &str, app_secret: &str) -> CredentialSource {
        self.client_source(TokenEndpoint::OfficialAccount {
            app_id: app_id.to_string(),
            app_secret: app_secret.to_string(),
        })
    }

    /// Self-built enterprise application token.
    pub fn corp_source(&self, corp_id: &str, corp_secret: &str) -> CredentialSource {
        self.client_source(TokenEndpoint::Corp {
            corp_id: corp_id.to_string(),
            corp_secret: corp_secret.to_string(),
        })
    }

    /// Service provider token.
    pub fn provider_source(&self, corp_id: &str, provider_secret: &str) -> CredentialSource {
        self.client_source(TokenEndpoint::Provider {
            corp_id: corp_id.to_string(),
            provider_secret: provider_secret.to_string(),
        })
    }

    /// Component token, exchanged for the pushed `component_verify_ticket`.
    pub fn component_source(
        &self,
        component_app_id: &str,
        component_app_secret: &str,
        verify_ticket: Arc<TokenCache>,
    ) -> CredentialSource {
        let vendor = self.clone();
        let component_app_id = component_app_id.to_string();
        let component_app_secret = component_app_secret.to_string();
        CredentialSource::ticket_bound(verify_ticket, move |ticket| {
            let vendor = vendor.clone();
            let endpoint = TokenEndpoint::Component {
                component_app_id: component_app_id.clone(),
                component_app_secret: component_app_secret.clone(),
                verify_ticket: ticket,
            };
            async move { vendor.fetch_token(&endpoint).await }
        })
    }

    /// Suite token, exchanged for the pushed `suite_ticket`.
    pub fn suite_source(
        &self,
        suite_id: &str,
        suite_secret: &str,
        suite_ticket: Arc<TokenCache>,
    ) -> CredentialSource {
        let vendor = self.clone();
        let suite_id = suite_id.to_string();
        let suite_secret = suite_secret.to_string();
        CredentialSource::ticket_bound(suite_ticket, move |ticket| {
            let vendor = vendor.clone();
            let endpoint = TokenEndpoint::Suite {
                suite_id: suite_id.clone(),
                suite_secret: suite_secret.clone(),
                suite_ticket: ticket,
            };
            async move { vendor.fetch_token(&endpoint).await }
        })
    }

    /// Authorizer token, fetched with the component token and the
    /// authorizer's refresh token.
    ///
    /// `refresh_token` is a read-only cache filled when the account authorizes
    /// the component. A refresh token rotated by the vendor is written back to it.
    pub fn authorizer_source(
        &self,
        component_token: Arc<TokenCache>,
        component_app_id: &str,
        authorizer_app_id: &str,
        refresh_token: Arc<TokenCache>,
    ) -> CredentialSource {
        let vendor = self.clone();
        let component_app_id = component_app_id.to_string();
        let authorizer_app_id = authorizer_app_id.to_string();
        CredentialSource::ticket_bound(component_token, move |component_access_token| {
            let vendor = vendor.clone();
            let refresh_token = Arc::clone(&refresh_token);
            let component_app_id = component_app_id.clone();
            let authorizer_app_id = authorizer_app_id.clone();
            async move {
                let current = refresh_token.get_access_token().await?;
                let endpoint = TokenEndpoint::Authorizer {
                    component_access_token,
                    component_app_id,
                    authorizer_app_id,
                    refresh_token: current.clone(),
                };
                let response = vendor.fetch_response(&endpoint).await?;
                if let Some(rotated) = response
                    .authorizer_refresh_token
                    .as_deref()
                    .filter(|rotated| !rotated.is_empty() && *rotated != current)
                {
                    if let Err(e) = refresh_token
                        .update_access_token(rotated, LONG_LIVED_CREDENTIAL)
                        .await
                    {
                        warn!(
                            cache_key = %refresh_token.keys().cache_key,
                            error = %e,
                            "Failed to store rotated authorizer refresh token"
                        );
                    }
                }
                let value = response.value_for(&endpoint).ok_or_else(|| {
                    WxError::VendorRejected {
                        code: 0,
                        message: "authorizer response carries no credential".to_string(),
                    }
                })?;
                Ok(FetchedToken::new(
                    value,
                    response.expires_in.unwrap_or(DEFAULT_EXPIRES_IN),
                ))
            }
        })
    }

    /// Third-party corp token, fetched with the suite token and the corp's
    /// permanent code (a read-only cache).
    pub fn third_party_corp_source(
        &self,
        suite_token: Arc<TokenCache>,
        auth_corp_id: &str,
        permanent_code: Arc<TokenCache>,
    ) -> CredentialSource {
        let vendor = self.clone();
        let auth_corp_id = auth_corp_id.to_string();
        CredentialSource::ticket_bound(suite_token, move |suite_access_token| {
            let vendor = vendor.clone();
            let permanent_code = Arc::clone(&permanent_code);
            let auth_corp_id = auth_corp_id.clone();
            async move {
                let endpoint = TokenEndpoint::ThirdPartyCorp {
                    suite_access_token,
                    auth_corp_id,
                    permanent_code: permanent_code.get_access_token().await?,
                };
                vendor.fetch_token(&endpoint).await
            }
        })
    }

    /// JS-SDK or card ticket, fetched with the access token from `access_token`.
    pub fn ticket_source(
        &self,
        kind: TicketKind,
        access_token: Arc<TokenCache>,
    ) -> CredentialSource {
        let vendor = self.clone();
        CredentialSource::ticket_bound(access_token, move |token| {
            let vendor = vendor.clone();
            let endpoint = kind.endpoint(token);
            async move { vendor.fetch_token(&endpoint).await }
        })
    }

    fn client_source(&self, endpoint: TokenEndpoint) -> CredentialSource {
        let vendor = self.clone();
        CredentialSource::client_credential(move || {
            let vendor = vendor.clone();
            let endpoint = endpoint.clone();
            async move { vendor.fetch_token(&endpoint).await }
        })
    }
}

/// Runs `call` with a token from `tokens`, retrying at most once.
///
/// - `40014` (invalid token): the token is force-refreshed and `call` retried
/// - `-1` (system busy): `call` is retried with the same token
///
/// Every other outcome is returned as is.
///
/// # Example
///
/// ```rust,no_run
/// use wxkit::credential::{call_with_token, ApiHost, TokenCache, VendorClient};
///
/// # async fn example(tokens: &TokenCache, vendor: &VendorClient) -> Result<(), wxkit::WxError> {
/// let menu = call_with_token(tokens, |token| async move {
///     vendor.call_api(ApiHost::Official, "/cgi-bin/menu/get", &token, None).await
/// })
/// .await?;
/// # Ok(())
/// # }
/// ```
pub async fn call_with_token<T, F, Fut>(tokens: &TokenCache, call: F) -> Result<T, WxError>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<T, WxError>>,
{
    let token = tokens.get_access_token().await?;
    match call(token.clone()).await {
        Err(e) if e.vendor_code() == Some(ERRCODE_INVALID_TOKEN) => {
            warn!(
                cache_key = %tokens.keys().cache_key,
                "Vendor rejected token, refreshing and retrying once"
            );
            let fresh = tokens.refresh_access_token(None).await?;
            call(fresh).await
        }
        Err(e) if e.vendor_code() == Some(ERRCODE_SYSTEM_BUSY) => {
            warn!(cache_key = %tokens.keys().cache_key, "Vendor busy, retrying once");
            call(token).await
        }
        other => other,
    }
}
