//! REST client with pluggable authentication
//!
//! Supports basic, API key, bearer and OAuth2 client-credentials auth. OAuth2
//! access tokens are cached per `(token_url, client_id)` and refreshed
//! shortly before they expire; concurrent refreshes of one client are
//! collapsed into one token request while other clients refresh independently.
//!
//! # Example
//!
//! ```rust,ignore
//! let client = RestClient::new(RestClientConfig::new("https://api.partner.example/v2"))?
//!     .with_auth(RestAuth::OAuth2(credentials));
//!
//! let claims: Vec<Claim> = client.get("/claims?status=open").await?.json()?;
//! client.post("/claims", RequestBody::json(&claim)?).await?;
//! ```

use super::credentials::OAuth2Credentials;
use crate::error::{IntegrationError, Result};
use crate::types::SensitiveString;
use metrics::{counter, histogram};
use parking_lot::{Mutex, RwLock};
use reqwest::Method;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

fn default_connect_timeout_ms() -> u64 {
    30_000
}

fn default_read_timeout_ms() -> u64 {
    60_000
}

fn default_user_agent() -> String {
    "IntegrationHub/1.0".to_string()
}

fn default_token_buffer_secs() -> u64 {
    30
}

/// Lifetime assumed when a token response carries no `expires_in`
pub const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

/// Client settings
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RestClientConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Refresh cached tokens this many seconds before they expire
    #[serde(default = "default_token_buffer_secs")]
    pub token_refresh_buffer_secs: u64,
    #[serde(default)]
    pub default_headers: HashMap<String, String>,
}

impl Default for RestClientConfig {
    fn default() -> Self {
        Self::new("")
    }
}

impl RestClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            user_agent: default_user_agent(),
            token_refresh_buffer_secs: default_token_buffer_secs(),
            default_headers: HashMap::new(),
        }
    }

    pub fn with_timeouts(mut self, connect: Duration, read: Duration) -> Self {
        self.connect_timeout_ms = connect.as_millis() as u64;
        self.read_timeout_ms = read.as_millis() as u64;
        self
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RestAuth {
    #[default]
    None,
    Basic {
        username: String,
        password: SensitiveString,
    },
    /// API key in header
    ApiKey {
        header_name: String,
        key: SensitiveString,
    },
    Bearer {
        token: SensitiveString,
    },
    /// Client-credentials grant
    #[serde(rename = "oauth2")]
    OAuth2(OAuth2Credentials),
}

/// Request payload
#[derive(Debug, Clone)]
pub enum RequestBody {
    Bytes { content_type: String, data: Vec<u8> },
    /// Single file part of a multipart form
    Multipart {
        field: String,
        file_name: String,
        content_type: String,
        data: Vec<u8>,
    },
}

impl RequestBody {
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self::Bytes {
            content_type: "application/json".to_string(),
            data: serde_json::to_vec(value)?,
        })
    }

    pub fn bytes(content_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self::Bytes {
            content_type: content_type.into(),
            data,
        }
    }
}

/// Successful response
#[derive(Debug, Clone)]
pub struct RestResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl RestResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: SensitiveString,
    expires_at: Instant,
}

static GLOBAL_TOKEN_CACHE: LazyLock<Arc<TokenCache>> = LazyLock::new(|| Arc::new(TokenCache::new()));

/// OAuth2 access tokens keyed by `(token_url, client_id)`
#[derive(Debug, Default)]
pub struct TokenCache {
    tokens: RwLock<HashMap<(String, String), CachedToken>>,
    refreshing: Mutex<HashMap<(String, String), Arc<tokio::sync::Mutex<()>>>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide cache used by clients that were not given their own
    pub fn global() -> Arc<TokenCache> {
        GLOBAL_TOKEN_CACHE.clone()
    }

    fn cached(&self, key: &(String, String), buffer: Duration) -> Option<SensitiveString> {
        let tokens = self.tokens.read();
        let token = tokens.get(key)?;
        if Instant::now() + buffer < token.expires_at {
            Some(token.access_token.clone())
        } else {
            None
        }
    }

    /// A valid token, requesting a new one when missing or about to expire
    pub async fn token(
        &self,
        http: &reqwest::Client,
        credentials: &OAuth2Credentials,
        buffer: Duration,
    ) -> Result<SensitiveString> {
        let key = (credentials.token_url.clone(), credentials.client_id.clone());
        if let Some(token) = self.cached(&key, buffer) {
            return Ok(token);
        }

        let gate = self.refreshing.lock().entry(key.clone()).or_default().clone();
        let _refresh = gate.lock().await;
        // another task may have refreshed while we waited
        if let Some(token) = self.cached(&key, buffer) {
            return Ok(token);
        }

        let fetched = fetch_token(http, credentials).await?;
        let token = fetched.access_token.clone();
        self.tokens.write().insert(key, fetched);
        Ok(token)
    }

    /// Forget the token of one client
    pub fn invalidate(&self, token_url: &str, client_id: &str) {
        self.tokens
            .write()
            .remove(&(token_url.to_string(), client_id.to_string()));
    }

    pub fn clear(&self) {
        self.tokens.write().clear();
    }

    pub fn len(&self) -> usize {
        self.tokens.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.read().is_empty()
    }
}

async fn fetch_token(http: &reqwest::Client, credentials: &OAuth2Credentials) -> Result<CachedToken> {
    let mut form: Vec<(String, String)> = vec![
        ("grant_type".to_string(), "client_credentials".to_string()),
        ("client_id".to_string(), credentials.client_id.clone()),
        (
            "client_secret".to_string(),
            credentials.client_secret.expose_secret().to_string(),
        ),
    ];
    if !credentials.scopes.is_empty() {
        form.push(("scope".to_string(), credentials.scopes.join(" ")));
    }
    let mut extra: Vec<_> = credentials.additional_params.iter().collect();
    extra.sort();
    form.extend(extra.into_iter().map(|(k, v)| (k.clone(), v.clone())));

    let response = http.post(&credentials.token_url).form(&form).send().await?;
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        counter!("rest.token.failures").increment(1);
        return Err(IntegrationError::Send {
            destination: credentials.token_url.clone(),
            message: format!("token request failed: HTTP {}: {}", status.as_u16(), body),
            records_sent: 0,
            records_attempted: 0,
            status: Some(status.as_u16()),
        });
    }

    let parsed: TokenResponse = serde_json::from_str(&body)?;
    let lifetime = parsed
        .expires_in
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_TOKEN_LIFETIME);
    info!(
        "Obtained OAuth2 token for client '{}' (expires in {:?})",
        credentials.client_id, lifetime
    );
    counter!("rest.token.refreshed").increment(1);
    Ok(CachedToken {
        access_token: SensitiveString::new(parsed.access_token),
        expires_at: Instant::now() + lifetime,
    })
}

/// HTTP client bound to a base URL and an auth scheme
#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
    config: RestClientConfig,
    auth: RestAuth,
    tokens: Arc<TokenCache>,
}

impl RestClient {
    pub fn new(config: RestClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_millis(config.read_timeout_ms))
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self {
            http,
            config,
            auth: RestAuth::None,
            tokens: TokenCache::global(),
        })
    }

    pub fn with_auth(mut self, auth: RestAuth) -> Self {
        self.auth = auth;
        self
    }

    /// Use a dedicated token cache instead of the process-wide one
    pub fn with_token_cache(mut self, tokens: Arc<TokenCache>) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.default_headers.insert(name.into(), value.into());
        self
    }

    pub fn config(&self) -> &RestClientConfig {
        &self.config
    }

    /// Drop every cached token held by this client's cache
    pub fn clear_token_cache(&self) {
        self.tokens.clear();
    }

    /// Absolute URL for `path`; absolute inputs are used unchanged
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        let base = self.config.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        match (base.is_empty(), path.is_empty()) {
            (true, _) => path.to_string(),
            (false, true) => base.to_string(),
            (false, false) => format!("{}/{}", base, path),
        }
    }

    pub async fn get(&self, path: &str) -> Result<RestResponse> {
        self.request(Method::GET, path, None, &HashMap::new()).await
    }

    pub async fn delete(&self, path: &str) -> Result<RestResponse> {
        self.request(Method::DELETE, path, None, &HashMap::new()).await
    }

    pub async fn post(&self, path: &str, body: RequestBody) -> Result<RestResponse> {
        self.request(Method::POST, path, Some(body), &HashMap::new()).await
    }

    pub async fn put(&self, path: &str, body: RequestBody) -> Result<RestResponse> {
        self.request(Method::PUT, path, Some(body), &HashMap::new()).await
    }

    pub async fn patch(&self, path: &str, body: RequestBody) -> Result<RestResponse> {
        self.request(Method::PATCH, path, Some(body), &HashMap::new()).await
    }

    /// Send a request. A 401 under OAuth2 evicts the cached token and retries once.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<RequestBody>,
        headers: &HashMap<String, String>,
    ) -> Result<RestResponse> {
        let url = self.url(path);
        let start = Instant::now();
        counter!("rest.requests").increment(1);

        let mut response = self.send_once(&method, &url, body.clone(), headers).await?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            if let RestAuth::OAuth2(credentials) = &self.auth {
                warn!("Token rejected by {}, refreshing", url);
                self.tokens
                    .invalidate(&credentials.token_url, &credentials.client_id);
                response = self.send_once(&method, &url, body, headers).await?;
            }
        }

        let status = response.status();
        let response_headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
            .collect();
        let text = response.text().await?;
        histogram!("rest.request_duration_ms").record(start.elapsed().as_millis() as f64);

        if !status.is_success() {
            counter!("rest.errors").increment(1);
            let message = format!("HTTP {}: {}", status.as_u16(), text);
            debug!("{} {} failed: {}", method, url, message);
            return Err(if method == Method::GET || method == Method::DELETE {
                IntegrationError::Read {
                    source_name: url,
                    message,
                    offset: None,
                    status: Some(status.as_u16()),
                }
            } else {
                IntegrationError::Send {
                    destination: url,
                    message,
                    records_sent: 0,
                    records_attempted: 1,
                    status: Some(status.as_u16()),
                }
            });
        }

        debug!("{} {} -> {}", method, url, status.as_u16());
        Ok(RestResponse {
            status: status.as_u16(),
            headers: response_headers,
            body: text,
        })
    }

    async fn send_once(
        &self,
        method: &Method,
        url: &str,
        body: Option<RequestBody>,
        headers: &HashMap<String, String>,
    ) -> Result<reqwest::Response> {
        let mut request = self.http.request(method.clone(), url);
        for (name, value) in self.config.default_headers.iter().chain(headers) {
            request = request.header(name.as_str(), value.as_str());
        }

        request = match &self.auth {
            RestAuth::None => request,
            RestAuth::Basic { username, password } => {
                request.basic_auth(username, Some(password.expose_secret()))
            }
            RestAuth::ApiKey { header_name, key } => {
                request.header(header_name.as_str(), key.expose_secret())
            }
            RestAuth::Bearer { token } => {
                request.header("Authorization", format!("Bearer {}", token.expose_secret()))
            }
            RestAuth::OAuth2(credentials) => {
                let buffer = Duration::from_secs(self.config.token_refresh_buffer_secs);
                let token = self.tokens.token(&self.http, credentials, buffer).await?;
                request.header("Authorization", format!("Bearer {}", token.expose_secret()))
            }
        };

        request = match body {
            None => request,
            Some(RequestBody::Bytes { content_type, data }) => {
                request.header("Content-Type", content_type).body(data)
            }
            Some(RequestBody::Multipart {
                field,
                file_name,
                content_type,
                data,
            }) => {
                let part = reqwest::multipart::Part::bytes(data)
                    .file_name(file_name)
                    .mime_str(&content_type)?;
                request.multipart(reqwest::multipart::Form::new().part(field, part))
            }
        };

        Ok(request.send().await?)
    }
}
