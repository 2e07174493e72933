//! HTTP request gateway with token attachment and refresh-retry protocol

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{message_from_body, ClientError, Result};
use crate::session::{expire_session, SessionRefresher};
use crate::token_store::TokenStore;
use crate::types::{RequestOptions, Role, SessionContext};

/// Configuration for the API client
#[derive(Debug, Clone)]
pub struct ApiClientConfig {
    /// Base URL of the marketplace REST API, without a trailing slash,
    /// e.g. `https://api.threadline.example/api`.
    pub base_url: String,
}

impl ApiClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { base_url }
    }

    /// Reads `THREADLINE_API_URL`, defaulting to a local development server.
    pub fn from_env() -> Self {
        let base_url = std::env::var("THREADLINE_API_URL")
            .unwrap_or_else(|_| "http://localhost:5000/api".to_string());
        Self::new(base_url)
    }

    /// Realtime server URL: the HTTP base with any `/api` suffix stripped
    /// and the scheme mapped to websocket.
    pub fn realtime_url(&self) -> String {
        let stripped = self
            .base_url
            .strip_suffix("/api")
            .unwrap_or(&self.base_url);

        if let Some(rest) = stripped.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = stripped.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            stripped.to_string()
        }
    }
}

/// Outcome of a single round trip, before the refresh protocol is applied.
enum Outcome {
    Ok(Value),
    Unauthorized,
    Rejected { status: u16, message: String },
}

/// Gateway for authenticated marketplace API calls.
///
/// Owns the token store and drives the refresh protocol: a 401 triggers at
/// most one silent refresh, after which the identical request is retried
/// exactly once. A 401 on the retried request goes straight to expiry
/// handling.
pub struct ApiClient {
    config: ApiClientConfig,
    http_client: Client,
    tokens: TokenStore,
    refresher: SessionRefresher,
}

impl ApiClient {
    /// Create a new API client owning a fresh token store.
    pub fn new(config: ApiClientConfig) -> Self {
        let http_client = Client::new();
        let tokens = TokenStore::new();
        let refresher = SessionRefresher::new(
            config.base_url.clone(),
            http_client.clone(),
            tokens.clone(),
        );

        Self {
            config,
            http_client,
            tokens,
            refresher,
        }
    }

    /// The shared token store; login and OTP flows write through this.
    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    pub fn config(&self) -> &ApiClientConfig {
        &self.config
    }

    /// Signs `role` out of its portal.
    pub fn logout(&self, role: Role) {
        self.tokens.remove_token(role);
    }

    /// Hard logout across every portal.
    pub fn logout_all(&self) {
        self.tokens.clear_all_auth_data();
    }

    pub async fn get(&self, session: &SessionContext, endpoint: &str) -> Result<Value> {
        self.request(session, endpoint, RequestOptions::get()).await
    }

    pub async fn post(&self, session: &SessionContext, endpoint: &str, body: Value) -> Result<Value> {
        self.request(session, endpoint, RequestOptions::post(body)).await
    }

    pub async fn put(&self, session: &SessionContext, endpoint: &str, body: Value) -> Result<Value> {
        self.request(session, endpoint, RequestOptions::put(body)).await
    }

    pub async fn patch(&self, session: &SessionContext, endpoint: &str, body: Value) -> Result<Value> {
        self.request(session, endpoint, RequestOptions::patch(body)).await
    }

    pub async fn delete(&self, session: &SessionContext, endpoint: &str) -> Result<Value> {
        self.request(session, endpoint, RequestOptions::delete()).await
    }

    /// Issues `options` against `endpoint`, driving the single silent
    /// refresh and retry on authorization failures.
    pub async fn request(
        &self,
        session: &SessionContext,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<Value> {
        match self.execute(session, endpoint, &options).await? {
            Outcome::Ok(body) => Ok(body),
            Outcome::Rejected { status, message } => {
                Err(ClientError::Rejected { status, message })
            }
            Outcome::Unauthorized => {
                if !options.skip_refresh && self.refresher.try_refresh_once(session).await {
                    debug!(endpoint, "Retrying request after token refresh");
                    match self.execute(session, endpoint, &options).await? {
                        Outcome::Ok(body) => return Ok(body),
                        Outcome::Rejected { status, message } => {
                            return Err(ClientError::Rejected { status, message });
                        }
                        // Still unauthorized after the one refresh: fall
                        // through to expiry, no second attempt.
                        Outcome::Unauthorized => {}
                    }
                }

                let redirect = expire_session(&self.tokens, session);
                warn!(endpoint, path = %session.path, "Session expired");
                Err(ClientError::SessionExpired { redirect })
            }
        }
    }

    /// One round trip: build headers, attach the bearer token, classify the
    /// response by transport status.
    async fn execute(
        &self,
        session: &SessionContext,
        endpoint: &str,
        options: &RequestOptions,
    ) -> Result<Outcome> {
        let response = self.send(session, endpoint, options).await?;
        let status = response.status();
        let body = read_body(response).await?;

        if status.is_success() {
            Ok(Outcome::Ok(body))
        } else if status == StatusCode::UNAUTHORIZED {
            Ok(Outcome::Unauthorized)
        } else {
            let status = status.as_u16();
            Ok(Outcome::Rejected {
                status,
                message: message_from_body(&body, status),
            })
        }
    }

    async fn send(
        &self,
        session: &SessionContext,
        endpoint: &str,
        options: &RequestOptions,
    ) -> Result<Response> {
        let url = format!("{}{endpoint}", self.config.base_url);

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        // Caller headers win over the defaults on conflict.
        for (name, value) in &options.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ClientError::Configuration(format!("Invalid header name {name:?}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ClientError::Configuration(format!("Invalid header value: {e}")))?;
            headers.insert(name, value);
        }

        // Never an empty bearer: the header is omitted when no token
        // resolves for the session.
        if let Some((_, token)) = self.tokens.resolve(session) {
            if !token.is_empty() {
                let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|e| ClientError::Configuration(format!("Invalid token value: {e}")))?;
                headers.insert(AUTHORIZATION, bearer);
            }
        }

        let mut request = self
            .http_client
            .request(options.method.clone(), &url)
            .headers(headers);

        if let Some(body) = &options.body {
            request = request.json(body);
        }

        Ok(request.send().await?)
    }
}

/// Parses a response body: JSON when the server declares it, otherwise the
/// raw text wrapped in a message envelope.
async fn read_body(response: Response) -> Result<Value> {
    let status = response.status().as_u16();
    let is_json = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("application/json"));

    if is_json {
        Ok(response.json().await?)
    } else {
        let text = response.text().await?;
        let message = if text.is_empty() {
            format!("HTTP error! status: {status}")
        } else {
            text
        };
        Ok(json!({ "message": message }))
    }
}
