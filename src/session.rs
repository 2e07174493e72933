//! Silent session refresh and expiry handling

use async_singleflight::Group;
use reqwest::Client;
use tracing::{debug, warn};

use crate::token_store::TokenStore;
use crate::types::{RefreshResponse, Role, SessionContext};

/// Token refresh endpoint, relative to the API base URL.
pub const REFRESH_ENDPOINT: &str = "/auth/refresh-token";

/// Performs the single silent refresh the request protocol allows.
///
/// The refresh call goes out through a raw `reqwest` request, never through
/// [`crate::ApiClient::request`]: routing it through the gateway's own 401
/// handling would recurse.
pub struct SessionRefresher {
    base_url: String,
    http_client: Client,
    tokens: TokenStore,
    /// Singleflight group so concurrent 401s share one in-flight refresh per
    /// role. Error type is String because singleflight requires a shared
    /// error type.
    refresh_singleflight: Group<String, String>,
}

impl SessionRefresher {
    pub fn new(base_url: String, http_client: Client, tokens: TokenStore) -> Self {
        Self {
            base_url,
            http_client,
            tokens,
            refresh_singleflight: Group::new(),
        }
    }

    /// One refresh attempt for the session's owning role.
    ///
    /// Returns false without a network call when no token resolves. A false
    /// return is a signal to proceed to expiry handling, never an error.
    pub async fn try_refresh_once(&self, session: &SessionContext) -> bool {
        let Some((role, stale_token)) = self.tokens.resolve(session) else {
            debug!(path = %session.path, "No token to refresh");
            return false;
        };

        let role_key = role.as_str().to_string();
        let (token_opt, error_opt, _shared) = self
            .refresh_singleflight
            .work(&role_key, async {
                match self.do_refresh(role, &stale_token).await {
                    Ok(token) => Ok(token),
                    Err(reason) => {
                        warn!(role = %role, reason = %reason, "Token refresh failed");
                        Err(reason)
                    }
                }
            })
            .await;

        matches!((token_opt, error_opt), (Some(_), None))
    }

    /// Refresh round trip: authenticate with the stale token, store the
    /// replacement under the same role.
    async fn do_refresh(&self, role: Role, stale_token: &str) -> Result<String, String> {
        let url = format!("{}{REFRESH_ENDPOINT}", self.base_url);

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(stale_token)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            return Err(format!("refresh rejected with status {}", response.status()));
        }

        let body: RefreshResponse = response.json().await.map_err(|e| e.to_string())?;
        let Some(token) = body.into_token() else {
            return Err("refresh response carried no token".to_string());
        };

        self.tokens.set_token(&token, role);
        debug!(role = %role, "Access token refreshed");

        Ok(token)
    }
}

/// Clears the credentials of an expired session and names the portal entry
/// path the host should navigate to.
///
/// Paths outside every known portal prefix clear all auth data and leave
/// navigation to the caller. Repeated calls on an already-cleared session
/// are no-ops beyond redundant deletes.
pub fn expire_session(tokens: &TokenStore, session: &SessionContext) -> Option<String> {
    let role = session.role.or_else(|| Role::from_path(&session.path));

    match role {
        Some(role) => {
            tokens.remove_token(role);
            Some(role.portal_root().to_string())
        }
        None => {
            tokens.clear_all_auth_data();
            None
        }
    }
}
