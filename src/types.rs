//! Type definitions shared across the client

use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;

/// Marketplace portal roles.
///
/// A role selects the token slot credentials are stored under and the portal
/// path prefix requests are attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Buyer,
    Manufacturer,
    Admin,
}

impl Role {
    /// Lookup order for paths outside any known portal prefix.
    pub const FALLBACK_ORDER: [Role; 3] = [Role::Buyer, Role::Manufacturer, Role::Admin];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Buyer => "buyer",
            Role::Manufacturer => "manufacturer",
            Role::Admin => "admin",
        }
    }

    /// Durable storage key of this role's token slot.
    pub fn token_key(&self) -> &'static str {
        match self {
            Role::Buyer => "buyer_token",
            Role::Manufacturer => "manufacturer_token",
            Role::Admin => "admin_token",
        }
    }

    /// Navigation prefix of the portal this role signs in to.
    pub fn portal_prefix(&self) -> &'static str {
        match self {
            Role::Buyer => "/buyer-portal",
            Role::Manufacturer => "/manufacturer-portal",
            Role::Admin => "/admin",
        }
    }

    /// Entry path of the portal, used as the post-expiry redirect target.
    pub fn portal_root(&self) -> &'static str {
        self.portal_prefix()
    }

    /// Role owning `path`, judged by portal prefix alone.
    pub fn from_path(path: &str) -> Option<Role> {
        if path.starts_with("/admin") {
            Some(Role::Admin)
        } else if path.starts_with("/buyer-portal") {
            Some(Role::Buyer)
        } else if path.starts_with("/manufacturer-portal") {
            Some(Role::Manufacturer)
        } else {
            None
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a request is being made from: the current navigation path plus an
/// optional explicit role supplied by the host application.
///
/// An explicit role always wins over path-prefix inference.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub path: String,
    pub role: Option<Role>,
}

impl SessionContext {
    pub fn from_path(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            role: None,
        }
    }

    pub fn with_role(path: impl Into<String>, role: Role) -> Self {
        Self {
            path: path.into(),
            role: Some(role),
        }
    }
}

/// Per-call request parameters. Constructed fresh for every call, never stored.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub method: Method,
    /// Extra headers; these win over the gateway's defaults on conflict.
    pub headers: Vec<(String, String)>,
    /// JSON body, serialized as-is.
    pub body: Option<Value>,
    /// Disables the silent refresh for this call. A 401 then goes straight
    /// to expiry handling.
    pub skip_refresh: bool,
}

impl RequestOptions {
    pub fn get() -> Self {
        Self::default()
    }

    pub fn post(body: Value) -> Self {
        Self {
            method: Method::POST,
            body: Some(body),
            ..Self::default()
        }
    }

    pub fn put(body: Value) -> Self {
        Self {
            method: Method::PUT,
            body: Some(body),
            ..Self::default()
        }
    }

    pub fn patch(body: Value) -> Self {
        Self {
            method: Method::PATCH,
            body: Some(body),
            ..Self::default()
        }
    }

    pub fn delete() -> Self {
        Self {
            method: Method::DELETE,
            ..Self::default()
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Success envelope of `POST /auth/refresh-token`.
///
/// Older backend versions return the token at the top level, newer ones nest
/// it under `data`; both locations are accepted.
#[derive(Debug, Deserialize)]
pub struct RefreshResponse {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub data: Option<RefreshData>,
}

#[derive(Debug, Deserialize)]
pub struct RefreshData {
    #[serde(default)]
    pub token: Option<String>,
}

impl RefreshResponse {
    /// The refreshed token from either accepted location.
    pub fn into_token(self) -> Option<String> {
        self.token.or(self.data.and_then(|d| d.token))
    }
}
