//! Role-keyed token storage with a legacy cookie mirror

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use papaya::HashMap;

use crate::types::{Role, SessionContext};

/// Durable key the pre-portal frontend stored its single token under.
pub const LEGACY_TOKEN_KEY: &str = "token";

/// Cookie mirroring the buyer token for server-side routing checks.
pub const LEGACY_COOKIE_NAME: &str = "token";

/// Lifetime of the mirrored cookie in seconds.
const COOKIE_MAX_AGE_SECS: u64 = 86_400;

/// Auxiliary per-role identity fields, removed on a hard logout.
pub const AUX_KEYS: [&str; 5] = [
    "buyer_phone",
    "manufacturer_phone",
    "buyer_onboarding_complete",
    "manufacturer_onboarding_complete",
    "active_role",
];

/// Mirrored cookie record carrying the attributes the backend expects.
#[derive(Debug, Clone)]
pub struct CookieRecord {
    pub value: String,
    pub path: &'static str,
    pub max_age_secs: u64,
    pub same_site: &'static str,
    issued_at_secs: u64,
}

impl CookieRecord {
    fn new(value: String) -> Self {
        Self {
            value,
            path: "/",
            max_age_secs: COOKIE_MAX_AGE_SECS,
            same_site: "Lax",
            issued_at_secs: now_secs(),
        }
    }

    /// Check if the cookie has outlived its max-age.
    fn is_expired(&self) -> bool {
        now_secs() >= self.issued_at_secs + self.max_age_secs
    }

    /// Rendered `Set-Cookie` attributes for hosts that forward the mirror.
    pub fn to_set_cookie_header(&self) -> String {
        format!(
            "{LEGACY_COOKIE_NAME}={}; path={}; max-age={}; SameSite={}",
            self.value, self.path, self.max_age_secs, self.same_site
        )
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// Thread-safe store for per-portal bearer tokens.
///
/// Cheap to clone; all clones share the same backing maps. Writes are
/// synchronous, best-effort, and infallible: persistence here is advisory,
/// the server stays the source of truth for authorization.
#[derive(Clone)]
pub struct TokenStore {
    slots: Arc<HashMap<String, String>>,
    cookies: Arc<HashMap<String, CookieRecord>>,
}

impl TokenStore {
    /// Create a new token store
    pub fn new() -> Self {
        Self {
            slots: Arc::new(HashMap::new()),
            cookies: Arc::new(HashMap::new()),
        }
    }

    /// Store `token` in `role`'s slot, overwriting any previous value.
    ///
    /// The buyer slot is additionally mirrored into the legacy cookie with
    /// `path=/`, `max-age=86400`, `SameSite=Lax`.
    pub fn set_token(&self, token: &str, role: Role) {
        self.slots
            .pin()
            .insert(role.token_key().to_string(), token.to_string());

        if role == Role::Buyer {
            self.cookies.pin().insert(
                LEGACY_COOKIE_NAME.to_string(),
                CookieRecord::new(token.to_string()),
            );
        }
    }

    /// Token slot lookup by role.
    pub fn token_for_role(&self, role: Role) -> Option<String> {
        self.slots.pin().get(role.token_key()).cloned()
    }

    /// Token for the portal owning `path`.
    ///
    /// Known portal prefixes read only their own slot. Any other path falls
    /// back through buyer, manufacturer, admin in that order.
    pub fn token_for_path(&self, path: &str) -> Option<String> {
        self.resolve_path(path).map(|(_, token)| token)
    }

    /// Token plus owning role for a session; an explicit session role wins
    /// over the path prefix.
    pub fn resolve(&self, session: &SessionContext) -> Option<(Role, String)> {
        match session.role {
            Some(role) => self.token_for_role(role).map(|token| (role, token)),
            None => self.resolve_path(&session.path),
        }
    }

    fn resolve_path(&self, path: &str) -> Option<(Role, String)> {
        if let Some(role) = Role::from_path(path) {
            return self.token_for_role(role).map(|token| (role, token));
        }

        Role::FALLBACK_ORDER
            .iter()
            .find_map(|&role| self.token_for_role(role).map(|token| (role, token)))
    }

    /// Delete `role`'s token; the buyer also drops the cookie mirror.
    pub fn remove_token(&self, role: Role) {
        self.slots.pin().remove(role.token_key());

        if role == Role::Buyer {
            self.cookies.pin().remove(LEGACY_COOKIE_NAME);
        }
    }

    /// Delete every role's token, the legacy key, and the cookie mirror.
    pub fn remove_all_tokens(&self) {
        for role in Role::FALLBACK_ORDER {
            self.remove_token(role);
        }
        self.slots.pin().remove(LEGACY_TOKEN_KEY);
    }

    /// Hard logout across the whole application: every token plus the
    /// auxiliary identity fields (phone numbers, onboarding flags, cached
    /// role).
    pub fn clear_all_auth_data(&self) {
        self.remove_all_tokens();

        let slots = self.slots.pin();
        for key in AUX_KEYS {
            slots.remove(key);
        }
    }

    /// Current value of the legacy cookie mirror, if still within max-age.
    pub fn legacy_cookie(&self) -> Option<CookieRecord> {
        self.cookies
            .pin()
            .get(LEGACY_COOKIE_NAME)
            .filter(|cookie| !cookie.is_expired())
            .cloned()
    }

    /// Write an auxiliary identity field.
    pub fn set_aux(&self, key: &str, value: &str) {
        self.slots
            .pin()
            .insert(key.to_string(), value.to_string());
    }

    /// Read an auxiliary identity field.
    pub fn aux(&self, key: &str) -> Option<String> {
        self.slots.pin().get(key).cloned()
    }
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new()
    }
}
