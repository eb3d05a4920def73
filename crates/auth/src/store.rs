//! Token store mirrored across the device-local and HTTP-readable stores

use log::{debug, warn};
use std::time::Duration;
use storefront_broadcast::ContextId;

use crate::storage::{CookieJar, KeyValueStore, LocalStorage};
use crate::token::{time_to_expiry, TokenPair};
use crate::types::UserIdentity;

pub const ACCESS_TOKEN_KEY: &str = "accessToken";
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";
pub const USER_KEY: &str = "user";

/// Persists the credential pair and the user identity in both mirrors.
///
/// Writes go to the device-local store first and then to the cookie jar.
/// Reads prefer the device-local store; a value found only in the cookie jar
/// is copied back into the device-local store.
#[derive(Clone)]
pub struct TokenStore {
    local: LocalStorage,
    cookies: CookieJar,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenStore {
    pub fn new(local: LocalStorage, cookies: CookieJar) -> Self {
        Self {
            local,
            cookies,
            access_ttl: Duration::from_secs(15 * 60),
            refresh_ttl: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }

    /// Cookie horizons used when a token carries no readable expiry.
    pub fn with_cookie_ttls(mut self, access_ttl: Duration, refresh_ttl: Duration) -> Self {
        self.access_ttl = access_ttl;
        self.refresh_ttl = refresh_ttl;
        self
    }

    pub fn local(&self) -> &LocalStorage {
        &self.local
    }

    pub fn cookies(&self) -> &CookieJar {
        &self.cookies
    }

    pub fn context(&self) -> ContextId {
        self.local.context()
    }

    pub fn save(&self, pair: &TokenPair) {
        self.local.set(ACCESS_TOKEN_KEY, &pair.access_token);
        self.local.set(REFRESH_TOKEN_KEY, &pair.refresh_token);

        self.cookies.set_with_ttl(
            ACCESS_TOKEN_KEY,
            &pair.access_token,
            horizon(&pair.access_token, self.access_ttl),
        );
        self.cookies.set_with_ttl(
            REFRESH_TOKEN_KEY,
            &pair.refresh_token,
            horizon(&pair.refresh_token, self.refresh_ttl),
        );
        debug!("Saved credential pair to both mirrors");
    }

    /// Both tokens, or `None` if either is missing from both mirrors.
    pub fn load(&self) -> Option<TokenPair> {
        let access_token = self.read(ACCESS_TOKEN_KEY)?;
        let refresh_token = self.read(REFRESH_TOKEN_KEY)?;
        Some(TokenPair {
            access_token,
            refresh_token,
        })
    }

    pub fn access_token(&self) -> Option<String> {
        self.read(ACCESS_TOKEN_KEY)
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.read(REFRESH_TOKEN_KEY)
    }

    pub fn save_user(&self, user: &UserIdentity) {
        let raw = match serde_json::to_string(user) {
            Ok(raw) => raw,
            Err(err) => {
                warn!("Could not serialize user identity: {}", err);
                return;
            }
        };
        self.local.set(USER_KEY, &raw);
        self.cookies.set_with_ttl(USER_KEY, &raw, self.refresh_ttl);
    }

    pub fn load_user(&self) -> Option<UserIdentity> {
        let raw = self.read(USER_KEY)?;
        match serde_json::from_str(&raw) {
            Ok(user) => Some(user),
            Err(err) => {
                warn!("Ignoring unreadable user identity: {}", err);
                None
            }
        }
    }

    /// Empties both mirrors. Safe to call any number of times.
    pub fn clear(&self) {
        for key in [ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, USER_KEY] {
            self.local.remove(key);
        }
        for key in [ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, USER_KEY] {
            self.cookies.remove(key);
        }
    }

    pub fn cookie_header(&self) -> Option<String> {
        self.cookies.header_value()
    }

    fn read(&self, key: &str) -> Option<String> {
        if let Some(value) = self.local.get(key).filter(|v| !v.is_empty()) {
            return Some(value);
        }

        let value = self.cookies.get(key).filter(|v| !v.is_empty())?;
        debug!("Repairing device-local {} from cookie mirror", key);
        self.local.set(key, &value);
        Some(value)
    }
}

/// Cookie lifetime: the token's own expiry when readable, else `fallback`.
fn horizon(token: &str, fallback: Duration) -> Duration {
    match time_to_expiry(token) {
        remaining if remaining.is_zero() => fallback,
        remaining => remaining,
    }
}
