//! Configuration options for the storefront client

use std::env::{self, VarError};
use std::time::Duration;
use storefront_auth::{AuthOptions, MIN_CHECK_INTERVAL};
use storefront_cart::CartOptions;

use crate::error::{Error, Result};

/// Configuration options for the storefront client
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Renew the access token when it expires within this window
    pub refresh_threshold: Duration,

    /// How often the expiration monitor checks the access token
    pub check_interval: Duration,

    /// Upper bound for every network call
    pub request_timeout: Duration,

    /// Cookie lifetime for access tokens without a readable expiry
    pub access_cookie_ttl: Duration,

    /// Cookie lifetime for refresh tokens and the user identity
    pub refresh_cookie_ttl: Duration,

    /// Attempts per cart mutation when the server answers 409
    pub cart_max_attempts: u32,

    /// First cart backoff delay
    pub cart_backoff_base: Duration,

    /// Skip proactive renewal after this much inactivity
    pub idle_timeout: Option<Duration>,

    /// Whether to renew an expired access token before sending a request
    pub auto_refresh_token: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        let auth = AuthOptions::default();
        let cart = CartOptions::default();
        Self {
            refresh_threshold: auth.refresh_threshold,
            check_interval: auth.check_interval,
            request_timeout: auth.request_timeout,
            access_cookie_ttl: Duration::from_secs(15 * 60),
            refresh_cookie_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            cart_max_attempts: cart.max_attempts,
            cart_backoff_base: cart.backoff_base,
            idle_timeout: auth.idle_timeout,
            auto_refresh_token: auth.auto_refresh_token,
        }
    }
}

impl ClientOptions {
    /// Reads `STOREFRONT_*` environment variables on top of the defaults.
    ///
    /// Durations are whole seconds, except `STOREFRONT_CART_BACKOFF_MS`.
    /// A variable that is set but unreadable is a configuration error.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| match env::var(name) {
            Ok(value) => Ok(Some(value)),
            Err(VarError::NotPresent) => Ok(None),
            Err(VarError::NotUnicode(_)) => Err(Error::config(format!("{} is not valid UTF-8", name))),
        })
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Result<Option<String>>,
    {
        let mut options = Self::default();

        if let Some(value) = seconds(&lookup, "STOREFRONT_REFRESH_THRESHOLD_SECS")? {
            options.refresh_threshold = value;
        }
        if let Some(value) = seconds(&lookup, "STOREFRONT_CHECK_INTERVAL_SECS")? {
            if value.is_zero() {
                return Err(Error::config("STOREFRONT_CHECK_INTERVAL_SECS must be positive"));
            }
            options.check_interval = value;
        }
        if let Some(value) = seconds(&lookup, "STOREFRONT_REQUEST_TIMEOUT_SECS")? {
            options.request_timeout = value;
        }
        if let Some(value) = seconds(&lookup, "STOREFRONT_ACCESS_COOKIE_TTL_SECS")? {
            options.access_cookie_ttl = value;
        }
        if let Some(value) = seconds(&lookup, "STOREFRONT_REFRESH_COOKIE_TTL_SECS")? {
            options.refresh_cookie_ttl = value;
        }
        if let Some(value) = number(&lookup, "STOREFRONT_CART_MAX_ATTEMPTS")? {
            let attempts = u32::try_from(value)
                .map_err(|_| Error::config("STOREFRONT_CART_MAX_ATTEMPTS is too large"))?;
            options.cart_max_attempts = attempts.max(1);
        }
        if let Some(value) = number(&lookup, "STOREFRONT_CART_BACKOFF_MS")? {
            options.cart_backoff_base = Duration::from_millis(value);
        }
        if let Some(value) = seconds(&lookup, "STOREFRONT_IDLE_TIMEOUT_SECS")? {
            options.idle_timeout = Some(value).filter(|idle| !idle.is_zero());
        }
        if let Some(raw) = lookup("STOREFRONT_AUTO_REFRESH_TOKEN")? {
            options.auto_refresh_token = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(Error::config(format!(
                        "STOREFRONT_AUTO_REFRESH_TOKEN must be a boolean, got {:?}",
                        raw
                    )))
                }
            };
        }

        Ok(options)
    }

    pub fn with_refresh_threshold(mut self, value: Duration) -> Self {
        self.refresh_threshold = value;
        self
    }

    /// Set the expiration check period, at least [`MIN_CHECK_INTERVAL`]
    pub fn with_check_interval(mut self, value: Duration) -> Self {
        self.check_interval = value.max(MIN_CHECK_INTERVAL);
        self
    }

    /// Set the request timeout
    pub fn with_request_timeout(mut self, value: Duration) -> Self {
        self.request_timeout = value;
        self
    }

    pub fn with_cookie_ttls(mut self, access: Duration, refresh: Duration) -> Self {
        self.access_cookie_ttl = access;
        self.refresh_cookie_ttl = refresh;
        self
    }

    pub fn with_cart_max_attempts(mut self, value: u32) -> Self {
        self.cart_max_attempts = value.max(1);
        self
    }

    pub fn with_cart_backoff_base(mut self, value: Duration) -> Self {
        self.cart_backoff_base = value;
        self
    }

    pub fn with_idle_timeout(mut self, value: Option<Duration>) -> Self {
        self.idle_timeout = value;
        self
    }

    /// Set whether to automatically refresh the token
    pub fn with_auto_refresh_token(mut self, value: bool) -> Self {
        self.auto_refresh_token = value;
        self
    }

    pub fn auth_options(&self) -> AuthOptions {
        AuthOptions {
            refresh_threshold: self.refresh_threshold,
            check_interval: self.check_interval,
            request_timeout: self.request_timeout,
            auto_refresh_token: self.auto_refresh_token,
            idle_timeout: self.idle_timeout,
        }
    }

    pub fn cart_options(&self) -> CartOptions {
        CartOptions::new()
            .with_max_attempts(self.cart_max_attempts)
            .with_backoff_base(self.cart_backoff_base)
    }
}

fn number<F>(lookup: &F, name: &str) -> Result<Option<u64>>
where
    F: Fn(&str) -> Result<Option<String>>,
{
    match lookup(name)? {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<u64>().map(Some).map_err(|_| {
            Error::config(format!("{} must be a non-negative integer, got {:?}", name, raw))
        }),
    }
}

fn seconds<F>(lookup: &F, name: &str) -> Result<Option<Duration>>
where
    F: Fn(&str) -> Result<Option<String>>,
{
    Ok(number(lookup, name)?.map(Duration::from_secs))
}
