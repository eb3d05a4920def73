//! Backing stores for persisted credentials.
//!
//! [`LocalStorage`] is the device-local store: it survives reloads, is never
//! sent with requests and notifies other contexts about every change.
//! [`CookieJar`] is the HTTP-readable store: entries expire and are rendered
//! into a `Cookie` header for requests to the API origin.
//!
//! Both are cheap handles over shared memory, so several contexts of one
//! device can hold clones of the same store.

use chrono::{DateTime, Utc};
use log::{trace, warn};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use storefront_broadcast::{Broadcaster, ContextId, LocalBroadcast, StorageEvent, Subscription};

/// Minimal key/value contract shared by both mirrors.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
}

/// Device-local persistent store with cross-context change notifications.
#[derive(Clone)]
pub struct LocalStorage {
    entries: Arc<RwLock<HashMap<String, String>>>,
    events: Arc<dyn Broadcaster<StorageEvent>>,
    context: ContextId,
}

impl LocalStorage {
    /// Creates an empty store with an in-process change channel.
    pub fn new() -> Self {
        Self::with_broadcaster(Arc::new(LocalBroadcast::new()))
    }

    /// Creates an empty store that publishes changes through `events`.
    pub fn with_broadcaster(events: Arc<dyn Broadcaster<StorageEvent>>) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            events,
            context: ContextId::new(),
        }
    }

    /// A handle to the same store for another browsing context.
    pub fn for_context(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            events: Arc::clone(&self.events),
            context: ContextId::new(),
        }
    }

    /// The context writes through this handle are attributed to.
    pub fn context(&self) -> ContextId {
        self.context
    }

    /// Change notifications for every context, including this one.
    pub fn subscribe(&self) -> Subscription<StorageEvent> {
        self.events.subscribe()
    }

    fn notify(&self, key: &str, old_value: Option<String>, new_value: Option<String>) {
        let event = StorageEvent {
            key: key.to_string(),
            old_value,
            new_value,
            origin: self.context,
        };
        if let Err(err) = self.events.publish(event) {
            warn!("Failed to publish storage change for {}: {}", key, err);
        }
    }
}

impl Default for LocalStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for LocalStorage {
    fn get(&self, key: &str) -> Option<String> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        let old_value = {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            entries.insert(key.to_string(), value.to_string())
        };
        if old_value.as_deref() != Some(value) {
            self.notify(key, old_value, Some(value.to_string()));
        }
    }

    fn remove(&self, key: &str) {
        let old_value = {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            entries.remove(key)
        };
        if old_value.is_some() {
            self.notify(key, old_value, None);
        }
    }
}

#[derive(Debug, Clone)]
struct Cookie {
    value: String,
    expires_at: DateTime<Utc>,
}

impl Cookie {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// HTTP-readable store; every entry carries an expiry horizon.
#[derive(Debug, Clone)]
pub struct CookieJar {
    cookies: Arc<RwLock<BTreeMap<String, Cookie>>>,
    default_ttl: Duration,
}

impl CookieJar {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            cookies: Arc::new(RwLock::new(BTreeMap::new())),
            default_ttl,
        }
    }

    pub fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(3650));
        let cookie = Cookie {
            value: value.to_string(),
            expires_at: Utc::now() + ttl,
        };
        let mut cookies = self.cookies.write().unwrap_or_else(PoisonError::into_inner);
        cookies.insert(key.to_string(), cookie);
    }

    /// Renders live cookies as a `Cookie` request header value.
    pub fn header_value(&self) -> Option<String> {
        let now = Utc::now();
        let cookies = self.cookies.read().unwrap_or_else(PoisonError::into_inner);
        let pairs: Vec<String> = cookies
            .iter()
            .filter(|(_, cookie)| cookie.is_live(now))
            .map(|(key, cookie)| format!("{}={}", key, urlencoding::encode(&cookie.value)))
            .collect();

        if pairs.is_empty() {
            None
        } else {
            Some(pairs.join("; "))
        }
    }
}

impl Default for CookieJar {
    fn default() -> Self {
        Self::new(Duration::from_secs(7 * 24 * 60 * 60))
    }
}

impl KeyValueStore for CookieJar {
    fn get(&self, key: &str) -> Option<String> {
        let now = Utc::now();
        let mut cookies = self.cookies.write().unwrap_or_else(PoisonError::into_inner);
        match cookies.get(key) {
            Some(cookie) if cookie.is_live(now) => Some(cookie.value.clone()),
            Some(_) => {
                trace!("Cookie {} expired", key);
                cookies.remove(key);
                None
            }
            None => None,
        }
    }

    fn set(&self, key: &str, value: &str) {
        self.set_with_ttl(key, value, self.default_ttl);
    }

    fn remove(&self, key: &str) {
        let mut cookies = self.cookies.write().unwrap_or_else(PoisonError::into_inner);
        cookies.remove(key);
    }
}
