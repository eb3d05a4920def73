use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identity of one browsing context (tab or window).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextId(Uuid);

impl ContextId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A change to a key of the shared device-local store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageEvent {
    pub key: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    /// The context that performed the write.
    pub origin: ContextId,
}

impl StorageEvent {
    /// True when the key was removed or set to an empty value.
    pub fn is_removal(&self) -> bool {
        self.new_value.as_deref().map_or(true, str::is_empty)
    }
}

/// Internal signals exchanged between components of one context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    /// Ask the expiration monitor to check the access token right away.
    CheckTokenNow,
    /// A new access token has been stored.
    TokenRefreshed,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(new_value: Option<&str>) -> StorageEvent {
        StorageEvent {
            key: "accessToken".to_string(),
            old_value: Some("old".to_string()),
            new_value: new_value.map(str::to_string),
            origin: ContextId::new(),
        }
    }

    #[test]
    fn test_removal_detection() {
        assert!(event(None).is_removal());
        assert!(event(Some("")).is_removal());
        assert!(!event(Some("token")).is_removal());
    }

    #[test]
    fn test_context_ids_are_unique() {
        assert_ne!(ContextId::new(), ContextId::new());
    }
}
