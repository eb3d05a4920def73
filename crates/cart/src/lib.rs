//! Storefront cart synchronization
//!
//! Keeps an optimistic local copy of the shopping cart and reconciles it
//! with the server, which stays the source of truth.

mod error;
mod item;
mod sync;

use std::time::Duration;

pub use error::CartError;
pub use item::{CartItem, LineKey};
pub use sync::CartSynchronizer;

/// 結果型
pub type Result<T> = std::result::Result<T, CartError>;

/// カートオプション
#[derive(Debug, Clone)]
pub struct CartOptions {
    /// Total attempts for a mutation answered with 409, first one included
    pub max_attempts: u32,
    /// Wait before the second attempt; later waits grow linearly
    pub backoff_base: Duration,
}

impl Default for CartOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(300),
        }
    }
}

impl CartOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff_base(mut self, backoff_base: Duration) -> Self {
        self.backoff_base = backoff_base;
        self
    }

    /// Wait after the `attempt`-th conflict (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.backoff_base * attempt
    }
}
