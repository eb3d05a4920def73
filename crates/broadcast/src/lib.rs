//! Publish/subscribe transport for storefront browsing contexts.
//!
//! Contexts (tabs, windows) never share in-memory session state. They learn
//! about each other only through messages published here: storage change
//! notifications between contexts and internal signals within one context.

mod channel;
mod error;
mod message;

pub use channel::{Broadcaster, LocalBroadcast, Subscription};
pub use error::BroadcastError;
pub use message::{ContextId, Signal, StorageEvent};
