//! Cross-context session synchronization.
//!
//! Every context of a device shares one [`LocalStorage`](crate::LocalStorage).
//! Changes made by other contexts arrive as [`StorageEvent`]s and are applied
//! to this context's session without any network call.

use log::{debug, info, trace, warn};
use std::sync::{Arc, Mutex, PoisonError};
use storefront_broadcast::StorageEvent;
use tokio::task::JoinHandle;

use crate::state::SessionState;
use crate::store::{ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, USER_KEY};
use crate::types::UserIdentity;
use crate::AuthClient;

/// What a remote change did to this context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteChange {
    LoggedOut,
    Adopted,
    IdentityUpdated,
    Ignored,
}

pub struct CrossTabSync {
    client: Arc<AuthClient>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CrossTabSync {
    pub fn new(client: Arc<AuthClient>) -> Self {
        Self {
            client,
            task: Mutex::new(None),
        }
    }

    /// Starts listening for changes made by other contexts.
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().map_or(false, |handle| !handle.is_finished()) {
            return;
        }

        let mut events = self.client.store().local().subscribe();
        let client = Arc::clone(&self.client);
        *task = Some(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                apply(&client, &event);
            }
            debug!("Storage change channel closed");
        }));
        debug!("Cross-context sync started for {}", self.client.store().context());
    }

    /// Applies one storage change.
    pub fn handle(&self, event: &StorageEvent) -> RemoteChange {
        apply(&self.client, event)
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    pub fn stop(&self) {
        let handle = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            handle.abort();
            debug!("Cross-context sync stopped");
        }
    }
}

impl Drop for CrossTabSync {
    fn drop(&mut self) {
        self.stop();
    }
}

fn apply(client: &AuthClient, event: &StorageEvent) -> RemoteChange {
    if event.origin == client.store().context() {
        return RemoteChange::Ignored;
    }
    trace!("Storage change for {} from {}", event.key, event.origin);

    let new_value = if event.is_removal() {
        None
    } else {
        event.new_value.as_deref()
    };
    match (event.key.as_str(), new_value) {
        (ACCESS_TOKEN_KEY | REFRESH_TOKEN_KEY, None) => {
            if client.state() == SessionState::Anonymous {
                return RemoteChange::Ignored;
            }
            info!("Another context signed out");
            client.release_remote_session();
            RemoteChange::LoggedOut
        }
        (ACCESS_TOKEN_KEY, Some(_)) => adopt(client),
        // A pair written while this context is anonymous may land here first.
        (REFRESH_TOKEN_KEY, Some(_)) if client.state() == SessionState::Anonymous => adopt(client),
        (USER_KEY, Some(raw)) => match serde_json::from_str::<UserIdentity>(raw) {
            Ok(user) => {
                client.set_user(Some(user));
                RemoteChange::IdentityUpdated
            }
            Err(err) => {
                warn!("Ignoring unreadable user identity from another context: {}", err);
                RemoteChange::Ignored
            }
        },
        _ => RemoteChange::Ignored,
    }
}

fn adopt(client: &AuthClient) -> RemoteChange {
    if client.adopt_remote_session() {
        RemoteChange::Adopted
    } else {
        RemoteChange::Ignored
    }
}
