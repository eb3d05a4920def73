//! Proactive expiration checks.
//!
//! The monitor renews the access token shortly before it expires. Checks
//! run once at start-up, on every interval tick, and whenever a
//! [`Signal::CheckTokenNow`] is published (tab back in the foreground,
//! network back online).

use log::{debug, info, warn};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use storefront_broadcast::{Broadcaster, Signal};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::refresh::RefreshCoordinator;
use crate::store::TokenStore;
use crate::AuthClient;

pub use crate::token::time_to_expiry;

/// Shortest period between scheduled checks.
pub const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Answers whether the user has interacted recently.
pub trait ActivityProbe: Send + Sync {
    fn is_user_active(&self, idle_threshold: Duration) -> bool;
}

/// Result of a single expiration check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    NoCredential,
    /// The token outlives the threshold by this much.
    Fresh(Duration),
    SkippedIdle,
    Refreshed,
    Failed,
}

pub struct ExpirationMonitor {
    store: Arc<TokenStore>,
    coordinator: Arc<RefreshCoordinator>,
    signals: Arc<dyn Broadcaster<Signal>>,
    refresh_threshold: Duration,
    idle_gate: Option<(Arc<dyn ActivityProbe>, Duration)>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ExpirationMonitor {
    pub fn new(client: &AuthClient) -> Self {
        Self {
            store: Arc::clone(client.store()),
            coordinator: Arc::clone(client.coordinator()),
            signals: Arc::clone(client.signals()),
            refresh_threshold: client.options().refresh_threshold,
            idle_gate: None,
            task: Mutex::new(None),
        }
    }

    /// Skips proactive renewal while `probe` reports no activity within
    /// `idle_threshold`.
    pub fn with_idle_gate(mut self, probe: Arc<dyn ActivityProbe>, idle_threshold: Duration) -> Self {
        self.idle_gate = Some((probe, idle_threshold));
        self
    }

    pub fn refresh_threshold(&self) -> Duration {
        self.refresh_threshold
    }

    /// Checks the stored access token once and renews it if it expires
    /// within the threshold.
    pub async fn check_now(&self) -> CheckOutcome {
        if self.store.refresh_token().is_none() {
            return CheckOutcome::NoCredential;
        }

        let remaining = self
            .store
            .access_token()
            .map_or(Duration::ZERO, |token| time_to_expiry(&token));
        if remaining > self.refresh_threshold {
            debug!("Access token valid for another {:?}", remaining);
            return CheckOutcome::Fresh(remaining);
        }

        if let Some((probe, idle_threshold)) = &self.idle_gate {
            if !probe.is_user_active(*idle_threshold) {
                debug!("User idle, skipping proactive refresh");
                return CheckOutcome::SkippedIdle;
            }
        }

        info!("Access token expires in {:?}, refreshing", remaining);
        match self.coordinator.ensure_fresh_token().await {
            Ok(_) => CheckOutcome::Refreshed,
            Err(err) => {
                warn!("Proactive refresh failed: {}", err);
                CheckOutcome::Failed
            }
        }
    }

    /// Starts the periodic check. Restarting replaces the running task.
    /// Intervals below [`MIN_CHECK_INTERVAL`] are raised to it.
    pub fn schedule(self: &Arc<Self>, check_interval: Duration) {
        self.stop();
        let check_interval = check_interval.max(MIN_CHECK_INTERVAL);

        // Subscribe before spawning so no signal published after this call
        // is missed.
        let mut signals = self.signals.subscribe();
        let monitor: Weak<Self> = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut signals_open = true;

            loop {
                let triggered = tokio::select! {
                    _ = ticker.tick() => true,
                    signal = signals.recv(), if signals_open => match signal {
                        Some(Signal::CheckTokenNow) => true,
                        Some(_) => false,
                        None => {
                            signals_open = false;
                            false
                        }
                    },
                };
                if !triggered {
                    continue;
                }

                let Some(monitor) = monitor.upgrade() else {
                    break;
                };
                monitor.check_now().await;
            }
            debug!("Expiration monitor stopped");
        });

        *self.lock_task() = Some(handle);
        debug!("Expiration monitor scheduled every {:?}", check_interval);
    }

    pub fn is_running(&self) -> bool {
        self.lock_task()
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    /// Cancels the periodic check. Safe to call at any time.
    pub fn stop(&self) {
        if let Some(handle) = self.lock_task().take() {
            handle.abort();
            debug!("Expiration monitor cancelled");
        }
    }

    fn lock_task(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ExpirationMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
