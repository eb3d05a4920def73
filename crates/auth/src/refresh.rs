//! Single-flight token renewal.
//!
//! At most one refresh request is in flight per context. The in-flight
//! attempt is represented by a ticket holding a shared future; every caller
//! that finds a ticket awaits that future and observes the same outcome.

use futures_util::future::{self, BoxFuture, FutureExt, Shared};
use log::{debug, error, info, warn};
use reqwest::header::{CONTENT_TYPE, COOKIE};
use reqwest::Client;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use storefront_broadcast::{Broadcaster, Signal};
use tokio::sync::watch;

use crate::error::RefreshError;
use crate::state::{EndReason, SessionState, SessionStateMachine};
use crate::store::TokenStore;
use crate::token::{is_expired, TokenPair};
use crate::types::{RefreshRequest, RefreshResponse};

type RefreshOutcome = Result<String, RefreshError>;
type SharedRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;

struct Ticket {
    generation: u64,
    outcome: SharedRefresh,
    cancel: watch::Sender<bool>,
}

pub struct RefreshCoordinator {
    http_client: Client,
    refresh_url: String,
    store: Arc<TokenStore>,
    state: Arc<SessionStateMachine>,
    signals: Arc<dyn Broadcaster<Signal>>,
    request_timeout: Duration,
    ticket: Mutex<Option<Ticket>>,
    next_generation: AtomicU64,
    refresh_calls: AtomicU64,
}

impl RefreshCoordinator {
    pub fn new(
        http_client: Client,
        refresh_url: &str,
        store: Arc<TokenStore>,
        state: Arc<SessionStateMachine>,
        signals: Arc<dyn Broadcaster<Signal>>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            http_client,
            refresh_url: refresh_url.to_string(),
            store,
            state,
            signals,
            request_timeout,
            ticket: Mutex::new(None),
            next_generation: AtomicU64::new(1),
            refresh_calls: AtomicU64::new(0),
        }
    }

    /// Returns a fresh access token, renewing it if needed.
    ///
    /// Joins the in-flight renewal when there is one. On failure the token
    /// store is cleared and the session ends with
    /// [`EndReason::RefreshFailed`].
    pub async fn ensure_fresh_token(self: &Arc<Self>) -> Result<String, RefreshError> {
        self.ticket_or_start(None).await
    }

    /// Like [`ensure_fresh_token`](Self::ensure_fresh_token), for a caller
    /// whose request was rejected with `stale`. If the store already holds a
    /// different live token, it is returned without a network call.
    pub async fn ensure_fresh_token_after(
        self: &Arc<Self>,
        stale: Option<&str>,
    ) -> Result<String, RefreshError> {
        self.ticket_or_start(Some(stale)).await
    }

    /// Drops the in-flight renewal; its waiters fail with
    /// [`RefreshError::Cancelled`].
    pub fn cancel(&self) {
        let ticket = self.lock_ticket().take();
        if let Some(ticket) = ticket {
            info!("Cancelling in-flight token refresh");
            let _ = ticket.cancel.send(true);
        }
    }

    pub fn is_refreshing(&self) -> bool {
        self.lock_ticket().is_some()
    }

    /// Number of refresh requests sent so far.
    pub fn refresh_count(&self) -> u64 {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    fn lock_ticket(&self) -> std::sync::MutexGuard<'_, Option<Ticket>> {
        self.ticket.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// With `stale` set, the store is checked under the ticket lock so a
    /// renewal that finished a moment ago is not repeated.
    fn ticket_or_start(self: &Arc<Self>, stale: Option<Option<&str>>) -> SharedRefresh {
        let mut slot = self.lock_ticket();
        if let Some(ticket) = slot.as_ref() {
            debug!("Joining in-flight token refresh");
            return ticket.outcome.clone();
        }

        if let (Some(stale), Some(current)) = (stale, self.store.access_token()) {
            if Some(current.as_str()) != stale && !is_expired(&current) {
                debug!("Access token already renewed by another caller");
                return future::ready(Ok(current)).boxed().shared();
            }
        }

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let (cancel, cancelled) = watch::channel(false);
        let this = Arc::clone(self);
        let outcome = async move {
            let _guard = TicketGuard {
                coordinator: Arc::clone(&this),
                generation,
            };
            this.run(cancelled).await
        }
        .boxed()
        .shared();

        *slot = Some(Ticket {
            generation,
            outcome: outcome.clone(),
            cancel,
        });
        outcome
    }

    fn release(&self, generation: u64) {
        let mut slot = self.lock_ticket();
        if slot.as_ref().map(|t| t.generation) == Some(generation) {
            *slot = None;
        }
    }

    async fn run(&self, mut cancelled: watch::Receiver<bool>) -> RefreshOutcome {
        // Guests have no session to mark as refreshing.
        if self.state.current() != SessionState::Anonymous {
            self.state.transition(SessionState::Refreshing);
        }

        let epoch = self.state.epoch();
        let result = tokio::select! {
            result = self.request_new_pair() => result,
            _ = wait_for_cancel(&mut cancelled) => Err(RefreshError::Cancelled),
        };

        match result {
            Ok(_) if self.state.epoch() != epoch => {
                debug!("Session ended during token refresh, dropping new pair");
                Err(RefreshError::Cancelled)
            }
            Ok(pair) => {
                self.store.save(&pair);
                self.state.transition(SessionState::Authenticated);
                if let Err(err) = self.signals.publish(Signal::TokenRefreshed) {
                    warn!("Failed to announce refreshed token: {}", err);
                }
                info!("Access token refreshed");
                Ok(pair.access_token)
            }
            Err(RefreshError::Cancelled) => {
                debug!("Token refresh cancelled");
                Err(RefreshError::Cancelled)
            }
            Err(err) => {
                error!("Token refresh failed, ending session: {}", err);
                self.store.clear();
                self.state.transition(SessionState::Expired);
                self.state.end(EndReason::RefreshFailed);
                Err(err)
            }
        }
    }

    async fn request_new_pair(&self) -> Result<TokenPair, RefreshError> {
        let refresh_token = self
            .store
            .refresh_token()
            .ok_or(RefreshError::MissingRefreshToken)?;

        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        debug!("Requesting new access token");

        let mut request = self
            .http_client
            .post(&self.refresh_url)
            .header(CONTENT_TYPE, "application/json")
            .json(&RefreshRequest {
                refresh_token: &refresh_token,
            });
        if let Some(cookie) = self.store.cookie_header() {
            request = request.header(COOKIE, cookie);
        }

        let response = match tokio::time::timeout(self.request_timeout, request.send()).await {
            Err(_) => return Err(RefreshError::Timeout),
            Ok(Err(err)) if err.is_timeout() => return Err(RefreshError::Timeout),
            Ok(Err(err)) => return Err(RefreshError::Network(err.to_string())),
            Ok(Ok(response)) => response,
        };

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(RefreshError::Rejected { status, message });
        }

        let body: RefreshResponse = response
            .json()
            .await
            .map_err(|err| RefreshError::InvalidResponse(err.to_string()))?;

        // Servers that do not rotate refresh tokens omit them.
        Ok(TokenPair {
            access_token: body.access_token,
            refresh_token: body.refresh_token.unwrap_or(refresh_token),
        })
    }
}

/// Releases the ticket however the refresh future finishes.
struct TicketGuard {
    coordinator: Arc<RefreshCoordinator>,
    generation: u64,
}

impl Drop for TicketGuard {
    fn drop(&mut self) {
        self.coordinator.release(self.generation);
    }
}

async fn wait_for_cancel(cancelled: &mut watch::Receiver<bool>) {
    loop {
        let is_cancelled = *cancelled.borrow();
        if is_cancelled {
            return;
        }
        if cancelled.changed().await.is_err() {
            // Ticket released without cancelling.
            std::future::pending::<()>().await;
        }
    }
}
