//! Credential lifecycle for storefront clients
//!
//! This crate keeps an access token valid across time, browsing contexts and
//! concurrent requests: a mirrored token store, single-flight renewal, a
//! request layer that retries once after a 401, a proactive expiration
//! monitor, cross-context synchronization and activity tracking.

pub mod activity;
pub mod cross_tab;
mod error;
pub mod fetch;
pub mod monitor;
pub mod refresh;
pub mod state;
pub mod storage;
pub mod store;
pub mod token;
mod types;

use log::{debug, info, warn};
use reqwest::header::COOKIE;
use reqwest::{Client, Method};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use storefront_broadcast::{Broadcaster, Signal};
use tokio::sync::broadcast;

pub use activity::{ActivityRecord, ActivitySignal, ActivityTracker};
pub use cross_tab::{CrossTabSync, RemoteChange};
pub use error::{AuthError, RefreshError};
pub use fetch::AuthedRequest;
pub use monitor::{ActivityProbe, CheckOutcome, ExpirationMonitor, MIN_CHECK_INTERVAL};
pub use refresh::RefreshCoordinator;
pub use state::{EndReason, SessionEvent, SessionState, SessionStateMachine};
pub use storage::{CookieJar, KeyValueStore, LocalStorage};
pub use store::TokenStore;
pub use token::{decode_claims, is_expired, time_to_expiry, Claims, TokenPair};
pub use types::UserIdentity;

/// クライアントオプション
#[derive(Debug, Clone)]
pub struct AuthOptions {
    /// Lead time before expiry at which the token is renewed proactively
    pub refresh_threshold: Duration,
    /// Cadence of the expiration monitor
    pub check_interval: Duration,
    /// Upper bound for every network call
    pub request_timeout: Duration,
    /// Renew expired access tokens before sending a request
    pub auto_refresh_token: bool,
    /// Skip proactive renewal when the user has been idle this long
    pub idle_timeout: Option<Duration>,
}

impl Default for AuthOptions {
    fn default() -> Self {
        Self {
            refresh_threshold: Duration::from_secs(5 * 60),
            check_interval: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
            auto_refresh_token: true,
            idle_timeout: None,
        }
    }
}

/// Auth クライアント
///
/// Owns the token store, the session state and the refresh coordinator of
/// one browsing context, and sends authenticated requests on their behalf.
pub struct AuthClient {
    url: String,
    http_client: Client,
    options: AuthOptions,
    store: Arc<TokenStore>,
    state: Arc<SessionStateMachine>,
    coordinator: Arc<RefreshCoordinator>,
    signals: Arc<dyn Broadcaster<Signal>>,
    user: RwLock<Option<UserIdentity>>,
}

impl AuthClient {
    /// 新しい Auth クライアントを作成
    pub fn new(
        url: &str,
        http_client: Client,
        store: TokenStore,
        signals: Arc<dyn Broadcaster<Signal>>,
        options: AuthOptions,
    ) -> Self {
        let url = url.trim_end_matches('/').to_string();
        let store = Arc::new(store);
        let state = Arc::new(SessionStateMachine::new());
        let coordinator = Arc::new(RefreshCoordinator::new(
            http_client.clone(),
            &format!("{}/auth/refresh", url),
            Arc::clone(&store),
            Arc::clone(&state),
            Arc::clone(&signals),
            options.request_timeout,
        ));

        Self {
            url,
            http_client,
            options,
            store,
            state,
            coordinator,
            signals,
            user: RwLock::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn options(&self) -> &AuthOptions {
        &self.options
    }

    pub(crate) fn http_client(&self) -> &Client {
        &self.http_client
    }

    pub fn store(&self) -> &Arc<TokenStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.coordinator
    }

    pub fn signals(&self) -> &Arc<dyn Broadcaster<Signal>> {
        &self.signals
    }

    pub fn session(&self) -> &Arc<SessionStateMachine> {
        &self.state
    }

    pub fn state(&self) -> SessionState {
        self.state.current()
    }

    pub fn on_session_event(&self) -> broadcast::Receiver<SessionEvent> {
        self.state.subscribe()
    }

    /// 現在のユーザーを取得
    pub fn user(&self) -> Option<UserIdentity> {
        self.user
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_user(&self, user: Option<UserIdentity>) {
        *self.user.write().unwrap_or_else(PoisonError::into_inner) = user;
    }

    /// Starts building an authenticated request to `path` (relative to the
    /// API base URL).
    pub fn request(&self, method: Method, path: &str) -> AuthedRequest<'_> {
        AuthedRequest::new(self, method, path)
    }

    pub fn get(&self, path: &str) -> AuthedRequest<'_> {
        self.request(Method::GET, path)
    }

    pub fn post(&self, path: &str) -> AuthedRequest<'_> {
        self.request(Method::POST, path)
    }

    pub fn put(&self, path: &str) -> AuthedRequest<'_> {
        self.request(Method::PUT, path)
    }

    pub fn delete(&self, path: &str) -> AuthedRequest<'_> {
        self.request(Method::DELETE, path)
    }

    pub async fn ensure_fresh_token(&self) -> Result<String, RefreshError> {
        self.coordinator.ensure_fresh_token().await
    }

    /// Adopts credentials obtained from the sign-in handshake.
    pub fn set_session(&self, pair: &TokenPair, user: Option<&UserIdentity>) {
        self.store.save(pair);
        if let Some(user) = user {
            self.store.save_user(user);
        }
        self.set_user(user.cloned().or_else(|| self.store.load_user()));
        self.state.transition(SessionState::Authenticated);
    }

    /// Asks the server who the current credential belongs to and caches the
    /// answer in memory and in both mirrors.
    pub async fn check_session(&self) -> Result<UserIdentity, AuthError> {
        let response: types::CheckResponse = self.get("/auth/check").execute().await?;
        let user = response.into_user();
        self.store.save_user(&user);
        self.set_user(Some(user.clone()));
        Ok(user)
    }

    /// Restores the session persisted by an earlier page load.
    ///
    /// Returns the signed-in user, or `None` when the context stays
    /// anonymous. A network failure keeps a still-valid session with the
    /// cached identity instead of logging the user out.
    pub async fn restore_session(&self) -> Result<Option<UserIdentity>, AuthError> {
        let pair = match self.store.load() {
            Some(pair) => pair,
            None => {
                debug!("No persisted credential, staying anonymous");
                return Ok(None);
            }
        };

        if !pair.is_session_valid() {
            info!("Persisted refresh token expired, clearing credential");
            self.end_session(EndReason::RefreshFailed);
            return Ok(None);
        }

        self.state.transition(SessionState::Authenticating);
        match self.check_session().await {
            Ok(user) => {
                self.state.transition(SessionState::Authenticated);
                Ok(Some(user))
            }
            Err(err) if err.requires_login() => Ok(None),
            Err(err) if err.is_transient() => {
                warn!("Could not verify session ({}), keeping cached identity", err);
                let user = self.store.load_user();
                self.set_user(user.clone());
                self.state.transition(SessionState::Authenticated);
                Ok(user)
            }
            Err(err) => {
                self.end_session(EndReason::Unauthorized);
                Err(err)
            }
        }
    }

    /// Signs out: notifies the server on a best-effort basis, then ends the
    /// local session. Calling it again is harmless.
    pub async fn sign_out(&self) {
        if let Some(token) = self.store.access_token() {
            let url = format!("{}/auth/logout", self.url);
            let mut request = self.http_client.post(&url).bearer_auth(&token);
            if let Some(cookie) = self.store.cookie_header() {
                request = request.header(COOKIE, cookie);
            }
            match tokio::time::timeout(self.options.request_timeout, request.send()).await {
                Ok(Ok(response)) if response.status().is_success() => {
                    debug!("Server acknowledged logout")
                }
                Ok(Ok(response)) => warn!("Server logout answered {}", response.status()),
                Ok(Err(err)) => warn!("Server logout failed: {}", err),
                Err(_) => warn!("Server logout timed out"),
            }
        }
        self.end_session(EndReason::Logout);
    }

    /// Ends the session locally: cancels any in-flight refresh and clears
    /// both mirrors.
    pub fn end_session(&self, reason: EndReason) {
        self.coordinator.cancel();
        self.store.clear();
        self.set_user(None);
        self.state.end(reason);
    }

    /// Ends the session after another context logged out. The shared stores
    /// are left alone; the other context already cleared them.
    pub(crate) fn release_remote_session(&self) {
        self.coordinator.cancel();
        self.set_user(None);
        self.state.end(EndReason::RemoteLogout);
    }

    /// Takes over a credential written by another context, without any
    /// network call.
    pub(crate) fn adopt_remote_session(&self) -> bool {
        let pair = match self.store.load() {
            Some(pair) if pair.is_session_valid() => pair,
            _ => return false,
        };

        if let Some(user) = self.store.load_user() {
            self.set_user(Some(user));
        }
        if self.state() != SessionState::Refreshing {
            self.state.transition(SessionState::Authenticated);
        }
        debug!(
            "Adopted credential for {} from another context",
            pair.subject().unwrap_or_default()
        );
        if let Err(err) = self.signals.publish(Signal::TokenRefreshed) {
            warn!("Failed to announce adopted token: {}", err);
        }
        true
    }
}
