//! Storefront session client
//!
//! Keeps a shopper signed in across time, browsing contexts and concurrent
//! requests, and keeps the shopping cart consistent with the server.
//!
//! A [`Storefront`] is one browsing context. It wires the token store,
//! expiration monitor, refresh coordinator, cross-context synchronizer,
//! activity tracker and cart together; contexts of the same device share
//! only the persisted stores.

pub mod config;
pub mod error;

pub use storefront_auth as auth;
pub use storefront_broadcast as broadcast;
pub use storefront_cart as cart;

use log::{debug, info, warn};
use reqwest::Client;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use storefront_auth::{
    ActivityProbe, ActivitySignal, ActivityTracker, AuthClient, CookieJar, CrossTabSync,
    ExpirationMonitor, LocalStorage, SessionEvent, SessionState, TokenPair, TokenStore,
    UserIdentity,
};
use storefront_broadcast::{Broadcaster, LocalBroadcast, Signal};
use storefront_cart::CartSynchronizer;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tokio::task::JoinHandle;
use url::Url;

use crate::config::ClientOptions;
use crate::error::{Error, Result};

/// The main entry point: one browsing context of the storefront
pub struct Storefront {
    url: String,
    options: ClientOptions,
    auth: Arc<AuthClient>,
    monitor: Arc<ExpirationMonitor>,
    activity: Arc<ActivityTracker>,
    cross_tab: CrossTabSync,
    cart: Arc<CartSynchronizer>,
    // Set while the monitor and tracker belong to a live session.
    session_tasks: Arc<AtomicBool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Storefront {
    /// Create a new storefront context with fresh stores
    ///
    /// # Example
    ///
    /// ```
    /// use storefront_session::Storefront;
    ///
    /// let storefront = Storefront::new("https://api.example-shop.com");
    /// assert!(storefront.user().is_none());
    /// ```
    pub fn new(api_url: &str) -> Self {
        Self::new_with_options(api_url, ClientOptions::default())
    }

    /// Create a new storefront context with custom options
    ///
    /// # Example
    ///
    /// ```
    /// use std::time::Duration;
    /// use storefront_session::{Storefront, config::ClientOptions};
    ///
    /// let options = ClientOptions::default().with_refresh_threshold(Duration::from_secs(120));
    /// let storefront = Storefront::new_with_options("https://api.example-shop.com", options);
    /// ```
    pub fn new_with_options(api_url: &str, options: ClientOptions) -> Self {
        let cookies = CookieJar::new(options.refresh_cookie_ttl);
        Self::with_stores(api_url, LocalStorage::new(), cookies, options)
    }

    /// Reads `STOREFRONT_API_URL` and the `STOREFRONT_*` options.
    pub fn from_env() -> Result<Self> {
        let api_url = std::env::var("STOREFRONT_API_URL")
            .map_err(|_| Error::config("STOREFRONT_API_URL environment variable not found"))?;
        let api_url = Url::parse(&api_url)?;
        let options = ClientOptions::from_env()?;
        Ok(Self::new_with_options(api_url.as_str(), options))
    }

    /// Create a context on top of existing persisted stores.
    pub fn with_stores(
        api_url: &str,
        local: LocalStorage,
        cookies: CookieJar,
        options: ClientOptions,
    ) -> Self {
        let store = TokenStore::new(local, cookies)
            .with_cookie_ttls(options.access_cookie_ttl, options.refresh_cookie_ttl);
        let signals: Arc<dyn Broadcaster<Signal>> = Arc::new(LocalBroadcast::new());

        let auth = Arc::new(AuthClient::new(
            api_url,
            Client::new(),
            store,
            Arc::clone(&signals),
            options.auth_options(),
        ));

        let activity = Arc::new(ActivityTracker::new(Arc::clone(&signals)));
        let mut monitor = ExpirationMonitor::new(&auth);
        if let Some(idle_timeout) = options.idle_timeout {
            let probe: Arc<dyn ActivityProbe> = activity.clone();
            monitor = monitor.with_idle_gate(probe, idle_timeout);
        }

        let cart = Arc::new(CartSynchronizer::new(
            Arc::clone(&auth),
            options.cart_options(),
        ));

        Self {
            url: auth.url().to_string(),
            options,
            cross_tab: CrossTabSync::new(Arc::clone(&auth)),
            auth,
            monitor: Arc::new(monitor),
            activity,
            cart,
            session_tasks: Arc::new(AtomicBool::new(false)),
            supervisor: Mutex::new(None),
        }
    }

    /// Another browsing context of the same device: it shares the persisted
    /// stores and nothing else.
    pub fn open_context(&self) -> Self {
        let store = self.auth.store();
        Self::with_stores(
            &self.url,
            store.local().for_context(),
            store.cookies().clone(),
            self.options.clone(),
        )
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn auth(&self) -> &Arc<AuthClient> {
        &self.auth
    }

    pub fn cart(&self) -> &Arc<CartSynchronizer> {
        &self.cart
    }

    pub fn monitor(&self) -> &Arc<ExpirationMonitor> {
        &self.monitor
    }

    pub fn activity(&self) -> &Arc<ActivityTracker> {
        &self.activity
    }

    pub fn cross_tab(&self) -> &CrossTabSync {
        &self.cross_tab
    }

    pub fn state(&self) -> SessionState {
        self.auth.state()
    }

    pub fn user(&self) -> Option<UserIdentity> {
        self.auth.user()
    }

    pub fn on_session_event(&self) -> Receiver<SessionEvent> {
        self.auth.on_session_event()
    }

    /// Forwards an interaction or environment signal from the UI.
    pub fn notify_activity(&self, signal: ActivitySignal) {
        self.activity.notify(signal);
    }

    pub async fn ensure_fresh_token(&self) -> Result<String> {
        Ok(self.auth.ensure_fresh_token().await?)
    }

    /// Restores the persisted session after a reload and starts listening
    /// to the other contexts. Without a valid session the context stays in
    /// guest mode.
    pub async fn start(&self) -> Result<Option<UserIdentity>> {
        self.cross_tab.start();
        self.supervise();

        // Claimed up front so the supervisor leaves the restored session to us.
        let claimed = claim(&self.session_tasks);
        let user = match self.auth.restore_session().await {
            Ok(user) => user,
            Err(err) => {
                if claimed {
                    self.session_tasks.store(false, Ordering::SeqCst);
                }
                return Err(err.into());
            }
        };

        if self.state().is_signed_in() {
            if claimed {
                self.begin_session_tasks();
            }
            self.sync_cart().await;
        } else {
            if claimed {
                self.session_tasks.store(false, Ordering::SeqCst);
            }
            info!("No valid session, continuing as guest");
        }
        Ok(user)
    }

    /// Adopts credentials obtained from the sign-in handshake.
    pub async fn login(&self, pair: TokenPair, user: Option<UserIdentity>) -> Result<()> {
        if !pair.is_session_valid() {
            return Err(Error::general("refusing to sign in with an expired refresh token"));
        }

        self.cross_tab.start();
        self.supervise();
        let claimed = claim(&self.session_tasks);
        self.auth.set_session(&pair, user.as_ref());
        info!("Signed in as {}", pair.subject().unwrap_or_default());

        if claimed {
            self.begin_session_tasks();
        }
        self.sync_cart().await;
        Ok(())
    }

    /// Signs out of this context and, through the shared stores, of every
    /// other context. Safe to call repeatedly.
    pub async fn logout(&self) {
        self.auth.sign_out().await;
        end_session_tasks(&self.session_tasks, &self.monitor, &self.activity, &self.cart);
    }

    fn begin_session_tasks(&self) {
        begin_session_tasks(&self.monitor, &self.activity, &self.options);
    }

    async fn sync_cart(&self) {
        if let Err(err) = self.cart.fetch_canonical().await {
            warn!("Could not load the cart: {}", err);
        }
    }

    /// Reacts to session changes made anywhere: by a refresh failure, a
    /// rejected request or another context.
    fn supervise(&self) {
        let mut slot = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().map_or(false, |handle| !handle.is_finished()) {
            return;
        }

        let mut events = self.auth.on_session_event();
        let auth = Arc::clone(&self.auth);
        let monitor = Arc::clone(&self.monitor);
        let activity = Arc::clone(&self.activity);
        let cart = Arc::clone(&self.cart);
        let session_tasks = Arc::clone(&self.session_tasks);
        let options = self.options.clone();

        *slot = Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::Ended(reason)) if auth.state().is_signed_in() => {
                        debug!("Ignoring end ({:?}) of a session already replaced", reason);
                    }
                    Ok(SessionEvent::Ended(reason)) => {
                        info!("Session ended ({:?}), back to guest mode", reason);
                        end_session_tasks(&session_tasks, &monitor, &activity, &cart);
                    }
                    Ok(SessionEvent::StateChanged(SessionState::Authenticated))
                        if claim(&session_tasks) =>
                    {
                        begin_session_tasks(&monitor, &activity, &options);
                        if let Err(err) = cart.fetch_canonical().await {
                            warn!("Could not load the cart: {}", err);
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Session supervisor missed {} events", skipped)
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }));
        debug!("Session supervisor started");
    }
}

impl Drop for Storefront {
    fn drop(&mut self) {
        let supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = supervisor {
            handle.abort();
        }
        self.monitor.stop();
        self.activity.stop_activity_tracking();
        self.cross_tab.stop();
    }
}

fn begin_session_tasks(
    monitor: &Arc<ExpirationMonitor>,
    activity: &ActivityTracker,
    options: &ClientOptions,
) {
    monitor.schedule(options.check_interval);
    activity.start_activity_tracking();
}

/// Returns true for the one caller that gets to start the session tasks.
fn claim(session_tasks: &AtomicBool) -> bool {
    !session_tasks.swap(true, Ordering::SeqCst)
}

fn end_session_tasks(
    session_tasks: &AtomicBool,
    monitor: &ExpirationMonitor,
    activity: &ActivityTracker,
    cart: &CartSynchronizer,
) {
    session_tasks.store(false, Ordering::SeqCst);
    monitor.stop();
    activity.clear_session();
    cart.reset();
}

/// A convenience module for common imports
pub mod prelude {
    pub use crate::config::ClientOptions;
    pub use crate::error::{Error, Result};
    pub use crate::Storefront;
    pub use storefront_auth::{
        ActivitySignal, EndReason, SessionEvent, SessionState, TokenPair, UserIdentity,
    };
    pub use storefront_cart::{CartItem, LineKey};
}
