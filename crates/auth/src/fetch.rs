//! Authenticated requests with a single retry hop.
//!
//! Every request carries the current access token. A 401 triggers one
//! renewal through the [`RefreshCoordinator`](crate::RefreshCoordinator) and
//! one resend. A network failure or timeout gets its own single resend, so a
//! request is sent at most three times.

use log::{debug, warn};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE, COOKIE};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use url::Url;

use crate::error::AuthError;
use crate::state::EndReason;
use crate::token::is_expired;
use crate::AuthClient;

/// Builder for one authenticated request
pub struct AuthedRequest<'a> {
    client: &'a AuthClient,
    method: Method,
    path: String,
    headers: HeaderMap,
    query: Vec<(String, String)>,
    body: Option<Vec<u8>>,
}

impl<'a> AuthedRequest<'a> {
    pub(crate) fn new(client: &'a AuthClient, method: Method, path: &str) -> Self {
        Self {
            client,
            method,
            path: path.to_string(),
            headers: HeaderMap::new(),
            query: Vec::new(),
            body: None,
        }
    }

    /// Adds a header; invalid names or values are skipped.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn query(mut self, key: &str, value: &str) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self, AuthError> {
        self.body = Some(serde_json::to_vec(body)?);
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(self)
    }

    /// Sends the request and returns the successful response. Non-2xx
    /// answers are classified into [`AuthError`] variants.
    pub async fn send(&self) -> Result<Response, AuthError> {
        let mut token = self.usable_access_token().await?;
        let mut renewed = false;
        let mut resent = false;

        loop {
            let error = match self.dispatch(token.as_deref()).await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) if response.status() == StatusCode::UNAUTHORIZED => {
                    AuthError::Unauthorized
                }
                Ok(response) => return Err(AuthError::from_response(response).await),
                Err(err) => err,
            };

            match error {
                AuthError::Unauthorized if renewed => {
                    warn!("{} {} rejected again after refresh, ending session", self.method, self.path);
                    self.client.end_session(EndReason::Unauthorized);
                    return Err(error);
                }
                AuthError::Unauthorized => {
                    renewed = true;
                    debug!("{} {} answered 401, renewing token", self.method, self.path);
                    let fresh = self
                        .client
                        .coordinator()
                        .ensure_fresh_token_after(token.as_deref())
                        .await?;
                    token = Some(fresh);
                }
                ref transient if transient.is_transient() && !resent => {
                    resent = true;
                    warn!("{} {} failed ({}), retrying once", self.method, self.path, transient);
                }
                _ => return Err(error),
            }
        }
    }

    pub async fn execute<T: DeserializeOwned>(&self) -> Result<T, AuthError> {
        let response = self.send().await?;
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn execute_empty(&self) -> Result<(), AuthError> {
        self.send().await.map(|_| ())
    }

    /// The stored access token, renewed first when it has expired while the
    /// session is still valid.
    async fn usable_access_token(&self) -> Result<Option<String>, AuthError> {
        let current = self.client.store().access_token();
        if let Some(token) = current.as_ref() {
            if !is_expired(token) {
                return Ok(current);
            }
        }

        let can_refresh = self
            .client
            .store()
            .refresh_token()
            .map_or(false, |refresh| !is_expired(&refresh));
        if self.client.options().auto_refresh_token && can_refresh {
            let fresh = self
                .client
                .coordinator()
                .ensure_fresh_token_after(current.as_deref())
                .await?;
            return Ok(Some(fresh));
        }
        Ok(current)
    }

    async fn dispatch(&self, token: Option<&str>) -> Result<Response, AuthError> {
        let request = self.build(token)?;
        match tokio::time::timeout(self.client.options().request_timeout, request.send()).await {
            Err(_) => Err(AuthError::Timeout),
            Ok(Err(err)) if err.is_timeout() => Err(AuthError::Timeout),
            Ok(Err(err)) => Err(AuthError::NetworkError(err)),
            Ok(Ok(response)) => Ok(response),
        }
    }

    fn build(&self, token: Option<&str>) -> Result<RequestBuilder, AuthError> {
        let mut url = Url::parse(&format!("{}{}", self.client.url(), self.path))?;
        if !self.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &self.query {
                pairs.append_pair(key, value);
            }
        }

        let mut request = self
            .client
            .http_client()
            .request(self.method.clone(), url.as_str())
            .headers(self.headers.clone());

        if let Some(token) = token {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        if let Some(cookie) = self.client.store().cookie_header() {
            request = request.header(COOKIE, cookie);
        }
        if let Some(body) = &self.body {
            request = request.body(body.clone());
        }

        Ok(request)
    }
}
