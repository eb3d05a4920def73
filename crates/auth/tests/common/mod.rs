#![allow(dead_code)]

use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use storefront_auth::{AuthClient, AuthOptions, Claims, CookieJar, LocalStorage, TokenPair, TokenStore};
use storefront_broadcast::LocalBroadcast;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Signs a token for `sub` that expires `ttl_secs` from now.
pub fn mint(sub: &str, ttl_secs: i64) -> String {
    let now = Utc::now().timestamp();
    let claims = Claims {
        sub: Some(sub.to_string()),
        exp: now + ttl_secs,
        iat: Some(now),
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(b"integration-secret")).unwrap()
}

pub fn client(uri: &str, store: TokenStore, options: AuthOptions) -> Arc<AuthClient> {
    Arc::new(AuthClient::new(
        uri,
        reqwest::Client::new(),
        store,
        Arc::new(LocalBroadcast::new()),
        options,
    ))
}

pub fn client_for(server: &MockServer) -> Arc<AuthClient> {
    client(&server.uri(), fresh_store(), AuthOptions::default())
}

pub fn fresh_store() -> TokenStore {
    TokenStore::new(LocalStorage::new(), CookieJar::default())
}

/// Signs the client in with `pair`.
pub fn signed_in(client: &AuthClient, pair: &TokenPair) {
    client.set_session(pair, None);
}

pub async fn mount_refresh(server: &MockServer, pair: &TokenPair, delay: Duration, calls: u64) {
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({
                    "accessToken": pair.access_token,
                    "refreshToken": pair.refresh_token,
                }))
                .set_delay(delay),
        )
        .expect(calls)
        .mount(server)
        .await;
}

/// Polls `condition` for up to two seconds.
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}
