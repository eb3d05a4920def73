mod common;

use common::{client, client_for, eventually, fresh_store, mint, mount_refresh, signed_in};
use futures_util::future::join_all;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use storefront_auth::{
    AuthError, AuthOptions, CheckOutcome, CookieJar, CrossTabSync, EndReason, ExpirationMonitor,
    LocalStorage, RefreshError, SessionEvent, SessionState, TokenPair, TokenStore,
};
use storefront_broadcast::{Broadcaster, Signal};
use tokio::sync::broadcast::Receiver;
use wiremock::matchers::{body_json, header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn drain(events: &mut Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

#[tokio::test]
async fn test_concurrent_callers_share_one_refresh() {
    // モックサーバーの起動
    let server = MockServer::start().await;
    let renewed = TokenPair::new(mint("shopper", 900), mint("shopper", 86_400));
    mount_refresh(&server, &renewed, Duration::from_millis(200), 1).await;

    let client = client_for(&server);
    signed_in(&client, &TokenPair::new(mint("shopper", 60), mint("shopper", 3600)));

    // 10件の同時呼び出し
    let results = join_all((0..10).map(|_| client.ensure_fresh_token())).await;

    for result in results {
        assert_eq!(result.unwrap(), renewed.access_token);
    }
    assert_eq!(client.coordinator().refresh_count(), 1);
    assert!(!client.coordinator().is_refreshing());
    assert_eq!(client.store().load(), Some(renewed));
    assert_eq!(client.state(), SessionState::Authenticated);
}

#[tokio::test]
async fn test_refresh_sends_token_in_body_and_cookie() {
    let server = MockServer::start().await;
    let refresh_token = mint("shopper", 3600);

    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .and(body_json(json!({ "refreshToken": refresh_token })))
        .and(header_exists("cookie"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "accessToken": mint("shopper", 900),
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    signed_in(&client, &TokenPair::new(mint("shopper", 30), refresh_token.clone()));

    client.ensure_fresh_token().await.unwrap();

    // リフレッシュトークンはローテーションされていない
    assert_eq!(client.store().refresh_token(), Some(refresh_token));
}

#[tokio::test]
async fn test_failed_refresh_is_shared_and_ends_session() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(
            ResponseTemplate::new(401)
                .set_body_string("refresh token revoked")
                .set_delay(Duration::from_millis(150)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    signed_in(&client, &TokenPair::new(mint("shopper", 60), mint("shopper", 3600)));
    let mut events = client.on_session_event();

    let results = join_all((0..5).map(|_| client.ensure_fresh_token())).await;

    for result in results {
        assert!(matches!(result, Err(RefreshError::Rejected { status: 401, .. })));
    }
    assert!(client.store().load().is_none());
    assert_eq!(client.state(), SessionState::Anonymous);

    let seen = drain(&mut events);
    assert!(seen.contains(&SessionEvent::StateChanged(SessionState::Expired)));
    assert_eq!(seen.last(), Some(&SessionEvent::Ended(EndReason::RefreshFailed)));
}

#[tokio::test]
async fn test_repeated_401_is_retried_once_then_logs_out() {
    // モックサーバーの起動
    let server = MockServer::start().await;
    let renewed = TokenPair::new(mint("shopper", 900), mint("shopper", 86_400));
    mount_refresh(&server, &renewed, Duration::ZERO, 1).await;

    Mock::given(method("GET"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(401))
        .expect(2)
        .mount(&server)
        .await;

    let client = client_for(&server);
    signed_in(&client, &TokenPair::new(mint("shopper", 600), mint("shopper", 3600)));
    let mut events = client.on_session_event();

    let result = client.get("/orders").send().await;

    assert!(matches!(result, Err(AuthError::Unauthorized)));
    assert!(client.store().load().is_none());
    assert_eq!(client.state(), SessionState::Anonymous);
    assert!(drain(&mut events).contains(&SessionEvent::Ended(EndReason::Unauthorized)));
}

#[tokio::test]
async fn test_401_then_success_with_renewed_token() {
    let server = MockServer::start().await;
    let stale = mint("shopper", 600);
    let renewed = TokenPair::new(mint("shopper", 1200), mint("shopper", 86_400));
    mount_refresh(&server, &renewed, Duration::ZERO, 1).await;

    Mock::given(method("GET"))
        .and(path("/profile"))
        .and(header("authorization", format!("Bearer {}", stale).as_str()))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/profile"))
        .and(header("authorization", format!("Bearer {}", renewed.access_token).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "name": "Mika" })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    signed_in(&client, &TokenPair::new(stale, mint("shopper", 3600)));

    let profile: serde_json::Value = client.get("/profile").execute().await.unwrap();

    assert_eq!(profile["name"], "Mika");
    assert_eq!(client.state(), SessionState::Authenticated);
}

#[tokio::test]
async fn test_parallel_requests_at_expiry_refresh_once() {
    let server = MockServer::start().await;
    let renewed = TokenPair::new(mint("shopper", 900), mint("shopper", 86_400));
    mount_refresh(&server, &renewed, Duration::from_millis(200), 1).await;

    Mock::given(method("GET"))
        .and(path("/cart"))
        .and(header("authorization", format!("Bearer {}", renewed.access_token).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "items": [] })))
        .expect(10)
        .mount(&server)
        .await;

    let client = client_for(&server);
    signed_in(&client, &TokenPair::new(mint("shopper", -5), mint("shopper", 3600)));

    let requests: Vec<_> = (0..10).map(|_| client.get("/cart")).collect();
    let results = join_all(requests.iter().map(|request| request.send())).await;

    assert!(results.iter().all(|result| result.is_ok()));
    assert_eq!(client.coordinator().refresh_count(), 1);
}

#[tokio::test]
async fn test_forbidden_is_never_retried() {
    let server = MockServer::start().await;
    mount_refresh(&server, &TokenPair::new("unused", "unused"), Duration::ZERO, 0).await;

    Mock::given(method("DELETE"))
        .and(path("/admin/products"))
        .respond_with(ResponseTemplate::new(403).set_body_string("admins only"))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    signed_in(&client, &TokenPair::new(mint("shopper", 600), mint("shopper", 3600)));

    let result = client.delete("/admin/products").send().await;

    match result {
        Err(AuthError::Forbidden(message)) => assert_eq!(message, "admins only"),
        other => panic!("expected Forbidden, got {:?}", other.map(|r| r.status())),
    }
    assert_eq!(client.state(), SessionState::Authenticated);
}

#[tokio::test]
async fn test_timeout_consumes_the_single_retry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .expect(2)
        .mount(&server)
        .await;

    let options = AuthOptions {
        request_timeout: Duration::from_millis(100),
        ..AuthOptions::default()
    };
    let client = client(&server.uri(), fresh_store(), options);
    signed_in(&client, &TokenPair::new(mint("shopper", 600), mint("shopper", 3600)));

    let result = client.get("/slow").send().await;

    assert!(matches!(result, Err(AuthError::Timeout)));
    // 通信エラーではセッションは終了しない
    assert_eq!(client.state(), SessionState::Authenticated);
}

#[tokio::test]
async fn test_401_after_timeout_still_renews_token() {
    // モックサーバーの起動
    let server = MockServer::start().await;
    let stale = mint("shopper", 600);
    let renewed = TokenPair::new(mint("shopper", 1200), mint("shopper", 86_400));
    mount_refresh(&server, &renewed, Duration::ZERO, 1).await;

    // 1回目はタイムアウト、2回目は401、更新後のトークンで成功
    Mock::given(method("GET"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(400)))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/orders"))
        .and(header("authorization", format!("Bearer {}", stale).as_str()))
        .respond_with(ResponseTemplate::new(401))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/orders"))
        .and(header("authorization", format!("Bearer {}", renewed.access_token).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "orders": [] })))
        .expect(1)
        .mount(&server)
        .await;

    let options = AuthOptions {
        request_timeout: Duration::from_millis(100),
        ..AuthOptions::default()
    };
    let client = client(&server.uri(), fresh_store(), options);
    signed_in(&client, &TokenPair::new(stale, mint("shopper", 3600)));

    let result = client.get("/orders").send().await;

    assert!(result.is_ok());
    assert_eq!(client.coordinator().refresh_count(), 1);
    assert_eq!(client.state(), SessionState::Authenticated);
}

#[tokio::test]
async fn test_monitor_refreshes_token_inside_threshold() {
    let server = MockServer::start().await;
    let renewed = TokenPair::new(mint("shopper", 900), mint("shopper", 86_400));
    mount_refresh(&server, &renewed, Duration::ZERO, 1).await;

    // ExpirationMonitor の初期化
    let client = client_for(&server);
    let monitor = ExpirationMonitor::new(&client);
    assert_eq!(monitor.refresh_threshold(), Duration::from_secs(300));

    assert_eq!(monitor.check_now().await, CheckOutcome::NoCredential);

    signed_in(&client, &TokenPair::new(mint("shopper", 240), mint("shopper", 3600)));
    assert_eq!(monitor.check_now().await, CheckOutcome::Refreshed);
    assert!(matches!(monitor.check_now().await, CheckOutcome::Fresh(_)));
}

#[tokio::test]
async fn test_monitor_leaves_fresh_token_alone() {
    let server = MockServer::start().await;
    mount_refresh(&server, &TokenPair::new("unused", "unused"), Duration::ZERO, 0).await;

    let client = client_for(&server);
    signed_in(&client, &TokenPair::new(mint("shopper", 600), mint("shopper", 3600)));

    let monitor = ExpirationMonitor::new(&client);
    match monitor.check_now().await {
        CheckOutcome::Fresh(remaining) => assert!(remaining > Duration::from_secs(300)),
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[tokio::test]
async fn test_scheduled_monitor_checks_on_signal() {
    let server = MockServer::start().await;
    let renewed = TokenPair::new(mint("shopper", 900), mint("shopper", 86_400));
    mount_refresh(&server, &renewed, Duration::ZERO, 1).await;

    let client = client_for(&server);
    signed_in(&client, &TokenPair::new(mint("shopper", 600), mint("shopper", 3600)));

    let monitor = Arc::new(ExpirationMonitor::new(&client));
    monitor.schedule(Duration::from_secs(3600));
    assert!(monitor.is_running());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.coordinator().refresh_count(), 0);

    client
        .store()
        .save(&TokenPair::new(mint("shopper", 240), mint("shopper", 3600)));
    client.signals().publish(Signal::CheckTokenNow).unwrap();

    assert!(eventually(|| client.coordinator().refresh_count() == 1).await);
    assert!(eventually(|| client.store().access_token() == Some(renewed.access_token.clone())).await);

    monitor.stop();
    monitor.stop();
    assert!(!monitor.is_running());
}

#[tokio::test]
async fn test_zero_interval_monitor_keeps_running() {
    let server = MockServer::start().await;
    let renewed = TokenPair::new(mint("shopper", 900), mint("shopper", 86_400));
    mount_refresh(&server, &renewed, Duration::ZERO, 1).await;

    let client = client_for(&server);
    signed_in(&client, &TokenPair::new(mint("shopper", 60), mint("shopper", 3600)));

    let monitor = Arc::new(ExpirationMonitor::new(&client));
    monitor.schedule(Duration::ZERO);

    // 起動直後のチェックで更新される
    assert!(eventually(|| client.store().access_token() == Some(renewed.access_token.clone())).await);
    assert!(monitor.is_running());
    monitor.stop();
}

#[tokio::test]
async fn test_cross_context_login_and_logout_without_network() {
    let server = MockServer::start().await;

    let local = LocalStorage::new();
    let cookies = CookieJar::default();
    let tab_a = client(
        &server.uri(),
        TokenStore::new(local.clone(), cookies.clone()),
        AuthOptions::default(),
    );
    let tab_b = client(
        &server.uri(),
        TokenStore::new(local.for_context(), cookies),
        AuthOptions::default(),
    );

    // 別タブの変更を監視する
    let sync = CrossTabSync::new(Arc::clone(&tab_b));
    sync.start();
    let mut events = tab_b.on_session_event();

    signed_in(&tab_a, &TokenPair::new(mint("shopper", 900), mint("shopper", 3600)));
    assert!(eventually(|| tab_b.state() == SessionState::Authenticated).await);

    tab_a.end_session(EndReason::Logout);
    assert!(eventually(|| tab_b.state() == SessionState::Anonymous).await);

    assert!(drain(&mut events).contains(&SessionEvent::Ended(EndReason::RemoteLogout)));
    assert!(server.received_requests().await.unwrap().is_empty());

    sync.stop();
    sync.stop();
    assert!(!sync.is_running());
}

#[tokio::test]
async fn test_restore_session_checks_identity() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/auth/check"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "user": { "_id": "u-7", "email": "shopper@example.com", "role": "customer" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let store = fresh_store();
    store.save(&TokenPair::new(mint("u-7", 900), mint("u-7", 3600)));
    let client = client(&server.uri(), store, AuthOptions::default());

    let user = client.restore_session().await.unwrap().unwrap();

    assert_eq!(user.id, "u-7");
    assert_eq!(client.user(), Some(user.clone()));
    assert_eq!(client.store().load_user(), Some(user));
    assert_eq!(client.state(), SessionState::Authenticated);
}

#[tokio::test]
async fn test_restore_with_expired_refresh_token_stays_anonymous() {
    let server = MockServer::start().await;

    let store = fresh_store();
    store.save(&TokenPair::new(mint("u-7", -600), mint("u-7", -60)));
    let client = client(&server.uri(), store, AuthOptions::default());

    assert_eq!(client.restore_session().await.unwrap(), None);
    assert_eq!(client.state(), SessionState::Anonymous);
    assert!(client.store().load().is_none());
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_sign_out_is_idempotent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/logout"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    signed_in(&client, &TokenPair::new(mint("shopper", 900), mint("shopper", 3600)));

    client.sign_out().await;
    client.sign_out().await;

    assert_eq!(client.state(), SessionState::Anonymous);
    assert!(client.store().load().is_none());
    assert!(client.store().cookie_header().is_none());
}
