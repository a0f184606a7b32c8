mod common;

use axum::http::{header, StatusCode};
use chrono::Duration;
use common::{
    bearer_request, body_json, form_request, json_request, test_config, TestContext,
    TEST_CLIENT_ID,
};
use identity_service::models::AuditEventType;
use serde_json::json;
use tower::ServiceExt;

const DEVICE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

#[tokio::test]
async fn test_health_reports_dependencies() {
    let ctx = TestContext::new();
    let app = ctx.router().await;

    let response = app
        .oneshot(axum::http::Request::get("/health").body(axum::body::Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));

    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["checks"]["blacklist"], "up");
}

#[tokio::test]
async fn test_health_fails_when_blacklist_is_down() {
    let ctx = TestContext::new();
    ctx.blacklist.set_unavailable(true);

    let response = ctx
        .router()
        .await
        .oneshot(axum::http::Request::get("/health").body(axum::body::Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_device_flow_over_http() {
    let ctx = TestContext::new();
    let app = ctx.router().await;
    let user = ctx.seed_subject("browser@example.com").await;
    let browser = ctx.tokens_for(&user).await;

    let response = app
        .clone()
        .oneshot(form_request("/oauth/device/code", &[("client_id", TEST_CLIENT_ID)]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let code = body_json(response).await;
    let device_code = code["device_code"].as_str().unwrap().to_string();
    let user_code = code["user_code"].as_str().unwrap().to_string();
    assert_eq!(code["interval"], 5);

    let poll = || {
        form_request(
            "/oauth/token",
            &[
                ("grant_type", DEVICE_GRANT),
                ("device_code", &device_code),
                ("client_id", TEST_CLIENT_ID),
            ],
        )
    };

    let response = app.clone().oneshot(poll()).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "authorization_pending");

    let response = app
        .clone()
        .oneshot(bearer_request(
            "GET",
            &format!("/device/lookup?user_code={}", user_code),
            &browser.access_token,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["client_id"], TEST_CLIENT_ID);

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/device/authorize",
            Some(&browser.access_token),
            json!({ "user_code": user_code }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    ctx.clock.advance(Duration::seconds(5));
    let response = app.clone().oneshot(poll()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CACHE_CONTROL).unwrap(),
        "no-store"
    );
    let tokens = body_json(response).await;
    assert_eq!(tokens["token_type"], "Bearer");
    assert!(tokens["refresh_token"].as_str().is_some());

    let response = app
        .oneshot(json_request(
            "POST",
            "/device/authorize",
            Some(&browser.access_token),
            json!({ "user_code": user_code }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_token_endpoint_error_codes() {
    let ctx = TestContext::new();
    let app = ctx.router().await;

    let response = app
        .clone()
        .oneshot(form_request("/oauth/token", &[("grant_type", "password")]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "unsupported_grant_type");

    let response = app
        .clone()
        .oneshot(form_request(
            "/oauth/token",
            &[("grant_type", DEVICE_GRANT), ("device_code", "abc")],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["error"], "invalid_client");

    let response = app
        .clone()
        .oneshot(form_request(
            "/oauth/token",
            &[("grant_type", "refresh_token"), ("refresh_token", "bogus")],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "invalid_grant");

    let response = app
        .oneshot(form_request("/oauth/device/code", &[("client_id", "scraper")]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["error"], "invalid_client");
}

#[tokio::test]
async fn test_malformed_oauth_bodies_get_invalid_request() {
    let ctx = TestContext::new();
    let app = ctx.router().await;

    let requests = vec![
        form_request("/oauth/token", &[]),
        form_request("/oauth/token", &[("grant_type", "")]),
        json_request("POST", "/oauth/token", None, json!({ "device_code": "abc" })),
        form_request("/oauth/device/code", &[]),
    ];
    for request in requests {
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"], "invalid_request");
        assert!(body["error_description"].as_str().is_some());
    }
}

#[tokio::test]
async fn test_protected_routes_require_bearer() {
    let ctx = TestContext::new();
    let app = ctx.router().await;

    for (method, uri) in [
        ("POST", "/auth/logout"),
        ("POST", "/auth/revoke-all"),
        ("POST", "/account/deletion"),
        ("DELETE", "/account/deletion"),
    ] {
        let response = app
            .clone()
            .oneshot(json_request(method, uri, None, json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{} {}", method, uri);
    }

    let response = app
        .oneshot(bearer_request("POST", "/auth/revoke-all", "not-a-jwt"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_refresh_and_revoke_all_over_http() {
    let ctx = TestContext::new();
    let app = ctx.router().await;
    let user = ctx.seed_subject("http-session@example.com").await;
    let first = ctx.tokens_for(&user).await;
    ctx.tokens_for(&user).await;

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/auth/refresh",
            None,
            json!({ "refresh_token": first.refresh_token }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let rotated = body_json(response).await;
    let access = rotated["access_token"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/auth/refresh",
            None,
            json!({ "refresh_token": first.refresh_token }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .clone()
        .oneshot(bearer_request("POST", "/auth/revoke-all", &access))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["count"], 2);

    let response = app
        .oneshot(bearer_request("POST", "/auth/revoke-all", &access))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_logout_without_body() {
    let ctx = TestContext::new();
    let app = ctx.router().await;
    let user = ctx.seed_subject("bye@example.com").await;
    let tokens = ctx.tokens_for(&user).await;

    let response = app
        .clone()
        .oneshot(bearer_request("POST", "/auth/logout", &tokens.access_token))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(bearer_request("POST", "/auth/logout", &tokens.access_token))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_account_deletion_over_http() {
    let ctx = TestContext::new();
    let app = ctx.router().await;
    let user = ctx.seed_subject("http-delete@example.com").await;
    let tokens = ctx.tokens_for(&user).await;

    let response = app
        .clone()
        .oneshot(bearer_request("POST", "/account/deletion", &tokens.access_token))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = body_json(response).await;
    assert_eq!(body["grace_period_days"], 30);
    assert!(body["scheduled_at"].as_str().is_some());

    let response = app
        .clone()
        .oneshot(bearer_request("POST", "/account/deletion", &tokens.access_token))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = app
        .clone()
        .oneshot(bearer_request("DELETE", "/account/deletion", &tokens.access_token))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(bearer_request("DELETE", "/account/deletion", &tokens.access_token))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_request_id_is_echoed() {
    let ctx = TestContext::new();
    let response = ctx
        .router()
        .await
        .oneshot(
            axum::http::Request::get("/health")
                .header("x-request-id", "pantry-trace-42")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.headers().get("x-request-id").unwrap(), "pantry-trace-42");
}

async fn refreshed_from_ip(ctx: &TestContext) -> Option<String> {
    let user = ctx.seed_subject("proxied@example.com").await;
    let tokens = ctx.tokens_for(&user).await;

    let mut request = json_request(
        "POST",
        "/auth/refresh",
        None,
        json!({ "refresh_token": tokens.refresh_token }),
    );
    request
        .headers_mut()
        .insert("x-forwarded-for", header::HeaderValue::from_static("203.0.113.9"));
    let response = ctx.router().await.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    ctx.store
        .audit_events()
        .unwrap()
        .into_iter()
        .find(|e| e.event_type == AuditEventType::TokenRefreshed)
        .and_then(|e| e.ip_address)
}

#[tokio::test]
async fn test_forwarded_for_needs_trusted_proxy() {
    let ctx = TestContext::new();
    assert_eq!(refreshed_from_ip(&ctx).await, None);

    let mut config = test_config();
    config.trust_proxy_headers = true;
    let ctx = TestContext::with_config(config);
    assert_eq!(refreshed_from_ip(&ctx).await.as_deref(), Some("203.0.113.9"));
}
