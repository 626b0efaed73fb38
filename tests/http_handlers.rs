//! HTTP surface driven through the axum router without a socket.

mod common;

use anyhow::{Context, Result};
use axum::{
    body::{to_bytes, Body},
    http::{header, HeaderMap, Method, Request, StatusCode},
    Router,
};
use base64ct::{Base64, Encoding};
use common::{fixture, vector, Fixture, CODE, DNI, USERNAME};
use facegate::{
    api::{self, handlers::AppState},
    store::MemoryStore,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

const ADMIN_TOKEN: &str = "admin-secret";

struct Harness {
    app: Router,
    store: MemoryStore,
    identity_id: Uuid,
}

async fn harness() -> Result<Harness> {
    let Fixture {
        store,
        orchestrator,
        identity_id,
    } = fixture().await?;
    let state = AppState::new(Arc::new(store.clone()), orchestrator, ADMIN_TOKEN);
    Ok(Harness {
        app: api::app(Arc::new(state)),
        store,
        identity_id,
    })
}

fn request(method: Method, uri: &str, body: Option<&Value>) -> Result<Request<Body>> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-forwarded-for", "192.0.2.44");
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(body)?))?,
        None => builder.body(Body::empty())?,
    };
    Ok(request)
}

fn admin(method: Method, uri: &str, body: Option<&Value>) -> Result<Request<Body>> {
    let mut request = request(method, uri, body)?;
    request.headers_mut().insert(
        header::AUTHORIZATION,
        format!("Bearer {ADMIN_TOKEN}").parse()?,
    );
    Ok(request)
}

async fn send(app: &Router, request: Request<Body>) -> Result<(StatusCode, HeaderMap, Value)> {
    let response = app.clone().oneshot(request).await?;
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)?
    };
    Ok((status, headers, body))
}

async fn login(app: &Router, body: Value) -> Result<(StatusCode, Value)> {
    let (status, _, body) = send(app, request(Method::POST, "/auth/login", Some(&body))?).await?;
    Ok((status, body))
}

#[tokio::test]
async fn health_reports_store_state() -> Result<()> {
    let h = harness().await?;

    let (status, headers, body) = send(&h.app, request(Method::GET, "/health", None)?).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["store"], json!("ok"));
    assert_eq!(body["name"], json!(env!("CARGO_PKG_NAME")));
    let x_app = headers
        .get("X-App")
        .and_then(|value| value.to_str().ok())
        .context("X-App header missing")?;
    assert!(x_app.starts_with(env!("CARGO_PKG_NAME")));
    assert!(headers.contains_key("x-request-id"));

    h.store.set_available(false);
    let (status, _, body) = send(&h.app, request(Method::GET, "/health", None)?).await?;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["store"], json!("error"));
    Ok(())
}

#[tokio::test]
async fn full_login_over_http() -> Result<()> {
    let h = harness().await?;

    let (status, body) = login(
        &h.app,
        json!({ "stage": "credential", "identifier": USERNAME }),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["next_stage"], json!("face"));
    assert_eq!(body["user_id"], json!(h.identity_id));
    let session_id = body["session_id"]
        .as_str()
        .context("session id missing")?
        .to_string();

    let (status, body) = login(
        &h.app,
        json!({
            "stage": "face",
            "session_id": session_id,
            "sample": { "image": Base64::encode_string(b"face:0.2") },
            "pose": { "x": 0.5, "y": 0.5, "scale": 1.0 },
            "image_metadata": { "width": 640, "height": 480 },
        }),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["next_stage"], json!("fallback"));
    assert!(body["confidence_score"].as_f64().is_some());
    assert!(body["processing_time"].as_f64().is_some());
    assert!(body["attempt_id"].is_string());

    let (status, body) = login(
        &h.app,
        json!({ "stage": "fallback", "session_id": session_id, "dni": DNI, "code": CODE }),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));
    assert!(body["token"].is_string());
    assert!(body["expires_at"].is_string());
    Ok(())
}

#[tokio::test]
async fn login_failures_are_generic() -> Result<()> {
    let h = harness().await?;

    let (status, body) = login(
        &h.app,
        json!({ "stage": "credential", "identifier": "mallory" }),
    )
    .await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, json!({ "success": false, "error": "Authentication failed" }));

    let (status, _) = login(&h.app, json!({ "identifier": USERNAME })).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = login(
        &h.app,
        json!({
            "stage": "face",
            "session_id": "unknown",
            "sample": { "image": "%%%" },
            "pose": { "x": 0.5, "y": 0.5, "scale": 1.0 },
        }),
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn sixth_attempt_is_rate_limited_until_unblocked() -> Result<()> {
    let h = harness().await?;
    let attempt = json!({
        "stage": "face",
        "session_id": "missing",
        "sample": { "embedding": vector(0.0) },
        "pose": { "x": 0.5, "y": 0.5, "scale": 1.0 },
    });

    for _ in 0..5 {
        let (status, _) = login(&h.app, attempt.clone()).await?;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
    let (status, body) = login(&h.app, attempt.clone()).await?;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["blocked"], json!(true));
    assert_eq!(body["reason"], json!("too_many_attempts"));
    assert!(body["blocked_until"].is_string());

    let (status, _, body) = send(&h.app, admin(Method::GET, "/blocks", None)?).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], json!(1));
    assert_eq!(body["blocks"][0]["source"], json!("192.0.2.44"));
    assert_eq!(body["blocks"][0]["currently_blocked"], json!(true));

    let (status, _, _) =
        send(&h.app, admin(Method::DELETE, "/blocks/192.0.2.44", None)?).await?;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _, _) =
        send(&h.app, admin(Method::DELETE, "/blocks/192.0.2.44", None)?).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, body) = send(
        &h.app,
        admin(
            Method::GET,
            &format!("/attempts?username={USERNAME}&status=failed"),
            None,
        )?,
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    // Unknown sessions never resolve an identity.
    assert_eq!(body["count"], json!(0));

    let (status, _, body) =
        send(&h.app, admin(Method::GET, "/attempts?status=blocked", None)?).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], json!(1));
    assert_eq!(
        body["attempts"][0]["details"]["type"],
        json!("rate_limit_exceeded")
    );
    Ok(())
}

#[tokio::test]
async fn admin_routes_require_token() -> Result<()> {
    let h = harness().await?;
    for (method, uri) in [
        (Method::GET, "/attempts"),
        (Method::GET, "/blocks"),
        (Method::GET, "/policy"),
        (Method::GET, "/policies"),
    ] {
        let (status, _, _) = send(&h.app, request(method.clone(), uri, None)?).await?;
        assert_eq!(status, StatusCode::UNAUTHORIZED, "{method} {uri}");
    }

    let mut wrong = request(Method::GET, "/blocks", None)?;
    wrong
        .headers_mut()
        .insert(header::AUTHORIZATION, "Bearer nope".parse()?);
    let (status, _, _) = send(&h.app, wrong).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn user_creation_and_registration() -> Result<()> {
    let h = harness().await?;

    let (status, _, body) = send(
        &h.app,
        admin(
            Method::POST,
            "/users",
            Some(&json!({ "username": "  Carol ", "dni": "55555555" })),
        )?,
    )
    .await?;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["username"], json!("carol"));
    let user_id = body["user_id"].as_str().context("user id missing")?.to_string();

    let (status, _, _) = send(
        &h.app,
        admin(
            Method::POST,
            "/users",
            Some(&json!({ "username": "carol", "dni": "66666666" })),
        )?,
    )
    .await?;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _, _) = send(
        &h.app,
        admin(
            Method::POST,
            "/users",
            Some(&json!({ "username": "x", "dni": "66666666" })),
        )?,
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let registration = json!({
        "samples": [
            { "embedding": vector(0.0) },
            { "image": Base64::encode_string(b"face:0.05") },
        ],
        "positions": [
            { "x": 0.5, "y": 0.5, "scale": 1.0 },
            { "roll": 0.0, "pitch": 2.0, "yaw": -3.0, "dist": 0.6 },
        ],
        "fallback_code": "9876",
    });
    let (status, _, body) = send(
        &h.app,
        admin(
            Method::POST,
            &format!("/users/{user_id}/facial-register"),
            Some(&registration),
        )?,
    )
    .await?;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["embeddings"], json!(2));
    assert_eq!(body["positions"], json!(2));

    let (status, _, _) = send(
        &h.app,
        admin(
            Method::POST,
            &format!("/users/{user_id}/facial-register"),
            Some(&json!({ "samples": [{ "image": Base64::encode_string(b"tree") }] })),
        )?,
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = send(
        &h.app,
        admin(
            Method::POST,
            &format!("/users/{user_id}/facial-register"),
            Some(&json!({})),
        )?,
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = send(
        &h.app,
        admin(
            Method::POST,
            &format!("/users/{}/facial-register", Uuid::now_v7()),
            Some(&registration),
        )?,
    )
    .await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn policy_versions() -> Result<()> {
    let h = harness().await?;

    let (status, _, body) = send(&h.app, admin(Method::GET, "/policy", None)?).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["active"], json!(false));
    let mut policy = body["policy"].clone();

    policy["name"] = json!("strict");
    policy["max_attempts_per_window"] = json!(0);
    let (status, _, _) = send(&h.app, admin(Method::POST, "/policy", Some(&policy))?).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    policy["max_attempts_per_window"] = json!(3);
    let (status, _, body) = send(&h.app, admin(Method::POST, "/policy", Some(&policy))?).await?;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["policy"]["version"], json!(1));

    let (status, _, body) = send(&h.app, admin(Method::GET, "/policy", None)?).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["active"], json!(true));
    assert_eq!(body["policy"]["name"], json!("strict"));

    let (status, _, body) = send(&h.app, admin(Method::GET, "/policies", None)?).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], json!(1));
    Ok(())
}

#[tokio::test]
async fn attempt_queries_validate_filters() -> Result<()> {
    let h = harness().await?;

    let (status, _, _) =
        send(&h.app, admin(Method::GET, "/attempts?status=maybe", None)?).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) =
        send(&h.app, admin(Method::GET, "/attempts?username=ghost", None)?).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    login(
        &h.app,
        json!({ "stage": "credential", "identifier": USERNAME }),
    )
    .await?;
    let (status, _, body) = send(
        &h.app,
        admin(Method::GET, &format!("/attempts?username={USERNAME}"), None)?,
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], json!(1));
    assert_eq!(body["attempts"][0]["stage"], json!("credential"));
    assert_eq!(body["attempts"][0]["source"], json!("192.0.2.44"));
    Ok(())
}

#[tokio::test]
async fn blocked_source_cannot_dodge_the_limiter_with_bad_images() -> Result<()> {
    let h = harness().await?;
    let attempt = json!({
        "stage": "face",
        "session_id": "missing",
        "sample": { "embedding": vector(0.0) },
        "pose": { "x": 0.5, "y": 0.5, "scale": 1.0 },
    });
    for _ in 0..5 {
        let (status, _) = login(&h.app, attempt.clone()).await?;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    let (status, body) = login(
        &h.app,
        json!({
            "stage": "face",
            "session_id": "missing",
            "sample": { "image": "***not-base64***" },
            "pose": { "x": 0.5, "y": 0.5, "scale": 1.0 },
        }),
    )
    .await?;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["blocked"], json!(true));

    let (_, _, body) =
        send(&h.app, admin(Method::GET, "/attempts?status=failed", None)?).await?;
    assert_eq!(body["count"], json!(5));
    let (_, _, body) =
        send(&h.app, admin(Method::GET, "/attempts?status=blocked", None)?).await?;
    assert_eq!(body["count"], json!(1));
    Ok(())
}

#[tokio::test]
async fn bad_image_counts_toward_the_window() -> Result<()> {
    let h = harness().await?;
    let bad_image = json!({
        "stage": "face",
        "session_id": "missing",
        "sample": { "image": "%%%" },
        "pose": { "x": 0.5, "y": 0.5, "scale": 1.0 },
    });
    for _ in 0..5 {
        let (status, _) = login(&h.app, bad_image.clone()).await?;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
    let (status, _) = login(&h.app, bad_image).await?;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

    let (_, _, body) =
        send(&h.app, admin(Method::GET, "/attempts?status=failed", None)?).await?;
    assert_eq!(body["count"], json!(5));
    assert_eq!(body["attempts"][0]["details"]["type"], json!("invalid_image"));
    assert_eq!(body["attempts"][0]["stage"], json!("face"));
    Ok(())
}

#[tokio::test]
async fn malformed_login_body_is_recorded() -> Result<()> {
    let h = harness().await?;
    let (status, _) = login(&h.app, json!({ "stage": "retina", "identifier": USERNAME })).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, body) =
        send(&h.app, admin(Method::GET, "/attempts?status=failed", None)?).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], json!(1));
    assert_eq!(
        body["attempts"][0]["details"]["type"],
        json!("malformed_request")
    );
    assert_eq!(body["attempts"][0]["source"], json!("192.0.2.44"));
    Ok(())
}
