//! End-to-end checks over the axum router.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::util::ServiceExt;

use toolbroker::clock::Clock;
use toolbroker::http::{router, AppState};

use crate::support::TestEnv;

async fn app() -> (Router, Arc<AppState>) {
    let env = TestEnv::new().await;
    let TestEnv {
        store,
        clock,
        secrets: _,
        vendor,
        broker,
    } = env;
    let state = Arc::new(AppState {
        broker: Arc::new(broker),
        vendor,
        store,
        clock: clock as Arc<dyn Clock>,
    });
    (router(Arc::clone(&state)), state)
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router
        .clone()
        .oneshot(request)
        .await
        .expect("router should respond");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, body)
}

fn post(path: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn get(path: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(path)
        .body(Body::empty())
        .expect("request")
}

async fn seed_agent(router: &Router, name: &str, roles: &[&str]) -> String {
    let (status, body) = send(
        router,
        post("/agents", &json!({ "name": name, "roles": roles })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    body["agent_id"].as_str().expect("agent_id").to_owned()
}

async fn seed_tool(router: &Router, name: &str, owner_id: &str, scopes: &[&str]) -> String {
    let (status, body) = send(
        router,
        post(
            "/tools",
            &json!({ "name": name, "owner_id": owner_id, "allowed_scopes": scopes }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    body["tool_id"].as_str().expect("tool_id").to_owned()
}

async fn seed_policy(router: &Router, tool_id: &str, created_by: &str, scopes: &[&str]) {
    let (status, _) = send(
        router,
        post(
            "/policies",
            &json!({
                "name": format!("policy-for-{tool_id}"),
                "tool_id": tool_id,
                "created_by": created_by,
                "allowed_scopes": scopes,
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn health_reports_ok() {
    let (router, _state) = app().await;
    let (status, body) = send(&router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn duplicate_tool_name_is_a_409_with_detail() {
    let (router, _state) = app().await;
    let owner = seed_agent(&router, "owner", &[]).await;
    seed_tool(&router, "search", &owner, &["read"]).await;

    let (status, body) = send(
        &router,
        post(
            "/tools",
            &json!({ "name": "Search", "owner_id": owner, "allowed_scopes": ["read"] }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["detail"], "Tool with name 'Search' already exists");
    assert!(body["correlation_id"].is_string());
}

#[tokio::test]
async fn access_request_round_trips_to_a_usable_bearer() {
    let (router, _state) = app().await;
    let owner = seed_agent(&router, "owner", &[]).await;
    let agent = seed_agent(&router, "runner", &["tool_user"]).await;
    let tool = seed_tool(&router, "search", &owner, &["read", "write"]).await;
    seed_policy(&router, &tool, &owner, &["read"]).await;

    let (status, body) = send(
        &router,
        post(
            "/access/request",
            &json!({
                "agent_id": agent,
                "tool_id": tool,
                "requested_scopes": ["read", "write"],
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "APPROVED");
    assert_eq!(body["credential"]["granted_scopes"], json!(["read"]));
    let token = body["credential"]["token"].as_str().expect("token");

    // Validate through the wire endpoint.
    let request = Request::builder()
        .method("POST")
        .uri("/access/validate?scope=read")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .expect("request");
    let (status, body) = send(&router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], true);
    assert_eq!(body["agent_id"].as_str(), Some(agent.as_str()));

    // Wrong scope is a 403.
    let request = Request::builder()
        .method("POST")
        .uri("/access/validate?scope=write")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .expect("request");
    let (status, _) = send(&router, request).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn garbage_bearer_is_a_terse_401() {
    let (router, _state) = app().await;
    let request = Request::builder()
        .method("POST")
        .uri("/access/validate")
        .header(header::AUTHORIZATION, "Bearer not-a-token")
        .body(Body::empty())
        .expect("request");
    let (status, body) = send(&router, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["detail"], "invalid credential");
}

#[tokio::test]
async fn denied_request_is_a_403_with_reason_code() {
    let (router, _state) = app().await;
    let owner = seed_agent(&router, "owner", &[]).await;
    let agent = seed_agent(&router, "runner", &[]).await;
    let tool = seed_tool(&router, "search", &owner, &["read"]).await;
    // No policy seeded.

    let (status, body) = send(
        &router,
        post(
            "/access/request",
            &json!({
                "agent_id": agent,
                "tool_id": tool,
                "requested_scopes": ["read"],
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["reason_code"], "NO_POLICY_MATCH");
}

#[tokio::test]
async fn unknown_tool_is_a_404() {
    let (router, _state) = app().await;
    let agent = seed_agent(&router, "runner", &[]).await;

    let (status, body) = send(
        &router,
        post(
            "/access/request",
            &json!({
                "agent_id": agent,
                "tool_id": uuid::Uuid::new_v4(),
                "requested_scopes": ["read"],
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["reason_code"], "UNKNOWN_TARGET");
}

#[tokio::test]
async fn empty_scope_list_is_a_400() {
    let (router, _state) = app().await;
    let (status, _) = send(
        &router,
        post(
            "/access/request",
            &json!({
                "agent_id": uuid::Uuid::new_v4(),
                "tool_id": uuid::Uuid::new_v4(),
                "requested_scopes": [],
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn rate_limited_request_carries_retry_after() {
    let env = TestEnv::with_rate_limit(1, 60).await;
    let TestEnv {
        store,
        clock,
        secrets: _,
        vendor,
        broker,
    } = env;
    let state = Arc::new(AppState {
        broker: Arc::new(broker),
        vendor,
        store,
        clock: clock as Arc<dyn Clock>,
    });
    let router = router(state);

    let owner = seed_agent(&router, "owner", &[]).await;
    let agent = seed_agent(&router, "runner", &[]).await;
    let tool = seed_tool(&router, "search", &owner, &["read"]).await;
    seed_policy(&router, &tool, &owner, &["read"]).await;

    let body = json!({
        "agent_id": agent,
        "tool_id": tool,
        "requested_scopes": ["read"],
    });

    let (status, _) = send(&router, post("/access/request", &body)).await;
    assert_eq!(status, StatusCode::OK);

    let response = router
        .clone()
        .oneshot(post("/access/request", &body))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after = response
        .headers()
        .get(header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.parse::<u64>().ok())
        .expect("Retry-After header");
    assert!(retry_after > 0);
}

#[tokio::test]
async fn revoke_endpoint_is_idempotent() {
    let (router, _state) = app().await;
    let owner = seed_agent(&router, "owner", &[]).await;
    let agent = seed_agent(&router, "runner", &[]).await;
    let tool = seed_tool(&router, "search", &owner, &["read"]).await;
    seed_policy(&router, &tool, &owner, &["read"]).await;

    let (_, body) = send(
        &router,
        post(
            "/access/request",
            &json!({ "agent_id": agent, "tool_id": tool, "requested_scopes": ["read"] }),
        ),
    )
    .await;
    let credential_id = body["credential"]["credential_id"]
        .as_str()
        .expect("credential_id")
        .to_owned();
    let token = body["credential"]["token"].as_str().expect("token").to_owned();

    let path = format!("/credentials/{credential_id}/revoke");
    let (status, _) = send(&router, post(&path, &json!({}))).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    // Revoking again is still a 204.
    let (status, _) = send(&router, post(&path, &json!({}))).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // The bearer no longer validates.
    let request = Request::builder()
        .method("POST")
        .uri("/access/validate")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .expect("request");
    let (status, _) = send(&router, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Unknown credential id is a 404.
    let path = format!("/credentials/{}/revoke", uuid::Uuid::new_v4());
    let (status, _) = send(&router, post(&path, &json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn logs_endpoint_filters_and_paginates() {
    let (router, _state) = app().await;
    let owner = seed_agent(&router, "owner", &[]).await;
    let agent = seed_agent(&router, "runner", &[]).await;
    let tool = seed_tool(&router, "search", &owner, &["read"]).await;
    seed_policy(&router, &tool, &owner, &["read"]).await;

    for _ in 0..3 {
        let (status, _) = send(
            &router,
            post(
                "/access/request",
                &json!({ "agent_id": agent, "tool_id": tool, "requested_scopes": ["read"] }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, body) = send(
        &router,
        get(&format!("/access/logs?event=CREDENTIAL_ISSUED&agent_id={agent}&limit=2")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["items"].as_array().expect("items").len(), 2);
    let cursor = body["next_cursor"].as_str().expect("cursor").to_owned();

    let (status, body) = send(
        &router,
        get(&format!(
            "/access/logs?event=CREDENTIAL_ISSUED&agent_id={agent}&limit=2&cursor={cursor}"
        )),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["items"].as_array().expect("items").len(), 1);
}

#[tokio::test]
async fn pending_request_is_retrievable_and_resolvable() {
    let (router, _state) = app().await;
    let owner = seed_agent(&router, "owner", &[]).await;
    let agent = seed_agent(&router, "runner", &[]).await;
    let tool = seed_tool(&router, "exporter", &owner, &["write"]).await;
    let (status, _) = send(
        &router,
        post(
            "/policies",
            &json!({
                "name": "guarded",
                "tool_id": tool,
                "created_by": owner,
                "allowed_scopes": ["write"],
                "rules": { "require_approval": true },
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(
        &router,
        post(
            "/access/request",
            &json!({ "agent_id": agent, "tool_id": tool, "requested_scopes": ["write"] }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "PENDING_APPROVAL");
    let request_id = body["request_id"].as_str().expect("request_id").to_owned();

    let (status, body) = send(&router, get(&format!("/access/requests/{request_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "PENDING");

    let (status, body) = send(
        &router,
        post(
            &format!("/access/requests/{request_id}/approve"),
            &json!({ "resolver_id": owner }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["request"]["status"], "APPROVED");
    assert!(body["credential"]["token"].is_string());

    // Second resolution conflicts.
    let (status, _) = send(
        &router,
        post(
            &format!("/access/requests/{request_id}/reject"),
            &json!({ "resolver_id": owner }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}
