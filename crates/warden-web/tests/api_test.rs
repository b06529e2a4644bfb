use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{HeaderMap, Method, Request, StatusCode};
use chrono::{Duration, Utc};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use warden_auth::token::{ABILITY_ACCESS_API, generate_api_token, hash_token};
use warden_auth::{
    AuditFilter, AuditRecorder, AuthConfig, AuthStore, CreateRoleRequest, CreateTenantRequest,
    CreateUserRequest,
    NewAccessToken, Role, SqliteAuthStore, StoreAuditSink, Tenant, User, hash_password,
};
use warden_web::{AppState, build_app};

const PASSWORD: &str = "secret123";

struct Harness {
    app: Router,
    store: Arc<SqliteAuthStore>,
    acme: Tenant,
    globex: Tenant,
    root: User,
    acme_admin: User,
    globex_user: User,
}

async fn harness_with(config: AuthConfig) -> Harness {
    let store = Arc::new(SqliteAuthStore::open_in_memory().unwrap());
    harness_on(store, config).await
}

async fn harness_on(store: Arc<SqliteAuthStore>, config: AuthConfig) -> Harness {
    store.migrate().await.unwrap();
    store.seed_defaults("super_admin").await.unwrap();

    let roles = store.list_roles(None).await.unwrap();
    let role = |code: &str| -> Role { roles.iter().find(|r| r.code == code).unwrap().clone() };
    let super_role = role("super_admin");
    let tenant_admin = role("tenant_admin");

    let acme = tenant(&store, "acme").await;
    let globex = tenant(&store, "globex").await;
    let root = user(&store, "root", None, Some(super_role.id)).await;
    let acme_admin = user(&store, "alice", Some(acme.id), Some(tenant_admin.id)).await;
    let globex_user = user(&store, "gus", Some(globex.id), None).await;

    let dyn_store: Arc<dyn AuthStore> = store.clone();
    let audit = AuditRecorder::inline(Arc::new(StoreAuditSink(dyn_store.clone())));
    let state = Arc::new(AppState::new(dyn_store, config, audit, false));

    Harness {
        app: build_app(state),
        store,
        acme,
        globex,
        root,
        acme_admin,
        globex_user,
    }
}

async fn harness() -> Harness {
    harness_with(AuthConfig::default()).await
}

async fn tenant(store: &SqliteAuthStore, code: &str) -> Tenant {
    store
        .create_tenant(&CreateTenantRequest {
            code: code.into(),
            name: code.to_uppercase(),
            status: None,
        })
        .await
        .unwrap()
}

async fn user(
    store: &SqliteAuthStore,
    username: &str,
    tenant_id: Option<i64>,
    role_id: Option<i64>,
) -> User {
    let hash = hash_password(PASSWORD).unwrap();
    store
        .create_user(
            &CreateUserRequest {
                username: username.into(),
                password: PASSWORD.into(),
                email: None,
                tenant_id,
                role_id,
                status: None,
            },
            &hash,
        )
        .await
        .unwrap()
}

struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    body: Value,
}

impl Reply {
    fn code(&self) -> &str {
        self.body["code"].as_str().unwrap_or_default()
    }
}

async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    token: Option<&str>,
    headers: &[(&str, &str)],
    body: Option<Value>,
) -> Reply {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    Reply {
        status,
        headers,
        body,
    }
}

async fn login(app: &Router, username: &str) -> Value {
    let reply = send(
        app,
        Method::POST,
        "/api/auth/login",
        None,
        &[],
        Some(json!({"username": username, "password": PASSWORD})),
    )
    .await;
    assert_eq!(reply.status, StatusCode::OK, "{}", reply.body);
    reply.body["data"].clone()
}

async fn token_for(app: &Router, username: &str) -> String {
    login(app, username).await["token"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn login_issues_token_pair() {
    let h = harness().await;
    let reply = send(
        &h.app,
        Method::POST,
        "/api/v1/auth/login",
        None,
        &[],
        Some(json!({"username": "root", "password": PASSWORD, "remember": true})),
    )
    .await;

    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.code(), "0000");
    let data = &reply.body["data"];
    assert!(data["token"].as_str().unwrap().starts_with("wdn_"));
    assert!(data["refreshToken"].as_str().is_some());
    assert_eq!(data["tokenType"], "Bearer");
    assert!(!reply.body["requestId"].as_str().unwrap().is_empty());
    assert_eq!(reply.body["traceId"].as_str().unwrap().len(), 32);
    assert!(reply.headers.contains_key("x-request-id"));
    assert!(reply.headers.contains_key("traceparent"));

    let tokens = h.store.list_tokens(h.root.id).await.unwrap();
    assert_eq!(tokens.len(), 2);
    assert_eq!(tokens[0].session_id, tokens[1].session_id);
}

#[tokio::test]
async fn sixth_failed_login_is_throttled() {
    let h = harness().await;
    let bad = json!({"username": "alice", "password": "wrong-pass1"});
    for _ in 0..5 {
        let reply = send(&h.app, Method::POST, "/api/auth/login", None, &[], Some(bad.clone())).await;
        assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
        assert_eq!(reply.code(), "1001");
    }

    let reply = send(&h.app, Method::POST, "/api/auth/login", None, &[], Some(bad)).await;
    assert_eq!(reply.status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(reply.code(), "1001");
    assert!(
        reply.body["msg"]
            .as_str()
            .unwrap()
            .starts_with("Too many login attempts. Please try again in")
    );
    assert!(reply.headers.contains_key("retry-after"));

    // Correct credentials stay locked out for the window as well.
    let reply = send(
        &h.app,
        Method::POST,
        "/api/auth/login",
        None,
        &[],
        Some(json!({"username": "ALICE", "password": PASSWORD})),
    )
    .await;
    assert_eq!(reply.status, StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn missing_token_is_unauthorized() {
    let h = harness().await;
    let reply = send(&h.app, Method::GET, "/api/auth/me", None, &[], None).await;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
    assert_eq!(reply.code(), "8888");
}

#[tokio::test]
async fn expired_token_reports_expiry_once() {
    let h = harness().await;
    let raw = generate_api_token();
    h.store
        .create_token(&NewAccessToken {
            user_id: h.root.id,
            name: "access".into(),
            token_hash: hash_token(&raw),
            abilities: vec![ABILITY_ACCESS_API.into()],
            expires_at: Some(Utc::now() - Duration::minutes(1)),
            device: None,
            ip_addr: None,
            remember: false,
            session_id: "s-expired".into(),
        })
        .await
        .unwrap();

    let first = send(&h.app, Method::GET, "/api/auth/me", Some(&raw), &[], None).await;
    assert_eq!(first.status, StatusCode::UNAUTHORIZED);
    assert_eq!(first.code(), "9999");

    let second = send(&h.app, Method::GET, "/api/auth/me", Some(&raw), &[], None).await;
    assert_eq!(second.code(), "8888");
}

#[tokio::test]
async fn both_prefixes_serve_the_same_routes() {
    let h = harness().await;
    let token = token_for(&h.app, "root").await;
    for uri in ["/api/v1/auth/me", "/api/auth/me"] {
        let reply = send(&h.app, Method::GET, uri, Some(&token), &[], None).await;
        assert_eq!(reply.status, StatusCode::OK, "{uri}");
        assert_eq!(reply.body["data"]["user"]["username"], "root");
        assert_eq!(reply.body["data"]["tenant"]["isSuper"], true);
    }
}

#[tokio::test]
async fn unknown_route_and_wrong_method_use_envelope() {
    let h = harness().await;
    let reply = send(&h.app, Method::GET, "/api/nothing-here", None, &[], None).await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
    assert_eq!(reply.code(), "4040");

    let reply = send(&h.app, Method::DELETE, "/api/auth/login", None, &[], None).await;
    assert_eq!(reply.status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(reply.code(), "4050");
}

#[tokio::test]
async fn tenant_header_is_ignored_for_tenant_users() {
    let h = harness().await;
    let token = token_for(&h.app, "alice").await;
    let globex = h.globex.id.to_string();
    let reply = send(
        &h.app,
        Method::GET,
        "/api/auth/me",
        Some(&token),
        &[("x-tenant-id", globex.as_str())],
        None,
    )
    .await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body["data"]["tenant"]["tenantId"], h.acme.id);
    assert_eq!(reply.body["data"]["tenant"]["isSuper"], false);

    // Users of another tenant are invisible rather than forbidden.
    let uri = format!("/api/users/{}", h.globex_user.id);
    let reply = send(&h.app, Method::GET, &uri, Some(&token), &[], None).await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
    assert_eq!(reply.code(), "4040");
}

#[tokio::test]
async fn platform_admin_selects_tenant_by_header() {
    let h = harness().await;
    let token = token_for(&h.app, "root").await;
    let globex = h.globex.id.to_string();
    let reply = send(
        &h.app,
        Method::GET,
        "/api/auth/me",
        Some(&token),
        &[("x-tenant-id", globex.as_str())],
        None,
    )
    .await;
    assert_eq!(reply.body["data"]["tenant"]["tenantId"], h.globex.id);
    assert_eq!(reply.body["data"]["tenant"]["options"].as_array().unwrap().len(), 2);

    let reply = send(
        &h.app,
        Method::GET,
        "/api/auth/me",
        Some(&token),
        &[("x-tenant-id", "9999")],
        None,
    )
    .await;
    assert_eq!(reply.status, StatusCode::FORBIDDEN);
    assert_eq!(reply.code(), "1003");
}

#[tokio::test]
async fn retried_create_replays_first_response() {
    let h = harness().await;
    let token = token_for(&h.app, "root").await;
    let body = json!({"username": "bob", "password": "hunter2go", "tenant_id": h.acme.id});
    let headers = [("idempotency-key", "create-bob")];

    let first = send(&h.app, Method::POST, "/api/users", Some(&token), &headers, Some(body.clone())).await;
    assert_eq!(first.status, StatusCode::OK, "{}", first.body);
    assert!(!first.headers.contains_key("x-idempotent-replay"));

    let second = send(&h.app, Method::POST, "/api/v1/users", Some(&token), &headers, Some(body)).await;
    assert_eq!(second.status, StatusCode::OK);
    assert_eq!(second.headers.get("x-idempotent-replay").unwrap(), "1");
    assert_eq!(second.body, first.body);

    let bobs = h
        .store
        .list_users(Some(h.acme.id))
        .await
        .unwrap()
        .into_iter()
        .filter(|u| u.username == "bob")
        .count();
    assert_eq!(bobs, 1);
}

#[tokio::test]
async fn reused_key_with_other_payload_is_rejected() {
    let h = harness().await;
    let token = token_for(&h.app, "root").await;
    let headers = [("idempotency-key", "k-1")];
    let first = send(
        &h.app,
        Method::POST,
        "/api/users",
        Some(&token),
        &headers,
        Some(json!({"username": "carol", "password": "hunter2go"})),
    )
    .await;
    assert_eq!(first.status, StatusCode::OK);

    let second = send(
        &h.app,
        Method::POST,
        "/api/users",
        Some(&token),
        &headers,
        Some(json!({"username": "dave", "password": "hunter2go"})),
    )
    .await;
    assert_eq!(second.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(second.code(), "1002");
}

#[tokio::test]
async fn action_wrapper_deduplicates_without_middleware() {
    let mut config = AuthConfig::default();
    config.idempotency.enabled = false;
    let h = harness_with(config).await;
    let token = token_for(&h.app, "root").await;
    let body = json!({"username": "erin", "password": "hunter2go"});
    let headers = [("idempotency-key", "erin-1")];

    let first = send(&h.app, Method::POST, "/api/users", Some(&token), &headers, Some(body.clone())).await;
    assert_eq!(first.status, StatusCode::OK, "{}", first.body);
    let second = send(&h.app, Method::POST, "/api/users", Some(&token), &headers, Some(body)).await;
    assert_eq!(second.headers.get("x-idempotent-replay").unwrap(), "1");
    assert_eq!(second.body["data"]["id"], first.body["data"]["id"]);
}

#[tokio::test]
async fn stale_version_conflicts() {
    let h = harness().await;
    let token = token_for(&h.app, "root").await;
    let target = h.store.get_user(h.globex_user.id).await.unwrap();
    let current = target.updated_at.timestamp();
    let uri = format!("/api/users/{}", target.id);

    let reply = send(
        &h.app,
        Method::PUT,
        &uri,
        Some(&token),
        &[],
        Some(json!({"email": "gus@example.com", "version": current - 60})),
    )
    .await;
    assert_eq!(reply.status, StatusCode::CONFLICT);
    assert_eq!(reply.code(), "1009");
    assert_eq!(reply.body["data"]["currentVersion"], current);
    assert!(reply.body["data"]["currentUpdatedAt"].is_string());

    let reply = send(
        &h.app,
        Method::PUT,
        &uri,
        Some(&token),
        &[],
        Some(json!({"email": "gus@example.com", "version": current})),
    )
    .await;
    assert_eq!(reply.status, StatusCode::OK, "{}", reply.body);
    assert_eq!(reply.body["data"]["email"], "gus@example.com");
}

#[tokio::test]
async fn tenant_admin_cannot_grant_equal_role() {
    let h = harness().await;
    let token = token_for(&h.app, "alice").await;
    let tenant_admin = h.acme_admin.role_id.unwrap();
    let reply = send(
        &h.app,
        Method::POST,
        "/api/users",
        Some(&token),
        &[],
        Some(json!({"username": "frank", "password": "hunter2go", "role_id": tenant_admin})),
    )
    .await;
    assert_eq!(reply.status, StatusCode::FORBIDDEN);
    assert_eq!(reply.code(), "1003");

    // A role-less user lands in alice's own tenant regardless of the body.
    let reply = send(
        &h.app,
        Method::POST,
        "/api/users",
        Some(&token),
        &[],
        Some(json!({"username": "frank", "password": "hunter2go", "tenant_id": h.globex.id})),
    )
    .await;
    assert_eq!(reply.status, StatusCode::OK, "{}", reply.body);
    assert_eq!(reply.body["data"]["tenantId"], h.acme.id);
}

#[tokio::test]
async fn weak_password_is_a_param_error() {
    let h = harness().await;
    let token = token_for(&h.app, "root").await;
    let reply = send(
        &h.app,
        Method::POST,
        "/api/users",
        Some(&token),
        &[],
        Some(json!({"username": "gina", "password": "short"})),
    )
    .await;
    assert_eq!(reply.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(reply.code(), "1002");
}

#[tokio::test]
async fn refresh_rotates_and_consumes_token() {
    let h = harness().await;
    let pair = login(&h.app, "root").await;
    let access = pair["token"].as_str().unwrap();
    let refresh = pair["refreshToken"].as_str().unwrap();

    let reply = send(&h.app, Method::POST, "/api/auth/refresh", Some(access), &[], None).await;
    assert_eq!(reply.code(), "8888");

    let reply = send(&h.app, Method::POST, "/api/auth/refresh", Some(refresh), &[], None).await;
    assert_eq!(reply.status, StatusCode::OK, "{}", reply.body);
    assert_ne!(reply.body["data"]["refreshToken"].as_str().unwrap(), refresh);

    let reply = send(&h.app, Method::POST, "/api/auth/refresh", Some(refresh), &[], None).await;
    assert_eq!(reply.code(), "8888");
}

#[tokio::test]
async fn logout_revokes_the_session() {
    let h = harness().await;
    let token = token_for(&h.app, "root").await;
    let reply = send(&h.app, Method::POST, "/api/auth/logout", Some(&token), &[], None).await;
    assert_eq!(reply.status, StatusCode::OK);

    let reply = send(&h.app, Method::GET, "/api/auth/me", Some(&token), &[], None).await;
    assert_eq!(reply.code(), "8888");

    let logouts = h
        .store
        .list_audit(
            &AuditFilter {
                action: Some("auth.logout".into()),
                ..Default::default()
            },
            10,
            0,
        )
        .await
        .unwrap();
    assert_eq!(logouts.len(), 1);
}

#[tokio::test]
async fn tenant_in_use_cannot_be_deleted() {
    let h = harness().await;
    let token = token_for(&h.app, "root").await;
    let uri = format!("/api/tenants/{}", h.acme.id);
    let reply = send(&h.app, Method::DELETE, &uri, Some(&token), &[], None).await;
    assert_eq!(reply.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(reply.code(), "1002");
}

#[tokio::test]
async fn permission_catalog_is_listed() {
    let h = harness().await;
    let token = token_for(&h.app, "alice").await;
    let reply = send(&h.app, Method::GET, "/api/permissions", Some(&token), &[], None).await;
    assert_eq!(reply.status, StatusCode::OK);
    let codes: Vec<&str> = reply.body["data"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|p| p["code"].as_str())
        .collect();
    assert!(codes.contains(&"users.view"));
    assert!(codes.contains(&"audit.failed_jobs"));
}

async fn acme_role(h: &Harness, code: &str, level: u32, grants: &[&str]) -> Role {
    let role = h
        .store
        .create_role(&CreateRoleRequest {
            code: code.into(),
            name: code.into(),
            level,
            tenant_id: Some(h.acme.id),
            status: None,
        })
        .await
        .unwrap();
    let ids: Vec<i64> = h
        .store
        .list_permissions()
        .await
        .unwrap()
        .into_iter()
        .filter(|p| grants.contains(&p.code.as_str()))
        .map(|p| p.id)
        .collect();
    h.store.set_role_permissions(role.id, &ids).await.unwrap();
    role
}

#[tokio::test]
async fn tenant_role_with_reserved_code_cannot_escape_tenant() {
    let h = harness().await;
    let shadow = acme_role(&h, "super_admin", 100, &[]).await;
    user(&h.store, "mallory", Some(h.acme.id), Some(shadow.id)).await;
    let token = token_for(&h.app, "mallory").await;

    let globex = h.globex.id.to_string();
    let reply = send(
        &h.app,
        Method::GET,
        "/api/auth/me",
        Some(&token),
        &[("x-tenant-id", globex.as_str())],
        None,
    )
    .await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body["data"]["tenant"]["tenantId"], h.acme.id);
    assert_eq!(reply.body["data"]["tenant"]["isSuper"], false);
    assert_eq!(reply.body["data"]["tenant"]["options"].as_array().unwrap().len(), 1);

    let reply = send(
        &h.app,
        Method::POST,
        "/api/tenants",
        Some(&token),
        &[],
        Some(json!({"code": "initech", "name": "Initech"})),
    )
    .await;
    assert_eq!(reply.status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn reserved_role_code_is_rejected_inside_a_tenant() {
    let h = harness().await;
    let manager = acme_role(&h, "role_manager", 40, &["roles.view", "roles.create"]).await;
    user(&h.store, "bob", Some(h.acme.id), Some(manager.id)).await;
    let token = token_for(&h.app, "bob").await;

    let reply = send(
        &h.app,
        Method::POST,
        "/api/roles",
        Some(&token),
        &[],
        Some(json!({"code": "super_admin", "name": "Shadow", "level": 40})),
    )
    .await;
    assert_eq!(reply.status, StatusCode::UNPROCESSABLE_ENTITY, "{}", reply.body);
    assert_eq!(reply.code(), "1002");

    let reply = send(
        &h.app,
        Method::POST,
        "/api/roles",
        Some(&token),
        &[],
        Some(json!({"code": "helper", "name": "Helper", "level": 30})),
    )
    .await;
    assert_eq!(reply.status, StatusCode::OK, "{}", reply.body);
    assert_eq!(reply.body["data"]["tenantId"], h.acme.id);

    // Platform administrators cannot place the code in a tenant either.
    let root = token_for(&h.app, "root").await;
    let reply = send(
        &h.app,
        Method::POST,
        "/api/roles",
        Some(&root),
        &[],
        Some(json!({"code": "super_admin", "name": "Shadow", "level": 10, "tenant_id": h.globex.id})),
    )
    .await;
    assert_eq!(reply.code(), "1002");
}

#[tokio::test]
async fn server_error_releases_the_key_for_a_retry() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("warden.db");
    let store = Arc::new(SqliteAuthStore::open(&path).unwrap());
    let h = harness_on(store, AuthConfig::default()).await;
    let token = token_for(&h.app, "root").await;
    let uri = format!("/api/tenants/{}", h.acme.id);
    let body = json!({"name": "Acme Corp"});
    let headers = [("idempotency-key", "rename-acme")];

    let side = rusqlite::Connection::open(&path).unwrap();
    side.execute_batch("ALTER TABLE audit_logs RENAME TO audit_logs_off")
        .unwrap();
    let failed = send(&h.app, Method::PUT, &uri, Some(&token), &headers, Some(body.clone())).await;
    assert_eq!(failed.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(failed.code(), "5000");

    side.execute_batch("ALTER TABLE audit_logs_off RENAME TO audit_logs")
        .unwrap();
    let retried = send(&h.app, Method::PUT, &uri, Some(&token), &headers, Some(body.clone())).await;
    assert_eq!(retried.status, StatusCode::OK, "{}", retried.body);
    assert!(!retried.headers.contains_key("x-idempotent-replay"));
    assert_eq!(retried.body["data"]["name"], "Acme Corp");

    let again = send(&h.app, Method::PUT, &uri, Some(&token), &headers, Some(body)).await;
    assert_eq!(again.headers.get("x-idempotent-replay").unwrap(), "1");
    assert_eq!(again.body, retried.body);

    let updates = h
        .store
        .list_audit(
            &AuditFilter {
                action: Some("tenants.update".into()),
                ..Default::default()
            },
            10,
            0,
        )
        .await
        .unwrap();
    assert_eq!(updates.len(), 1);
}

#[tokio::test]
async fn guest_login_with_same_key_replays() {
    let h = harness().await;
    let body = json!({"username": "alice", "password": PASSWORD});
    let browser = [("idempotency-key", "login-1"), ("user-agent", "firefox")];

    let first = send(&h.app, Method::POST, "/api/auth/login", None, &browser, Some(body.clone())).await;
    assert_eq!(first.status, StatusCode::OK, "{}", first.body);
    assert!(!first.headers.contains_key("x-idempotent-replay"));

    let second = send(&h.app, Method::POST, "/api/auth/login", None, &browser, Some(body.clone())).await;
    assert_eq!(second.headers.get("x-idempotent-replay").unwrap(), "1");
    assert_eq!(second.body["data"]["token"], first.body["data"]["token"]);

    // A different client is a different guest even with the same key.
    let other = [("idempotency-key", "login-1"), ("user-agent", "curl")];
    let third = send(&h.app, Method::POST, "/api/auth/login", None, &other, Some(body)).await;
    assert_eq!(third.status, StatusCode::OK);
    assert!(!third.headers.contains_key("x-idempotent-replay"));
    assert_ne!(third.body["data"]["token"], first.body["data"]["token"]);
}

#[tokio::test]
async fn switcher_options_match_me_after_tenant_changes() {
    let h = harness().await;
    let token = token_for(&h.app, "root").await;
    let options = |reply: &Reply| reply.body["data"].clone();

    let before = send(&h.app, Method::GET, "/api/tenants/options", Some(&token), &[], None).await;
    assert_eq!(options(&before).as_array().unwrap().len(), 2);

    let created = send(
        &h.app,
        Method::POST,
        "/api/tenants",
        Some(&token),
        &[],
        Some(json!({"code": "initech", "name": "Initech"})),
    )
    .await;
    assert_eq!(created.status, StatusCode::OK, "{}", created.body);

    let listed = send(&h.app, Method::GET, "/api/tenants/options", Some(&token), &[], None).await;
    let me = send(&h.app, Method::GET, "/api/auth/me", Some(&token), &[], None).await;
    assert_eq!(options(&listed).as_array().unwrap().len(), 3);
    assert_eq!(me.body["data"]["tenant"]["options"], options(&listed));
}
