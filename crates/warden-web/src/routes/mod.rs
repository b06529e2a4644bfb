pub mod audit;
pub mod auth;
pub mod permissions;
pub mod preferences;
pub mod roles;
pub mod tenants;
pub mod users;

use std::sync::Arc;

use axum::Router;
use axum::http::HeaderMap;
use axum::middleware;
use axum::routing::{get, post, put};
use chrono_tz::Tz;
use serde_json::Value;
use tower_http::trace::TraceLayer;

use warden_auth::{LockInput, NewAuditEntry};

use crate::auth::{AuthUser, ClientInfo, auth_middleware, header_str};
use crate::envelope::{method_not_allowed, not_found};
use crate::idempotency::idempotency_middleware;
use crate::request_context::request_context;
use crate::state::AppState;

pub fn build_router(state: Arc<AppState>) -> Router {
    // Protected API routes. Auth wraps idempotency so replay keys belong to
    // the user rather than the connection.
    let protected = Router::new()
        .route("/auth/logout", post(auth::logout))
        .route("/auth/me", get(auth::me))
        .route("/users", get(users::list_users).post(users::create_user))
        .route(
            "/users/{id}",
            get(users::get_user)
                .put(users::update_user)
                .delete(users::delete_user),
        )
        .route("/users/{id}/restore", post(users::restore_user))
        .route("/users/{id}/password", put(users::update_password))
        .route("/roles", get(roles::list_roles).post(roles::create_role))
        .route(
            "/roles/{id}",
            get(roles::get_role)
                .put(roles::update_role)
                .delete(roles::delete_role),
        )
        .route(
            "/roles/{id}/permissions",
            get(roles::get_role_permissions).put(roles::set_role_permissions),
        )
        .route("/permissions", get(permissions::list_permissions))
        .route(
            "/tenants",
            get(tenants::list_tenants).post(tenants::create_tenant),
        )
        .route("/tenants/options", get(tenants::tenant_options))
        .route(
            "/tenants/{id}",
            put(tenants::update_tenant).delete(tenants::delete_tenant),
        )
        .route(
            "/preferences",
            get(preferences::get_preferences).put(preferences::update_preferences),
        )
        .route("/audit-logs", get(audit::list_audit_logs))
        .route("/failed-jobs", get(audit::list_failed_jobs))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            idempotency_middleware,
        ))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    // Public auth routes, deduplicated per guest.
    let public = Router::new()
        .route("/auth/login", post(auth::login))
        .route("/auth/refresh", post(auth::refresh))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            idempotency_middleware,
        ));

    let api = Router::new()
        .merge(public)
        .merge(protected)
        .method_not_allowed_fallback(method_not_allowed)
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api.clone())
        .nest("/api", api)
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(state, request_context))
        .layer(TraceLayer::new_for_http())
}

/// Version token sources for an update: body fields, the configured header
/// and the caller's timezone.
pub(crate) fn lock_input<'a>(
    state: &'a AppState,
    headers: &'a HeaderMap,
    payload: &'a Value,
    timezone: Tz,
) -> LockInput<'a> {
    LockInput {
        payload: Some(payload),
        header: header_str(headers, state.lock.header_name()),
        timezone: Some(timezone),
    }
}

/// Tenant a query or write applies to: platform admins choose (falling back
/// to the selected tenant), everyone else is pinned to their own.
pub(crate) fn target_tenant(user: &AuthUser, requested: Option<i64>) -> Option<i64> {
    if user.scope.is_super {
        requested.or(user.scope.tenant_id)
    } else {
        user.scope.tenant_id
    }
}

/// Audit row for an administrative action by `actor`.
pub(crate) fn audit_entry(
    actor: &AuthUser,
    client: &ClientInfo,
    action: &str,
    subject_type: &str,
    subject_id: impl ToString,
) -> NewAuditEntry {
    NewAuditEntry {
        action: action.to_string(),
        actor_id: Some(actor.user_id()),
        tenant_id: actor.scope.tenant_id.or(actor.ctx.user.tenant_id),
        subject_type: Some(subject_type.to_string()),
        subject_id: Some(subject_id.to_string()),
        ip_addr: Some(client.ip.clone()),
        user_agent: Some(client.user_agent.clone()),
        request_id: client.request_id.clone(),
        ..Default::default()
    }
}
