use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use serde::Deserialize;
use serde_json::{Value, json};

use warden_auth::{
    AuthError, CreateUserRequest, Role, UpdatePasswordRequest, UpdateUserRequest, User,
    ensure_can_manage, hash_password,
};

use super::{audit_entry, lock_input, target_tenant};
use crate::auth::{AuthUser, ClientInfo};
use crate::envelope::{ApiError, ApiOk, ApiResult, ValidJson, from_payload};
use crate::idempotency::{IdempotencyInfo, idempotent};
use crate::models::UserResponse;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct UserListQuery {
    pub tenant_id: Option<i64>,
}

pub async fn list_users(
    actor: AuthUser,
    State(state): State<Arc<AppState>>,
    Query(query): Query<UserListQuery>,
) -> ApiResult<Vec<UserResponse>> {
    actor.require_permission("users.view")?;
    let tenant = target_tenant(&actor, query.tenant_id);
    let users = state.store.list_users(tenant).await?;
    let tz = actor.ctx.timezone;
    Ok(ApiOk(users.into_iter().map(|u| UserResponse::new(u, tz)).collect()))
}

pub async fn get_user(
    actor: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<UserResponse> {
    actor.require_permission("users.view")?;
    let user = visible_user(&state, &actor, id).await?;
    Ok(ApiOk(UserResponse::new(user, actor.ctx.timezone)))
}

/// Creation is deduplicated per action, so a retried create never makes two
/// accounts even when the global middleware is switched off.
pub async fn create_user(
    actor: AuthUser,
    client: ClientInfo,
    info: IdempotencyInfo,
    State(state): State<Arc<AppState>>,
    ValidJson(payload): ValidJson<Value>,
) -> Result<Response, ApiError> {
    let (state_ref, actor_ref, client_ref, payload_ref) = (&*state, &actor, &client, &payload);
    idempotent(&state, &info, &payload, move || {
        create_user_inner(state_ref, actor_ref, client_ref, payload_ref)
    })
    .await
}

async fn create_user_inner(
    state: &AppState,
    actor: &AuthUser,
    client: &ClientInfo,
    payload: &Value,
) -> ApiResult<UserResponse> {
    actor.require_permission("users.create")?;
    let mut req: CreateUserRequest = from_payload(payload)?;
    req.username = req.username.trim().to_string();
    if req.username.is_empty() {
        return Err(AuthError::InvalidInput("username is required".into()).into());
    }
    state.config.password.validate(&req.password)?;
    req.tenant_id = target_tenant(actor, req.tenant_id);
    if let Some(role_id) = req.role_id {
        assignable_role(state, actor, role_id, req.tenant_id).await?;
    }

    let hash = hash_password(&req.password)?;
    let user = state.store.create_user(&req, &hash).await?;
    let mut entry = audit_entry(actor, client, "users.create", "user", user.id);
    entry.new_values = Some(json!({
        "username": user.username,
        "tenant_id": user.tenant_id,
        "role_id": user.role_id,
    }));
    state.audit.record(entry).await?;
    tracing::info!(user_id = user.id, actor_id = actor.user_id(), "user created");
    Ok(ApiOk(UserResponse::new(user, actor.ctx.timezone)))
}

pub async fn update_user(
    actor: AuthUser,
    client: ClientInfo,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    ValidJson(payload): ValidJson<Value>,
) -> ApiResult<UserResponse> {
    actor.require_permission("users.update")?;
    let current = visible_user(&state, &actor, id).await?;
    ensure_manageable(&state, &actor, &current).await?;
    state.lock.check(
        lock_input(&state, &headers, &payload, actor.ctx.timezone),
        &current,
        None,
    )?;

    let req: UpdateUserRequest = from_payload(&payload)?;
    if let Some(role_id) = req.role_id {
        assignable_role(&state, &actor, role_id, current.tenant_id).await?;
    }
    let user = state.store.update_user(id, &req).await?;

    let mut entry = audit_entry(&actor, &client, "users.update", "user", id);
    entry.old_values = Some(json!({
        "email": current.email,
        "status": current.status,
        "role_id": current.role_id,
    }));
    entry.new_values = Some(json!({
        "email": user.email,
        "status": user.status,
        "role_id": user.role_id,
    }));
    state.audit.record(entry).await?;
    Ok(ApiOk(UserResponse::new(user, actor.ctx.timezone)))
}

pub async fn delete_user(
    actor: AuthUser,
    client: ClientInfo,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Value> {
    actor.require_permission("users.delete")?;
    if id == actor.user_id() {
        return Err(AuthError::InvalidInput("you cannot delete your own account".into()).into());
    }
    let current = visible_user(&state, &actor, id).await?;
    ensure_manageable(&state, &actor, &current).await?;
    state.store.delete_user(id).await?;
    state
        .audit
        .record(audit_entry(&actor, &client, "users.delete", "user", id))
        .await?;
    tracing::info!(user_id = id, actor_id = actor.user_id(), "user deleted");
    Ok(ApiOk(json!({})))
}

pub async fn restore_user(
    actor: AuthUser,
    client: ClientInfo,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<UserResponse> {
    actor.require_permission("users.restore")?;
    let trashed = state.store.get_user_with_trashed(id).await?;
    if !actor.can_see_tenant(trashed.tenant_id) {
        return Err(AuthError::NotFound("user not found".into()).into());
    }
    if trashed.deleted_at.is_none() {
        return Err(AuthError::InvalidInput("user is not deleted".into()).into());
    }
    ensure_manageable(&state, &actor, &trashed).await?;
    let user = state.store.restore_user(id).await?;
    state
        .audit
        .record(audit_entry(&actor, &client, "users.restore", "user", id))
        .await?;
    Ok(ApiOk(UserResponse::new(user, actor.ctx.timezone)))
}

/// Own password, or another user's with `users.update` and a higher role.
pub async fn update_password(
    actor: AuthUser,
    client: ClientInfo,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    ValidJson(req): ValidJson<UpdatePasswordRequest>,
) -> ApiResult<Value> {
    if id != actor.user_id() {
        actor.require_permission("users.update")?;
        let target = visible_user(&state, &actor, id).await?;
        ensure_manageable(&state, &actor, &target).await?;
    }
    state.config.password.validate(&req.password)?;
    let hash = hash_password(&req.password)?;
    state.store.update_password(id, &hash).await?;
    state
        .audit
        .record(audit_entry(&actor, &client, "users.password", "user", id))
        .await?;
    Ok(ApiOk(json!({})))
}

/// Users outside the caller's tenant scope are reported as missing.
async fn visible_user(state: &AppState, actor: &AuthUser, id: i64) -> Result<User, AuthError> {
    let user = state.store.get_user(id).await?;
    if !actor.can_see_tenant(user.tenant_id) {
        return Err(AuthError::NotFound("user not found".into()));
    }
    Ok(user)
}

async fn role_of(state: &AppState, user: &User) -> Result<Option<Role>, AuthError> {
    let Some(role_id) = user.role_id else {
        return Ok(None);
    };
    match state.store.get_role(role_id).await {
        Ok(role) => Ok(Some(role)),
        Err(AuthError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

async fn ensure_manageable(state: &AppState, actor: &AuthUser, target: &User) -> Result<(), AuthError> {
    let target_role = role_of(state, target).await?;
    ensure_can_manage(
        actor.ctx.role.as_ref(),
        target_role.as_ref(),
        state.super_admin_code(),
    )
}

/// A role may be assigned when it belongs to the user's tenant (or is
/// global) and sits within the actor's reach.
async fn assignable_role(
    state: &AppState,
    actor: &AuthUser,
    role_id: i64,
    tenant_id: Option<i64>,
) -> Result<Role, AuthError> {
    let role = state.store.get_role(role_id).await.map_err(|e| match e {
        AuthError::NotFound(_) => AuthError::InvalidInput("role does not exist".into()),
        other => other,
    })?;
    if role.tenant_id.is_some() && role.tenant_id != tenant_id {
        return Err(AuthError::InvalidInput("role belongs to another tenant".into()));
    }
    ensure_can_manage(actor.ctx.role.as_ref(), Some(&role), state.super_admin_code())?;
    Ok(role)
}
