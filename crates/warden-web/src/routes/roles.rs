use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use serde::Deserialize;
use serde_json::{Value, json};

use warden_auth::cache::NS_ROLES;
use warden_auth::{
    AuthError, CreateRoleRequest, Role, RolePermissionsRequest, UpdateRoleRequest, can_manage,
    ensure_can_manage,
};

use super::{audit_entry, lock_input, target_tenant};
use crate::auth::{AuthUser, ClientInfo};
use crate::envelope::{ApiOk, ApiResult, ValidJson, from_payload};
use crate::models::{PermissionResponse, RoleResponse};
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct RoleListQuery {
    pub tenant_id: Option<i64>,
}

pub async fn list_roles(
    actor: AuthUser,
    State(state): State<Arc<AppState>>,
    Query(query): Query<RoleListQuery>,
) -> ApiResult<Vec<RoleResponse>> {
    actor.require_permission("roles.view")?;
    let tenant = target_tenant(&actor, query.tenant_id);
    let key = match tenant {
        Some(id) => format!("list:{id}"),
        None => "list:all".to_string(),
    };
    let store = &state.store;
    let roles: Vec<Role> = state
        .cache
        .get_or_load(NS_ROLES, &key, || store.list_roles(tenant))
        .await?;
    let tz = actor.ctx.timezone;
    Ok(ApiOk(roles.into_iter().map(|r| RoleResponse::new(r, tz)).collect()))
}

pub async fn get_role(
    actor: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<RoleResponse> {
    actor.require_permission("roles.view")?;
    let role = visible_role(&state, &actor, id).await?;
    let perms = state.store.list_role_permissions(role.id).await?;
    Ok(ApiOk(RoleResponse::new(role, actor.ctx.timezone).with_permissions(perms)))
}

pub async fn create_role(
    actor: AuthUser,
    client: ClientInfo,
    State(state): State<Arc<AppState>>,
    ValidJson(mut req): ValidJson<CreateRoleRequest>,
) -> ApiResult<RoleResponse> {
    actor.require_permission("roles.create")?;
    req.code = req.code.trim().to_string();
    if req.code.is_empty() || req.name.trim().is_empty() {
        return Err(AuthError::InvalidInput("code and name are required".into()).into());
    }
    req.tenant_id = if actor.scope.is_super {
        req.tenant_id
    } else {
        actor.scope.tenant_id
    };
    if req.tenant_id.is_some() && req.code == state.super_admin_code() {
        return Err(AuthError::InvalidInput(format!(
            "role code '{}' is reserved for the platform role",
            req.code
        ))
        .into());
    }
    let actor_level = actor.ctx.role_level();
    if !can_manage(actor_level, req.level, &req.code, state.super_admin_code()) {
        return Err(AuthError::Forbidden("role level must be below your own".into()).into());
    }

    let role = state.store.create_role(&req).await?;
    state.cache.invalidate(NS_ROLES).await?;
    let mut entry = audit_entry(&actor, &client, "roles.create", "role", role.id);
    entry.new_values = Some(json!({"code": role.code, "level": role.level, "tenant_id": role.tenant_id}));
    state.audit.record(entry).await?;
    Ok(ApiOk(RoleResponse::new(role, actor.ctx.timezone)))
}

pub async fn update_role(
    actor: AuthUser,
    client: ClientInfo,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    ValidJson(payload): ValidJson<Value>,
) -> ApiResult<RoleResponse> {
    actor.require_permission("roles.update")?;
    let current = writable_role(&state, &actor, id).await?;
    state.lock.check(
        lock_input(&state, &headers, &payload, actor.ctx.timezone),
        &current,
        None,
    )?;

    let req: UpdateRoleRequest = from_payload(&payload)?;
    if let Some(level) = req.level {
        if !can_manage(actor.ctx.role_level(), level, &current.code, state.super_admin_code()) {
            return Err(AuthError::Forbidden("role level must be below your own".into()).into());
        }
    }
    let role = state.store.update_role(id, &req).await?;
    state.cache.invalidate(NS_ROLES).await?;

    let mut entry = audit_entry(&actor, &client, "roles.update", "role", id);
    entry.old_values = Some(json!({"name": current.name, "level": current.level, "status": current.status}));
    entry.new_values = Some(json!({"name": role.name, "level": role.level, "status": role.status}));
    state.audit.record(entry).await?;
    Ok(ApiOk(RoleResponse::new(role, actor.ctx.timezone)))
}

pub async fn delete_role(
    actor: AuthUser,
    client: ClientInfo,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Value> {
    actor.require_permission("roles.delete")?;
    let role = writable_role(&state, &actor, id).await?;
    if role.code == state.super_admin_code() {
        return Err(AuthError::InvalidInput("the platform administrator role cannot be deleted".into()).into());
    }
    state.store.delete_role(id).await?;
    state.cache.invalidate(NS_ROLES).await?;
    state
        .audit
        .record(audit_entry(&actor, &client, "roles.delete", "role", id))
        .await?;
    Ok(ApiOk(json!({})))
}

pub async fn get_role_permissions(
    actor: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Vec<PermissionResponse>> {
    actor.require_permission("roles.view")?;
    let role = visible_role(&state, &actor, id).await?;
    let perms = state.store.list_role_permissions(role.id).await?;
    Ok(ApiOk(perms.into_iter().map(PermissionResponse::from).collect()))
}

/// Replaces a role's grants. Callers below platform level can only hand out
/// permissions they hold themselves.
pub async fn set_role_permissions(
    actor: AuthUser,
    client: ClientInfo,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    ValidJson(req): ValidJson<RolePermissionsRequest>,
) -> ApiResult<Vec<PermissionResponse>> {
    actor.require_permission("roles.update")?;
    let role = writable_role(&state, &actor, id).await?;

    let catalog = state.store.list_permissions().await?;
    let mut granted = Vec::with_capacity(req.permission_ids.len());
    for pid in &req.permission_ids {
        let perm = catalog
            .iter()
            .find(|p| p.id == *pid)
            .ok_or_else(|| AuthError::InvalidInput(format!("unknown permission id {pid}")))?;
        if !actor.scope.is_super && !actor.ctx.permissions.contains(&perm.code) {
            return Err(AuthError::Forbidden(format!("cannot grant '{}'", perm.code)).into());
        }
        granted.push(perm.code.clone());
    }

    let before: Vec<String> = state
        .store
        .list_role_permissions(role.id)
        .await?
        .into_iter()
        .map(|p| p.code)
        .collect();
    state.store.set_role_permissions(role.id, &req.permission_ids).await?;
    state.cache.invalidate(NS_ROLES).await?;

    let mut entry = audit_entry(&actor, &client, "roles.permissions", "role", role.id);
    entry.old_values = Some(json!({ "permissions": before }));
    entry.new_values = Some(json!({ "permissions": granted }));
    state.audit.dispatch(entry).await?;

    let perms = state.store.list_role_permissions(role.id).await?;
    Ok(ApiOk(perms.into_iter().map(PermissionResponse::from).collect()))
}

/// Global roles are visible to everyone; tenant roles only inside their
/// tenant's scope.
async fn visible_role(state: &AppState, actor: &AuthUser, id: i64) -> Result<Role, AuthError> {
    let role = state.store.get_role(id).await?;
    if role.tenant_id.is_some() && !actor.can_see_tenant(role.tenant_id) {
        return Err(AuthError::NotFound("role not found".into()));
    }
    Ok(role)
}

/// Visible, within the actor's reach, and global roles only for platform
/// administrators.
async fn writable_role(state: &AppState, actor: &AuthUser, id: i64) -> Result<Role, AuthError> {
    let role = visible_role(state, actor, id).await?;
    if role.tenant_id.is_none() && !actor.scope.is_super {
        return Err(AuthError::Forbidden("global roles are managed by platform administrators".into()));
    }
    ensure_can_manage(actor.ctx.role.as_ref(), Some(&role), state.super_admin_code())?;
    Ok(role)
}
