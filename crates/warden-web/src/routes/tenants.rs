use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use serde_json::{Value, json};

use warden_auth::cache::NS_TENANTS;
use warden_auth::{AuthError, CreateTenantRequest, TenantOption, UpdateTenantRequest};

use super::{audit_entry, lock_input};
use crate::auth::{AuthUser, ClientInfo};
use crate::envelope::{ApiOk, ApiResult, ValidJson, from_payload};
use crate::models::TenantResponse;
use crate::state::AppState;

pub async fn list_tenants(
    actor: AuthUser,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Vec<TenantResponse>> {
    actor.require_permission("tenants.view")?;
    let tenants = if actor.scope.is_super {
        state.store.list_tenants().await?
    } else {
        match actor.scope.tenant_id {
            Some(id) => vec![state.store.get_tenant(id).await?],
            None => Vec::new(),
        }
    };
    let tz = actor.ctx.timezone;
    Ok(ApiOk(tenants.into_iter().map(|t| TenantResponse::new(t, tz)).collect()))
}

/// Tenant switcher entries. Platform administrators get every active tenant.
pub async fn tenant_options(
    actor: AuthUser,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Vec<TenantOption>> {
    if !actor.scope.is_super {
        let own = match actor.scope.tenant_id {
            Some(id) => state.store.find_active_tenant(id).await?,
            None => None,
        };
        return Ok(ApiOk(own.iter().map(TenantOption::from).collect()));
    }
    Ok(ApiOk(state.tenants.active_options().await?))
}

pub async fn create_tenant(
    actor: AuthUser,
    client: ClientInfo,
    State(state): State<Arc<AppState>>,
    ValidJson(mut req): ValidJson<CreateTenantRequest>,
) -> ApiResult<TenantResponse> {
    actor.require_super()?;
    actor.require_permission("tenants.create")?;
    req.code = req.code.trim().to_string();
    if req.code.is_empty() || req.name.trim().is_empty() {
        return Err(AuthError::InvalidInput("code and name are required".into()).into());
    }
    let tenant = state.store.create_tenant(&req).await?;
    state.cache.invalidate(NS_TENANTS).await?;
    let mut entry = audit_entry(&actor, &client, "tenants.create", "tenant", tenant.id);
    entry.new_values = Some(json!({"code": tenant.code, "name": tenant.name}));
    state.audit.record(entry).await?;
    Ok(ApiOk(TenantResponse::new(tenant, actor.ctx.timezone)))
}

/// Tenant administrators may rename their own tenant; status changes are
/// reserved for platform administrators.
pub async fn update_tenant(
    actor: AuthUser,
    client: ClientInfo,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    ValidJson(payload): ValidJson<Value>,
) -> ApiResult<TenantResponse> {
    actor.require_permission("tenants.update")?;
    if !actor.scope.is_super && actor.scope.tenant_id != Some(id) {
        return Err(AuthError::NotFound("tenant not found".into()).into());
    }
    let current = state.store.get_tenant(id).await?;
    state.lock.check(
        lock_input(&state, &headers, &payload, actor.ctx.timezone),
        &current,
        None,
    )?;

    let req: UpdateTenantRequest = from_payload(&payload)?;
    if req.status.is_some() && !actor.scope.is_super {
        return Err(AuthError::Forbidden("only platform administrators can change tenant status".into()).into());
    }
    let tenant = state.store.update_tenant(id, &req).await?;
    state.cache.invalidate(NS_TENANTS).await?;

    let mut entry = audit_entry(&actor, &client, "tenants.update", "tenant", id);
    entry.old_values = Some(json!({"name": current.name, "status": current.status}));
    entry.new_values = Some(json!({"name": tenant.name, "status": tenant.status}));
    state.audit.record(entry).await?;
    Ok(ApiOk(TenantResponse::new(tenant, actor.ctx.timezone)))
}

pub async fn delete_tenant(
    actor: AuthUser,
    client: ClientInfo,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Value> {
    actor.require_super()?;
    actor.require_permission("tenants.delete")?;
    state.store.delete_tenant(id).await?;
    state.cache.invalidate(NS_TENANTS).await?;
    state
        .audit
        .record(audit_entry(&actor, &client, "tenants.delete", "tenant", id))
        .await?;
    tracing::info!(tenant_id = id, actor_id = actor.user_id(), "tenant deleted");
    Ok(ApiOk(json!({})))
}
