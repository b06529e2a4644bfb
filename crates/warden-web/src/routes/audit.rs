use std::sync::Arc;

use axum::extract::{Query, State};
use serde::Deserialize;

use warden_auth::AuditFilter;

use super::target_tenant;
use crate::auth::AuthUser;
use crate::envelope::{ApiOk, ApiResult};
use crate::models::{AuditLogResponse, FailedJobResponse, ListResponse};
use crate::state::AppState;

const MAX_PER_PAGE: u32 = 100;

#[derive(Debug, Default, Deserialize)]
pub struct AuditQuery {
    pub tenant_id: Option<i64>,
    pub actor_id: Option<i64>,
    pub action: Option<String>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

/// Audit trail, newest first. Tenant-scoped callers only see their tenant.
pub async fn list_audit_logs(
    actor: AuthUser,
    State(state): State<Arc<AppState>>,
    Query(query): Query<AuditQuery>,
) -> ApiResult<ListResponse<AuditLogResponse>> {
    actor.require_permission("audit.view")?;
    let page = query.page.unwrap_or(1).max(1);
    let per_page = query.per_page.unwrap_or(20).clamp(1, MAX_PER_PAGE);
    let filter = AuditFilter {
        tenant_id: target_tenant(&actor, query.tenant_id),
        actor_id: query.actor_id,
        action: query.action,
    };
    let rows = state
        .store
        .list_audit(&filter, per_page, (page - 1).saturating_mul(per_page))
        .await?;
    let tz = actor.ctx.timezone;
    Ok(ApiOk(ListResponse {
        items: rows.into_iter().map(|e| AuditLogResponse::new(e, tz)).collect(),
        page,
        per_page,
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct FailedJobQuery {
    pub limit: Option<u32>,
}

pub async fn list_failed_jobs(
    actor: AuthUser,
    State(state): State<Arc<AppState>>,
    Query(query): Query<FailedJobQuery>,
) -> ApiResult<Vec<FailedJobResponse>> {
    actor.require_super()?;
    actor.require_permission("audit.failed_jobs")?;
    let limit = query.limit.unwrap_or(50).clamp(1, MAX_PER_PAGE);
    let jobs = state.store.list_failed_jobs(limit).await?;
    let tz = actor.ctx.timezone;
    Ok(ApiOk(jobs.into_iter().map(|j| FailedJobResponse::new(j, tz)).collect()))
}
