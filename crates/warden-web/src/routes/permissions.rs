use std::sync::Arc;

use axum::extract::State;

use warden_auth::Permission;
use warden_auth::cache::NS_PERMISSIONS;

use crate::auth::AuthUser;
use crate::envelope::{ApiOk, ApiResult};
use crate::models::PermissionResponse;
use crate::state::AppState;

pub async fn list_permissions(
    actor: AuthUser,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Vec<PermissionResponse>> {
    actor.require_any_permission(&["permissions.view", "roles.view"])?;
    let store = &state.store;
    let perms: Vec<Permission> = state
        .cache
        .get_or_load(NS_PERMISSIONS, "catalog", || store.list_permissions())
        .await?;
    Ok(ApiOk(perms.into_iter().map(PermissionResponse::from).collect()))
}
