use std::sync::Arc;

use axum::extract::State;
use chrono_tz::Tz;

use warden_auth::{AuthError, UpdatePreferenceRequest};

use crate::auth::AuthUser;
use crate::envelope::{ApiOk, ApiResult, ValidJson};
use crate::models::PreferenceResponse;
use crate::state::AppState;

pub async fn get_preferences(
    user: AuthUser,
    State(state): State<Arc<AppState>>,
) -> ApiResult<PreferenceResponse> {
    let pref = state
        .store
        .get_preference(user.user_id())
        .await?
        .unwrap_or_default();
    Ok(ApiOk(pref.into()))
}

pub async fn update_preferences(
    user: AuthUser,
    State(state): State<Arc<AppState>>,
    ValidJson(req): ValidJson<UpdatePreferenceRequest>,
) -> ApiResult<PreferenceResponse> {
    if let Some(tz) = req.timezone.as_deref() {
        if tz.parse::<Tz>().is_err() {
            return Err(AuthError::InvalidInput(format!("unknown timezone '{tz}'")).into());
        }
    }
    let pref = state.store.upsert_preference(user.user_id(), &req).await?;
    Ok(ApiOk(pref.into()))
}
