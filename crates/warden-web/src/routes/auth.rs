use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, header};
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use warden_auth::tenant::parse_tenant_header;
use warden_auth::token::{ABILITY_ACCESS_API, ABILITY_REFRESH_TOKEN, ABILITY_REMEMBER_ME};
use warden_auth::{
    AuthError, NewAccessToken, NewAuditEntry, User, bearer_token, generate_api_token,
    hash_token, verify_password,
};

use crate::auth::{AuthUser, ClientInfo, TENANT_HEADER, header_str};
use crate::envelope::{ApiOk, ApiResult, ValidJson};
use crate::models::{LoginRequest, LoginResponse, MeResponse, RoleResponse, UserResponse};
use crate::state::AppState;

const INVALID_CREDENTIALS: &str = "Invalid username or password";

pub async fn login(
    State(state): State<Arc<AppState>>,
    client: ClientInfo,
    ValidJson(req): ValidJson<LoginRequest>,
) -> ApiResult<LoginResponse> {
    if req.username.trim().is_empty() || req.password.is_empty() {
        return Err(AuthError::InvalidInput("username and password are required".into()).into());
    }

    let now = Utc::now();
    let throttle_key = warden_auth::LoginThrottle::key(&req.username, &client.ip);
    state.throttle.check(&throttle_key, now)?;

    let user = match state.store.get_user_by_username(req.username.trim()).await {
        Ok(u) => Some(u),
        Err(AuthError::NotFound(_)) => None,
        Err(e) => return Err(e.into()),
    };
    let verified = match &user {
        Some(u) => verify_password(&req.password, &state.store.get_password_hash(u.id).await?)?,
        None => false,
    };
    let user = match user {
        Some(u) if verified => u,
        _ => {
            let attempts = state.throttle.hit(&throttle_key, now)?;
            tracing::info!(username = %req.username, ip = %client.ip, attempts, "login failed");
            return Err(AuthError::LoginFailed(INVALID_CREDENTIALS.into()).into());
        }
    };
    if !user.status.is_active() {
        return Err(AuthError::LoginFailed("Account is disabled".into()).into());
    }
    state.throttle.clear(&throttle_key)?;

    let response = issue_pair(&state, &user, req.remember, req.device, &client).await?;
    state
        .audit
        .dispatch(NewAuditEntry {
            action: "auth.login".into(),
            actor_id: Some(user.id),
            tenant_id: user.tenant_id,
            subject_type: Some("user".into()),
            subject_id: Some(user.id.to_string()),
            ip_addr: Some(client.ip.clone()),
            user_agent: Some(client.user_agent.clone()),
            request_id: client.request_id.clone(),
            ..Default::default()
        })
        .await?;
    tracing::info!(user_id = user.id, "login succeeded");
    Ok(ApiOk(response))
}

/// Rotates the token pair. The presented refresh token is consumed.
pub async fn refresh(
    State(state): State<Arc<AppState>>,
    client: ClientInfo,
    headers: HeaderMap,
) -> ApiResult<LoginResponse> {
    let raw = bearer_token(header_str(&headers, header::AUTHORIZATION.as_str()));
    let ctx = state
        .authenticator
        .authenticate(raw, ABILITY_REFRESH_TOKEN, Utc::now())
        .await?;
    state.store.delete_token(ctx.token.id).await?;

    let remember = ctx.token.remember;
    let response = issue_pair(&state, &ctx.user, remember, ctx.token.device.clone(), &client).await?;
    state
        .audit
        .dispatch(NewAuditEntry {
            action: "auth.refresh".into(),
            actor_id: Some(ctx.user.id),
            tenant_id: ctx.user.tenant_id,
            subject_type: Some("user".into()),
            subject_id: Some(ctx.user.id.to_string()),
            ip_addr: Some(client.ip.clone()),
            user_agent: Some(client.user_agent.clone()),
            request_id: client.request_id.clone(),
            ..Default::default()
        })
        .await?;
    Ok(ApiOk(response))
}

pub async fn logout(
    user: AuthUser,
    State(state): State<Arc<AppState>>,
    client: ClientInfo,
) -> ApiResult<serde_json::Value> {
    let removed = state
        .store
        .delete_session_tokens(user.user_id(), &user.ctx.token.session_id)
        .await?;
    state
        .audit
        .dispatch(NewAuditEntry {
            action: "auth.logout".into(),
            actor_id: Some(user.user_id()),
            tenant_id: user.scope.tenant_id,
            subject_type: Some("user".into()),
            subject_id: Some(user.user_id().to_string()),
            ip_addr: Some(client.ip),
            user_agent: Some(client.user_agent),
            request_id: client.request_id,
            ..Default::default()
        })
        .await?;
    tracing::info!(user_id = user.user_id(), removed, "logged out");
    Ok(ApiOk(json!({})))
}

pub async fn me(
    user: AuthUser,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<MeResponse> {
    let selected = parse_tenant_header(header_str(&headers, TENANT_HEADER));
    let tenant = state
        .tenants
        .resolve(&user.ctx.user, user.ctx.role.as_ref(), selected)
        .await?;
    let tz = user.ctx.timezone;
    let mut permissions: Vec<String> = user.ctx.permissions.codes().map(str::to_string).collect();
    permissions.sort();
    Ok(ApiOk(MeResponse {
        user: UserResponse::new(user.ctx.user.clone(), tz),
        role: user.ctx.role.clone().map(|r| RoleResponse::new(r, tz)),
        permissions,
        timezone: tz.name().to_string(),
        tenant,
    }))
}

/// Access token plus refresh token sharing a fresh session id.
async fn issue_pair(
    state: &AppState,
    user: &User,
    remember: bool,
    device: Option<String>,
    client: &ClientInfo,
) -> Result<LoginResponse, AuthError> {
    let now = Utc::now();
    let tokens = &state.config.tokens;
    let session_id = Uuid::now_v7().to_string();
    let access_ttl = tokens.access_ttl();
    let refresh_ttl = tokens.refresh_ttl(remember);

    let access = generate_api_token();
    state
        .store
        .create_token(&NewAccessToken {
            user_id: user.id,
            name: "access".into(),
            token_hash: hash_token(&access),
            abilities: vec![ABILITY_ACCESS_API.to_string()],
            expires_at: Some(now + access_ttl),
            device: device.clone(),
            ip_addr: Some(client.ip.clone()),
            remember,
            session_id: session_id.clone(),
        })
        .await?;

    let mut abilities = vec![ABILITY_REFRESH_TOKEN.to_string()];
    if remember {
        abilities.push(ABILITY_REMEMBER_ME.to_string());
    }
    let refresh = generate_api_token();
    state
        .store
        .create_token(&NewAccessToken {
            user_id: user.id,
            name: "refresh".into(),
            token_hash: hash_token(&refresh),
            abilities,
            expires_at: Some(now + refresh_ttl),
            device,
            ip_addr: Some(client.ip.clone()),
            remember,
            session_id,
        })
        .await?;

    Ok(LoginResponse {
        token: access,
        refresh_token: refresh,
        token_type: "Bearer",
        expires_in: access_ttl.num_seconds(),
        refresh_expires_in: refresh_ttl.num_seconds(),
    })
}
