use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::Utc;

use warden_auth::tenant::parse_tenant_header;
use warden_auth::token::ABILITY_ACCESS_API;
use warden_auth::{AuthContext, AuthError, RoleScope, bearer_token};

use crate::envelope::ApiError;
use crate::request_context::RequestContext;
use crate::state::AppState;

pub const TENANT_HEADER: &str = "x-tenant-id";

/// Authenticated principal plus its resolved tenant scope.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub ctx: AuthContext,
    pub scope: RoleScope,
}

impl AuthUser {
    pub fn user_id(&self) -> i64 {
        self.ctx.user.id
    }

    pub fn require_permission(&self, code: &str) -> Result<(), AuthError> {
        self.ctx.authorize(code)
    }

    pub fn require_any_permission(&self, codes: &[&str]) -> Result<(), AuthError> {
        self.ctx.authorize_any(codes)
    }

    pub fn require_super(&self) -> Result<(), AuthError> {
        if self.scope.is_super {
            Ok(())
        } else {
            Err(AuthError::Forbidden("platform administrator required".into()))
        }
    }

    /// Whether a row owned by `tenant_id` is visible in the current scope.
    /// A platform admin with no tenant selected sees everything.
    pub fn can_see_tenant(&self, tenant_id: Option<i64>) -> bool {
        match self.scope.tenant_id {
            None => self.scope.is_super,
            Some(current) => tenant_id == Some(current),
        }
    }
}

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthUser>()
            .cloned()
            .ok_or_else(|| ApiError(AuthError::unauthenticated()))
    }
}

/// Caller metadata used by audit rows, throttling and guest idempotency keys.
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub ip: String,
    pub user_agent: String,
    pub request_id: Option<String>,
}

impl ClientInfo {
    pub fn from_parts(headers: &HeaderMap, extensions: &axum::http::Extensions) -> Self {
        let ip = extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let user_agent = headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let request_id = extensions
            .get::<RequestContext>()
            .map(|c| c.request_id.clone());
        Self {
            ip,
            user_agent,
            request_id,
        }
    }
}

impl<S> FromRequestParts<S> for ClientInfo
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(ClientInfo::from_parts(&parts.headers, &parts.extensions))
    }
}

pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Authenticates the bearer token and resolves the tenant scope before any
/// protected handler runs.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    match authenticate(&state, request.headers()).await {
        Ok(user) => {
            tracing::Span::current().record("user_id", user.user_id());
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        Err(e) => ApiError(e).into_response(),
    }
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<AuthUser, AuthError> {
    let raw = bearer_token(header_str(headers, header::AUTHORIZATION.as_str()));
    let ctx = state
        .authenticator
        .authenticate(raw, ABILITY_ACCESS_API, Utc::now())
        .await?;
    let selected = parse_tenant_header(header_str(headers, TENANT_HEADER));
    let scope = state
        .tenants
        .resolve_role_scope(&ctx.user, ctx.role.as_ref(), selected)
        .await?;
    tracing::debug!(user_id = ctx.user.id, tenant_id = ?scope.tenant_id, is_super = scope.is_super, "authenticated");
    Ok(AuthUser { ctx, scope })
}
