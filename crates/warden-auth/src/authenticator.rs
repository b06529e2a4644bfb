use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::permissions::PermissionSet;
use crate::store::AuthStore;
use crate::token::hash_token;
use crate::types::{AccessToken, Role, User};

/// Everything later pipeline steps need to know about the caller. Built once
/// per request and never shared across requests.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user: User,
    pub token: AccessToken,
    pub role: Option<Role>,
    pub permissions: PermissionSet,
    pub timezone: Tz,
}

impl AuthContext {
    pub fn authorize(&self, code: &str) -> Result<(), AuthError> {
        self.permissions.authorize(code)
    }

    pub fn authorize_any(&self, codes: &[&str]) -> Result<(), AuthError> {
        self.permissions.authorize_any(codes)
    }

    pub fn role_level(&self) -> u32 {
        self.role.as_ref().map_or(0, |r| r.level)
    }
}

#[derive(Clone)]
pub struct TokenAuthenticator {
    store: Arc<dyn AuthStore>,
    config: Arc<AuthConfig>,
}

impl TokenAuthenticator {
    pub fn new(store: Arc<dyn AuthStore>, config: Arc<AuthConfig>) -> Self {
        Self { store, config }
    }

    /// Validates a raw bearer credential for `ability`.
    ///
    /// Expired tokens are deleted before `TokenExpired` is returned, so the
    /// same credential is rejected as unknown afterwards.
    pub async fn authenticate(
        &self,
        raw_token: Option<&str>,
        ability: &str,
        now: DateTime<Utc>,
    ) -> Result<AuthContext, AuthError> {
        let raw = raw_token.ok_or_else(AuthError::unauthenticated)?;
        let token = self
            .store
            .find_token(&hash_token(raw))
            .await?
            .ok_or_else(AuthError::unauthenticated)?;

        if token.is_expired(now) {
            self.store.delete_token(token.id).await?;
            tracing::info!(token_id = token.id, user_id = token.user_id, "expired token removed");
            return Err(AuthError::TokenExpired);
        }

        if !token.can(ability) {
            return Err(AuthError::unauthenticated());
        }

        let user = match self.store.get_user(token.user_id).await {
            Ok(u) => u,
            Err(AuthError::NotFound(_)) => return Err(AuthError::unauthenticated()),
            Err(e) => return Err(e),
        };
        if !user.status.is_active() {
            return Err(AuthError::Unauthorized("User is inactive".into()));
        }

        if self.should_touch(&token, now) {
            // Bookkeeping only; a failed write must not fail the request.
            if let Err(e) = self.store.touch_token(token.id, now).await {
                tracing::warn!(token_id = token.id, error = %e, "failed to update token last_used_at");
            }
        }

        let (role, permissions) = self.load_permissions(&user).await?;
        let timezone = self.resolve_timezone(user.id).await?;

        Ok(AuthContext {
            user,
            token,
            role,
            permissions,
            timezone,
        })
    }

    fn should_touch(&self, token: &AccessToken, now: DateTime<Utc>) -> bool {
        match token.last_used_at {
            None => true,
            Some(last) => now - last > self.config.tokens.touch_interval(),
        }
    }

    /// Eager load of role and effective permissions.
    pub async fn load_permissions(
        &self,
        user: &User,
    ) -> Result<(Option<Role>, PermissionSet), AuthError> {
        let Some(role_id) = user.role_id else {
            return Ok((None, PermissionSet::default()));
        };
        let role = match self.store.get_role(role_id).await {
            Ok(r) => r,
            Err(AuthError::NotFound(_)) => return Ok((None, PermissionSet::default())),
            Err(e) => return Err(e),
        };
        let perms = self.store.list_role_permissions(role.id).await?;
        let set = PermissionSet::for_role(Some(&role), &perms);
        Ok((Some(role), set))
    }

    async fn resolve_timezone(&self, user_id: i64) -> Result<Tz, AuthError> {
        let preferred = self
            .store
            .get_preference(user_id)
            .await?
            .and_then(|p| p.timezone)
            .and_then(|tz| tz.parse::<Tz>().ok());
        Ok(preferred.unwrap_or_else(|| self.default_timezone()))
    }

    pub fn default_timezone(&self) -> Tz {
        self.config.default_timezone.parse().unwrap_or(Tz::UTC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteAuthStore;
    use crate::token::{ABILITY_ACCESS_API, ABILITY_REFRESH_TOKEN, generate_api_token};
    use crate::types::{CreateUserRequest, NewAccessToken, Status, UpdatePreferenceRequest, UpdateUserRequest};
    use chrono::Duration;

    async fn setup() -> (Arc<SqliteAuthStore>, TokenAuthenticator, User) {
        let store = Arc::new(SqliteAuthStore::open_in_memory().unwrap());
        store.migrate().await.unwrap();
        store.seed_defaults("super_admin").await.unwrap();
        let roles = store.list_roles(None).await.unwrap();
        let sa = roles.iter().find(|r| r.code == "super_admin").unwrap();
        let user = store
            .create_user(
                &CreateUserRequest {
                    username: "admin".into(),
                    password: String::new(),
                    email: None,
                    tenant_id: None,
                    role_id: Some(sa.id),
                    status: None,
                },
                "hash",
            )
            .await
            .unwrap();
        let auth = TokenAuthenticator::new(store.clone(), Arc::new(AuthConfig::default()));
        (store, auth, user)
    }

    async fn issue(
        store: &SqliteAuthStore,
        user_id: i64,
        abilities: &[&str],
        expires_at: Option<DateTime<Utc>>,
    ) -> String {
        let raw = generate_api_token();
        store
            .create_token(&NewAccessToken {
                user_id,
                name: "test".into(),
                token_hash: hash_token(&raw),
                abilities: abilities.iter().map(|a| a.to_string()).collect(),
                expires_at,
                device: None,
                ip_addr: None,
                remember: false,
                session_id: "s1".into(),
            })
            .await
            .unwrap();
        raw
    }

    #[tokio::test]
    async fn missing_and_unknown_tokens_are_unauthorized() {
        let (_, auth, _) = setup().await;
        let now = Utc::now();
        assert!(matches!(
            auth.authenticate(None, ABILITY_ACCESS_API, now).await,
            Err(AuthError::Unauthorized(_))
        ));
        assert!(matches!(
            auth.authenticate(Some("wdn_nope"), ABILITY_ACCESS_API, now).await,
            Err(AuthError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn valid_token_loads_permissions_and_timezone() {
        let (store, auth, user) = setup().await;
        store
            .upsert_preference(
                user.id,
                &UpdatePreferenceRequest {
                    timezone: Some("Asia/Tokyo".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let raw = issue(&store, user.id, &[ABILITY_ACCESS_API], None).await;
        let ctx = auth
            .authenticate(Some(&raw), ABILITY_ACCESS_API, Utc::now())
            .await
            .unwrap();
        assert_eq!(ctx.user.id, user.id);
        assert!(ctx.permissions.contains("users.view"));
        assert_eq!(ctx.timezone, chrono_tz::Asia::Tokyo);
        assert_eq!(ctx.role_level(), 100);
    }

    #[tokio::test]
    async fn expired_token_is_deleted_and_stays_rejected() {
        let (store, auth, user) = setup().await;
        let now = Utc::now();
        let raw = issue(&store, user.id, &["*"], Some(now - Duration::seconds(5))).await;

        let first = auth.authenticate(Some(&raw), ABILITY_ACCESS_API, now).await;
        assert!(matches!(first, Err(AuthError::TokenExpired)));
        assert!(store.find_token(&hash_token(&raw)).await.unwrap().is_none());

        let second = auth.authenticate(Some(&raw), ABILITY_ACCESS_API, now).await;
        assert!(matches!(second, Err(AuthError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn refresh_token_cannot_access_api() {
        let (store, auth, user) = setup().await;
        let raw = issue(&store, user.id, &[ABILITY_REFRESH_TOKEN], None).await;
        let res = auth.authenticate(Some(&raw), ABILITY_ACCESS_API, Utc::now()).await;
        assert!(matches!(res, Err(AuthError::Unauthorized(_))));
        assert!(
            auth.authenticate(Some(&raw), ABILITY_REFRESH_TOKEN, Utc::now())
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn inactive_user_is_rejected() {
        let (store, auth, user) = setup().await;
        store
            .update_user(
                user.id,
                &UpdateUserRequest {
                    status: Some(Status::Inactive),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let raw = issue(&store, user.id, &[ABILITY_ACCESS_API], None).await;
        match auth.authenticate(Some(&raw), ABILITY_ACCESS_API, Utc::now()).await {
            Err(AuthError::Unauthorized(msg)) => assert_eq!(msg, "User is inactive"),
            other => panic!("expected inactive rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn last_used_is_touched_at_most_once_per_interval() {
        let (store, auth, user) = setup().await;
        let raw = issue(&store, user.id, &[ABILITY_ACCESS_API], None).await;
        let t0 = Utc::now();

        auth.authenticate(Some(&raw), ABILITY_ACCESS_API, t0).await.unwrap();
        let first = store.find_token(&hash_token(&raw)).await.unwrap().unwrap();
        assert_eq!(first.last_used_at.map(|t| t.timestamp()), Some(t0.timestamp()));

        let t1 = t0 + Duration::seconds(30);
        auth.authenticate(Some(&raw), ABILITY_ACCESS_API, t1).await.unwrap();
        let unchanged = store.find_token(&hash_token(&raw)).await.unwrap().unwrap();
        assert_eq!(unchanged.last_used_at.map(|t| t.timestamp()), Some(t0.timestamp()));

        let t2 = t0 + Duration::seconds(61);
        auth.authenticate(Some(&raw), ABILITY_ACCESS_API, t2).await.unwrap();
        let touched = store.find_token(&hash_token(&raw)).await.unwrap().unwrap();
        assert_eq!(touched.last_used_at.map(|t| t.timestamp()), Some(t2.timestamp()));
    }
}
