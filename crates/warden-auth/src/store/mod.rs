pub mod seed;
pub mod sqlite;

pub use sqlite::SqliteAuthStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::AuthError;
use crate::types::*;

/// Persistence boundary for everything the authorization layer reads or
/// writes. Soft-deleted rows are invisible unless a method says otherwise.
#[async_trait]
pub trait AuthStore: Send + Sync {
    // Tenants
    async fn create_tenant(&self, req: &CreateTenantRequest) -> Result<Tenant, AuthError>;
    async fn get_tenant(&self, id: i64) -> Result<Tenant, AuthError>;
    /// Active, non-deleted tenant by id.
    async fn find_active_tenant(&self, id: i64) -> Result<Option<Tenant>, AuthError>;
    async fn list_active_tenants(&self) -> Result<Vec<Tenant>, AuthError>;
    async fn list_tenants(&self) -> Result<Vec<Tenant>, AuthError>;
    async fn update_tenant(&self, id: i64, req: &UpdateTenantRequest) -> Result<Tenant, AuthError>;
    /// Refused while any user or role still references the tenant.
    async fn delete_tenant(&self, id: i64) -> Result<(), AuthError>;

    // Roles
    async fn create_role(&self, req: &CreateRoleRequest) -> Result<Role, AuthError>;
    async fn get_role(&self, id: i64) -> Result<Role, AuthError>;
    /// `None` lists every role; `Some(t)` lists global roles plus tenant `t`'s.
    async fn list_roles(&self, tenant_id: Option<i64>) -> Result<Vec<Role>, AuthError>;
    async fn update_role(&self, id: i64, req: &UpdateRoleRequest) -> Result<Role, AuthError>;
    async fn delete_role(&self, id: i64) -> Result<(), AuthError>;
    async fn set_role_permissions(
        &self,
        role_id: i64,
        permission_ids: &[i64],
    ) -> Result<(), AuthError>;
    async fn list_role_permissions(&self, role_id: i64) -> Result<Vec<Permission>, AuthError>;

    // Permissions
    async fn create_permission(
        &self,
        code: &str,
        name: &str,
        group_code: &str,
    ) -> Result<Permission, AuthError>;
    async fn list_permissions(&self) -> Result<Vec<Permission>, AuthError>;

    // Users
    async fn create_user(
        &self,
        req: &CreateUserRequest,
        password_hash: &str,
    ) -> Result<User, AuthError>;
    async fn get_user(&self, id: i64) -> Result<User, AuthError>;
    /// Also returns soft-deleted users; for restore flows only.
    async fn get_user_with_trashed(&self, id: i64) -> Result<User, AuthError>;
    async fn get_user_by_username(&self, username: &str) -> Result<User, AuthError>;
    async fn list_users(&self, tenant_id: Option<i64>) -> Result<Vec<User>, AuthError>;
    async fn update_user(&self, id: i64, req: &UpdateUserRequest) -> Result<User, AuthError>;
    async fn update_password(&self, id: i64, password_hash: &str) -> Result<(), AuthError>;
    /// Soft-deletes the user and revokes all of their tokens.
    async fn delete_user(&self, id: i64) -> Result<(), AuthError>;
    async fn restore_user(&self, id: i64) -> Result<User, AuthError>;
    async fn get_password_hash(&self, user_id: i64) -> Result<String, AuthError>;
    async fn user_count(&self) -> Result<u64, AuthError>;

    // Preferences
    async fn get_preference(&self, user_id: i64) -> Result<Option<Preference>, AuthError>;
    async fn upsert_preference(
        &self,
        user_id: i64,
        req: &UpdatePreferenceRequest,
    ) -> Result<Preference, AuthError>;

    // Tokens
    async fn create_token(&self, token: &NewAccessToken) -> Result<AccessToken, AuthError>;
    async fn find_token(&self, token_hash: &str) -> Result<Option<AccessToken>, AuthError>;
    async fn list_tokens(&self, user_id: i64) -> Result<Vec<AccessToken>, AuthError>;
    async fn delete_token(&self, id: i64) -> Result<(), AuthError>;
    async fn delete_session_tokens(&self, user_id: i64, session_id: &str)
    -> Result<u64, AuthError>;
    async fn touch_token(&self, id: i64, at: DateTime<Utc>) -> Result<(), AuthError>;

    // Idempotency keys
    async fn find_idempotency(
        &self,
        scope: &IdempotencyScope,
    ) -> Result<Option<IdempotencyRecord>, AuthError>;
    /// Inserts a `processing` record. Returns `None` when a concurrent
    /// request won the unique constraint.
    async fn insert_idempotency(
        &self,
        scope: &IdempotencyScope,
        request_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>, AuthError>;
    /// Back to `processing` with payload, response status and expiry cleared.
    async fn reset_idempotency(&self, id: i64, now: DateTime<Utc>) -> Result<(), AuthError>;
    async fn complete_idempotency(
        &self,
        id: i64,
        payload: &str,
        response_status: u16,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), AuthError>;
    async fn fail_idempotency(&self, id: i64, now: DateTime<Utc>) -> Result<(), AuthError>;
    async fn delete_idempotency(&self, id: i64) -> Result<(), AuthError>;
    async fn purge_expired_idempotency(&self, now: DateTime<Utc>) -> Result<u64, AuthError>;

    // Cache versions
    async fn cache_version(&self, namespace: &str) -> Result<i64, AuthError>;
    async fn bump_cache_version(&self, namespace: &str) -> Result<i64, AuthError>;

    // Audit
    async fn insert_audit(&self, entry: &NewAuditEntry) -> Result<(), AuthError>;
    async fn list_audit(
        &self,
        filter: &AuditFilter,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<AuditEntry>, AuthError>;
    async fn record_failed_job(
        &self,
        queue: &str,
        payload: &str,
        error: &str,
        attempts: u32,
    ) -> Result<(), AuthError>;
    async fn list_failed_jobs(&self, limit: u32) -> Result<Vec<FailedJob>, AuthError>;

    // Lifecycle
    async fn migrate(&self) -> Result<(), AuthError>;
    /// Seeds the permission catalog and the global super-admin role.
    async fn seed_defaults(&self, super_admin_code: &str) -> Result<(), AuthError>;
}
