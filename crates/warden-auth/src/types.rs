use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AuthError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Active,
    Inactive,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Active => "active",
            Status::Inactive => "inactive",
        }
    }

    pub fn is_active(self) -> bool {
        self == Status::Active
    }
}

impl std::str::FromStr for Status {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Status::Active),
            "inactive" => Ok(Status::Inactive),
            other => Err(AuthError::InvalidInput(format!("unknown status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub id: i64,
    /// `None` for platform-global roles.
    pub tenant_id: Option<i64>,
    /// `tenant_id` or `0` for global roles.
    pub tenant_scope_id: i64,
    pub code: String,
    pub name: String,
    pub level: u32,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Role {
    /// Platform scope needs the reserved code on a global role. A tenant
    /// role that happens to carry the code stays tenant-scoped.
    pub fn is_platform_admin(&self, super_admin_code: &str) -> bool {
        self.tenant_id.is_none() && self.code == super_admin_code
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Permission {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub group_code: String,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: Option<String>,
    pub status: Status,
    pub tenant_id: Option<i64>,
    pub role_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Preference {
    pub user_id: i64,
    pub locale: Option<String>,
    pub timezone: Option<String>,
    pub theme: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessToken {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub abilities: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub device: Option<String>,
    pub ip_addr: Option<String>,
    pub remember: bool,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn can(&self, ability: &str) -> bool {
        self.abilities.iter().any(|a| a == "*" || a == ability)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp < now)
    }
}

#[derive(Debug, Clone)]
pub struct NewAccessToken {
    pub user_id: i64,
    pub name: String,
    pub token_hash: String,
    pub abilities: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub device: Option<String>,
    pub ip_addr: Option<String>,
    pub remember: bool,
    pub session_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdempotencyStatus {
    Processing,
    Completed,
    Failed,
}

impl IdempotencyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            IdempotencyStatus::Processing => "processing",
            IdempotencyStatus::Completed => "completed",
            IdempotencyStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for IdempotencyStatus {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(IdempotencyStatus::Processing),
            "completed" => Ok(IdempotencyStatus::Completed),
            "failed" => Ok(IdempotencyStatus::Failed),
            other => Err(AuthError::Internal(format!(
                "unknown idempotency status '{other}'"
            ))),
        }
    }
}

/// The composite identity an idempotency record is unique on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyScope {
    pub actor_key: String,
    pub method: String,
    pub route: String,
    pub key: String,
}

#[derive(Debug, Clone)]
pub struct IdempotencyRecord {
    pub id: i64,
    pub scope: IdempotencyScope,
    pub request_hash: String,
    pub status: IdempotencyStatus,
    pub response_payload: Option<String>,
    pub response_status: Option<u16>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An audit row before it is persisted. Also the payload of queued audit jobs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewAuditEntry {
    pub action: String,
    pub actor_id: Option<i64>,
    pub tenant_id: Option<i64>,
    pub subject_type: Option<String>,
    pub subject_id: Option<String>,
    pub old_values: Option<serde_json::Value>,
    pub new_values: Option<serde_json::Value>,
    pub ip_addr: Option<String>,
    pub user_agent: Option<String>,
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub action: String,
    pub actor_id: Option<i64>,
    pub tenant_id: Option<i64>,
    pub subject_type: Option<String>,
    pub subject_id: Option<String>,
    pub old_values: Option<serde_json::Value>,
    pub new_values: Option<serde_json::Value>,
    pub ip_addr: Option<String>,
    pub user_agent: Option<String>,
    pub request_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditFilter {
    pub tenant_id: Option<i64>,
    pub actor_id: Option<i64>,
    pub action: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedJob {
    pub id: i64,
    pub queue: String,
    pub payload: String,
    pub error: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CreateTenantRequest {
    pub code: String,
    pub name: String,
    pub status: Option<Status>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateTenantRequest {
    pub name: Option<String>,
    pub status: Option<Status>,
}

#[derive(Debug, Deserialize)]
pub struct CreateRoleRequest {
    pub code: String,
    pub name: String,
    pub level: u32,
    pub tenant_id: Option<i64>,
    pub status: Option<Status>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateRoleRequest {
    pub name: Option<String>,
    pub level: Option<u32>,
    pub status: Option<Status>,
}

#[derive(Debug, Deserialize)]
pub struct RolePermissionsRequest {
    pub permission_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub password: String,
    pub email: Option<String>,
    pub tenant_id: Option<i64>,
    pub role_id: Option<i64>,
    pub status: Option<Status>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateUserRequest {
    pub email: Option<String>,
    pub status: Option<Status>,
    pub role_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct UpdatePasswordRequest {
    pub password: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdatePreferenceRequest {
    pub locale: Option<String>,
    pub timezone: Option<String>,
    pub theme: Option<String>,
}

pub(crate) fn from_unix(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}
