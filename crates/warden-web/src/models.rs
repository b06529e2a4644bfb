use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use warden_auth::lock::format_version_time;
use warden_auth::{
    AuditEntry, FailedJob, Permission, Preference, Role, Status, Tenant, TenantContext, User,
};

fn fmt(at: DateTime<Utc>, tz: Tz) -> String {
    format_version_time(at, tz)
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub remember: bool,
    pub device: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
    pub refresh_expires_in: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserResponse {
    pub id: i64,
    pub username: String,
    pub email: Option<String>,
    pub status: Status,
    pub tenant_id: Option<i64>,
    pub role_id: Option<i64>,
    /// Echo back as `version` on update.
    pub version: i64,
    pub created_at: String,
    pub updated_at: String,
    pub deleted_at: Option<String>,
}

impl UserResponse {
    pub fn new(user: User, tz: Tz) -> Self {
        Self {
            id: user.id,
            username: user.username,
            email: user.email,
            status: user.status,
            tenant_id: user.tenant_id,
            role_id: user.role_id,
            version: user.updated_at.timestamp(),
            created_at: fmt(user.created_at, tz),
            updated_at: fmt(user.updated_at, tz),
            deleted_at: user.deleted_at.map(|t| fmt(t, tz)),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionResponse {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub group: String,
    pub status: Status,
}

impl From<Permission> for PermissionResponse {
    fn from(p: Permission) -> Self {
        Self {
            id: p.id,
            code: p.code,
            name: p.name,
            group: p.group_code,
            status: p.status,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleResponse {
    pub id: i64,
    pub tenant_id: Option<i64>,
    pub code: String,
    pub name: String,
    pub level: u32,
    pub status: Status,
    pub version: i64,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Vec<PermissionResponse>>,
}

impl RoleResponse {
    pub fn new(role: Role, tz: Tz) -> Self {
        Self {
            id: role.id,
            tenant_id: role.tenant_id,
            code: role.code,
            name: role.name,
            level: role.level,
            status: role.status,
            version: role.updated_at.timestamp(),
            created_at: fmt(role.created_at, tz),
            updated_at: fmt(role.updated_at, tz),
            permissions: None,
        }
    }

    pub fn with_permissions(mut self, perms: Vec<Permission>) -> Self {
        self.permissions = Some(perms.into_iter().map(PermissionResponse::from).collect());
        self
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantResponse {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub status: Status,
    pub version: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl TenantResponse {
    pub fn new(t: Tenant, tz: Tz) -> Self {
        Self {
            id: t.id,
            code: t.code,
            name: t.name,
            status: t.status,
            version: t.updated_at.timestamp(),
            created_at: fmt(t.created_at, tz),
            updated_at: fmt(t.updated_at, tz),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreferenceResponse {
    pub locale: Option<String>,
    pub timezone: Option<String>,
    pub theme: Option<String>,
}

impl From<Preference> for PreferenceResponse {
    fn from(p: Preference) -> Self {
        Self {
            locale: p.locale,
            timezone: p.timezone,
            theme: p.theme,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeResponse {
    pub user: UserResponse,
    pub role: Option<RoleResponse>,
    pub permissions: Vec<String>,
    pub timezone: String,
    pub tenant: TenantContext,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogResponse {
    pub id: i64,
    pub action: String,
    pub actor_id: Option<i64>,
    pub tenant_id: Option<i64>,
    pub subject_type: Option<String>,
    pub subject_id: Option<String>,
    pub old_values: Option<serde_json::Value>,
    pub new_values: Option<serde_json::Value>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub request_id: Option<String>,
    pub created_at: String,
}

impl AuditLogResponse {
    pub fn new(e: AuditEntry, tz: Tz) -> Self {
        Self {
            id: e.id,
            action: e.action,
            actor_id: e.actor_id,
            tenant_id: e.tenant_id,
            subject_type: e.subject_type,
            subject_id: e.subject_id,
            old_values: e.old_values,
            new_values: e.new_values,
            ip: e.ip_addr,
            user_agent: e.user_agent,
            request_id: e.request_id,
            created_at: fmt(e.created_at, tz),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedJobResponse {
    pub id: i64,
    pub queue: String,
    pub payload: serde_json::Value,
    pub error: String,
    pub attempts: u32,
    pub failed_at: String,
}

impl FailedJobResponse {
    pub fn new(job: FailedJob, tz: Tz) -> Self {
        let payload = serde_json::from_str(&job.payload)
            .unwrap_or(serde_json::Value::String(job.payload));
        Self {
            id: job.id,
            queue: job.queue,
            payload,
            error: job.error,
            attempts: job.attempts,
            failed_at: fmt(job.failed_at, tz),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse<T: Serialize> {
    pub items: Vec<T>,
    pub page: u32,
    pub per_page: u32,
}
