use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::AuthStore;
use crate::error::AuthError;
use crate::types::*;

pub struct SqliteAuthStore {
    conn: Mutex<Connection>,
}

impl SqliteAuthStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    pub fn open(path: &Path) -> Result<Self, AuthError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;")?;
        Ok(Self::new(conn))
    }

    pub fn open_in_memory() -> Result<Self, AuthError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self::new(conn))
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, AuthError> {
        self.conn
            .lock()
            .map_err(|_| AuthError::Internal("auth store connection poisoned".into()))
    }
}

const MIGRATE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS tenants (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    code TEXT UNIQUE NOT NULL,
    name TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    deleted_at INTEGER
);

CREATE TABLE IF NOT EXISTS roles (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tenant_id INTEGER REFERENCES tenants(id),
    tenant_scope_id INTEGER NOT NULL DEFAULT 0,
    code TEXT NOT NULL,
    name TEXT NOT NULL,
    level INTEGER NOT NULL DEFAULT 0 CHECK (level >= 0),
    status TEXT NOT NULL DEFAULT 'active',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    deleted_at INTEGER,
    CHECK ((tenant_id IS NULL AND tenant_scope_id = 0)
        OR (tenant_id IS NOT NULL AND tenant_scope_id = tenant_id)),
    UNIQUE (tenant_scope_id, code)
);

CREATE TABLE IF NOT EXISTS permissions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    code TEXT UNIQUE NOT NULL,
    name TEXT NOT NULL,
    group_code TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT 'active',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    deleted_at INTEGER
);

CREATE TABLE IF NOT EXISTS role_permissions (
    role_id INTEGER NOT NULL REFERENCES roles(id) ON DELETE CASCADE,
    permission_id INTEGER NOT NULL REFERENCES permissions(id) ON DELETE CASCADE,
    PRIMARY KEY (role_id, permission_id)
);

CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT UNIQUE NOT NULL,
    email TEXT,
    password_hash TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    tenant_id INTEGER REFERENCES tenants(id),
    role_id INTEGER REFERENCES roles(id),
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    deleted_at INTEGER
);

CREATE TABLE IF NOT EXISTS user_preferences (
    user_id INTEGER PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
    locale TEXT,
    timezone TEXT,
    theme TEXT,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS access_tokens (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    token_hash TEXT UNIQUE NOT NULL,
    abilities TEXT NOT NULL DEFAULT '["*"]',
    expires_at INTEGER,
    last_used_at INTEGER,
    device TEXT,
    ip_addr TEXT,
    remember INTEGER NOT NULL DEFAULT 0,
    session_id TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_access_tokens_session ON access_tokens(user_id, session_id);

CREATE TABLE IF NOT EXISTS idempotency_keys (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    actor_key TEXT NOT NULL,
    method TEXT NOT NULL,
    route TEXT NOT NULL,
    idempotency_key TEXT NOT NULL,
    request_hash TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'processing',
    response_payload TEXT,
    response_status INTEGER,
    expires_at INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE (actor_key, method, route, idempotency_key)
);
CREATE INDEX IF NOT EXISTS idx_idempotency_expires ON idempotency_keys(expires_at);

CREATE TABLE IF NOT EXISTS cache_versions (
    namespace TEXT PRIMARY KEY,
    version INTEGER NOT NULL DEFAULT 1,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    action TEXT NOT NULL,
    actor_id INTEGER,
    tenant_id INTEGER,
    subject_type TEXT,
    subject_id TEXT,
    old_values TEXT,
    new_values TEXT,
    ip_addr TEXT,
    user_agent TEXT,
    request_id TEXT,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_logs_tenant ON audit_logs(tenant_id, created_at);

CREATE TABLE IF NOT EXISTS failed_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    queue TEXT NOT NULL,
    payload TEXT NOT NULL,
    error TEXT NOT NULL,
    attempts INTEGER NOT NULL,
    failed_at INTEGER NOT NULL
);
"#;

const TENANT_COLS: &str = "id, code, name, status, created_at, updated_at, deleted_at";
const ROLE_COLS: &str =
    "id, tenant_id, tenant_scope_id, code, name, level, status, created_at, updated_at, deleted_at";
const USER_COLS: &str =
    "id, username, email, status, tenant_id, role_id, created_at, updated_at, deleted_at";
const TOKEN_COLS: &str = "id, user_id, name, abilities, expires_at, last_used_at, device, ip_addr, remember, session_id, created_at";
const IDEMPOTENCY_COLS: &str = "id, actor_key, method, route, idempotency_key, request_hash, status, response_payload, response_status, expires_at, created_at, updated_at";
const AUDIT_COLS: &str = "id, action, actor_id, tenant_id, subject_type, subject_id, old_values, new_values, ip_addr, user_agent, request_id, created_at";

fn now_ts() -> i64 {
    Utc::now().timestamp()
}

fn ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    Ok(from_unix(row.get(idx)?))
}

fn opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    Ok(row.get::<_, Option<i64>>(idx)?.map(from_unix))
}

fn parsed<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = AuthError>,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn json_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<serde_json::Value>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_tenant(row: &Row<'_>) -> rusqlite::Result<Tenant> {
    Ok(Tenant {
        id: row.get(0)?,
        code: row.get(1)?,
        name: row.get(2)?,
        status: parsed(row, 3)?,
        created_at: ts(row, 4)?,
        updated_at: ts(row, 5)?,
        deleted_at: opt_ts(row, 6)?,
    })
}

fn row_to_role(row: &Row<'_>) -> rusqlite::Result<Role> {
    Ok(Role {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        tenant_scope_id: row.get(2)?,
        code: row.get(3)?,
        name: row.get(4)?,
        level: row.get(5)?,
        status: parsed(row, 6)?,
        created_at: ts(row, 7)?,
        updated_at: ts(row, 8)?,
        deleted_at: opt_ts(row, 9)?,
    })
}

fn row_to_permission(row: &Row<'_>) -> rusqlite::Result<Permission> {
    Ok(Permission {
        id: row.get(0)?,
        code: row.get(1)?,
        name: row.get(2)?,
        group_code: row.get(3)?,
        status: parsed(row, 4)?,
        created_at: ts(row, 5)?,
        updated_at: ts(row, 6)?,
    })
}

fn row_to_user(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        status: parsed(row, 3)?,
        tenant_id: row.get(4)?,
        role_id: row.get(5)?,
        created_at: ts(row, 6)?,
        updated_at: ts(row, 7)?,
        deleted_at: opt_ts(row, 8)?,
    })
}

fn row_to_token(row: &Row<'_>) -> rusqlite::Result<AccessToken> {
    let abilities: String = row.get(3)?;
    let abilities: Vec<String> = serde_json::from_str(&abilities)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;
    Ok(AccessToken {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        abilities,
        expires_at: opt_ts(row, 4)?,
        last_used_at: opt_ts(row, 5)?,
        device: row.get(6)?,
        ip_addr: row.get(7)?,
        remember: row.get::<_, i32>(8)? != 0,
        session_id: row.get(9)?,
        created_at: ts(row, 10)?,
    })
}

fn row_to_idempotency(row: &Row<'_>) -> rusqlite::Result<IdempotencyRecord> {
    Ok(IdempotencyRecord {
        id: row.get(0)?,
        scope: IdempotencyScope {
            actor_key: row.get(1)?,
            method: row.get(2)?,
            route: row.get(3)?,
            key: row.get(4)?,
        },
        request_hash: row.get(5)?,
        status: parsed(row, 6)?,
        response_payload: row.get(7)?,
        response_status: row.get(8)?,
        expires_at: opt_ts(row, 9)?,
        created_at: ts(row, 10)?,
        updated_at: ts(row, 11)?,
    })
}

fn row_to_audit(row: &Row<'_>) -> rusqlite::Result<AuditEntry> {
    Ok(AuditEntry {
        id: row.get(0)?,
        action: row.get(1)?,
        actor_id: row.get(2)?,
        tenant_id: row.get(3)?,
        subject_type: row.get(4)?,
        subject_id: row.get(5)?,
        old_values: json_col(row, 6)?,
        new_values: json_col(row, 7)?,
        ip_addr: row.get(8)?,
        user_agent: row.get(9)?,
        request_id: row.get(10)?,
        created_at: ts(row, 11)?,
    })
}

fn not_found(what: &'static str) -> impl Fn(rusqlite::Error) -> AuthError {
    move |e| match e {
        rusqlite::Error::QueryReturnedNoRows => AuthError::NotFound(format!("{what} not found")),
        _ => AuthError::Database(e.to_string()),
    }
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    // 2067 = SQLITE_CONSTRAINT_UNIQUE, 1555 = SQLITE_CONSTRAINT_PRIMARYKEY
    matches!(e, rusqlite::Error::SqliteFailure(err, _)
        if err.extended_code == 2067 || err.extended_code == 1555)
}

fn fetch_tenant(conn: &Connection, id: i64) -> Result<Tenant, AuthError> {
    conn.query_row(
        &format!("SELECT {TENANT_COLS} FROM tenants WHERE id = ?1 AND deleted_at IS NULL"),
        [id],
        row_to_tenant,
    )
    .map_err(not_found("tenant"))
}

fn fetch_role(conn: &Connection, id: i64) -> Result<Role, AuthError> {
    conn.query_row(
        &format!("SELECT {ROLE_COLS} FROM roles WHERE id = ?1 AND deleted_at IS NULL"),
        [id],
        row_to_role,
    )
    .map_err(not_found("role"))
}

fn fetch_user(conn: &Connection, id: i64, with_trashed: bool) -> Result<User, AuthError> {
    let sql = if with_trashed {
        format!("SELECT {USER_COLS} FROM users WHERE id = ?1")
    } else {
        format!("SELECT {USER_COLS} FROM users WHERE id = ?1 AND deleted_at IS NULL")
    };
    conn.query_row(&sql, [id], row_to_user)
        .map_err(not_found("user"))
}

fn fetch_token(conn: &Connection, id: i64) -> Result<AccessToken, AuthError> {
    conn.query_row(
        &format!("SELECT {TOKEN_COLS} FROM access_tokens WHERE id = ?1"),
        [id],
        row_to_token,
    )
    .map_err(not_found("token"))
}

fn fetch_preference(conn: &Connection, user_id: i64) -> Result<Option<Preference>, AuthError> {
    let pref = conn
        .query_row(
            "SELECT user_id, locale, timezone, theme FROM user_preferences WHERE user_id = ?1",
            [user_id],
            |row| {
                Ok(Preference {
                    user_id: row.get(0)?,
                    locale: row.get(1)?,
                    timezone: row.get(2)?,
                    theme: row.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(pref)
}

#[async_trait]
impl AuthStore for SqliteAuthStore {
    async fn migrate(&self) -> Result<(), AuthError> {
        let conn = self.conn()?;
        conn.execute_batch(MIGRATE_SQL)?;
        Ok(())
    }

    async fn seed_defaults(&self, super_admin_code: &str) -> Result<(), AuthError> {
        super::seed::seed_defaults(self, super_admin_code).await
    }

    // --- Tenants ---

    async fn create_tenant(&self, req: &CreateTenantRequest) -> Result<Tenant, AuthError> {
        let conn = self.conn()?;
        let now = now_ts();
        let status = req.status.unwrap_or(Status::Active);
        conn.execute(
            "INSERT INTO tenants (code, name, status, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?4)",
            params![req.code, req.name, status.as_str(), now],
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                return AuthError::Duplicate(format!("tenant '{}' already exists", req.code));
            }
            AuthError::Database(e.to_string())
        })?;
        fetch_tenant(&conn, conn.last_insert_rowid())
    }

    async fn get_tenant(&self, id: i64) -> Result<Tenant, AuthError> {
        let conn = self.conn()?;
        fetch_tenant(&conn, id)
    }

    async fn find_active_tenant(&self, id: i64) -> Result<Option<Tenant>, AuthError> {
        let conn = self.conn()?;
        let tenant = conn
            .query_row(
                &format!(
                    "SELECT {TENANT_COLS} FROM tenants
                     WHERE id = ?1 AND status = 'active' AND deleted_at IS NULL"
                ),
                [id],
                row_to_tenant,
            )
            .optional()?;
        Ok(tenant)
    }

    async fn list_active_tenants(&self) -> Result<Vec<Tenant>, AuthError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TENANT_COLS} FROM tenants
             WHERE status = 'active' AND deleted_at IS NULL ORDER BY id"
        ))?;
        let tenants = stmt
            .query_map([], row_to_tenant)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tenants)
    }

    async fn list_tenants(&self) -> Result<Vec<Tenant>, AuthError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TENANT_COLS} FROM tenants WHERE deleted_at IS NULL ORDER BY id"
        ))?;
        let tenants = stmt
            .query_map([], row_to_tenant)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tenants)
    }

    async fn update_tenant(&self, id: i64, req: &UpdateTenantRequest) -> Result<Tenant, AuthError> {
        let conn = self.conn()?;
        fetch_tenant(&conn, id)?;
        let now = now_ts();
        if let Some(ref name) = req.name {
            conn.execute(
                "UPDATE tenants SET name = ?1, updated_at = ?2 WHERE id = ?3",
                params![name, now, id],
            )?;
        }
        if let Some(status) = req.status {
            conn.execute(
                "UPDATE tenants SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), now, id],
            )?;
        }
        fetch_tenant(&conn, id)
    }

    async fn delete_tenant(&self, id: i64) -> Result<(), AuthError> {
        let conn = self.conn()?;
        fetch_tenant(&conn, id)?;
        let users: i64 = conn.query_row(
            "SELECT COUNT(*) FROM users WHERE tenant_id = ?1 AND deleted_at IS NULL",
            [id],
            |row| row.get(0),
        )?;
        let roles: i64 = conn.query_row(
            "SELECT COUNT(*) FROM roles WHERE tenant_id = ?1 AND deleted_at IS NULL",
            [id],
            |row| row.get(0),
        )?;
        if users > 0 || roles > 0 {
            return Err(AuthError::InvalidInput(format!(
                "tenant is still referenced by {users} user(s) and {roles} role(s)"
            )));
        }
        let now = now_ts();
        conn.execute(
            "UPDATE tenants SET deleted_at = ?1, updated_at = ?1 WHERE id = ?2",
            params![now, id],
        )?;
        Ok(())
    }

    // --- Roles ---

    async fn create_role(&self, req: &CreateRoleRequest) -> Result<Role, AuthError> {
        let conn = self.conn()?;
        let now = now_ts();
        let status = req.status.unwrap_or(Status::Active);
        let tenant_scope_id = req.tenant_id.unwrap_or(0);
        conn.execute(
            "INSERT INTO roles (tenant_id, tenant_scope_id, code, name, level, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                req.tenant_id,
                tenant_scope_id,
                req.code,
                req.name,
                req.level,
                status.as_str(),
                now
            ],
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                return AuthError::Duplicate(format!(
                    "role '{}' already exists in this scope",
                    req.code
                ));
            }
            AuthError::Database(e.to_string())
        })?;
        fetch_role(&conn, conn.last_insert_rowid())
    }

    async fn get_role(&self, id: i64) -> Result<Role, AuthError> {
        let conn = self.conn()?;
        fetch_role(&conn, id)
    }

    async fn list_roles(&self, tenant_id: Option<i64>) -> Result<Vec<Role>, AuthError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ROLE_COLS} FROM roles
             WHERE deleted_at IS NULL AND (?1 IS NULL OR tenant_id IS NULL OR tenant_id = ?1)
             ORDER BY level DESC, id"
        ))?;
        let roles = stmt
            .query_map([tenant_id], row_to_role)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(roles)
    }

    async fn update_role(&self, id: i64, req: &UpdateRoleRequest) -> Result<Role, AuthError> {
        let conn = self.conn()?;
        fetch_role(&conn, id)?;
        let now = now_ts();
        if let Some(ref name) = req.name {
            conn.execute(
                "UPDATE roles SET name = ?1, updated_at = ?2 WHERE id = ?3",
                params![name, now, id],
            )?;
        }
        if let Some(level) = req.level {
            conn.execute(
                "UPDATE roles SET level = ?1, updated_at = ?2 WHERE id = ?3",
                params![level, now, id],
            )?;
        }
        if let Some(status) = req.status {
            conn.execute(
                "UPDATE roles SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), now, id],
            )?;
        }
        fetch_role(&conn, id)
    }

    async fn delete_role(&self, id: i64) -> Result<(), AuthError> {
        let conn = self.conn()?;
        let now = now_ts();
        let changed = conn.execute(
            "UPDATE roles SET deleted_at = ?1, updated_at = ?1 WHERE id = ?2 AND deleted_at IS NULL",
            params![now, id],
        )?;
        if changed == 0 {
            return Err(AuthError::NotFound("role not found".into()));
        }
        Ok(())
    }

    async fn set_role_permissions(
        &self,
        role_id: i64,
        permission_ids: &[i64],
    ) -> Result<(), AuthError> {
        let conn = self.conn()?;
        fetch_role(&conn, role_id)?;
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM role_permissions WHERE role_id = ?1", [role_id])?;
        for pid in permission_ids {
            tx.execute(
                "INSERT OR IGNORE INTO role_permissions (role_id, permission_id) VALUES (?1, ?2)",
                params![role_id, pid],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(ref err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    AuthError::InvalidInput(format!("permission {pid} does not exist"))
                }
                _ => AuthError::Database(e.to_string()),
            })?;
        }
        tx.execute(
            "UPDATE roles SET updated_at = ?1 WHERE id = ?2",
            params![now_ts(), role_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn list_role_permissions(&self, role_id: i64) -> Result<Vec<Permission>, AuthError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT p.id, p.code, p.name, p.group_code, p.status, p.created_at, p.updated_at
             FROM permissions p
             JOIN role_permissions rp ON rp.permission_id = p.id
             WHERE rp.role_id = ?1 AND p.deleted_at IS NULL
             ORDER BY p.code",
        )?;
        let perms = stmt
            .query_map([role_id], row_to_permission)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(perms)
    }

    // --- Permissions ---

    async fn create_permission(
        &self,
        code: &str,
        name: &str,
        group_code: &str,
    ) -> Result<Permission, AuthError> {
        let conn = self.conn()?;
        let now = now_ts();
        conn.execute(
            "INSERT OR IGNORE INTO permissions (code, name, group_code, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![code, name, group_code, now],
        )?;
        // Return existing or new
        conn.query_row(
            "SELECT id, code, name, group_code, status, created_at, updated_at
             FROM permissions WHERE code = ?1",
            [code],
            row_to_permission,
        )
        .map_err(|e| AuthError::Database(e.to_string()))
    }

    async fn list_permissions(&self) -> Result<Vec<Permission>, AuthError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, code, name, group_code, status, created_at, updated_at
             FROM permissions WHERE deleted_at IS NULL ORDER BY group_code, code",
        )?;
        let perms = stmt
            .query_map([], row_to_permission)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(perms)
    }

    // --- Users ---

    async fn create_user(
        &self,
        req: &CreateUserRequest,
        password_hash: &str,
    ) -> Result<User, AuthError> {
        let conn = self.conn()?;
        let now = now_ts();
        let status = req.status.unwrap_or(Status::Active);
        conn.execute(
            "INSERT INTO users (username, email, password_hash, status, tenant_id, role_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                req.username,
                req.email,
                password_hash,
                status.as_str(),
                req.tenant_id,
                req.role_id,
                now
            ],
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                return AuthError::Duplicate(format!("user '{}' already exists", req.username));
            }
            AuthError::Database(e.to_string())
        })?;
        fetch_user(&conn, conn.last_insert_rowid(), false)
    }

    async fn get_user(&self, id: i64) -> Result<User, AuthError> {
        let conn = self.conn()?;
        fetch_user(&conn, id, false)
    }

    async fn get_user_with_trashed(&self, id: i64) -> Result<User, AuthError> {
        let conn = self.conn()?;
        fetch_user(&conn, id, true)
    }

    async fn get_user_by_username(&self, username: &str) -> Result<User, AuthError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {USER_COLS} FROM users WHERE username = ?1 AND deleted_at IS NULL"),
            [username],
            row_to_user,
        )
        .map_err(not_found("user"))
    }

    async fn list_users(&self, tenant_id: Option<i64>) -> Result<Vec<User>, AuthError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {USER_COLS} FROM users
             WHERE deleted_at IS NULL AND (?1 IS NULL OR tenant_id = ?1)
             ORDER BY id"
        ))?;
        let users = stmt
            .query_map([tenant_id], row_to_user)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(users)
    }

    async fn update_user(&self, id: i64, req: &UpdateUserRequest) -> Result<User, AuthError> {
        let conn = self.conn()?;
        fetch_user(&conn, id, false)?;
        let now = now_ts();
        if let Some(ref email) = req.email {
            conn.execute(
                "UPDATE users SET email = ?1, updated_at = ?2 WHERE id = ?3",
                params![email, now, id],
            )?;
        }
        if let Some(status) = req.status {
            conn.execute(
                "UPDATE users SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), now, id],
            )?;
        }
        if let Some(role_id) = req.role_id {
            conn.execute(
                "UPDATE users SET role_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![role_id, now, id],
            )?;
        }
        fetch_user(&conn, id, false)
    }

    async fn update_password(&self, id: i64, password_hash: &str) -> Result<(), AuthError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE users SET password_hash = ?1, updated_at = ?2 WHERE id = ?3 AND deleted_at IS NULL",
            params![password_hash, now_ts(), id],
        )?;
        if changed == 0 {
            return Err(AuthError::NotFound("user not found".into()));
        }
        Ok(())
    }

    async fn delete_user(&self, id: i64) -> Result<(), AuthError> {
        let conn = self.conn()?;
        let now = now_ts();
        let changed = conn.execute(
            "UPDATE users SET deleted_at = ?1, updated_at = ?1 WHERE id = ?2 AND deleted_at IS NULL",
            params![now, id],
        )?;
        if changed == 0 {
            return Err(AuthError::NotFound("user not found".into()));
        }
        conn.execute("DELETE FROM access_tokens WHERE user_id = ?1", [id])?;
        Ok(())
    }

    async fn restore_user(&self, id: i64) -> Result<User, AuthError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE users SET deleted_at = NULL, updated_at = ?1 WHERE id = ?2 AND deleted_at IS NOT NULL",
            params![now_ts(), id],
        )?;
        if changed == 0 {
            return Err(AuthError::NotFound("deleted user not found".into()));
        }
        fetch_user(&conn, id, false)
    }

    async fn get_password_hash(&self, user_id: i64) -> Result<String, AuthError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT password_hash FROM users WHERE id = ?1 AND deleted_at IS NULL",
            [user_id],
            |row| row.get(0),
        )
        .map_err(not_found("user"))
    }

    async fn user_count(&self) -> Result<u64, AuthError> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM users WHERE deleted_at IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    // --- Preferences ---

    async fn get_preference(&self, user_id: i64) -> Result<Option<Preference>, AuthError> {
        let conn = self.conn()?;
        fetch_preference(&conn, user_id)
    }

    async fn upsert_preference(
        &self,
        user_id: i64,
        req: &UpdatePreferenceRequest,
    ) -> Result<Preference, AuthError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO user_preferences (user_id, locale, timezone, theme, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user_id) DO UPDATE SET
                locale = COALESCE(excluded.locale, user_preferences.locale),
                timezone = COALESCE(excluded.timezone, user_preferences.timezone),
                theme = COALESCE(excluded.theme, user_preferences.theme),
                updated_at = excluded.updated_at",
            params![user_id, req.locale, req.timezone, req.theme, now_ts()],
        )?;
        fetch_preference(&conn, user_id)?
            .ok_or_else(|| AuthError::Internal("preference vanished after upsert".into()))
    }

    // --- Tokens ---

    async fn create_token(&self, token: &NewAccessToken) -> Result<AccessToken, AuthError> {
        let conn = self.conn()?;
        let abilities = serde_json::to_string(&token.abilities)?;
        conn.execute(
            "INSERT INTO access_tokens
                (user_id, name, token_hash, abilities, expires_at, device, ip_addr, remember, session_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                token.user_id,
                token.name,
                token.token_hash,
                abilities,
                token.expires_at.map(|t| t.timestamp()),
                token.device,
                token.ip_addr,
                token.remember as i32,
                token.session_id,
                now_ts()
            ],
        )?;
        fetch_token(&conn, conn.last_insert_rowid())
    }

    async fn find_token(&self, token_hash: &str) -> Result<Option<AccessToken>, AuthError> {
        let conn = self.conn()?;
        let token = conn
            .query_row(
                &format!("SELECT {TOKEN_COLS} FROM access_tokens WHERE token_hash = ?1"),
                [token_hash],
                row_to_token,
            )
            .optional()?;
        Ok(token)
    }

    async fn list_tokens(&self, user_id: i64) -> Result<Vec<AccessToken>, AuthError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TOKEN_COLS} FROM access_tokens WHERE user_id = ?1 ORDER BY created_at DESC, id DESC"
        ))?;
        let tokens = stmt
            .query_map([user_id], row_to_token)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tokens)
    }

    async fn delete_token(&self, id: i64) -> Result<(), AuthError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM access_tokens WHERE id = ?1", [id])?;
        Ok(())
    }

    async fn delete_session_tokens(
        &self,
        user_id: i64,
        session_id: &str,
    ) -> Result<u64, AuthError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "DELETE FROM access_tokens WHERE user_id = ?1 AND session_id = ?2",
            params![user_id, session_id],
        )?;
        Ok(changed as u64)
    }

    async fn touch_token(&self, id: i64, at: DateTime<Utc>) -> Result<(), AuthError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE access_tokens SET last_used_at = ?1 WHERE id = ?2",
            params![at.timestamp(), id],
        )?;
        Ok(())
    }

    // --- Idempotency keys ---

    async fn find_idempotency(
        &self,
        scope: &IdempotencyScope,
    ) -> Result<Option<IdempotencyRecord>, AuthError> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!(
                    "SELECT {IDEMPOTENCY_COLS} FROM idempotency_keys
                     WHERE actor_key = ?1 AND method = ?2 AND route = ?3 AND idempotency_key = ?4"
                ),
                params![scope.actor_key, scope.method, scope.route, scope.key],
                row_to_idempotency,
            )
            .optional()?;
        Ok(record)
    }

    async fn insert_idempotency(
        &self,
        scope: &IdempotencyScope,
        request_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>, AuthError> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT INTO idempotency_keys
                (actor_key, method, route, idempotency_key, request_hash, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'processing', ?6, ?6)",
            params![
                scope.actor_key,
                scope.method,
                scope.route,
                scope.key,
                request_hash,
                now.timestamp()
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let record = conn.query_row(
            &format!("SELECT {IDEMPOTENCY_COLS} FROM idempotency_keys WHERE id = ?1"),
            [conn.last_insert_rowid()],
            row_to_idempotency,
        )?;
        Ok(Some(record))
    }

    async fn reset_idempotency(&self, id: i64, now: DateTime<Utc>) -> Result<(), AuthError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE idempotency_keys
             SET status = 'processing', response_payload = NULL, response_status = NULL,
                 expires_at = NULL, updated_at = ?1
             WHERE id = ?2",
            params![now.timestamp(), id],
        )?;
        Ok(())
    }

    async fn complete_idempotency(
        &self,
        id: i64,
        payload: &str,
        response_status: u16,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), AuthError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE idempotency_keys
             SET status = 'completed', response_payload = ?1, response_status = ?2,
                 expires_at = ?3, updated_at = ?4
             WHERE id = ?5",
            params![
                payload,
                response_status,
                expires_at.timestamp(),
                now.timestamp(),
                id
            ],
        )?;
        Ok(())
    }

    async fn fail_idempotency(&self, id: i64, now: DateTime<Utc>) -> Result<(), AuthError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE idempotency_keys
             SET status = 'failed', response_payload = NULL, response_status = NULL, updated_at = ?1
             WHERE id = ?2",
            params![now.timestamp(), id],
        )?;
        Ok(())
    }

    async fn delete_idempotency(&self, id: i64) -> Result<(), AuthError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM idempotency_keys WHERE id = ?1", [id])?;
        Ok(())
    }

    async fn purge_expired_idempotency(&self, now: DateTime<Utc>) -> Result<u64, AuthError> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM idempotency_keys WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            [now.timestamp()],
        )?;
        Ok(removed as u64)
    }

    // --- Cache versions ---

    async fn cache_version(&self, namespace: &str) -> Result<i64, AuthError> {
        let conn = self.conn()?;
        let version: Option<i64> = conn
            .query_row(
                "SELECT version FROM cache_versions WHERE namespace = ?1",
                [namespace],
                |row| row.get(0),
            )
            .optional()?;
        Ok(version.unwrap_or(1))
    }

    async fn bump_cache_version(&self, namespace: &str) -> Result<i64, AuthError> {
        let conn = self.conn()?;
        let version = conn.query_row(
            "INSERT INTO cache_versions (namespace, version, updated_at) VALUES (?1, 2, ?2)
             ON CONFLICT(namespace) DO UPDATE SET
                version = cache_versions.version + 1,
                updated_at = excluded.updated_at
             RETURNING version",
            params![namespace, now_ts()],
            |row| row.get(0),
        )?;
        Ok(version)
    }

    // --- Audit ---

    async fn insert_audit(&self, entry: &NewAuditEntry) -> Result<(), AuthError> {
        let old_values = entry.old_values.as_ref().map(serde_json::to_string).transpose()?;
        let new_values = entry.new_values.as_ref().map(serde_json::to_string).transpose()?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO audit_logs
                (action, actor_id, tenant_id, subject_type, subject_id, old_values, new_values,
                 ip_addr, user_agent, request_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                entry.action,
                entry.actor_id,
                entry.tenant_id,
                entry.subject_type,
                entry.subject_id,
                old_values,
                new_values,
                entry.ip_addr,
                entry.user_agent,
                entry.request_id,
                now_ts()
            ],
        )?;
        Ok(())
    }

    async fn list_audit(
        &self,
        filter: &AuditFilter,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<AuditEntry>, AuthError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {AUDIT_COLS} FROM audit_logs
             WHERE (?1 IS NULL OR tenant_id = ?1)
               AND (?2 IS NULL OR actor_id = ?2)
               AND (?3 IS NULL OR action = ?3)
             ORDER BY id DESC LIMIT ?4 OFFSET ?5"
        ))?;
        let entries = stmt
            .query_map(
                params![filter.tenant_id, filter.actor_id, filter.action, limit, offset],
                row_to_audit,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    async fn record_failed_job(
        &self,
        queue: &str,
        payload: &str,
        error: &str,
        attempts: u32,
    ) -> Result<(), AuthError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO failed_jobs (queue, payload, error, attempts, failed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![queue, payload, error, attempts, now_ts()],
        )?;
        Ok(())
    }

    async fn list_failed_jobs(&self, limit: u32) -> Result<Vec<FailedJob>, AuthError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, queue, payload, error, attempts, failed_at
             FROM failed_jobs ORDER BY id DESC LIMIT ?1",
        )?;
        let jobs = stmt
            .query_map([limit], |row| {
                Ok(FailedJob {
                    id: row.get(0)?,
                    queue: row.get(1)?,
                    payload: row.get(2)?,
                    error: row.get(3)?,
                    attempts: row.get(4)?,
                    failed_at: ts(row, 5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqliteAuthStore {
        let store = SqliteAuthStore::open_in_memory().unwrap();
        store.migrate().await.unwrap();
        store
    }

    fn tenant_req(code: &str) -> CreateTenantRequest {
        CreateTenantRequest {
            code: code.into(),
            name: code.to_uppercase(),
            status: None,
        }
    }

    #[tokio::test]
    async fn role_scope_id_follows_tenant() {
        let store = store().await;
        let tenant = store.create_tenant(&tenant_req("acme")).await.unwrap();
        let global = store
            .create_role(&CreateRoleRequest {
                code: "viewer".into(),
                name: "Viewer".into(),
                level: 10,
                tenant_id: None,
                status: None,
            })
            .await
            .unwrap();
        let scoped = store
            .create_role(&CreateRoleRequest {
                code: "viewer".into(),
                name: "Viewer".into(),
                level: 10,
                tenant_id: Some(tenant.id),
                status: None,
            })
            .await
            .unwrap();
        assert_eq!(global.tenant_scope_id, 0);
        assert_eq!(scoped.tenant_scope_id, tenant.id);

        let dup = store
            .create_role(&CreateRoleRequest {
                code: "viewer".into(),
                name: "Again".into(),
                level: 1,
                tenant_id: None,
                status: None,
            })
            .await;
        assert!(matches!(dup, Err(AuthError::Duplicate(_))));
    }

    #[tokio::test]
    async fn check_constraint_rejects_inconsistent_scope() {
        let store = store().await;
        let conn = store.conn().unwrap();
        let res = conn.execute(
            "INSERT INTO roles (tenant_id, tenant_scope_id, code, name, level, created_at, updated_at)
             VALUES (NULL, 5, 'x', 'x', 1, 0, 0)",
            [],
        );
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn tenant_delete_blocked_while_referenced() {
        let store = store().await;
        let tenant = store.create_tenant(&tenant_req("acme")).await.unwrap();
        let user = store
            .create_user(
                &CreateUserRequest {
                    username: "alice".into(),
                    password: String::new(),
                    email: None,
                    tenant_id: Some(tenant.id),
                    role_id: None,
                    status: None,
                },
                "hash",
            )
            .await
            .unwrap();

        let blocked = store.delete_tenant(tenant.id).await;
        assert!(matches!(blocked, Err(AuthError::InvalidInput(_))));

        store.delete_user(user.id).await.unwrap();
        store.delete_tenant(tenant.id).await.unwrap();
        assert!(matches!(
            store.get_tenant(tenant.id).await,
            Err(AuthError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn soft_deleted_user_hidden_until_restored() {
        let store = store().await;
        let user = store
            .create_user(
                &CreateUserRequest {
                    username: "bob".into(),
                    password: String::new(),
                    email: None,
                    tenant_id: None,
                    role_id: None,
                    status: None,
                },
                "hash",
            )
            .await
            .unwrap();
        store.delete_user(user.id).await.unwrap();
        assert!(store.get_user(user.id).await.is_err());
        assert!(store.get_user_by_username("bob").await.is_err());
        let trashed = store.get_user_with_trashed(user.id).await.unwrap();
        assert!(trashed.deleted_at.is_some());

        let restored = store.restore_user(user.id).await.unwrap();
        assert!(restored.deleted_at.is_none());
        assert_eq!(store.user_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn idempotency_insert_reports_lost_race() {
        let store = store().await;
        let scope = IdempotencyScope {
            actor_key: "user:1".into(),
            method: "POST".into(),
            route: "/api/users".into(),
            key: "k1".into(),
        };
        let now = Utc::now();
        let first = store.insert_idempotency(&scope, "h", now).await.unwrap();
        assert!(first.is_some());
        let second = store.insert_idempotency(&scope, "h", now).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn cache_version_starts_at_one_and_bumps() {
        let store = store().await;
        assert_eq!(store.cache_version("roles").await.unwrap(), 1);
        assert_eq!(store.bump_cache_version("roles").await.unwrap(), 2);
        assert_eq!(store.bump_cache_version("roles").await.unwrap(), 3);
        assert_eq!(store.cache_version("roles").await.unwrap(), 3);
        assert_eq!(store.cache_version("tenants").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn preference_upsert_keeps_unset_fields() {
        let store = store().await;
        let user = store
            .create_user(
                &CreateUserRequest {
                    username: "carol".into(),
                    password: String::new(),
                    email: None,
                    tenant_id: None,
                    role_id: None,
                    status: None,
                },
                "hash",
            )
            .await
            .unwrap();
        store
            .upsert_preference(
                user.id,
                &UpdatePreferenceRequest {
                    locale: Some("en".into()),
                    timezone: Some("Asia/Shanghai".into()),
                    theme: None,
                },
            )
            .await
            .unwrap();
        let pref = store
            .upsert_preference(
                user.id,
                &UpdatePreferenceRequest {
                    theme: Some("dark".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(pref.timezone.as_deref(), Some("Asia/Shanghai"));
        assert_eq!(pref.theme.as_deref(), Some("dark"));
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("warden.db");
        {
            let store = SqliteAuthStore::open(&path).unwrap();
            store.migrate().await.unwrap();
            store.seed_defaults("super_admin").await.unwrap();
            store.create_tenant(&tenant_req("acme")).await.unwrap();
        }

        let store = SqliteAuthStore::open(&path).unwrap();
        store.migrate().await.unwrap();
        assert_eq!(store.list_tenants().await.unwrap().len(), 1);
        assert_eq!(store.list_permissions().await.unwrap().len(), crate::PERMISSIONS.len());
    }
}
