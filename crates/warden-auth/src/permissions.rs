use std::collections::BTreeSet;

use crate::error::AuthError;
use crate::types::{Permission, Role};

/// Permission catalog seeded on first start: `(code, name, group)`.
pub const PERMISSIONS: &[(&str, &str, &str)] = &[
    ("users.view", "View users", "users"),
    ("users.create", "Create users", "users"),
    ("users.update", "Update users", "users"),
    ("users.delete", "Delete users", "users"),
    ("users.restore", "Restore deleted users", "users"),
    ("roles.view", "View roles", "roles"),
    ("roles.create", "Create roles", "roles"),
    ("roles.update", "Update roles and their permissions", "roles"),
    ("roles.delete", "Delete roles", "roles"),
    ("permissions.view", "View the permission catalog", "roles"),
    ("tenants.view", "View tenants", "tenants"),
    ("tenants.create", "Create tenants", "tenants"),
    ("tenants.update", "Update tenants", "tenants"),
    ("tenants.delete", "Delete tenants", "tenants"),
    ("audit.view", "View audit logs", "audit"),
    ("audit.failed_jobs", "Inspect failed audit deliveries", "audit"),
];

/// Effective permission codes of one principal, computed once per request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionSet {
    codes: BTreeSet<String>,
}

impl PermissionSet {
    /// Union of the role's active permissions; an inactive or deleted role
    /// grants nothing.
    pub fn for_role(role: Option<&Role>, permissions: &[Permission]) -> Self {
        let Some(role) = role else {
            return Self::default();
        };
        if !role.status.is_active() || role.deleted_at.is_some() {
            return Self::default();
        }
        let codes = permissions
            .iter()
            .filter(|p| p.status.is_active())
            .map(|p| p.code.clone())
            .collect();
        Self { codes }
    }

    pub fn from_codes<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            codes: codes.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, code: &str) -> bool {
        self.codes.contains(code)
    }

    pub fn contains_any(&self, codes: &[&str]) -> bool {
        codes.iter().any(|c| self.codes.contains(*c))
    }

    pub fn authorize(&self, code: &str) -> Result<(), AuthError> {
        if self.contains(code) {
            Ok(())
        } else {
            Err(AuthError::Forbidden(format!("missing permission: {code}")))
        }
    }

    pub fn authorize_any(&self, codes: &[&str]) -> Result<(), AuthError> {
        if self.contains_any(codes) {
            Ok(())
        } else {
            Err(AuthError::Forbidden(format!(
                "missing permission: one of {}",
                codes.join(", ")
            )))
        }
    }

    pub fn codes(&self) -> impl Iterator<Item = &str> {
        self.codes.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

/// Role-hierarchy gate for user and role management.
///
/// The actor needs a positive level and the target must sit strictly below
/// it. Equal levels are only manageable when the target carries the
/// super-admin code.
pub fn can_manage(actor_level: u32, target_level: u32, target_code: &str, super_admin_code: &str) -> bool {
    if actor_level == 0 {
        return false;
    }
    target_level < actor_level || (target_level == actor_level && target_code == super_admin_code)
}

/// [`can_manage`] against an optional target role; a role-less target has
/// level 0.
pub fn ensure_can_manage(
    actor: Option<&Role>,
    target: Option<&Role>,
    super_admin_code: &str,
) -> Result<(), AuthError> {
    let actor_level = actor.map_or(0, |r| r.level);
    let (target_level, target_code) = target.map_or((0, ""), |r| (r.level, r.code.as_str()));
    if can_manage(actor_level, target_level, target_code, super_admin_code) {
        Ok(())
    } else {
        Err(AuthError::Forbidden(
            "insufficient role level to manage this target".into(),
        ))
    }
}
