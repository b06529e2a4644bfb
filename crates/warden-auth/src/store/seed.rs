use std::collections::HashMap;

use crate::error::AuthError;
use crate::permissions::PERMISSIONS;
use crate::store::AuthStore;
use crate::types::{CreateRoleRequest, Role};

const SUPER_ADMIN_LEVEL: u32 = 100;
const TENANT_ADMIN_LEVEL: u32 = 50;

const TENANT_ADMIN_PERMISSIONS: &[&str] = &[
    "users.view",
    "users.create",
    "users.update",
    "users.delete",
    "users.restore",
    "roles.view",
    "permissions.view",
    "audit.view",
];

/// Seeds the permission catalog plus the two built-in global roles. Safe to
/// run on every start: existing rows are reused and their grants refreshed.
pub async fn seed_defaults(store: &dyn AuthStore, super_admin_code: &str) -> Result<(), AuthError> {
    let mut perm_map = HashMap::new();
    for (code, name, group) in PERMISSIONS {
        let p = store.create_permission(code, name, group).await?;
        perm_map.insert(*code, p.id);
    }

    let roles = [
        (super_admin_code, "Super administrator", SUPER_ADMIN_LEVEL),
        ("tenant_admin", "Tenant administrator", TENANT_ADMIN_LEVEL),
    ];

    for (code, name, level) in roles {
        let role = match find_global_role(store, code).await? {
            Some(r) => r,
            None => {
                store
                    .create_role(&CreateRoleRequest {
                        code: code.to_string(),
                        name: name.to_string(),
                        level,
                        tenant_id: None,
                        status: None,
                    })
                    .await?
            }
        };

        let ids: Vec<i64> = if code == super_admin_code {
            perm_map.values().copied().collect()
        } else {
            TENANT_ADMIN_PERMISSIONS
                .iter()
                .filter_map(|c| perm_map.get(c).copied())
                .collect()
        };
        store.set_role_permissions(role.id, &ids).await?;
    }

    tracing::debug!(permissions = perm_map.len(), "seeded default roles and permissions");
    Ok(())
}

async fn find_global_role(store: &dyn AuthStore, code: &str) -> Result<Option<Role>, AuthError> {
    let roles = store.list_roles(None).await?;
    Ok(roles
        .into_iter()
        .find(|r| r.tenant_id.is_none() && r.code == code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteAuthStore;

    #[tokio::test]
    async fn seeding_twice_is_idempotent() {
        let store = SqliteAuthStore::open_in_memory().unwrap();
        store.migrate().await.unwrap();
        store.seed_defaults("super_admin").await.unwrap();
        store.seed_defaults("super_admin").await.unwrap();

        let perms = store.list_permissions().await.unwrap();
        assert_eq!(perms.len(), PERMISSIONS.len());

        let roles = store.list_roles(None).await.unwrap();
        assert_eq!(roles.len(), 2);
        let sa = roles.iter().find(|r| r.code == "super_admin").unwrap();
        assert_eq!(sa.level, 100);
        assert_eq!(
            store.list_role_permissions(sa.id).await.unwrap().len(),
            PERMISSIONS.len()
        );
    }
}
