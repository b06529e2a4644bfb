use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cache::{NS_TENANTS, ReadCache};
use crate::error::AuthError;
use crate::store::AuthStore;
use crate::types::{Role, Tenant, User};

/// Minimal scope answer for authorization paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleScope {
    pub tenant_id: Option<i64>,
    pub is_super: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantOption {
    pub id: i64,
    pub code: String,
    pub name: String,
}

impl From<&Tenant> for TenantOption {
    fn from(t: &Tenant) -> Self {
        Self {
            id: t.id,
            code: t.code.clone(),
            name: t.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantContext {
    pub tenant_id: Option<i64>,
    pub tenant_name: Option<String>,
    pub is_super: bool,
    pub options: Vec<TenantOption>,
}

impl TenantContext {
    pub fn scope(&self) -> RoleScope {
        RoleScope {
            tenant_id: self.tenant_id,
            is_super: self.is_super,
        }
    }
}

/// Parses an `X-Tenant-Id` value. Anything that is not a positive integer
/// means "no tenant selected".
pub fn parse_tenant_header(value: Option<&str>) -> Option<i64> {
    value
        .and_then(|v| v.trim().parse::<i64>().ok())
        .filter(|id| *id > 0)
}

#[derive(Clone)]
pub struct TenantContextResolver {
    store: Arc<dyn AuthStore>,
    super_admin_code: String,
    cache: Option<ReadCache>,
}

impl TenantContextResolver {
    pub fn new(store: Arc<dyn AuthStore>, super_admin_code: impl Into<String>) -> Self {
        Self {
            store,
            super_admin_code: super_admin_code.into(),
            cache: None,
        }
    }

    /// Serve the switcher list from `cache` under the `tenants` namespace.
    pub fn with_cache(mut self, cache: ReadCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn is_super(&self, role: Option<&Role>) -> bool {
        role.is_some_and(|r| r.is_platform_admin(&self.super_admin_code))
    }

    /// Full resolution including the tenant switcher list.
    pub async fn resolve(
        &self,
        user: &User,
        role: Option<&Role>,
        selected: Option<i64>,
    ) -> Result<TenantContext, AuthError> {
        let (scope, tenant) = self.decide(user, role, selected).await?;
        let options = if scope.is_super {
            self.active_options().await?
        } else {
            tenant.iter().map(TenantOption::from).collect()
        };
        Ok(TenantContext {
            tenant_id: scope.tenant_id,
            tenant_name: tenant.map(|t| t.name),
            is_super: scope.is_super,
            options,
        })
    }

    /// Every active tenant as a switcher entry.
    pub async fn active_options(&self) -> Result<Vec<TenantOption>, AuthError> {
        let store = &self.store;
        let load = || async move {
            let tenants = store.list_active_tenants().await?;
            Ok::<_, AuthError>(tenants.iter().map(TenantOption::from).collect::<Vec<_>>())
        };
        match &self.cache {
            Some(cache) => cache.get_or_load(NS_TENANTS, "options", load).await,
            None => load().await,
        }
    }

    /// Same accept/reject decision as [`resolve`](Self::resolve) without
    /// loading the option list.
    pub async fn resolve_role_scope(
        &self,
        user: &User,
        role: Option<&Role>,
        selected: Option<i64>,
    ) -> Result<RoleScope, AuthError> {
        let (scope, _) = self.decide(user, role, selected).await?;
        Ok(scope)
    }

    async fn decide(
        &self,
        user: &User,
        role: Option<&Role>,
        selected: Option<i64>,
    ) -> Result<(RoleScope, Option<Tenant>), AuthError> {
        if self.is_super(role) {
            let Some(id) = selected.filter(|id| *id > 0) else {
                return Ok((
                    RoleScope {
                        tenant_id: None,
                        is_super: true,
                    },
                    None,
                ));
            };
            let tenant = self.store.find_active_tenant(id).await?.ok_or_else(|| {
                AuthError::Forbidden("Selected tenant is invalid or inactive".into())
            })?;
            return Ok((
                RoleScope {
                    tenant_id: Some(tenant.id),
                    is_super: true,
                },
                Some(tenant),
            ));
        }

        // Tenant-scoped principals are pinned; the selector is ignored.
        let tenant = match user.tenant_id {
            Some(id) => self.store.find_active_tenant(id).await?,
            None => None,
        };
        let tenant = tenant.ok_or_else(|| AuthError::Forbidden("Tenant is inactive".into()))?;
        Ok((
            RoleScope {
                tenant_id: Some(tenant.id),
                is_super: false,
            },
            Some(tenant),
        ))
    }
}
