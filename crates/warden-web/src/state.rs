use std::sync::Arc;

use serde::{Deserialize, Serialize};

use warden_auth::cache::CacheVersions;
use warden_auth::{
    AuditRecorder, AuthConfig, AuthStore, IdempotencyCoordinator, LoginThrottle, OptimisticLock,
    ReadCache, TenantContextResolver, TokenAuthenticator,
};

pub struct AppState {
    pub store: Arc<dyn AuthStore>,
    pub config: Arc<AuthConfig>,
    pub authenticator: TokenAuthenticator,
    pub tenants: TenantContextResolver,
    pub lock: OptimisticLock,
    pub idempotency: IdempotencyCoordinator,
    pub audit: AuditRecorder,
    pub cache: ReadCache,
    pub throttle: LoginThrottle,
    /// Expose server-side error detail in responses.
    pub debug: bool,
}

impl AppState {
    pub fn new(
        store: Arc<dyn AuthStore>,
        config: AuthConfig,
        audit: AuditRecorder,
        debug: bool,
    ) -> Self {
        let config = Arc::new(config);
        let cache = ReadCache::new(CacheVersions::new(store.clone()));
        Self {
            authenticator: TokenAuthenticator::new(store.clone(), config.clone()),
            tenants: TenantContextResolver::new(store.clone(), config.super_admin_code.clone())
                .with_cache(cache.clone()),
            lock: OptimisticLock::new(config.optimistic_lock.clone()),
            idempotency: IdempotencyCoordinator::new(store.clone(), config.idempotency.clone()),
            cache,
            throttle: LoginThrottle::new(config.login.clone()),
            audit,
            store,
            config,
            debug,
        }
    }

    pub fn super_admin_code(&self) -> &str {
        &self.config.super_admin_code
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub debug: bool,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            debug: false,
        }
    }
}
