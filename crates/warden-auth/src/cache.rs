use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::AuthError;
use crate::store::AuthStore;

pub const NS_PERMISSIONS: &str = "permissions";
pub const NS_ROLES: &str = "roles";
pub const NS_TENANTS: &str = "tenants";

/// Namespace-keyed version counters. A namespace that was never bumped is
/// at version 1.
#[derive(Clone)]
pub struct CacheVersions {
    store: Arc<dyn AuthStore>,
}

impl CacheVersions {
    pub fn new(store: Arc<dyn AuthStore>) -> Self {
        Self { store }
    }

    pub async fn current(&self, namespace: &str) -> Result<i64, AuthError> {
        self.store.cache_version(namespace).await
    }

    pub async fn bump(&self, namespace: &str) -> Result<i64, AuthError> {
        let version = self.store.bump_cache_version(namespace).await?;
        tracing::debug!(namespace, version, "cache namespace bumped");
        Ok(version)
    }

    pub async fn key(&self, namespace: &str, key: &str) -> Result<String, AuthError> {
        Ok(versioned_key(namespace, self.current(namespace).await?, key))
    }
}

pub fn versioned_key(namespace: &str, version: i64, key: &str) -> String {
    format!("{namespace}:v{version}:{key}")
}

/// In-process read-through cache. Entries are never invalidated directly; a
/// namespace bump changes the key so older entries are simply no longer hit.
#[derive(Clone)]
pub struct ReadCache {
    versions: CacheVersions,
    entries: Arc<Mutex<HashMap<String, Value>>>,
}

impl ReadCache {
    pub fn new(versions: CacheVersions) -> Self {
        Self {
            versions,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn versions(&self) -> &CacheVersions {
        &self.versions
    }

    pub async fn get_or_load<T, F, Fut>(
        &self,
        namespace: &str,
        key: &str,
        load: F,
    ) -> Result<T, AuthError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AuthError>>,
    {
        let version = self.versions.current(namespace).await?;
        let full_key = versioned_key(namespace, version, key);

        if let Some(hit) = self.lookup(&full_key)? {
            return Ok(serde_json::from_value(hit)?);
        }

        let value = load().await?;
        let encoded = serde_json::to_value(&value)?;
        let prefix = format!("{namespace}:");
        let current = format!("{namespace}:v{version}:");
        let mut entries = self.lock()?;
        entries.retain(|k, _| !k.starts_with(&prefix) || k.starts_with(&current));
        entries.insert(full_key, encoded);
        Ok(value)
    }

    pub async fn invalidate(&self, namespace: &str) -> Result<i64, AuthError> {
        self.versions.bump(namespace).await
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, key: &str) -> Result<Option<Value>, AuthError> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Value>>, AuthError> {
        self.entries
            .lock()
            .map_err(|_| AuthError::Internal("read cache poisoned".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteAuthStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn cache() -> ReadCache {
        let store = Arc::new(SqliteAuthStore::open_in_memory().unwrap());
        store.migrate().await.unwrap();
        ReadCache::new(CacheVersions::new(store))
    }

    #[test]
    fn key_format() {
        assert_eq!(versioned_key("roles", 3, "all"), "roles:v3:all");
    }

    #[tokio::test]
    async fn hit_until_namespace_bumped() {
        let cache = cache().await;
        let loads = AtomicUsize::new(0);
        let counter = &loads;
        let loader = move || async move {
            Ok(vec![counter.fetch_add(1, Ordering::SeqCst) as i64])
        };

        let a: Vec<i64> = cache.get_or_load(NS_TENANTS, "active", loader).await.unwrap();
        let b: Vec<i64> = cache.get_or_load(NS_TENANTS, "active", loader).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        assert_eq!(cache.invalidate(NS_TENANTS).await.unwrap(), 2);
        let c: Vec<i64> = cache.get_or_load(NS_TENANTS, "active", loader).await.unwrap();
        assert_eq!(c, vec![1]);
        assert_eq!(loads.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn namespaces_are_independent() {
        let cache = cache().await;
        let _: i64 = cache.get_or_load(NS_ROLES, "k", || async { Ok(1) }).await.unwrap();
        let _: i64 = cache.get_or_load(NS_PERMISSIONS, "k", || async { Ok(2) }).await.unwrap();
        cache.invalidate(NS_ROLES).await.unwrap();
        assert_eq!(cache.versions().current(NS_PERMISSIONS).await.unwrap(), 1);
        let p: i64 = cache
            .get_or_load(NS_PERMISSIONS, "k", || async { Ok(99) })
            .await
            .unwrap();
        assert_eq!(p, 2);
    }
}
