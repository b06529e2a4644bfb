pub mod config;
pub mod create_admin;
pub mod init;
pub mod migrate;
pub mod serve;

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;

use warden_auth::{AuthStore, SqliteAuthStore};

use crate::config::WardenConfig;

/// Opens the configured database and brings its schema and seed data up to
/// date.
pub async fn open_store(config: &WardenConfig, base_dir: &Path) -> Result<Arc<SqliteAuthStore>> {
    let db_path = config.db_path(base_dir);
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = Arc::new(SqliteAuthStore::open(&db_path)?);
    store.migrate().await?;
    store.seed_defaults(&config.auth.super_admin_code).await?;
    tracing::debug!(db = %db_path.display(), "store ready");
    Ok(store)
}
