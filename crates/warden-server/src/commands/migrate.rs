use std::path::Path;

use anyhow::Result;

use warden_auth::AuthStore;

use crate::config::WardenConfig;

pub async fn run(base_dir: &Path) -> Result<()> {
    let config = WardenConfig::load(&WardenConfig::default_path(base_dir))?;
    let store = super::open_store(&config, base_dir).await?;
    let users = store.user_count().await?;
    let permissions = store.list_permissions().await?.len();
    println!("Schema is up to date: {}", config.db_path(base_dir).display());
    println!("  Users:        {users}");
    println!("  Permissions:  {permissions}");
    Ok(())
}
