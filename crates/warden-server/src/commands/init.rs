use std::path::Path;

use anyhow::Result;

use crate::config::WardenConfig;

pub async fn run(base_dir: &Path) -> Result<()> {
    println!("Initializing Warden in {}", base_dir.display());
    std::fs::create_dir_all(base_dir)?;

    let config_path = WardenConfig::default_path(base_dir);
    if config_path.exists() {
        println!("Config already exists at {}", config_path.display());
    } else {
        WardenConfig::default_config(base_dir).save(&config_path)?;
        println!("Created config: {}", config_path.display());
    }

    let config = WardenConfig::load(&config_path)?;
    super::open_store(&config, base_dir).await?;
    println!("Initialized database: {}", config.db_path(base_dir).display());

    println!("\nWarden initialized. Next steps:");
    println!("  1. Run `warden create-admin <username>` to create a platform administrator");
    println!("  2. Run `warden serve` to start the API");
    Ok(())
}
