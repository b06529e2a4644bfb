use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use warden_auth::AuthConfig;

/// Top-level `warden.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WardenConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// SQLite database file. Empty means `<base_dir>/warden.db`.
    #[serde(default)]
    pub db_path: String,
    /// Expose server-side error detail in `5000` responses.
    #[serde(default)]
    pub debug: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            db_path: String::new(),
            debug: false,
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

impl WardenConfig {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            bail!(
                "config not found at {} (run `warden init` first)",
                path.display()
            );
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Default config for `warden init`.
    pub fn default_config(base_dir: &Path) -> Self {
        Self {
            server: ServerSettings {
                db_path: base_dir.join("warden.db").display().to_string(),
                ..ServerSettings::default()
            },
            auth: AuthConfig::default(),
        }
    }

    /// Database path, relative paths resolved against `base_dir`.
    pub fn db_path(&self, base_dir: &Path) -> PathBuf {
        if self.server.db_path.is_empty() {
            return base_dir.join("warden.db");
        }
        let path = PathBuf::from(&self.server.db_path);
        if path.is_absolute() {
            path
        } else {
            base_dir.join(path)
        }
    }

    /// `<base_dir>/warden.toml`
    pub fn default_path(base_dir: &Path) -> PathBuf {
        base_dir.join("warden.toml")
    }

    /// `~/.warden`
    pub fn default_base_dir() -> Result<PathBuf> {
        dirs::home_dir()
            .map(|h| h.join(".warden"))
            .context("Cannot determine home directory")
    }
}
