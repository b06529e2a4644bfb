use std::path::Path;

use anyhow::{Context, Result, bail};

use warden_auth::{AuthStore, CreateUserRequest, hash_password};

use crate::config::WardenConfig;

/// Creates a platform administrator holding the super-admin role.
pub async fn run(
    base_dir: &Path,
    username: &str,
    email: Option<String>,
    cli_password: &Option<String>,
) -> Result<()> {
    let config = WardenConfig::load(&WardenConfig::default_path(base_dir))?;
    let store = super::open_store(&config, base_dir).await?;

    let super_code = &config.auth.super_admin_code;
    let role = store
        .list_roles(None)
        .await?
        .into_iter()
        .find(|r| r.tenant_id.is_none() && &r.code == super_code)
        .with_context(|| format!("global role '{super_code}' is missing"))?;

    let password = match cli_password {
        Some(p) => p.clone(),
        None => prompt_password()?,
    };
    config.auth.password.validate(&password)?;

    let req = CreateUserRequest {
        username: username.trim().to_string(),
        password: password.clone(),
        email,
        tenant_id: None,
        role_id: Some(role.id),
        status: None,
    };
    if req.username.is_empty() {
        bail!("username must not be empty");
    }
    let user = store.create_user(&req, &hash_password(&password)?).await?;
    println!("Created platform administrator '{}' (id {})", user.username, user.id);
    Ok(())
}

fn prompt_password() -> Result<String> {
    let first = rpassword::prompt_password_stdout("Password: ")?;
    let second = rpassword::prompt_password_stdout("Confirm password: ")?;
    if first != second {
        bail!("passwords do not match");
    }
    Ok(first)
}
