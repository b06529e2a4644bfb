use std::path::Path;

use anyhow::Result;

use crate::config::WardenConfig;

pub fn run(base_dir: &Path) -> Result<()> {
    let config_path = WardenConfig::default_path(base_dir);
    let config = WardenConfig::load(&config_path)?;
    let auth = &config.auth;

    println!("Config: {}", config_path.display());
    println!();
    println!("  Listen address:    {}", config.server.listen_addr);
    println!("  DB path:           {}", config.db_path(base_dir).display());
    println!("  Debug errors:      {}", config.server.debug);
    println!("  Super admin role:  {}", auth.super_admin_code);
    println!("  Default timezone:  {}", auth.default_timezone);
    println!(
        "  Token TTLs:        access {}s, refresh {}s, remember {}s",
        auth.tokens.access_ttl_secs, auth.tokens.refresh_ttl_secs, auth.tokens.remember_ttl_secs
    );
    println!(
        "  Login throttle:    {} attempts / {}s",
        auth.login.max_attempts, auth.login.decay_secs
    );
    println!(
        "  Idempotency:       {} (methods {:?}, ttl {}s)",
        if auth.idempotency.enabled { "enabled" } else { "disabled" },
        auth.idempotency.methods,
        auth.idempotency.ttl_secs
    );
    println!(
        "  Optimistic lock:   fields {:?}, header {}, required {}",
        auth.optimistic_lock.token_fields, auth.optimistic_lock.header, auth.optimistic_lock.required
    );
    println!(
        "  Audit queue:       {} (capacity {}, tries {})",
        if auth.audit.async_enabled { "async" } else { "inline" },
        auth.audit.queue_capacity,
        auth.audit.tries
    );
    Ok(())
}
