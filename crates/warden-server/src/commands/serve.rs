use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;

use warden_auth::{AuditRecorder, AuthStore, StoreAuditSink};
use warden_web::{AppState, WebConfig};

use crate::config::WardenConfig;

const PURGE_INTERVAL: Duration = Duration::from_secs(600);

pub async fn run(base_dir: &Path, listen: Option<String>) -> Result<()> {
    let config = WardenConfig::load(&WardenConfig::default_path(base_dir))?;
    let store: Arc<dyn AuthStore> = super::open_store(&config, base_dir).await?;

    let sink = Arc::new(StoreAuditSink(store.clone()));
    let (audit, worker) = AuditRecorder::with_queue(sink, config.auth.audit.clone());
    if let Some(worker) = worker {
        tokio::spawn(worker.run());
    }

    let web = WebConfig {
        listen_addr: listen.unwrap_or_else(|| config.server.listen_addr.clone()),
        debug: config.server.debug,
    };
    let state = Arc::new(AppState::new(store, config.auth, audit, web.debug));

    let purge_state = state.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PURGE_INTERVAL);
        loop {
            ticker.tick().await;
            match purge_state.idempotency.purge_expired(Utc::now()).await {
                Ok(0) => {}
                Ok(n) => tracing::info!(purged = n, "expired idempotency keys removed"),
                Err(e) => tracing::warn!(error = %e, "idempotency purge failed"),
            }
        }
    });

    warden_web::start_server(web, state).await
}
