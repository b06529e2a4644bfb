use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::AuditQueueConfig;
use crate::error::AuthError;
use crate::store::AuthStore;
use crate::types::NewAuditEntry;

pub const AUDIT_QUEUE: &str = "audit";

/// Where audit rows end up, plus the dead-letter for jobs that ran out of
/// retries.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn write(&self, entry: &NewAuditEntry) -> Result<(), AuthError>;
    async fn dead_letter(
        &self,
        queue: &str,
        payload: &str,
        error: &str,
        attempts: u32,
    ) -> Result<(), AuthError>;
}

pub struct StoreAuditSink(pub Arc<dyn AuthStore>);

#[async_trait]
impl AuditSink for StoreAuditSink {
    async fn write(&self, entry: &NewAuditEntry) -> Result<(), AuthError> {
        self.0.insert_audit(entry).await
    }

    async fn dead_letter(
        &self,
        queue: &str,
        payload: &str,
        error: &str,
        attempts: u32,
    ) -> Result<(), AuthError> {
        self.0.record_failed_job(queue, payload, error, attempts).await
    }
}

/// The one audit-writing function. Both the inline path and the queue
/// worker go through here.
pub async fn write_audit(sink: &dyn AuditSink, entry: &NewAuditEntry) -> Result<(), AuthError> {
    sink.write(entry).await
}

/// Mirrors a queued security event onto the `audit` tracing target.
pub fn emit_audit_event(entry: &NewAuditEntry) {
    tracing::info!(
        target: "audit",
        event = entry.action.as_str(),
        actor_id = entry.actor_id,
        tenant_id = entry.tenant_id,
        subject_type = entry.subject_type.as_deref().unwrap_or(""),
        subject_id = entry.subject_id.as_deref().unwrap_or(""),
        request_id = entry.request_id.as_deref().unwrap_or(""),
        "audit event queued"
    );
}

#[derive(Debug, Clone)]
pub struct AuditJob {
    pub entry: NewAuditEntry,
}

#[derive(Clone)]
pub struct AuditRecorder {
    sink: Arc<dyn AuditSink>,
    queue: Option<mpsc::Sender<AuditJob>>,
}

impl AuditRecorder {
    /// Recorder without a queue; `dispatch` writes inline.
    pub fn inline(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink, queue: None }
    }

    /// Recorder plus the worker that drains its queue. The worker is `None`
    /// when async delivery is disabled.
    pub fn with_queue(
        sink: Arc<dyn AuditSink>,
        config: AuditQueueConfig,
    ) -> (Self, Option<AuditWorker>) {
        if !config.async_enabled {
            return (Self::inline(sink), None);
        }
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let worker = AuditWorker {
            sink: sink.clone(),
            rx,
            config,
        };
        (
            Self {
                sink,
                queue: Some(tx),
            },
            Some(worker),
        )
    }

    /// Synchronous write.
    pub async fn record(&self, entry: NewAuditEntry) -> Result<(), AuthError> {
        write_audit(self.sink.as_ref(), &entry).await
    }

    /// Queued write for hot-path events. Falls back to an inline write when
    /// the queue is full or its worker is gone.
    pub async fn dispatch(&self, entry: NewAuditEntry) -> Result<(), AuthError> {
        emit_audit_event(&entry);
        let Some(queue) = &self.queue else {
            return self.record(entry).await;
        };
        match queue.try_send(AuditJob { entry }) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(job) | mpsc::error::TrySendError::Closed(job)) => {
                tracing::warn!(action = %job.entry.action, "audit queue unavailable, writing inline");
                self.record(job.entry).await
            }
        }
    }
}

pub struct AuditWorker {
    sink: Arc<dyn AuditSink>,
    rx: mpsc::Receiver<AuditJob>,
    config: AuditQueueConfig,
}

impl AuditWorker {
    /// Drains the queue until every recorder handle is dropped.
    pub async fn run(mut self) {
        while let Some(job) = self.rx.recv().await {
            self.deliver(job).await;
        }
        tracing::debug!("audit worker stopped");
    }

    async fn deliver(&self, job: AuditJob) {
        let tries = self.config.tries.max(1);
        let mut last_error = String::new();

        for attempt in 1..=tries {
            match tokio::time::timeout(
                self.config.timeout(),
                write_audit(self.sink.as_ref(), &job.entry),
            )
            .await
            {
                Ok(Ok(())) => return,
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = format!("timed out after {}s", self.config.timeout_secs),
            }
            tracing::warn!(
                action = %job.entry.action,
                attempt,
                tries,
                error = %last_error,
                "audit write failed"
            );
            if attempt < tries {
                tokio::time::sleep(self.config.backoff(attempt)).await;
            }
        }

        let payload = match serde_json::to_string(&job.entry) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(action = %job.entry.action, error = %e, "cannot serialize failed audit job");
                return;
            }
        };
        if let Err(e) = self
            .sink
            .dead_letter(AUDIT_QUEUE, &payload, &last_error, tries)
            .await
        {
            tracing::error!(
                action = %job.entry.action,
                error = %e,
                payload = %payload,
                "audit job lost: dead-letter write failed"
            );
        }
    }
}
