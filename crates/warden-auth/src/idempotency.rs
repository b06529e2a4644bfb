use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::config::IdempotencyConfig;
use crate::error::AuthError;
use crate::store::AuthStore;
use crate::types::{IdempotencyRecord, IdempotencyScope, IdempotencyStatus};

pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";
pub const REPLAY_HEADER: &str = "x-idempotent-replay";

/// One mutating request as seen by the coordinator.
#[derive(Debug, Clone)]
pub struct IdempotentRequest<'a> {
    pub key: Option<&'a str>,
    pub actor_key: String,
    pub method: &'a str,
    pub route: &'a str,
    pub payload: &'a Value,
}

#[derive(Debug)]
pub enum Begin {
    /// No key supplied; run the handler without bookkeeping.
    Bypass,
    /// A completed response exists; return it and do not run the handler.
    Replay { status: u16, payload: String },
    /// The caller owns the record and must `complete` or `mark_failed` it.
    Proceed {
        record: IdempotencyRecord,
        newly_created: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Executed { status: u16, payload: String },
    Replayed { status: u16, payload: String },
}

impl Outcome {
    pub fn status(&self) -> u16 {
        match self {
            Outcome::Executed { status, .. } | Outcome::Replayed { status, .. } => *status,
        }
    }

    pub fn payload(&self) -> &str {
        match self {
            Outcome::Executed { payload, .. } | Outcome::Replayed { payload, .. } => payload,
        }
    }

    pub fn is_replay(&self) -> bool {
        matches!(self, Outcome::Replayed { .. })
    }
}

#[derive(Clone)]
pub struct IdempotencyCoordinator {
    store: Arc<dyn AuthStore>,
    config: IdempotencyConfig,
}

impl IdempotencyCoordinator {
    pub fn new(store: Arc<dyn AuthStore>, config: IdempotencyConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    pub async fn begin(
        &self,
        req: &IdempotentRequest<'_>,
        now: DateTime<Utc>,
    ) -> Result<Begin, AuthError> {
        let Some(key) = req.key.map(str::trim).filter(|k| !k.is_empty()) else {
            return Ok(Begin::Bypass);
        };
        if key.chars().count() > self.config.max_key_length {
            return Err(AuthError::InvalidInput(format!(
                "Idempotency-Key must not exceed {} characters",
                self.config.max_key_length
            )));
        }

        let scope = IdempotencyScope {
            actor_key: req.actor_key.clone(),
            method: req.method.to_ascii_uppercase(),
            route: normalize_route(req.route),
            key: key.to_string(),
        };
        let request_hash = canonical_hash(req.payload);

        let mut existing = self.store.find_idempotency(&scope).await?;
        if let Some(record) = &existing {
            if record.expires_at.is_some_and(|exp| exp <= now) {
                self.store.delete_idempotency(record.id).await?;
                existing = None;
            }
        }

        let mut newly_created = false;
        if existing.is_none() {
            existing = match self.store.insert_idempotency(&scope, &request_hash, now).await? {
                Some(record) => {
                    newly_created = true;
                    Some(record)
                }
                // Lost the unique-constraint race; read the winner's row.
                None => self.store.find_idempotency(&scope).await?,
            };
        }

        let record = existing.ok_or_else(|| {
            AuthError::Internal("Unable to acquire idempotency key lock".into())
        })?;

        if record.request_hash != request_hash {
            return Err(AuthError::InvalidInput(
                "Idempotency-Key has been used with a different request payload".into(),
            ));
        }

        if record.status == IdempotencyStatus::Completed {
            if let Some(payload) = record.response_payload.clone() {
                tracing::debug!(idempotency_key = %scope.key, route = %scope.route, "replaying stored response");
                return Ok(Begin::Replay {
                    status: record.response_status.unwrap_or(200),
                    payload,
                });
            }
        }

        if record.status == IdempotencyStatus::Processing
            && !newly_created
            && now - record.updated_at < self.config.lock_timeout()
        {
            return Err(AuthError::conflict(
                "Request with this Idempotency-Key is already being processed",
            ));
        }

        if !newly_created {
            self.store.reset_idempotency(record.id, now).await?;
            tracing::info!(
                idempotency_key = %scope.key,
                previous = record.status.as_str(),
                "re-entering idempotency record"
            );
        }

        Ok(Begin::Proceed {
            record,
            newly_created,
        })
    }

    pub async fn complete(
        &self,
        record: &IdempotencyRecord,
        status: u16,
        payload: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AuthError> {
        let expires_at = now + self.config.ttl();
        self.store
            .complete_idempotency(record.id, payload, status, expires_at, now)
            .await
    }

    pub async fn mark_failed(
        &self,
        record: &IdempotencyRecord,
        now: DateTime<Utc>,
    ) -> Result<(), AuthError> {
        self.store.fail_idempotency(record.id, now).await
    }

    /// Explicit per-action wrapper: replays, or runs `handler` and stores
    /// its `(status, payload)`. A handler error marks the record failed and
    /// is returned unchanged.
    pub async fn run<F, Fut>(
        &self,
        req: &IdempotentRequest<'_>,
        handler: F,
    ) -> Result<Outcome, AuthError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(u16, String), AuthError>>,
    {
        let record = match self.begin(req, Utc::now()).await? {
            Begin::Replay { status, payload } => return Ok(Outcome::Replayed { status, payload }),
            Begin::Bypass => {
                let (status, payload) = handler().await?;
                return Ok(Outcome::Executed { status, payload });
            }
            Begin::Proceed { record, .. } => record,
        };

        match handler().await {
            Ok((status, payload)) => {
                self.complete(&record, status, &payload, Utc::now()).await?;
                Ok(Outcome::Executed { status, payload })
            }
            Err(e) => {
                if let Err(mark_err) = self.mark_failed(&record, Utc::now()).await {
                    tracing::error!(error = %mark_err, "failed to mark idempotency record failed");
                }
                Err(e)
            }
        }
    }

    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, AuthError> {
        self.store.purge_expired_idempotency(now).await
    }
}

/// `user:<id>` for authenticated callers, otherwise a stable hash of the
/// caller's IP and user agent.
pub fn actor_key(user_id: Option<i64>, ip: &str, user_agent: &str) -> String {
    match user_id {
        Some(id) => format!("user:{id}"),
        None => {
            let ua_hash = sha256_hex(user_agent.as_bytes());
            sha256_hex(format!("guest:{ip}:{}", &ua_hash[..24]).as_bytes())
        }
    }
}

/// Drops the API version segment and trailing slashes so every mount of the
/// same route shares keys.
pub fn normalize_route(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    let normalized = match trimmed.strip_prefix("/api/v1") {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => format!("/api{rest}"),
        _ => trimmed.to_string(),
    };
    if normalized.is_empty() {
        "/".to_string()
    } else {
        normalized
    }
}

/// Object keys sorted at every depth; array order is preserved.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for k in keys {
                sorted.insert(k.clone(), canonicalize(&map[k]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

pub fn canonical_hash(payload: &Value) -> String {
    sha256_hex(canonicalize(payload).to_string().as_bytes())
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
