use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Authorization-layer settings, loaded once at startup as the `[auth]`
/// section of the server config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Role code identifying platform-scoped (super-admin) principals.
    #[serde(default = "default_super_admin_code")]
    pub super_admin_code: String,
    /// Timezone used when a principal has no (valid) preference.
    #[serde(default = "default_timezone")]
    pub default_timezone: String,
    #[serde(default)]
    pub tokens: TokenConfig,
    #[serde(default)]
    pub login: LoginThrottleConfig,
    #[serde(default)]
    pub password: PasswordPolicy,
    #[serde(default)]
    pub idempotency: IdempotencyConfig,
    #[serde(default)]
    pub optimistic_lock: OptimisticLockConfig,
    #[serde(default)]
    pub audit: AuditQueueConfig,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            super_admin_code: default_super_admin_code(),
            default_timezone: default_timezone(),
            tokens: TokenConfig::default(),
            login: LoginThrottleConfig::default(),
            password: PasswordPolicy::default(),
            idempotency: IdempotencyConfig::default(),
            optimistic_lock: OptimisticLockConfig::default(),
            audit: AuditQueueConfig::default(),
        }
    }
}

fn default_super_admin_code() -> String {
    "super_admin".to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    #[serde(default = "default_access_ttl")]
    pub access_ttl_secs: u64,
    #[serde(default = "default_refresh_ttl")]
    pub refresh_ttl_secs: u64,
    /// Refresh-token lifetime when the client asked to be remembered.
    #[serde(default = "default_remember_ttl")]
    pub remember_ttl_secs: u64,
    /// Minimum gap between two `last_used_at` writes for the same token.
    #[serde(default = "default_touch_interval")]
    pub touch_interval_secs: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            access_ttl_secs: default_access_ttl(),
            refresh_ttl_secs: default_refresh_ttl(),
            remember_ttl_secs: default_remember_ttl(),
            touch_interval_secs: default_touch_interval(),
        }
    }
}

impl TokenConfig {
    pub fn access_ttl(&self) -> Duration {
        secs(self.access_ttl_secs)
    }

    pub fn refresh_ttl(&self, remember: bool) -> Duration {
        if remember {
            secs(self.remember_ttl_secs)
        } else {
            secs(self.refresh_ttl_secs)
        }
    }

    pub fn touch_interval(&self) -> Duration {
        secs(self.touch_interval_secs)
    }
}

fn default_access_ttl() -> u64 {
    7200
}
fn default_refresh_ttl() -> u64 {
    7 * 86400
}
fn default_remember_ttl() -> u64 {
    30 * 86400
}
fn default_touch_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginThrottleConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_decay")]
    pub decay_secs: u64,
}

impl Default for LoginThrottleConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            decay_secs: default_decay(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}
fn default_decay() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasswordPolicy {
    #[serde(default = "default_min_length")]
    pub min_length: usize,
    #[serde(default = "default_true")]
    pub require_letter: bool,
    #[serde(default = "default_true")]
    pub require_digit: bool,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            min_length: default_min_length(),
            require_letter: true,
            require_digit: true,
        }
    }
}

fn default_min_length() -> usize {
    8
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    /// Enables the global middleware. The per-action wrapper is always active.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// HTTP verbs the middleware deduplicates.
    #[serde(default = "default_methods")]
    pub methods: Vec<String>,
    /// How long a completed response stays replayable.
    #[serde(default = "default_idempotency_ttl")]
    pub ttl_secs: u64,
    /// Window during which a `processing` record blocks duplicates.
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_secs: u64,
    #[serde(default = "default_max_key_length")]
    pub max_key_length: usize,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            methods: default_methods(),
            ttl_secs: default_idempotency_ttl(),
            lock_timeout_secs: default_lock_timeout(),
            max_key_length: default_max_key_length(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl IdempotencyConfig {
    pub fn ttl(&self) -> Duration {
        secs(self.ttl_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        secs(self.lock_timeout_secs)
    }

    pub fn applies_to(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    }
}

fn default_methods() -> Vec<String> {
    ["POST", "PUT", "PATCH", "DELETE"]
        .iter()
        .map(|m| m.to_string())
        .collect()
}
fn default_idempotency_ttl() -> u64 {
    86400
}
fn default_lock_timeout() -> u64 {
    30
}
fn default_max_key_length() -> usize {
    128
}
fn default_max_body_bytes() -> usize {
    1024 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimisticLockConfig {
    /// Payload fields searched, in order, for the client's version token.
    #[serde(default = "default_token_fields")]
    pub token_fields: Vec<String>,
    /// Header consulted when no payload field carries a token.
    #[serde(default = "default_lock_header")]
    pub header: String,
    /// Reject writes that carry no version token at all.
    #[serde(default)]
    pub required: bool,
}

impl Default for OptimisticLockConfig {
    fn default() -> Self {
        Self {
            token_fields: default_token_fields(),
            header: default_lock_header(),
            required: false,
        }
    }
}

fn default_token_fields() -> Vec<String> {
    vec!["version".to_string()]
}
fn default_lock_header() -> String {
    "If-Unmodified-Since".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditQueueConfig {
    /// When false, queued audit events are written inline.
    #[serde(default = "default_true")]
    pub async_enabled: bool,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_tries")]
    pub tries: u32,
    /// Delay before retry N (the last entry repeats).
    #[serde(default = "default_backoff")]
    pub backoff_secs: Vec<u64>,
    #[serde(default = "default_audit_timeout")]
    pub timeout_secs: u64,
}

impl Default for AuditQueueConfig {
    fn default() -> Self {
        Self {
            async_enabled: true,
            queue_capacity: default_queue_capacity(),
            tries: default_tries(),
            backoff_secs: default_backoff(),
            timeout_secs: default_audit_timeout(),
        }
    }
}

impl AuditQueueConfig {
    /// Backoff before the retry that follows failed attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> std::time::Duration {
        let idx = (attempt.saturating_sub(1) as usize).min(self.backoff_secs.len().saturating_sub(1));
        let secs = self.backoff_secs.get(idx).copied().unwrap_or(0);
        std::time::Duration::from_secs(secs)
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs)
    }
}

fn default_queue_capacity() -> usize {
    1024
}
fn default_tries() -> u32 {
    5
}
fn default_backoff() -> Vec<u64> {
    vec![5, 30, 120]
}
fn default_audit_timeout() -> u64 {
    15
}

fn secs(value: u64) -> Duration {
    Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX).min(i64::MAX / 1000))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = AuthConfig::default();
        assert_eq!(cfg.super_admin_code, "super_admin");
        assert_eq!(cfg.idempotency.max_key_length, 128);
        assert_eq!(cfg.idempotency.lock_timeout_secs, 30);
        assert_eq!(cfg.idempotency.ttl_secs, 86400);
        assert_eq!(cfg.optimistic_lock.token_fields, vec!["version"]);
        assert_eq!(cfg.audit.tries, 5);
        assert_eq!(cfg.login.max_attempts, 5);
    }

    #[test]
    fn backoff_repeats_last_step() {
        let cfg = AuditQueueConfig::default();
        assert_eq!(cfg.backoff(1).as_secs(), 5);
        assert_eq!(cfg.backoff(2).as_secs(), 30);
        assert_eq!(cfg.backoff(3).as_secs(), 120);
        assert_eq!(cfg.backoff(9).as_secs(), 120);
    }

    #[test]
    fn methods_match_case_insensitively() {
        let cfg = IdempotencyConfig::default();
        assert!(cfg.applies_to("post"));
        assert!(cfg.applies_to("DELETE"));
        assert!(!cfg.applies_to("GET"));
    }

    #[test]
    fn partial_section_fills_defaults() {
        let cfg: AuthConfig = serde_json::from_str(r#"{"idempotency":{"ttl_secs":60}}"#).unwrap();
        assert_eq!(cfg.idempotency.ttl_secs, 60);
        assert_eq!(cfg.idempotency.lock_timeout_secs, 30);
        assert!(cfg.idempotency.enabled);
    }
}
