use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde_json::Value;

use crate::config::OptimisticLockConfig;
use crate::error::AuthError;
use crate::types::{Role, Tenant, User};

const NAIVE_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"];

/// A resource whose last-modified time acts as its version.
pub trait Versioned {
    /// `None` for resources that were never persisted.
    fn updated_at(&self) -> Option<DateTime<Utc>>;
}

impl Versioned for User {
    fn updated_at(&self) -> Option<DateTime<Utc>> {
        Some(self.updated_at)
    }
}

impl Versioned for Role {
    fn updated_at(&self) -> Option<DateTime<Utc>> {
        Some(self.updated_at)
    }
}

impl Versioned for Tenant {
    fn updated_at(&self) -> Option<DateTime<Utc>> {
        Some(self.updated_at)
    }
}

impl<T: Versioned> Versioned for Option<T> {
    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.as_ref().and_then(Versioned::updated_at)
    }
}

/// The client-supplied inputs a version token may come from.
#[derive(Debug, Default, Clone, Copy)]
pub struct LockInput<'a> {
    pub payload: Option<&'a Value>,
    pub header: Option<&'a str>,
    pub timezone: Option<Tz>,
}

#[derive(Debug, Clone)]
pub struct OptimisticLock {
    config: OptimisticLockConfig,
}

impl OptimisticLock {
    pub fn new(config: OptimisticLockConfig) -> Self {
        Self { config }
    }

    pub fn header_name(&self) -> &str {
        &self.config.header
    }

    /// Passes when the token matches the resource's `updated_at` (Unix
    /// seconds) or when there is nothing to compare.
    pub fn check(
        &self,
        input: LockInput<'_>,
        resource: &impl Versioned,
        token_fields: Option<&[String]>,
    ) -> Result<(), AuthError> {
        let fields = token_fields.unwrap_or(&self.config.token_fields);
        let Some(raw) = extract_token(input, fields) else {
            if self.config.required {
                return Err(AuthError::InvalidInput("version token is required".into()));
            }
            return Ok(());
        };

        let tz = input.timezone.unwrap_or(Tz::UTC);
        let supplied = parse_version_token(&raw, tz)
            .ok_or_else(|| AuthError::InvalidInput("version token is invalid".into()))?;

        let Some(current) = resource.updated_at() else {
            return Ok(());
        };
        if supplied == current.timestamp() {
            return Ok(());
        }

        tracing::debug!(supplied, current = current.timestamp(), "optimistic lock conflict");
        Err(AuthError::Conflict {
            message: "The resource has been modified by another request. Please refresh and try again."
                .into(),
            current_version: Some(current.timestamp()),
            current_updated_at: Some(format_version_time(current, tz)),
        })
    }
}

enum RawToken {
    Number(i64),
    Text(String),
}

fn extract_token(input: LockInput<'_>, fields: &[String]) -> Option<RawToken> {
    if let Some(obj) = input.payload.and_then(Value::as_object) {
        for field in fields {
            match obj.get(field) {
                Some(Value::Number(n)) => {
                    if let Some(v) = n.as_i64() {
                        return Some(RawToken::Number(v));
                    }
                    if let Some(v) = n.as_f64() {
                        return Some(RawToken::Text(v.to_string()));
                    }
                }
                Some(Value::String(s)) if !s.trim().is_empty() => {
                    return Some(RawToken::Text(s.clone()));
                }
                _ => {}
            }
        }
    }
    input
        .header
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(|h| RawToken::Text(h.to_string()))
}

fn parse_version_token(raw: &RawToken, tz: Tz) -> Option<i64> {
    match raw {
        RawToken::Number(v) => Some(*v),
        RawToken::Text(s) => parse_text_token(s.trim(), tz),
    }
}

/// Digits are a Unix timestamp; anything else is a date-time, read in `tz`
/// when it carries no offset of its own.
pub fn parse_text_token(s: &str, tz: Tz) -> Option<i64> {
    if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
        return s.parse().ok();
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp());
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.timestamp());
    }
    NAIVE_FORMATS.iter().find_map(|fmt| {
        let naive = NaiveDateTime::parse_from_str(s, fmt).ok()?;
        tz.from_local_datetime(&naive)
            .earliest()
            .map(|dt| dt.timestamp())
    })
}

pub fn format_version_time(at: DateTime<Utc>, tz: Tz) -> String {
    at.with_timezone(&tz).format("%Y-%m-%d %H:%M:%S").to_string()
}
