use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use crate::config::LoginThrottleConfig;
use crate::error::AuthError;

/// Tracked keys before `hit` sweeps out expired windows.
const PRUNE_THRESHOLD: usize = 1024;

#[derive(Debug, Clone, Copy)]
struct Window {
    failures: u32,
    started: DateTime<Utc>,
}

/// Counts failed logins per `username|ip` inside a decay window.
pub struct LoginThrottle {
    config: LoginThrottleConfig,
    windows: Mutex<HashMap<String, Window>>,
}

impl LoginThrottle {
    pub fn new(config: LoginThrottleConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn key(username: &str, ip: &str) -> String {
        format!("{}|{ip}", username.trim().to_lowercase())
    }

    fn decay(&self) -> Duration {
        Duration::seconds(self.config.decay_secs.min(u32::MAX as u64) as i64)
    }

    /// Rejects the attempt while the key is locked out.
    pub fn check(&self, key: &str, now: DateTime<Utc>) -> Result<(), AuthError> {
        let mut windows = self.lock()?;
        let Some(window) = windows.get(key).copied() else {
            return Ok(());
        };
        let ends = window.started + self.decay();
        if now >= ends {
            windows.remove(key);
            return Ok(());
        }
        if window.failures >= self.config.max_attempts {
            let retry_after = (ends - now).num_seconds().max(1) as u64;
            return Err(AuthError::LoginThrottled { retry_after });
        }
        Ok(())
    }

    pub fn hit(&self, key: &str, now: DateTime<Utc>) -> Result<u32, AuthError> {
        let decay = self.decay();
        let mut windows = self.lock()?;
        if windows.len() >= PRUNE_THRESHOLD {
            windows.retain(|_, w| now < w.started + decay);
        }
        let window = windows.entry(key.to_string()).or_insert(Window {
            failures: 0,
            started: now,
        });
        if now >= window.started + decay {
            *window = Window {
                failures: 0,
                started: now,
            };
        }
        window.failures += 1;
        Ok(window.failures)
    }

    pub fn clear(&self, key: &str) -> Result<(), AuthError> {
        self.lock()?.remove(key);
        Ok(())
    }

    /// Keys currently holding a failure window.
    pub fn tracked(&self) -> usize {
        self.windows.lock().map(|w| w.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Window>>, AuthError> {
        self.windows
            .lock()
            .map_err(|_| AuthError::Internal("login throttle poisoned".into()))
    }
}
