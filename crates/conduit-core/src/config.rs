// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

/// Default maximum active duration of a correlation context (one day).
pub const DEFAULT_CORRELATION_MAX_ACTIVE_SECS: u64 = 86_400;

/// Default interval between correlation expiry sweeps.
pub const DEFAULT_CORRELATION_SWEEP_INTERVAL_SECS: u64 = 60;

/// Default capacity of each lifecycle subscriber channel.
pub const DEFAULT_LIFECYCLE_BUFFER: usize = 256;

/// Orchestration core configuration
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Maximum time a correlation context may stay active. `None` disables expiry.
    pub correlation_max_active: Option<Duration>,
    /// How often expired correlation contexts are swept.
    pub correlation_sweep_interval: Duration,
    /// Capacity of each lifecycle subscriber channel.
    pub lifecycle_buffer: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            correlation_max_active: Some(Duration::from_secs(DEFAULT_CORRELATION_MAX_ACTIVE_SECS)),
            correlation_sweep_interval: Duration::from_secs(DEFAULT_CORRELATION_SWEEP_INTERVAL_SECS),
            lifecycle_buffer: DEFAULT_LIFECYCLE_BUFFER,
        }
    }
}

impl CoreConfig {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `CONDUIT_CORRELATION_MAX_ACTIVE_SECS`: context TTL, `0` disables (default: 86400)
    /// - `CONDUIT_CORRELATION_SWEEP_INTERVAL_SECS`: sweep interval (default: 60)
    /// - `CONDUIT_LIFECYCLE_BUFFER`: lifecycle channel capacity (default: 256)
    pub fn from_env() -> Result<Self, ConfigError> {
        let max_active_secs: u64 = std::env::var("CONDUIT_CORRELATION_MAX_ACTIVE_SECS")
            .unwrap_or_else(|_| DEFAULT_CORRELATION_MAX_ACTIVE_SECS.to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "CONDUIT_CORRELATION_MAX_ACTIVE_SECS",
                    "must be a non-negative integer",
                )
            })?;

        let sweep_secs: u64 = std::env::var("CONDUIT_CORRELATION_SWEEP_INTERVAL_SECS")
            .unwrap_or_else(|_| DEFAULT_CORRELATION_SWEEP_INTERVAL_SECS.to_string())
            .parse()
            .ok()
            .filter(|secs| *secs > 0)
            .ok_or(ConfigError::Invalid(
                "CONDUIT_CORRELATION_SWEEP_INTERVAL_SECS",
                "must be a positive integer",
            ))?;

        let lifecycle_buffer: usize = std::env::var("CONDUIT_LIFECYCLE_BUFFER")
            .unwrap_or_else(|_| DEFAULT_LIFECYCLE_BUFFER.to_string())
            .parse()
            .ok()
            .filter(|size| *size > 0)
            .ok_or(ConfigError::Invalid(
                "CONDUIT_LIFECYCLE_BUFFER",
                "must be a positive integer",
            ))?;

        Ok(Self {
            correlation_max_active: (max_active_secs > 0).then(|| Duration::from_secs(max_active_secs)),
            correlation_sweep_interval: Duration::from_secs(sweep_secs),
            lifecycle_buffer,
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    pub(crate) static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to set env vars for a test and restore them after
    pub(crate) struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        pub(crate) fn new() -> Self {
            Self { vars: Vec::new() }
        }

        pub(crate) fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        pub(crate) fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_core_config_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.remove("CONDUIT_CORRELATION_MAX_ACTIVE_SECS");
        guard.remove("CONDUIT_CORRELATION_SWEEP_INTERVAL_SECS");
        guard.remove("CONDUIT_LIFECYCLE_BUFFER");

        let config = CoreConfig::from_env().unwrap();

        assert_eq!(config.correlation_max_active, Some(Duration::from_secs(86_400)));
        assert_eq!(config.correlation_sweep_interval, Duration::from_secs(60));
        assert_eq!(config.lifecycle_buffer, 256);
    }

    #[test]
    fn test_core_config_zero_ttl_disables_expiry() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("CONDUIT_CORRELATION_MAX_ACTIVE_SECS", "0");
        guard.set("CONDUIT_CORRELATION_SWEEP_INTERVAL_SECS", "5");
        guard.set("CONDUIT_LIFECYCLE_BUFFER", "8");

        let config = CoreConfig::from_env().unwrap();

        assert_eq!(config.correlation_max_active, None);
        assert_eq!(config.correlation_sweep_interval, Duration::from_secs(5));
        assert_eq!(config.lifecycle_buffer, 8);
    }

    #[test]
    fn test_core_config_rejects_zero_buffer() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.remove("CONDUIT_CORRELATION_MAX_ACTIVE_SECS");
        guard.remove("CONDUIT_CORRELATION_SWEEP_INTERVAL_SECS");
        guard.set("CONDUIT_LIFECYCLE_BUFFER", "0");

        let err = CoreConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("CONDUIT_LIFECYCLE_BUFFER", _)));
    }

    #[test]
    fn test_core_config_invalid_ttl() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("CONDUIT_CORRELATION_MAX_ACTIVE_SECS", "soon");

        let result = CoreConfig::from_env();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("CONDUIT_CORRELATION_MAX_ACTIVE_SECS"));
    }
}
