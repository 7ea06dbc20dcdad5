// Copyright (C) 2025 Wipline Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

use crate::worker::{PruneWorkerConfig, ReconcileWorkerConfig, WorkerConfig};

/// Wipline worker daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite or PostgreSQL connection URL.
    pub database_url: String,
    /// Task worker poll loop tuning.
    pub worker: WorkerConfig,
    /// Reconcile worker tuning.
    pub reconcile: ReconcileWorkerConfig,
    /// Prune worker tuning.
    pub prune: PruneWorkerConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `WIPLINE_DATABASE_URL`: SQLite or PostgreSQL connection string
    ///
    /// Optional (with defaults):
    /// - `WIPLINE_POLL_INTERVAL_SECS`: worker poll interval (default: 5)
    /// - `WIPLINE_BATCH_SIZE`: tasks claimed per poll (default: 10)
    ///
    /// Reconcile and prune settings are read via
    /// [`ReconcileWorkerConfig::from_env`] and
    /// [`PruneWorkerConfig::from_env`].
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("WIPLINE_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("WIPLINE_DATABASE_URL"))?;

        let poll_interval_secs: u64 = std::env::var("WIPLINE_POLL_INTERVAL_SECS")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("WIPLINE_POLL_INTERVAL_SECS", "must be a positive integer")
            })?;

        let batch_size: usize = std::env::var("WIPLINE_BATCH_SIZE")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("WIPLINE_BATCH_SIZE", "must be a positive integer"))?;

        Ok(Self {
            database_url,
            worker: WorkerConfig {
                poll_interval: Duration::from_secs(poll_interval_secs),
                batch_size,
            },
            reconcile: ReconcileWorkerConfig::from_env(),
            prune: PruneWorkerConfig::from_env(),
        })
    }
}

/// Configuration errors.
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
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
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
    fn test_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("WIPLINE_DATABASE_URL", "sqlite:.data/test.db");
        guard.remove("WIPLINE_POLL_INTERVAL_SECS");
        guard.remove("WIPLINE_BATCH_SIZE");

        let config = Config::from_env().unwrap();
        assert_eq!(config.database_url, "sqlite:.data/test.db");
        assert_eq!(config.worker.poll_interval, Duration::from_secs(5));
        assert_eq!(config.worker.batch_size, 10);
    }

    #[test]
    fn test_from_env_missing_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.remove("WIPLINE_DATABASE_URL");

        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("WIPLINE_DATABASE_URL"));
    }

    #[test]
    fn test_from_env_invalid_batch_size() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("WIPLINE_DATABASE_URL", "sqlite:x.db");
        guard.set("WIPLINE_BATCH_SIZE", "lots");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("WIPLINE_BATCH_SIZE", _)));
    }

    #[test]
    fn test_from_env_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("WIPLINE_DATABASE_URL", "sqlite:x.db");
        guard.set("WIPLINE_POLL_INTERVAL_SECS", "1");
        guard.set("WIPLINE_BATCH_SIZE", "50");

        let config = Config::from_env().unwrap();
        assert_eq!(config.worker.poll_interval, Duration::from_secs(1));
        assert_eq!(config.worker.batch_size, 50);
    }
}
