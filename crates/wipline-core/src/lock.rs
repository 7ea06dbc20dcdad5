// Copyright (C) 2025 Wipline Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Distributed row lock with TTL.
//!
//! Wraps compound read-modify-write sequences (for example "pause the group,
//! then enqueue a terminate signal per in-flight task") so concurrent
//! claimers cannot interleave. Single-statement atomicity belongs to the
//! storage ports; the row lock exists only for the multi-statement cases
//! they cannot express.
//!
//! Every acquisition uses a fresh owner token. Release compares the token,
//! so a lock lost to TTL expiry mid-section is detected and reported as a
//! lock-conflict instead of silently unlocking someone else's hold.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::CoreError;
use crate::persistence::LockStore;

/// Row lock tuning.
#[derive(Debug, Clone)]
pub struct RowLockConfig {
    /// How long a hold lasts before other owners may take the lock over.
    pub ttl: Duration,
    /// How long `acquire` keeps retrying before failing with a lock-timeout.
    pub wait_timeout: Duration,
    /// Delay between acquisition attempts.
    pub retry_interval: Duration,
}

impl Default for RowLockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            wait_timeout: Duration::from_secs(10),
            retry_interval: Duration::from_millis(250),
        }
    }
}

/// A named distributed lock over a [`LockStore`].
pub struct RowLock {
    store: Arc<dyn LockStore>,
    name: String,
    config: RowLockConfig,
}

/// Proof of acquisition. Pass back to [`RowLock::release`].
#[derive(Debug)]
pub struct RowLockGuard {
    owner: Uuid,
}

impl RowLockGuard {
    /// The owner token for this hold.
    pub fn owner(&self) -> Uuid {
        self.owner
    }
}

impl RowLock {
    /// Create a lock handle for `name`.
    pub fn new(store: Arc<dyn LockStore>, name: impl Into<String>, config: RowLockConfig) -> Self {
        Self {
            store,
            name: name.into(),
            config,
        }
    }

    /// The lock name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquire the lock, retrying until the configured wait timeout.
    pub async fn acquire(&self) -> Result<RowLockGuard, CoreError> {
        let owner = Uuid::new_v4();
        let ttl_secs = self.config.ttl.as_secs() as i64;
        let started = tokio::time::Instant::now();

        loop {
            if self
                .store
                .try_acquire(&self.name, owner, ttl_secs, Utc::now())
                .await?
            {
                debug!(lock = %self.name, %owner, "lock acquired");
                return Ok(RowLockGuard { owner });
            }
            if started.elapsed() >= self.config.wait_timeout {
                return Err(CoreError::LockTimeout {
                    name: self.name.clone(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            tokio::time::sleep(self.config.retry_interval).await;
        }
    }

    /// Release a held lock.
    ///
    /// Fails with [`CoreError::LockConflict`] when the hold was already lost
    /// to TTL expiry and another owner took over.
    pub async fn release(&self, guard: RowLockGuard) -> Result<(), CoreError> {
        if self.store.release(&self.name, guard.owner).await? {
            debug!(lock = %self.name, "lock released");
            Ok(())
        } else {
            warn!(lock = %self.name, "lock was lost before release");
            Err(CoreError::LockConflict {
                name: self.name.clone(),
            })
        }
    }

    /// Run a compound critical section under the lock.
    ///
    /// The lock is released on every exit path. If the hold was lost to TTL
    /// expiry while the section ran, the section's result is replaced by a
    /// lock-conflict error so the caller knows the sequence may have
    /// interleaved with another worker.
    pub async fn run_atomic<F, Fut, T>(&self, section: F) -> Result<T, CoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        let guard = self.acquire().await?;
        let result = section().await;
        let released = self.store.release(&self.name, guard.owner).await?;

        match result {
            Ok(_) if !released => Err(CoreError::LockConflict {
                name: self.name.clone(),
            }),
            other => other,
        }
    }
}
