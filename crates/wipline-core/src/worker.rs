// Copyright (C) 2025 Wipline Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background workers.
//!
//! [`TaskWorker`] polls the scheduler and drives claimed tasks through the
//! executor. [`ReconcileWorker`] recovers ledger slots and stale claims left
//! by crashed workers. [`PruneWorker`] deletes completed tasks and consumed
//! signals past the retention horizon. All loops shut down through a
//! `Notify` handle and isolate per-item errors so one bad task never stalls
//! the sweep.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info};
use wipline_dsl::CompiledTable;

use crate::actions::ActionRegistry;
use crate::error::CoreError;
use crate::executor::{RunOutcome, StateMachineExecutor};
use crate::persistence::TaskEvent;
use crate::scheduler::TaskPoolScheduler;
use crate::task::{ExitStatus, Task, TaskStatus};

/// A named workflow definition: compiled table plus bound actions.
#[derive(Clone)]
pub struct WipDefinition {
    /// Name tasks reference via `wip_name`.
    pub name: String,
    /// The compiled state table.
    pub table: Arc<CompiledTable>,
    /// Actions bound against the table.
    pub actions: Arc<ActionRegistry>,
}

impl WipDefinition {
    /// Bundle a compiled table with its action registry.
    pub fn new(
        name: impl Into<String>,
        table: Arc<CompiledTable>,
        actions: Arc<ActionRegistry>,
    ) -> Self {
        Self {
            name: name.into(),
            table,
            actions,
        }
    }
}

/// Poll-loop tuning for the task worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How often to poll for runnable tasks.
    pub poll_interval: Duration,
    /// Maximum tasks to claim per poll.
    pub batch_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 10,
        }
    }
}

/// Claims runnable tasks and drives their state machines.
pub struct TaskWorker {
    scheduler: Arc<TaskPoolScheduler>,
    executors: HashMap<String, Arc<StateMachineExecutor>>,
    config: WorkerConfig,
    shutdown: Arc<Notify>,
}

impl TaskWorker {
    /// Create a worker over the scheduler and per-definition executors.
    pub fn new(
        scheduler: Arc<TaskPoolScheduler>,
        executors: HashMap<String, Arc<StateMachineExecutor>>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            scheduler,
            executors,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the poll loop until shutdown.
    pub async fn run(self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            batch_size = self.config.batch_size,
            definitions = self.executors.len(),
            "Task worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Task worker shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.process_batch().await {
                        error!(error = %e, "Failed to process task batch");
                    }
                }
            }
        }
    }

    /// Claim and drive one batch. Per-task errors release the claim and
    /// continue with the rest of the batch.
    pub async fn process_batch(&self) -> Result<(), CoreError> {
        let tasks = self
            .scheduler
            .get_next_runnable_tasks(self.config.batch_size)
            .await?;
        if tasks.is_empty() {
            debug!("No runnable tasks");
            return Ok(());
        }

        for mut task in tasks {
            if let Err(e) = self.drive(&mut task).await {
                error!(task = %task.task_id, error = %e, "Failed to drive task");
                let _ = self
                    .scheduler
                    .task_store()
                    .release_claim(task.task_id, TaskStatus::Restarted)
                    .await;
            }
        }
        Ok(())
    }

    /// Run one claimed task until it suspends or completes, then persist.
    async fn drive(&self, task: &mut Task) -> Result<(), CoreError> {
        let store = self.scheduler.task_store().clone();

        let Some(executor) = self.executors.get(&task.wip_name) else {
            // No registered definition: the task can never make progress.
            task.status = TaskStatus::Complete;
            task.exit_status = ExitStatus::ErrorSystem;
            task.exit_message = Some(format!(
                "no workflow definition registered for '{}'",
                task.wip_name
            ));
            task.finished_at = Some(Utc::now());
            task.claimed_timestamp = None;
            store.update_task(task).await?;
            self.scheduler.stop_progress(task).await?;
            return Ok(());
        };

        match executor.run(task).await? {
            RunOutcome::Suspended { until } => {
                // Hand the claim back; the wake time gates the next claim.
                task.claimed_timestamp = None;
                store.update_task(task).await?;
                store
                    .insert_task_event(&TaskEvent::now(
                        task.task_id,
                        "suspended",
                        Some(format!("until {}", until)),
                    ))
                    .await?;
            }
            RunOutcome::Completed { exit } => {
                task.claimed_timestamp = None;
                store.update_task(task).await?;
                self.scheduler.stop_progress(task).await?;
                store
                    .insert_task_event(&TaskEvent::now(
                        task.task_id,
                        "completed",
                        Some(exit.as_str().to_string()),
                    ))
                    .await?;
            }
        }
        Ok(())
    }
}

/// Reconcile-loop tuning.
#[derive(Debug, Clone)]
pub struct ReconcileWorkerConfig {
    /// How often to sweep.
    pub poll_interval: Duration,
    /// Claims older than this on non-terminal tasks are released.
    pub reclaim_after: Duration,
}

impl Default for ReconcileWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            reclaim_after: Duration::from_secs(900),
        }
    }
}

impl ReconcileWorkerConfig {
    /// Load from environment variables.
    ///
    /// - `WIPLINE_RECONCILE_POLL_INTERVAL_SECS`: seconds between sweeps
    ///   (default: 60)
    /// - `WIPLINE_RECLAIM_AFTER_SECS`: claim staleness horizon (default:
    ///   900)
    pub fn from_env() -> Self {
        let poll_interval_secs = std::env::var("WIPLINE_RECONCILE_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(60);
        let reclaim_after_secs = std::env::var("WIPLINE_RECLAIM_AFTER_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(900);
        Self {
            poll_interval: Duration::from_secs(poll_interval_secs),
            reclaim_after: Duration::from_secs(reclaim_after_secs),
        }
    }
}

/// Recovers concurrency slots and claims left behind by crashed workers.
pub struct ReconcileWorker {
    scheduler: Arc<TaskPoolScheduler>,
    config: ReconcileWorkerConfig,
    shutdown: Arc<Notify>,
}

impl ReconcileWorker {
    /// Create a reconcile worker.
    pub fn new(scheduler: Arc<TaskPoolScheduler>, config: ReconcileWorkerConfig) -> Self {
        Self {
            scheduler,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the sweep loop until shutdown.
    pub async fn run(self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            reclaim_after_secs = self.config.reclaim_after.as_secs(),
            "Reconcile worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Reconcile worker shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "Reconcile sweep failed");
                    }
                }
            }
        }
    }

    /// One reconciliation pass.
    pub async fn sweep(&self) -> Result<(), CoreError> {
        self.scheduler.cleanup_concurrency().await?;
        let horizon = Utc::now()
            - chrono::Duration::from_std(self.config.reclaim_after).unwrap_or_else(|_| {
                chrono::Duration::seconds(900)
            });
        self.scheduler.release_stale_claims(horizon).await?;
        Ok(())
    }
}

/// Prune-loop tuning.
#[derive(Debug, Clone)]
pub struct PruneWorkerConfig {
    /// Whether retention pruning is enabled.
    pub enabled: bool,
    /// How often to prune.
    pub poll_interval: Duration,
    /// Age past which completed tasks are deleted.
    pub max_age: Duration,
    /// Maximum tasks deleted per pass.
    pub batch_size: i64,
}

impl Default for PruneWorkerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval: Duration::from_secs(3600),
            max_age: Duration::from_secs(30 * 24 * 3600),
            batch_size: 100,
        }
    }
}

impl PruneWorkerConfig {
    /// Load from environment variables.
    ///
    /// - `WIPLINE_PRUNE_ENABLED`: "true" or "1" to enable (default: false)
    /// - `WIPLINE_PRUNE_POLL_INTERVAL_SECS`: seconds between passes
    ///   (default: 3600)
    /// - `WIPLINE_PRUNE_MAX_AGE_DAYS`: retention horizon in days (default:
    ///   30)
    /// - `WIPLINE_PRUNE_BATCH_SIZE`: max tasks per pass (default: 100)
    pub fn from_env() -> Self {
        let enabled = std::env::var("WIPLINE_PRUNE_ENABLED")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);
        let poll_interval_secs = std::env::var("WIPLINE_PRUNE_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3600);
        let max_age_days = std::env::var("WIPLINE_PRUNE_MAX_AGE_DAYS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(30);
        let batch_size = std::env::var("WIPLINE_PRUNE_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(100);
        Self {
            enabled,
            poll_interval: Duration::from_secs(poll_interval_secs),
            max_age: Duration::from_secs(max_age_days * 24 * 3600),
            batch_size,
        }
    }
}

/// Deletes completed tasks and consumed signals past the retention horizon.
pub struct PruneWorker {
    scheduler: Arc<TaskPoolScheduler>,
    config: PruneWorkerConfig,
    shutdown: Arc<Notify>,
}

impl PruneWorker {
    /// Create a prune worker.
    pub fn new(scheduler: Arc<TaskPoolScheduler>, config: PruneWorkerConfig) -> Self {
        Self {
            scheduler,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the prune loop until shutdown.
    pub async fn run(self) {
        if !self.config.enabled {
            info!("Prune worker disabled");
            return;
        }
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            max_age_secs = self.config.max_age.as_secs(),
            batch_size = self.config.batch_size,
            "Prune worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Prune worker shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "Prune pass failed");
                    }
                }
            }
        }
    }

    /// One retention pass.
    pub async fn sweep(&self) -> Result<(), CoreError> {
        let horizon = Utc::now()
            - chrono::Duration::from_std(self.config.max_age)
                .unwrap_or_else(|_| chrono::Duration::days(30));
        self.scheduler.prune(horizon, self.config.batch_size).await?;
        self.scheduler.prune_signals(horizon).await?;
        Ok(())
    }
}
