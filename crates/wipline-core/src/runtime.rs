// Copyright (C) 2025 Wipline Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable worker runtime.
//!
//! [`WorkerRuntime`] lets an application embed the scheduler, executor and
//! background workers in its own tokio process instead of running the
//! standalone daemon. Dependencies are passed explicitly at construction;
//! there is no global registry.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use wipline_core::persistence::SqliteStore;
//! use wipline_core::runtime::WorkerRuntime;
//! use wipline_core::worker::WipDefinition;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(SqliteStore::from_path(".data/wipline.db").await?);
//!
//!     let runtime = WorkerRuntime::builder()
//!         .single_store(store)
//!         .definition(WipDefinition::new("deploy", table, actions))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... run your application ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::executor::{ExecutorConfig, StateMachineExecutor};
use crate::logsink::{LogSink, TracingLogSink};
use crate::persistence::{LockStore, SignalStore, TaskStore};
use crate::scheduler::{SchedulerConfig, TaskPoolScheduler};
use crate::worker::{
    PruneWorker, PruneWorkerConfig, ReconcileWorker, ReconcileWorkerConfig, TaskWorker,
    WorkerConfig, WipDefinition,
};

/// Builder for a [`WorkerRuntime`].
pub struct WorkerRuntimeBuilder {
    tasks: Option<Arc<dyn TaskStore>>,
    signals: Option<Arc<dyn SignalStore>>,
    locks: Option<Arc<dyn LockStore>>,
    log: Arc<dyn LogSink>,
    definitions: Vec<WipDefinition>,
    scheduler_config: SchedulerConfig,
    executor_config: ExecutorConfig,
    worker_config: WorkerConfig,
    reconcile_config: ReconcileWorkerConfig,
    prune_config: PruneWorkerConfig,
}

impl std::fmt::Debug for WorkerRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRuntimeBuilder")
            .field("tasks", &self.tasks.as_ref().map(|_| "..."))
            .field("definitions", &self.definitions.len())
            .finish()
    }
}

impl Default for WorkerRuntimeBuilder {
    fn default() -> Self {
        Self {
            tasks: None,
            signals: None,
            locks: None,
            log: Arc::new(TracingLogSink),
            definitions: Vec::new(),
            scheduler_config: SchedulerConfig::default(),
            executor_config: ExecutorConfig::default(),
            worker_config: WorkerConfig::default(),
            reconcile_config: ReconcileWorkerConfig::default(),
            prune_config: PruneWorkerConfig::default(),
        }
    }
}

impl WorkerRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the task store (required).
    pub fn task_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.tasks = Some(store);
        self
    }

    /// Set the signal store (required).
    pub fn signal_store(mut self, store: Arc<dyn SignalStore>) -> Self {
        self.signals = Some(store);
        self
    }

    /// Set the lock store (required).
    pub fn lock_store(mut self, store: Arc<dyn LockStore>) -> Self {
        self.locks = Some(store);
        self
    }

    /// Use one backend for all three storage ports.
    pub fn single_store<S>(self, store: Arc<S>) -> Self
    where
        S: TaskStore + SignalStore + LockStore + 'static,
    {
        self.task_store(store.clone())
            .signal_store(store.clone())
            .lock_store(store)
    }

    /// Replace the default tracing log sink.
    pub fn log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log = sink;
        self
    }

    /// Register a workflow definition.
    pub fn definition(mut self, definition: WipDefinition) -> Self {
        self.definitions.push(definition);
        self
    }

    /// Override the scheduler configuration.
    pub fn scheduler_config(mut self, config: SchedulerConfig) -> Self {
        self.scheduler_config = config;
        self
    }

    /// Override the executor configuration.
    pub fn executor_config(mut self, config: ExecutorConfig) -> Self {
        self.executor_config = config;
        self
    }

    /// Override the task worker configuration.
    pub fn worker_config(mut self, config: WorkerConfig) -> Self {
        self.worker_config = config;
        self
    }

    /// Override the reconcile worker configuration.
    pub fn reconcile_config(mut self, config: ReconcileWorkerConfig) -> Self {
        self.reconcile_config = config;
        self
    }

    /// Override the prune worker configuration.
    pub fn prune_config(mut self, config: PruneWorkerConfig) -> Self {
        self.prune_config = config;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if a required store is missing.
    pub fn build(self) -> Result<WorkerRuntimeConfig> {
        let tasks = self
            .tasks
            .ok_or_else(|| anyhow::anyhow!("task store is required"))?;
        let signals = self
            .signals
            .ok_or_else(|| anyhow::anyhow!("signal store is required"))?;
        let locks = self
            .locks
            .ok_or_else(|| anyhow::anyhow!("lock store is required"))?;

        Ok(WorkerRuntimeConfig {
            tasks,
            signals,
            locks,
            log: self.log,
            definitions: self.definitions,
            scheduler_config: self.scheduler_config,
            executor_config: self.executor_config,
            worker_config: self.worker_config,
            reconcile_config: self.reconcile_config,
            prune_config: self.prune_config,
        })
    }
}

/// Built configuration, ready to start.
pub struct WorkerRuntimeConfig {
    tasks: Arc<dyn TaskStore>,
    signals: Arc<dyn SignalStore>,
    locks: Arc<dyn LockStore>,
    log: Arc<dyn LogSink>,
    definitions: Vec<WipDefinition>,
    scheduler_config: SchedulerConfig,
    executor_config: ExecutorConfig,
    worker_config: WorkerConfig,
    reconcile_config: ReconcileWorkerConfig,
    prune_config: PruneWorkerConfig,
}

impl std::fmt::Debug for WorkerRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRuntimeConfig")
            .field("definitions", &self.definitions.len())
            .finish()
    }
}

impl WorkerRuntimeConfig {
    /// Start the runtime: spawns the task worker, the reconcile worker and
    /// (if enabled) the prune worker.
    pub async fn start(self) -> Result<WorkerRuntime> {
        let scheduler = Arc::new(TaskPoolScheduler::new(
            self.tasks,
            self.signals.clone(),
            self.locks,
            self.log.clone(),
            self.scheduler_config,
        ));

        let mut executors = HashMap::new();
        for definition in &self.definitions {
            let executor = Arc::new(StateMachineExecutor::new(
                definition.table.clone(),
                definition.actions.clone(),
                self.signals.clone(),
                self.log.clone(),
                self.executor_config.clone(),
            ));
            executors.insert(definition.name.clone(), executor);
        }

        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        let mut shutdowns: Vec<Arc<Notify>> = Vec::new();

        let worker = TaskWorker::new(scheduler.clone(), executors, self.worker_config);
        shutdowns.push(worker.shutdown_handle());
        handles.push(tokio::spawn(worker.run()));

        let reconcile = ReconcileWorker::new(scheduler.clone(), self.reconcile_config);
        shutdowns.push(reconcile.shutdown_handle());
        handles.push(tokio::spawn(reconcile.run()));

        if self.prune_config.enabled {
            let prune = PruneWorker::new(scheduler.clone(), self.prune_config);
            shutdowns.push(prune.shutdown_handle());
            handles.push(tokio::spawn(prune.run()));
        }

        info!(
            definitions = self.definitions.len(),
            workers = handles.len(),
            "WorkerRuntime started"
        );

        Ok(WorkerRuntime {
            scheduler,
            handles,
            shutdowns,
        })
    }
}

/// A running wipline worker that can be embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct WorkerRuntime {
    scheduler: Arc<TaskPoolScheduler>,
    handles: Vec<JoinHandle<()>>,
    shutdowns: Vec<Arc<Notify>>,
}

impl WorkerRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> WorkerRuntimeBuilder {
        WorkerRuntimeBuilder::new()
    }

    /// The scheduler, for enqueueing tasks and operator actions.
    pub fn scheduler(&self) -> &Arc<TaskPoolScheduler> {
        &self.scheduler
    }

    /// True while every worker loop is still running.
    pub fn is_running(&self) -> bool {
        self.handles.iter().any(|h| !h.is_finished())
    }

    /// Gracefully shut down all worker loops.
    pub async fn shutdown(self) -> Result<()> {
        info!("WorkerRuntime shutting down...");
        for shutdown in &self.shutdowns {
            shutdown.notify_one();
        }
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Worker task panicked: {}", e);
                return Err(anyhow::anyhow!("worker task panicked: {}", e));
            }
        }
        info!("WorkerRuntime shutdown complete");
        Ok(())
    }
}
