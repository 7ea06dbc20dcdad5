// Copyright (C) 2025 Wipline Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The task pool scheduler.
//!
//! Selects the next runnable tasks from shared storage under priority
//! ordering, per-group concurrency limits and work-id exclusivity, safely
//! across concurrent claimers on different machines. Single-statement
//! atomicity comes from the storage ports; the row lock covers the one
//! compound operation (hard group pause) that spans several statements.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::CoreError;
use crate::lock::{RowLock, RowLockConfig};
use crate::logsink::{LogLevel, LogSink};
use crate::persistence::{LockStore, PauseMode, SignalStore, TaskEvent, TaskStore};
use crate::signals::Signal;
use crate::task::{Task, TaskStatus};

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Headroom for groups that were never explicitly configured.
    pub default_max_count: i64,
    /// How many candidates to fetch per requested claim; extra candidates
    /// absorb claims lost to concurrent pollers.
    pub claim_fetch_factor: i64,
    /// Row lock tuning for compound operations.
    pub lock: RowLockConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_max_count: 8,
            claim_fetch_factor: 4,
            lock: RowLockConfig::default(),
        }
    }
}

/// Which pause to apply to a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseKind {
    /// Block new claims; in-flight tasks finish.
    Soft,
    /// Block new claims and request termination of in-flight tasks.
    Hard,
}

/// Persists tasks and hands them out to workers.
pub struct TaskPoolScheduler {
    tasks: Arc<dyn TaskStore>,
    signals: Arc<dyn SignalStore>,
    locks: Arc<dyn LockStore>,
    log: Arc<dyn LogSink>,
    config: SchedulerConfig,
}

impl TaskPoolScheduler {
    /// Create a scheduler over the storage ports.
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        signals: Arc<dyn SignalStore>,
        locks: Arc<dyn LockStore>,
        log: Arc<dyn LogSink>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            tasks,
            signals,
            locks,
            log,
            config,
        }
    }

    /// The task store this scheduler runs against.
    pub fn task_store(&self) -> &Arc<dyn TaskStore> {
        &self.tasks
    }

    /// The signal store this scheduler runs against.
    pub fn signal_store(&self) -> &Arc<dyn SignalStore> {
        &self.signals
    }

    /// Persist a new task.
    ///
    /// Fails with [`CoreError::WorkIdConflict`] when a task with the same
    /// work-id is already WAITING or PROCESSING. A second NOT_STARTED task
    /// with the same work-id is accepted and serialized at claim time.
    pub async fn enqueue(&self, task: Task) -> Result<Task, CoreError> {
        self.ensure_group(&task.group_name).await?;

        if !self.tasks.insert_task(&task).await? {
            let work_id = task.work_id.clone().unwrap_or_default();
            return Err(CoreError::WorkIdConflict { work_id });
        }

        self.tasks
            .insert_task_event(&TaskEvent::now(task.task_id, "enqueued", None))
            .await?;
        debug!(task = %task.task_id, group = %task.group_name, "task enqueued");
        Ok(task)
    }

    /// Claim up to `limit` runnable tasks for this worker.
    ///
    /// Candidates are ordered resuming-waiters first, then priority, then
    /// wake time. Each claim is a storage-level atomic conditional update;
    /// a candidate lost to a concurrent poller, a paused group, missing
    /// ledger headroom or an active work-id holder is skipped.
    pub async fn get_next_runnable_tasks(&self, limit: usize) -> Result<Vec<Task>, CoreError> {
        let now = Utc::now();
        let fetch = (limit as i64).saturating_mul(self.config.claim_fetch_factor);
        let candidates = self.tasks.runnable_candidates(now, fetch.max(1)).await?;

        let mut claimed = Vec::new();
        for candidate in candidates {
            if claimed.len() >= limit {
                break;
            }

            let group = self.tasks.get_group(&candidate.group_name).await?;
            if group
                .as_ref()
                .is_some_and(|g| g.pause_mode.blocks_claims())
            {
                continue;
            }
            let max_count = group
                .map(|g| g.max_count)
                .unwrap_or(self.config.default_max_count);

            let resuming = self.tasks.ledger_contains(candidate.task_id).await?;
            if !resuming && self.tasks.ledger_count(&candidate.group_name).await? >= max_count {
                continue;
            }

            if !self.tasks.claim_task(candidate.task_id, now).await? {
                continue;
            }

            // The ledger insert is the atomic headroom check; losing it
            // hands the claim back.
            if !self
                .tasks
                .ledger_insert(&candidate.group_name, candidate.task_id, max_count)
                .await?
            {
                self.tasks
                    .release_claim(candidate.task_id, candidate.status)
                    .await?;
                continue;
            }

            self.tasks
                .insert_task_event(&TaskEvent::now(candidate.task_id, "claimed", None))
                .await?;

            let task = self
                .tasks
                .get_task(candidate.task_id)
                .await?
                .ok_or(CoreError::TaskNotFound {
                    task_id: candidate.task_id,
                })?;
            claimed.push(task);
        }

        if !claimed.is_empty() {
            debug!(count = claimed.len(), "claimed runnable tasks");
        }
        Ok(claimed)
    }

    /// Take a concurrency ledger slot for the task. Idempotent while held.
    pub async fn start_progress(&self, task: &Task) -> Result<bool, CoreError> {
        let max_count = self
            .tasks
            .get_group(&task.group_name)
            .await?
            .map(|g| g.max_count)
            .unwrap_or(self.config.default_max_count);
        self.tasks
            .ledger_insert(&task.group_name, task.task_id, max_count)
            .await
    }

    /// Release the task's ledger slot.
    ///
    /// Only COMPLETE tasks release: a WAITING task keeps its slot reserved
    /// across suspend/resume. Returns false when nothing was released.
    pub async fn stop_progress(&self, task: &Task) -> Result<bool, CoreError> {
        if task.status != TaskStatus::Complete {
            return Ok(false);
        }
        let removed = self
            .tasks
            .ledger_remove(&task.group_name, task.task_id)
            .await?;
        if removed {
            self.tasks
                .insert_task_event(&TaskEvent::now(task.task_id, "slot_released", None))
                .await?;
        }
        Ok(removed)
    }

    /// Reconciliation sweep: drop ledger slots whose task completed (or
    /// vanished) without a matching `stop_progress` - the residue of a
    /// crashed worker. Returns the number of slots recovered.
    pub async fn cleanup_concurrency(&self) -> Result<u64, CoreError> {
        let orphaned = self.tasks.orphaned_ledger_entries().await?;
        let mut recovered = 0u64;
        for entry in orphaned {
            if self
                .tasks
                .ledger_remove(&entry.group_name, entry.task_id)
                .await?
            {
                recovered += 1;
                warn!(
                    task = %entry.task_id,
                    group = %entry.group_name,
                    "recovered orphaned ledger slot"
                );
            }
        }
        if recovered > 0 {
            self.log.log(
                LogLevel::Info,
                &format!("recovered {} orphaned concurrency slots", recovered),
                None,
                false,
            );
        }
        Ok(recovered)
    }

    /// Release claims held longer than `older_than` by workers that
    /// presumably crashed. The tasks become RESTARTED and claimable again;
    /// their ledger slots stay reserved. Returns the number released.
    pub async fn release_stale_claims(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<u64, CoreError> {
        let stale = self.tasks.stale_claims(older_than).await?;
        let mut released = 0u64;
        for task in stale {
            self.tasks
                .release_claim(task.task_id, TaskStatus::Restarted)
                .await?;
            self.tasks
                .insert_task_event(&TaskEvent::now(
                    task.task_id,
                    "claim_released",
                    Some("stale claim recovered".to_string()),
                ))
                .await?;
            released += 1;
            warn!(task = %task.task_id, "released stale claim");
        }
        Ok(released)
    }

    /// Pause a group.
    ///
    /// Soft blocks new claims. Hard additionally requests termination of
    /// every in-flight task in the group; pause flag and signal fan-out run
    /// under the row lock so no concurrent claimer can interleave.
    pub async fn pause_group(&self, group: &str, kind: PauseKind) -> Result<(), CoreError> {
        match kind {
            PauseKind::Soft => {
                if !self.tasks.set_group_pause(group, PauseMode::Soft).await? {
                    return Err(CoreError::GroupNotFound {
                        group: group.to_string(),
                    });
                }
                info!(group = %group, "group soft paused");
                Ok(())
            }
            PauseKind::Hard => {
                let lock = RowLock::new(
                    self.locks.clone(),
                    format!("group-pause:{}", group),
                    self.config.lock.clone(),
                );
                let tasks = &self.tasks;
                let signals = &self.signals;
                lock.run_atomic(|| async move {
                    if !tasks.set_group_pause(group, PauseMode::Hard).await? {
                        return Err(CoreError::GroupNotFound {
                            group: group.to_string(),
                        });
                    }
                    let in_flight = tasks.active_tasks_in_group(group).await?;
                    for task in &in_flight {
                        signals
                            .send(&Signal::terminate(
                                task.task_id,
                                format!("group '{}' hard paused", group),
                            ))
                            .await?;
                    }
                    info!(
                        group = %group,
                        in_flight = in_flight.len(),
                        "group hard paused, termination requested"
                    );
                    Ok(())
                })
                .await
            }
        }
    }

    /// Lift a group's pause.
    pub async fn resume_group(&self, group: &str) -> Result<(), CoreError> {
        if !self.tasks.set_group_pause(group, PauseMode::None).await? {
            return Err(CoreError::GroupNotFound {
                group: group.to_string(),
            });
        }
        info!(group = %group, "group resumed");
        Ok(())
    }

    /// Configure a group's concurrency limit, creating it if needed.
    pub async fn set_group_limit(&self, group: &str, max_count: i64) -> Result<(), CoreError> {
        self.tasks.upsert_group(group, max_count).await
    }

    /// Make a NOT_READY task claimable.
    pub async fn mark_ready(&self, task_id: Uuid) -> Result<bool, CoreError> {
        self.tasks.mark_ready(task_id).await
    }

    /// Delete COMPLETE tasks (with their serialized contexts) finished
    /// before the horizon, bounded per call. Returns the deleted count.
    pub async fn prune(&self, before: DateTime<Utc>, limit: i64) -> Result<u64, CoreError> {
        let deleted = self.tasks.delete_complete_before(before, limit).await?;
        if deleted > 0 {
            info!(deleted, "pruned completed tasks");
        }
        Ok(deleted)
    }

    /// Delete consumed signals older than the horizon.
    pub async fn prune_signals(&self, before: DateTime<Utc>) -> Result<u64, CoreError> {
        self.signals.prune_consumed_before(before).await
    }

    async fn ensure_group(&self, group: &str) -> Result<(), CoreError> {
        if self.tasks.get_group(group).await?.is_none() {
            self.tasks
                .upsert_group(group, self.config.default_max_count)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logsink::TracingLogSink;
    use crate::persistence::MemoryStore;
    use crate::task::Priority;

    fn scheduler() -> (Arc<MemoryStore>, TaskPoolScheduler) {
        let store = Arc::new(MemoryStore::new());
        let scheduler = TaskPoolScheduler::new(
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(TracingLogSink),
            SchedulerConfig::default(),
        );
        (store, scheduler)
    }

    #[tokio::test]
    async fn test_enqueue_and_claim() {
        let (_, scheduler) = scheduler();
        let task = scheduler.enqueue(Task::new("deploy")).await.unwrap();
        let claimed = scheduler.get_next_runnable_tasks(10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].task_id, task.task_id);
        assert_eq!(claimed[0].status, TaskStatus::Processing);
        assert!(claimed[0].claimed_timestamp.is_some());
    }

    #[tokio::test]
    async fn test_enqueue_rejects_active_work_id() {
        let (_, scheduler) = scheduler();
        let first = scheduler
            .enqueue(Task::new("deploy").with_work_id("X"))
            .await
            .unwrap();
        // Claim it so it becomes an active holder.
        scheduler.get_next_runnable_tasks(1).await.unwrap();
        let _ = first;

        let err = scheduler
            .enqueue(Task::new("deploy").with_work_id("X"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::WorkIdConflict { work_id } if work_id == "X"));
    }

    #[tokio::test]
    async fn test_priority_ordering() {
        let (_, scheduler) = scheduler();
        let low = scheduler
            .enqueue(Task::new("a").with_priority(Priority::Low))
            .await
            .unwrap();
        let critical = scheduler
            .enqueue(Task::new("b").with_priority(Priority::Critical))
            .await
            .unwrap();

        let claimed = scheduler.get_next_runnable_tasks(2).await.unwrap();
        assert_eq!(claimed[0].task_id, critical.task_id);
        assert_eq!(claimed[1].task_id, low.task_id);
    }

    #[tokio::test]
    async fn test_soft_pause_blocks_claims() {
        let (_, scheduler) = scheduler();
        scheduler
            .enqueue(Task::new("deploy").with_group("g"))
            .await
            .unwrap();
        scheduler.pause_group("g", PauseKind::Soft).await.unwrap();
        assert!(scheduler.get_next_runnable_tasks(1).await.unwrap().is_empty());

        scheduler.resume_group("g").await.unwrap();
        assert_eq!(scheduler.get_next_runnable_tasks(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_hard_pause_sends_terminate_signals() {
        let (store, scheduler) = scheduler();
        scheduler
            .enqueue(Task::new("deploy").with_group("g"))
            .await
            .unwrap();
        let claimed = scheduler.get_next_runnable_tasks(1).await.unwrap();
        let task_id = claimed[0].task_id;

        scheduler.pause_group("g", PauseKind::Hard).await.unwrap();

        let signals = crate::persistence::SignalStore::load_all_active(store.as_ref(), task_id)
            .await
            .unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(
            signals[0].signal_type,
            crate::signals::SignalType::Terminate
        );
    }

    #[tokio::test]
    async fn test_pause_unknown_group_errors() {
        let (_, scheduler) = scheduler();
        let err = scheduler.pause_group("ghost", PauseKind::Soft).await.unwrap_err();
        assert!(matches!(err, CoreError::GroupNotFound { .. }));
    }

    #[tokio::test]
    async fn test_cleanup_concurrency_recovers_orphans() {
        let (store, scheduler) = scheduler();
        let task = scheduler.enqueue(Task::new("deploy")).await.unwrap();
        let mut claimed = scheduler
            .get_next_runnable_tasks(1)
            .await
            .unwrap()
            .remove(0);

        // Worker crashes after completing the task but before stop_progress.
        claimed.status = TaskStatus::Complete;
        claimed.finished_at = Some(Utc::now());
        store.update_task(&claimed).await.unwrap();

        assert_eq!(store.ledger_count("default").await.unwrap(), 1);
        let recovered = scheduler.cleanup_concurrency().await.unwrap();
        assert_eq!(recovered, 1);
        assert_eq!(store.ledger_count("default").await.unwrap(), 0);
        let _ = task;
    }

    #[tokio::test]
    async fn test_stale_claim_release_restarts_task() {
        let (store, scheduler) = scheduler();
        scheduler.enqueue(Task::new("deploy")).await.unwrap();
        let claimed = scheduler.get_next_runnable_tasks(1).await.unwrap();
        let task_id = claimed[0].task_id;

        let released = scheduler
            .release_stale_claims(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(released, 1);

        let task = store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Restarted);
        assert!(task.claimed_timestamp.is_none());

        // Restarted tasks are claimable again and keep their ledger slot.
        let reclaimed = scheduler.get_next_runnable_tasks(1).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].task_id, task_id);
    }
}
