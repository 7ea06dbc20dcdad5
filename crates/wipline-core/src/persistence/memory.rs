// Copyright (C) 2025 Wipline Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory storage backend.
//!
//! Implements all three ports behind a single mutex, mirroring the
//! conditional semantics of the SQL backends (claim guards, ledger caps,
//! work-id uniqueness). Used by tests and by embedders that do not need
//! durability.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::error::CoreError;
use crate::signals::Signal;
use crate::task::{Task, TaskStatus};

use super::{
    GroupRecord, LedgerEntry, LockRecord, LockStore, PauseMode, SignalStore, TaskEvent, TaskStore,
};

#[derive(Default)]
struct MemoryInner {
    tasks: HashMap<Uuid, Task>,
    ledger: Vec<LedgerEntry>,
    groups: HashMap<String, GroupRecord>,
    signals: HashMap<String, Signal>,
    locks: HashMap<String, LockRecord>,
    events: Vec<TaskEvent>,
    next_event_id: i64,
}

/// In-memory implementation of every storage port.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().expect("memory store poisoned")
    }
}

impl MemoryInner {
    /// True when another task actively holds this work-id.
    fn work_id_held(&self, work_id: &str, except: Uuid) -> bool {
        self.tasks.values().any(|t| {
            t.task_id != except
                && t.work_id.as_deref() == Some(work_id)
                && t.status.holds_work_id()
        })
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn insert_task(&self, task: &Task) -> Result<bool, CoreError> {
        let mut inner = self.lock();
        if inner.tasks.contains_key(&task.task_id) {
            return Err(CoreError::DatabaseError {
                operation: "insert_task".to_string(),
                details: format!("duplicate task id {}", task.task_id),
            });
        }
        if let Some(work_id) = &task.work_id {
            if inner.work_id_held(work_id, task.task_id) {
                return Ok(false);
            }
        }
        inner.tasks.insert(task.task_id, task.clone());
        Ok(true)
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>, CoreError> {
        Ok(self.lock().tasks.get(&task_id).cloned())
    }

    async fn update_task(&self, task: &Task) -> Result<(), CoreError> {
        let mut inner = self.lock();
        if !inner.tasks.contains_key(&task.task_id) {
            return Err(CoreError::TaskNotFound {
                task_id: task.task_id,
            });
        }
        inner.tasks.insert(task.task_id, task.clone());
        Ok(())
    }

    async fn mark_ready(&self, task_id: Uuid) -> Result<bool, CoreError> {
        let mut inner = self.lock();
        match inner.tasks.get_mut(&task_id) {
            Some(task) if task.status == TaskStatus::NotReady => {
                task.status = TaskStatus::NotStarted;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(CoreError::TaskNotFound { task_id }),
        }
    }

    async fn runnable_candidates(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Task>, CoreError> {
        let inner = self.lock();
        let mut candidates: Vec<&Task> = inner
            .tasks
            .values()
            .filter(|t| {
                t.is_claimable() && t.wake_timestamp.is_none_or(|wake| wake <= now)
            })
            .collect();
        candidates.sort_by_key(|t| {
            let fresh = !inner.ledger.iter().any(|l| l.task_id == t.task_id);
            (
                fresh,
                t.priority.rank(),
                t.wake_timestamp.unwrap_or(t.created_at),
            )
        });
        Ok(candidates
            .into_iter()
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn claim_task(&self, task_id: Uuid, now: DateTime<Utc>) -> Result<bool, CoreError> {
        let mut inner = self.lock();
        let Some(task) = inner.tasks.get(&task_id) else {
            return Ok(false);
        };
        if !task.is_claimable() {
            return Ok(false);
        }
        if let Some(work_id) = task.work_id.clone() {
            if inner.work_id_held(&work_id, task_id) {
                return Ok(false);
            }
        }
        let task = inner.tasks.get_mut(&task_id).expect("task present");
        task.claimed_timestamp = Some(now);
        task.status = TaskStatus::Processing;
        Ok(true)
    }

    async fn release_claim(&self, task_id: Uuid, restore_to: TaskStatus) -> Result<(), CoreError> {
        let mut inner = self.lock();
        let task = inner
            .tasks
            .get_mut(&task_id)
            .ok_or(CoreError::TaskNotFound { task_id })?;
        task.claimed_timestamp = None;
        task.status = restore_to;
        Ok(())
    }

    async fn stale_claims(&self, older_than: DateTime<Utc>) -> Result<Vec<Task>, CoreError> {
        let inner = self.lock();
        Ok(inner
            .tasks
            .values()
            .filter(|t| {
                !t.status.is_terminal()
                    && t.claimed_timestamp.is_some_and(|claimed| claimed < older_than)
            })
            .cloned()
            .collect())
    }

    async fn children_of(&self, parent_id: Uuid) -> Result<Vec<Task>, CoreError> {
        let inner = self.lock();
        let mut children: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| t.parent_id == Some(parent_id))
            .cloned()
            .collect();
        children.sort_by_key(|t| t.created_at);
        Ok(children)
    }

    async fn active_tasks_in_group(&self, group: &str) -> Result<Vec<Task>, CoreError> {
        let inner = self.lock();
        Ok(inner
            .tasks
            .values()
            .filter(|t| t.group_name == group && t.status.holds_work_id())
            .cloned()
            .collect())
    }

    async fn delete_complete_before(
        &self,
        horizon: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, CoreError> {
        let mut inner = self.lock();
        let mut victims: Vec<(DateTime<Utc>, Uuid)> = inner
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Complete
                    && t.finished_at.is_some_and(|finished| finished < horizon)
            })
            .map(|t| (t.finished_at.expect("finished"), t.task_id))
            .collect();
        victims.sort();
        victims.truncate(limit.max(0) as usize);
        for (_, id) in &victims {
            inner.tasks.remove(id);
        }
        Ok(victims.len() as u64)
    }

    async fn ledger_insert(
        &self,
        group: &str,
        task_id: Uuid,
        max_count: i64,
    ) -> Result<bool, CoreError> {
        let mut inner = self.lock();
        if inner
            .ledger
            .iter()
            .any(|l| l.group_name == group && l.task_id == task_id)
        {
            return Ok(true);
        }
        let active = inner.ledger.iter().filter(|l| l.group_name == group).count() as i64;
        if active >= max_count {
            return Ok(false);
        }
        inner.ledger.push(LedgerEntry {
            group_name: group.to_string(),
            task_id,
            started_at: Utc::now(),
        });
        Ok(true)
    }

    async fn ledger_remove(&self, group: &str, task_id: Uuid) -> Result<bool, CoreError> {
        let mut inner = self.lock();
        let before = inner.ledger.len();
        inner
            .ledger
            .retain(|l| !(l.group_name == group && l.task_id == task_id));
        Ok(inner.ledger.len() < before)
    }

    async fn ledger_count(&self, group: &str) -> Result<i64, CoreError> {
        let inner = self.lock();
        Ok(inner.ledger.iter().filter(|l| l.group_name == group).count() as i64)
    }

    async fn ledger_contains(&self, task_id: Uuid) -> Result<bool, CoreError> {
        Ok(self.lock().ledger.iter().any(|l| l.task_id == task_id))
    }

    async fn orphaned_ledger_entries(&self) -> Result<Vec<LedgerEntry>, CoreError> {
        let inner = self.lock();
        Ok(inner
            .ledger
            .iter()
            .filter(|l| {
                inner
                    .tasks
                    .get(&l.task_id)
                    .is_none_or(|t| t.status.is_terminal())
            })
            .cloned()
            .collect())
    }

    async fn upsert_group(&self, group: &str, max_count: i64) -> Result<(), CoreError> {
        let mut inner = self.lock();
        inner
            .groups
            .entry(group.to_string())
            .and_modify(|g| g.max_count = max_count)
            .or_insert_with(|| GroupRecord {
                group_name: group.to_string(),
                max_count,
                pause_mode: PauseMode::None,
            });
        Ok(())
    }

    async fn get_group(&self, group: &str) -> Result<Option<GroupRecord>, CoreError> {
        Ok(self.lock().groups.get(group).cloned())
    }

    async fn set_group_pause(&self, group: &str, mode: PauseMode) -> Result<bool, CoreError> {
        let mut inner = self.lock();
        match inner.groups.get_mut(group) {
            Some(g) => {
                g.pause_mode = mode;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn insert_task_event(&self, event: &TaskEvent) -> Result<(), CoreError> {
        let mut inner = self.lock();
        inner.next_event_id += 1;
        let mut event = event.clone();
        event.id = Some(inner.next_event_id);
        inner.events.push(event);
        Ok(())
    }

    async fn list_task_events(
        &self,
        task_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<TaskEvent>, CoreError> {
        let inner = self.lock();
        let mut events: Vec<TaskEvent> = inner
            .events
            .iter()
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect();
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(events
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        Ok(true)
    }
}

#[async_trait]
impl SignalStore for MemoryStore {
    async fn send(&self, signal: &Signal) -> Result<(), CoreError> {
        let mut inner = self.lock();
        inner
            .signals
            .entry(signal.signal_id.clone())
            .and_modify(|existing| {
                // Upsert by identity: payload may refresh, consumption state
                // never does.
                existing.payload = signal.payload.clone();
                existing.signal_type = signal.signal_type;
            })
            .or_insert_with(|| signal.clone());
        Ok(())
    }

    async fn load_all_active(&self, object_id: Uuid) -> Result<Vec<Signal>, CoreError> {
        let inner = self.lock();
        let mut signals: Vec<Signal> = inner
            .signals
            .values()
            .filter(|s| s.object_id == object_id && s.is_active())
            .cloned()
            .collect();
        signals.sort_by_key(|s| s.sent_time);
        Ok(signals)
    }

    async fn consume(&self, signal_id: &str, now: DateTime<Utc>) -> Result<bool, CoreError> {
        let mut inner = self.lock();
        match inner.signals.get_mut(signal_id) {
            Some(signal) if signal.consumed_time.is_none() => {
                signal.consumed_time = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn prune_consumed_before(&self, horizon: DateTime<Utc>) -> Result<u64, CoreError> {
        let mut inner = self.lock();
        let before = inner.signals.len();
        inner
            .signals
            .retain(|_, s| !s.consumed_time.is_some_and(|consumed| consumed < horizon));
        Ok((before - inner.signals.len()) as u64)
    }
}

#[async_trait]
impl LockStore for MemoryStore {
    async fn try_acquire(
        &self,
        name: &str,
        owner: Uuid,
        ttl_secs: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let mut inner = self.lock();
        let expires_at = now + Duration::seconds(ttl_secs);
        match inner.locks.get_mut(name) {
            Some(lock) if lock.expires_at > now => Ok(false),
            Some(lock) => {
                // Expired: take it over.
                lock.owner = owner;
                lock.expires_at = expires_at;
                Ok(true)
            }
            None => {
                inner.locks.insert(
                    name.to_string(),
                    LockRecord {
                        name: name.to_string(),
                        owner,
                        expires_at,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn release(&self, name: &str, owner: Uuid) -> Result<bool, CoreError> {
        let mut inner = self.lock();
        match inner.locks.get(name) {
            Some(lock) if lock.owner == owner => {
                inner.locks.remove(name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_lock(&self, name: &str) -> Result<Option<LockRecord>, CoreError> {
        Ok(self.lock().locks.get(name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = MemoryStore::new();
        let task = Task::new("deploy");
        assert!(store.insert_task(&task).await.unwrap());
        let loaded = store.get_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(loaded.wip_name, "deploy");
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let store = MemoryStore::new();
        let task = Task::new("deploy");
        store.insert_task(&task).await.unwrap();
        let now = Utc::now();
        assert!(store.claim_task(task.task_id, now).await.unwrap());
        // Second claim loses.
        assert!(!store.claim_task(task.task_id, now).await.unwrap());
    }

    #[tokio::test]
    async fn test_claim_respects_work_id() {
        let store = MemoryStore::new();
        let t1 = Task::new("deploy").with_work_id("X");
        let t2 = Task::new("deploy").with_work_id("X");
        store.insert_task(&t1).await.unwrap();
        store.insert_task(&t2).await.unwrap();
        let now = Utc::now();
        assert!(store.claim_task(t1.task_id, now).await.unwrap());
        // t1 is processing and holds X, so t2 cannot be claimed.
        assert!(!store.claim_task(t2.task_id, now).await.unwrap());
    }

    #[tokio::test]
    async fn test_ledger_cap() {
        let store = MemoryStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert!(store.ledger_insert("g", a, 1).await.unwrap());
        assert!(!store.ledger_insert("g", b, 1).await.unwrap());
        // Idempotent for the holder.
        assert!(store.ledger_insert("g", a, 1).await.unwrap());
        assert_eq!(store.ledger_count("g").await.unwrap(), 1);
        assert!(store.ledger_remove("g", a).await.unwrap());
        assert!(store.ledger_insert("g", b, 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_signal_consume_once() {
        let store = MemoryStore::new();
        let task = Uuid::new_v4();
        let signal = Signal::terminate(task, "stop");
        store.send(&signal).await.unwrap();
        let now = Utc::now();
        assert!(store.consume(&signal.signal_id, now).await.unwrap());
        assert!(!store.consume(&signal.signal_id, now).await.unwrap());
        assert!(store.load_all_active(task).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lock_ttl_takeover() {
        let store = MemoryStore::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let now = Utc::now();
        assert!(store.try_acquire("pause", first, 10, now).await.unwrap());
        assert!(!store.try_acquire("pause", second, 10, now).await.unwrap());
        // After the TTL the lock can be taken over...
        let later = now + Duration::seconds(11);
        assert!(store.try_acquire("pause", second, 10, later).await.unwrap());
        // ...and the original owner's release reports the loss.
        assert!(!store.release("pause", first).await.unwrap());
        assert!(store.release("pause", second).await.unwrap());
    }
}
