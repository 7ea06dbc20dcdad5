// Copyright (C) 2025 Wipline Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Storage ports and backend implementations.
//!
//! Three ports back the core: [`TaskStore`] (tasks, concurrency ledger,
//! groups, audit events), [`SignalStore`] and [`LockStore`]. All shared
//! mutable state - claim flags, ledger slots, work-id uniqueness - is
//! protected through the atomic conditional primitives these ports expose,
//! never through in-process coordination. Backends: SQLite, PostgreSQL and
//! an in-memory store for tests and embedding.

pub mod memory;
pub mod postgres;
pub mod sqlite;

pub use self::memory::MemoryStore;
pub use self::postgres::PostgresStore;
pub use self::sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::context::ContextSet;
use crate::error::CoreError;
use crate::signals::{Signal, SignalPayload, SignalType};
use crate::task::{ExitStatus, Priority, Task, TaskStatus};

/// Pause mode of a concurrency group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseMode {
    /// Claims allowed.
    None,
    /// New claims blocked; in-flight tasks finish.
    Soft,
    /// New claims blocked and in-flight tasks asked to terminate.
    Hard,
}

impl PauseMode {
    /// Storage string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Soft => "soft",
            Self::Hard => "hard",
        }
    }

    /// Parse from the storage string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::None),
            "soft" => Some(Self::Soft),
            "hard" => Some(Self::Hard),
            _ => None,
        }
    }

    /// True when claims are blocked.
    pub fn blocks_claims(&self) -> bool {
        !matches!(self, Self::None)
    }
}

/// A concurrency group: a named bucket limiting simultaneous tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRecord {
    /// Group name.
    pub group_name: String,
    /// Maximum simultaneous ledger entries.
    pub max_count: i64,
    /// Current pause mode.
    pub pause_mode: PauseMode,
}

/// One active slot in the concurrency ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    /// Group the slot belongs to.
    pub group_name: String,
    /// Task holding the slot.
    pub task_id: Uuid,
    /// When the slot was taken.
    pub started_at: DateTime<Utc>,
}

/// A row lock's current holder, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    /// Lock name.
    pub name: String,
    /// Current owner token.
    pub owner: Uuid,
    /// When the hold expires.
    pub expires_at: DateTime<Utc>,
}

/// Append-only audit event for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskEvent {
    /// Database key; None before insertion.
    pub id: Option<i64>,
    /// The task the event belongs to.
    pub task_id: Uuid,
    /// Event type (enqueued, claimed, suspended, completed, ...).
    pub event_type: String,
    /// Optional free-form detail.
    pub detail: Option<String>,
    /// When the event occurred.
    pub created_at: DateTime<Utc>,
}

impl TaskEvent {
    /// Build an event stamped now.
    pub fn now(task_id: Uuid, event_type: impl Into<String>, detail: Option<String>) -> Self {
        Self {
            id: None,
            task_id,
            event_type: event_type.into(),
            detail,
            created_at: Utc::now(),
        }
    }
}

/// Task persistence port.
///
/// The conditional methods (`insert_task`, `claim_task`, `ledger_insert`)
/// are the atomicity boundary: each is a single storage-level conditional
/// operation whose boolean result tells the caller whether it won.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a task unless another task already actively holds its work-id.
    ///
    /// Returns false on a work-id conflict (nothing inserted).
    async fn insert_task(&self, task: &Task) -> Result<bool, CoreError>;

    /// Fetch a task by id.
    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>, CoreError>;

    /// Persist the full task row (state, context, status, timestamps).
    async fn update_task(&self, task: &Task) -> Result<(), CoreError>;

    /// Move a NOT_READY task to NOT_STARTED. Returns false if it was not
    /// NOT_READY.
    async fn mark_ready(&self, task_id: Uuid) -> Result<bool, CoreError>;

    /// Unclaimed, due tasks ordered for claiming: ledger members (resuming
    /// waiters) first, then ascending priority rank, then wake time.
    async fn runnable_candidates(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Task>, CoreError>;

    /// Atomically claim a task: set `claimed_timestamp` and move it to
    /// PROCESSING, provided it is still unclaimed and claimable.
    ///
    /// Work-id exclusivity is enforced here by the storage layer (unique
    /// constraint over active holders); a conflict loses the claim rather
    /// than erroring. Returns true when this caller won.
    async fn claim_task(&self, task_id: Uuid, now: DateTime<Utc>) -> Result<bool, CoreError>;

    /// Release a claim, restoring the given status.
    async fn release_claim(&self, task_id: Uuid, restore_to: TaskStatus) -> Result<(), CoreError>;

    /// Non-terminal tasks whose claim is older than `older_than` - crashed
    /// workers, recoverable by the reconcile sweep.
    async fn stale_claims(&self, older_than: DateTime<Utc>) -> Result<Vec<Task>, CoreError>;

    /// Children of a task.
    async fn children_of(&self, parent_id: Uuid) -> Result<Vec<Task>, CoreError>;

    /// Tasks in a group that currently hold their work-id (WAITING,
    /// PROCESSING or RESTARTED).
    async fn active_tasks_in_group(&self, group: &str) -> Result<Vec<Task>, CoreError>;

    /// Delete COMPLETE tasks (and their serialized contexts) finished before
    /// the horizon, at most `limit` per call. Returns the deleted count.
    async fn delete_complete_before(
        &self,
        horizon: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, CoreError>;

    /// Atomically take a ledger slot for (group, task) if the group's active
    /// count is below `max_count`. Idempotent for an already-held slot.
    ///
    /// Returns true when the slot is held after the call.
    async fn ledger_insert(
        &self,
        group: &str,
        task_id: Uuid,
        max_count: i64,
    ) -> Result<bool, CoreError>;

    /// Remove a ledger slot. Returns true if a slot was removed.
    async fn ledger_remove(&self, group: &str, task_id: Uuid) -> Result<bool, CoreError>;

    /// Active slot count for a group.
    async fn ledger_count(&self, group: &str) -> Result<i64, CoreError>;

    /// True when the task holds a ledger slot in any group.
    async fn ledger_contains(&self, task_id: Uuid) -> Result<bool, CoreError>;

    /// Ledger entries whose task is COMPLETE or gone - slots a crashed
    /// worker failed to release.
    async fn orphaned_ledger_entries(&self) -> Result<Vec<LedgerEntry>, CoreError>;

    /// Create or update a group's max_count (pause mode untouched).
    async fn upsert_group(&self, group: &str, max_count: i64) -> Result<(), CoreError>;

    /// Fetch a group.
    async fn get_group(&self, group: &str) -> Result<Option<GroupRecord>, CoreError>;

    /// Set a group's pause mode. Returns false if the group does not exist.
    async fn set_group_pause(&self, group: &str, mode: PauseMode) -> Result<bool, CoreError>;

    /// Append an audit event.
    async fn insert_task_event(&self, event: &TaskEvent) -> Result<(), CoreError>;

    /// Audit events for a task, newest first.
    async fn list_task_events(
        &self,
        task_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<TaskEvent>, CoreError>;

    /// Storage connectivity check.
    async fn health_check_db(&self) -> Result<bool, CoreError>;
}

/// Signal persistence port.
#[async_trait]
pub trait SignalStore: Send + Sync {
    /// Persist a signal, keyed by its id. Re-sending an unchanged signal is
    /// a no-op; the consumed timestamp is never touched by a re-send.
    async fn send(&self, signal: &Signal) -> Result<(), CoreError>;

    /// Active (unconsumed) signals for a task, oldest first.
    async fn load_all_active(&self, object_id: Uuid) -> Result<Vec<Signal>, CoreError>;

    /// Consume a signal: flip `consumed_time` from unset to `now`.
    ///
    /// Safe under concurrent consumers: exactly one caller gets true, the
    /// rest get false without error.
    async fn consume(&self, signal_id: &str, now: DateTime<Utc>) -> Result<bool, CoreError>;

    /// Delete consumed signals older than the horizon. Returns the count.
    async fn prune_consumed_before(&self, horizon: DateTime<Utc>) -> Result<u64, CoreError>;
}

/// Row lock persistence port.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Take the named lock for `owner` if it is free or its TTL has expired.
    /// Returns true when this owner now holds it.
    async fn try_acquire(
        &self,
        name: &str,
        owner: Uuid,
        ttl_secs: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// Release the lock if `owner` still holds it. Returns false when the
    /// lock was lost to TTL expiry and another owner took it (or it is
    /// gone).
    async fn release(&self, name: &str, owner: Uuid) -> Result<bool, CoreError>;

    /// Current holder, for diagnostics.
    async fn get_lock(&self, name: &str) -> Result<Option<LockRecord>, CoreError>;
}

// ============================================================================
// Row types shared by the SQL backends
// ============================================================================

/// Parse a stored uuid column.
pub(crate) fn parse_uuid(field: &'static str, value: &str) -> Result<Uuid, CoreError> {
    Uuid::parse_str(value).map_err(|e| CoreError::ValidationError {
        field: field.to_string(),
        message: format!("invalid uuid '{}': {}", value, e),
    })
}

/// Task row as stored. Identifier columns are TEXT in both SQL backends.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TaskRow {
    /// Unique task identifier.
    pub task_id: String,
    /// Owning Wip instance.
    pub wip_id: String,
    /// State table definition name.
    pub wip_name: String,
    /// Current state name.
    pub state: String,
    /// Serialized context set (JSON).
    pub context: String,
    /// Scheduling status string.
    pub status: String,
    /// Exit status string.
    pub exit_status: String,
    /// Priority rank (0 = critical).
    pub priority: i32,
    /// Concurrency group.
    pub group_name: String,
    /// Work-id fingerprint.
    pub work_id: Option<String>,
    /// Earliest next tick.
    pub wake_timestamp: Option<DateTime<Utc>>,
    /// Claim timestamp; NULL = not claimed.
    pub claimed_timestamp: Option<DateTime<Utc>>,
    /// Parent task.
    pub parent_id: Option<String>,
    /// Short exit message.
    pub exit_message: Option<String>,
    /// Verbose exit details.
    pub exit_details: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Completion time.
    pub finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<TaskRow> for Task {
    type Error = CoreError;

    fn try_from(row: TaskRow) -> Result<Self, CoreError> {
        let context: ContextSet = serde_json::from_str(&row.context)?;
        let status = TaskStatus::parse(&row.status).ok_or_else(|| CoreError::ValidationError {
            field: "status".to_string(),
            message: format!("unknown task status '{}'", row.status),
        })?;
        let exit_status =
            ExitStatus::parse(&row.exit_status).ok_or_else(|| CoreError::ValidationError {
                field: "exit_status".to_string(),
                message: format!("unknown exit status '{}'", row.exit_status),
            })?;
        let priority =
            Priority::from_rank(row.priority).ok_or_else(|| CoreError::ValidationError {
                field: "priority".to_string(),
                message: format!("unknown priority rank {}", row.priority),
            })?;
        let parent_id = match &row.parent_id {
            Some(id) => Some(parse_uuid("parent_id", id)?),
            None => None,
        };
        Ok(Task {
            task_id: parse_uuid("task_id", &row.task_id)?,
            wip_id: parse_uuid("wip_id", &row.wip_id)?,
            wip_name: row.wip_name,
            state: row.state,
            context,
            status,
            exit_status,
            priority,
            group_name: row.group_name,
            work_id: row.work_id,
            wake_timestamp: row.wake_timestamp,
            claimed_timestamp: row.claimed_timestamp,
            parent_id,
            exit_message: row.exit_message,
            exit_details: row.exit_details,
            created_at: row.created_at,
            finished_at: row.finished_at,
        })
    }
}

/// Signal row as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SignalRow {
    /// Signal identity.
    pub signal_id: String,
    /// Addressed task.
    pub object_id: String,
    /// Signal type string.
    pub signal_type: String,
    /// When sent.
    pub sent_time: DateTime<Utc>,
    /// When consumed; NULL = active.
    pub consumed_time: Option<DateTime<Utc>>,
    /// Typed payload (JSON).
    pub payload: String,
}

impl TryFrom<SignalRow> for Signal {
    type Error = CoreError;

    fn try_from(row: SignalRow) -> Result<Self, CoreError> {
        let payload: SignalPayload = serde_json::from_str(&row.payload)?;
        let signal_type =
            SignalType::parse(&row.signal_type).ok_or_else(|| CoreError::ValidationError {
                field: "signal_type".to_string(),
                message: format!("unknown signal type '{}'", row.signal_type),
            })?;
        Ok(Signal {
            signal_id: row.signal_id,
            object_id: parse_uuid("object_id", &row.object_id)?,
            signal_type,
            sent_time: row.sent_time,
            consumed_time: row.consumed_time,
            payload,
        })
    }
}

/// Ledger row as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LedgerRow {
    /// Group the slot belongs to.
    pub group_name: String,
    /// Task holding the slot.
    pub task_id: String,
    /// When the slot was taken.
    pub started_at: DateTime<Utc>,
}

impl TryFrom<LedgerRow> for LedgerEntry {
    type Error = CoreError;

    fn try_from(row: LedgerRow) -> Result<Self, CoreError> {
        Ok(LedgerEntry {
            group_name: row.group_name,
            task_id: parse_uuid("task_id", &row.task_id)?,
            started_at: row.started_at,
        })
    }
}

/// Group row as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct GroupRow {
    /// Group name.
    pub group_name: String,
    /// Maximum simultaneous ledger entries.
    pub max_count: i64,
    /// Pause mode string.
    pub pause_mode: String,
}

impl TryFrom<GroupRow> for GroupRecord {
    type Error = CoreError;

    fn try_from(row: GroupRow) -> Result<Self, CoreError> {
        let pause_mode =
            PauseMode::parse(&row.pause_mode).ok_or_else(|| CoreError::ValidationError {
                field: "pause_mode".to_string(),
                message: format!("unknown pause mode '{}'", row.pause_mode),
            })?;
        Ok(GroupRecord {
            group_name: row.group_name,
            max_count: row.max_count,
            pause_mode,
        })
    }
}

/// Lock row as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LockRow {
    /// Lock name.
    pub name: String,
    /// Owner token.
    pub owner: String,
    /// When the hold expires.
    pub expires_at: DateTime<Utc>,
}

impl TryFrom<LockRow> for LockRecord {
    type Error = CoreError;

    fn try_from(row: LockRow) -> Result<Self, CoreError> {
        Ok(LockRecord {
            name: row.name,
            owner: parse_uuid("owner", &row.owner)?,
            expires_at: row.expires_at,
        })
    }
}

/// Task event row as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EventRow {
    /// Database key.
    pub id: i64,
    /// The task the event belongs to.
    pub task_id: String,
    /// Event type.
    pub event_type: String,
    /// Optional detail.
    pub detail: Option<String>,
    /// When the event occurred.
    pub created_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for TaskEvent {
    type Error = CoreError;

    fn try_from(row: EventRow) -> Result<Self, CoreError> {
        Ok(TaskEvent {
            id: Some(row.id),
            task_id: parse_uuid("task_id", &row.task_id)?,
            event_type: row.event_type,
            detail: row.detail,
            created_at: row.created_at,
        })
    }
}

/// Serialize a context set for storage.
pub(crate) fn context_json(task: &Task) -> Result<String, CoreError> {
    Ok(serde_json::to_string(&task.context)?)
}
