// Copyright (C) 2025 Wipline Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed storage implementation.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use crate::error::CoreError;
use crate::signals::Signal;
use crate::task::{Task, TaskStatus};

use super::{
    EventRow, GroupRecord, GroupRow, LedgerEntry, LedgerRow, LockRecord, LockRow, LockStore,
    PauseMode, SignalRow, SignalStore, TaskEvent, TaskRow, TaskStore, context_json,
};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/postgresql");

const TASK_COLUMNS: &str = "task_id, wip_id, wip_name, state, context, status, exit_status, \
                            priority, group_name, work_id, wake_timestamp, claimed_timestamp, \
                            parent_id, exit_message, exit_details, created_at, finished_at";

/// PostgreSQL-backed store implementing every storage port.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a store from an existing pool. Migrations are not run.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to a database URL and run all migrations.
    pub async fn connect(url: &str) -> Result<Self, CoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to PostgreSQL: {}", e),
            })?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn rows_to_tasks(rows: Vec<TaskRow>) -> Result<Vec<Task>, CoreError> {
    rows.into_iter().map(Task::try_from).collect()
}

#[async_trait]
impl TaskStore for PostgresStore {
    async fn insert_task(&self, task: &Task) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO tasks (task_id, wip_id, wip_name, state, context, status, exit_status,
                               priority, group_name, work_id, wake_timestamp, claimed_timestamp,
                               parent_id, exit_message, exit_details, created_at, finished_at)
            SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17
            WHERE NOT EXISTS (
                SELECT 1 FROM tasks
                WHERE work_id = $10
                  AND status IN ('waiting', 'processing', 'restarted')
            )
            "#,
        )
        .bind(task.task_id.to_string())
        .bind(task.wip_id.to_string())
        .bind(&task.wip_name)
        .bind(&task.state)
        .bind(context_json(task)?)
        .bind(task.status.as_str())
        .bind(task.exit_status.as_str())
        .bind(task.priority.rank())
        .bind(&task.group_name)
        .bind(&task.work_id)
        .bind(task.wake_timestamp)
        .bind(task.claimed_timestamp)
        .bind(task.parent_id.map(|id| id.to_string()))
        .bind(&task.exit_message)
        .bind(&task.exit_details)
        .bind(task.created_at)
        .bind(task.finished_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(done.rows_affected() > 0),
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>, CoreError> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM tasks WHERE task_id = $1",
            TASK_COLUMNS
        ))
        .bind(task_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Task::try_from).transpose()
    }

    async fn update_task(&self, task: &Task) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET state = $1, context = $2, status = $3, exit_status = $4, priority = $5,
                group_name = $6, work_id = $7, wake_timestamp = $8, claimed_timestamp = $9,
                exit_message = $10, exit_details = $11, finished_at = $12
            WHERE task_id = $13
            "#,
        )
        .bind(&task.state)
        .bind(context_json(task)?)
        .bind(task.status.as_str())
        .bind(task.exit_status.as_str())
        .bind(task.priority.rank())
        .bind(&task.group_name)
        .bind(&task.work_id)
        .bind(task.wake_timestamp)
        .bind(task.claimed_timestamp)
        .bind(&task.exit_message)
        .bind(&task.exit_details)
        .bind(task.finished_at)
        .bind(task.task_id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_ready(&self, task_id: Uuid) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'not_started'
            WHERE task_id = $1 AND status = 'not_ready'
            "#,
        )
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn runnable_candidates(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Task>, CoreError> {
        let rows = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT t.task_id, t.wip_id, t.wip_name, t.state, t.context, t.status, t.exit_status,
                   t.priority, t.group_name, t.work_id, t.wake_timestamp, t.claimed_timestamp,
                   t.parent_id, t.exit_message, t.exit_details, t.created_at, t.finished_at
            FROM tasks t
            LEFT JOIN concurrency_ledger l ON l.task_id = t.task_id
            WHERE t.claimed_timestamp IS NULL
              AND t.status IN ('not_started', 'waiting', 'restarted')
              AND (t.wake_timestamp IS NULL OR t.wake_timestamp <= $1)
            ORDER BY CASE WHEN l.task_id IS NULL THEN 1 ELSE 0 END,
                     t.priority,
                     COALESCE(t.wake_timestamp, t.created_at)
            LIMIT $2
            FOR UPDATE OF t SKIP LOCKED
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows_to_tasks(rows)
    }

    async fn claim_task(&self, task_id: Uuid, now: DateTime<Utc>) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET claimed_timestamp = $1, status = 'processing'
            WHERE task_id = $2
              AND claimed_timestamp IS NULL
              AND status IN ('not_started', 'waiting', 'restarted')
            "#,
        )
        .bind(now)
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(done.rows_affected() > 0),
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn release_claim(&self, task_id: Uuid, restore_to: TaskStatus) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET claimed_timestamp = NULL, status = $1
            WHERE task_id = $2
            "#,
        )
        .bind(restore_to.as_str())
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn stale_claims(&self, older_than: DateTime<Utc>) -> Result<Vec<Task>, CoreError> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            r#"
            SELECT {}
            FROM tasks
            WHERE claimed_timestamp IS NOT NULL
              AND claimed_timestamp < $1
              AND status != 'complete'
            "#,
            TASK_COLUMNS
        ))
        .bind(older_than)
        .fetch_all(&self.pool)
        .await?;

        rows_to_tasks(rows)
    }

    async fn children_of(&self, parent_id: Uuid) -> Result<Vec<Task>, CoreError> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM tasks WHERE parent_id = $1 ORDER BY created_at",
            TASK_COLUMNS
        ))
        .bind(parent_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows_to_tasks(rows)
    }

    async fn active_tasks_in_group(&self, group: &str) -> Result<Vec<Task>, CoreError> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            r#"
            SELECT {}
            FROM tasks
            WHERE group_name = $1
              AND status IN ('waiting', 'processing', 'restarted')
            "#,
            TASK_COLUMNS
        ))
        .bind(group)
        .fetch_all(&self.pool)
        .await?;

        rows_to_tasks(rows)
    }

    async fn delete_complete_before(
        &self,
        horizon: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, CoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM tasks
            WHERE task_id IN (
                SELECT task_id FROM tasks
                WHERE status = 'complete'
                  AND finished_at IS NOT NULL
                  AND finished_at < $1
                ORDER BY finished_at
                LIMIT $2
            )
            "#,
        )
        .bind(horizon)
        .bind(limit)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn ledger_insert(
        &self,
        group: &str,
        task_id: Uuid,
        max_count: i64,
    ) -> Result<bool, CoreError> {
        // Concurrent inserters for the same group serialize on an advisory
        // lock for the duration of the transaction, so the count guard and
        // the insert are atomic.
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(group)
            .execute(&mut *tx)
            .await?;

        let held = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM concurrency_ledger WHERE group_name = $1 AND task_id = $2",
        )
        .bind(group)
        .bind(task_id.to_string())
        .fetch_one(&mut *tx)
        .await?;

        if held > 0 {
            tx.commit().await?;
            return Ok(true);
        }

        let active = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM concurrency_ledger WHERE group_name = $1",
        )
        .bind(group)
        .fetch_one(&mut *tx)
        .await?;

        if active >= max_count {
            tx.commit().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO concurrency_ledger (group_name, task_id, started_at)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(group)
        .bind(task_id.to_string())
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn ledger_remove(&self, group: &str, task_id: Uuid) -> Result<bool, CoreError> {
        let result =
            sqlx::query("DELETE FROM concurrency_ledger WHERE group_name = $1 AND task_id = $2")
                .bind(group)
                .bind(task_id.to_string())
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn ledger_count(&self, group: &str) -> Result<i64, CoreError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM concurrency_ledger WHERE group_name = $1",
        )
        .bind(group)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn ledger_contains(&self, task_id: Uuid) -> Result<bool, CoreError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM concurrency_ledger WHERE task_id = $1",
        )
        .bind(task_id.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }

    async fn orphaned_ledger_entries(&self) -> Result<Vec<LedgerEntry>, CoreError> {
        let rows = sqlx::query_as::<_, LedgerRow>(
            r#"
            SELECT l.group_name, l.task_id, l.started_at
            FROM concurrency_ledger l
            LEFT JOIN tasks t ON t.task_id = l.task_id
            WHERE t.task_id IS NULL OR t.status = 'complete'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(LedgerEntry::try_from).collect()
    }

    async fn upsert_group(&self, group: &str, max_count: i64) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO task_groups (group_name, max_count, pause_mode)
            VALUES ($1, $2, 'none')
            ON CONFLICT (group_name) DO UPDATE SET max_count = EXCLUDED.max_count
            "#,
        )
        .bind(group)
        .bind(max_count)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_group(&self, group: &str) -> Result<Option<GroupRecord>, CoreError> {
        let row = sqlx::query_as::<_, GroupRow>(
            "SELECT group_name, max_count, pause_mode FROM task_groups WHERE group_name = $1",
        )
        .bind(group)
        .fetch_optional(&self.pool)
        .await?;

        row.map(GroupRecord::try_from).transpose()
    }

    async fn set_group_pause(&self, group: &str, mode: PauseMode) -> Result<bool, CoreError> {
        let result = sqlx::query("UPDATE task_groups SET pause_mode = $1 WHERE group_name = $2")
            .bind(mode.as_str())
            .bind(group)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn insert_task_event(&self, event: &TaskEvent) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO task_events (task_id, event_type, detail, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(event.task_id.to_string())
        .bind(&event.event_type)
        .bind(&event.detail)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_task_events(
        &self,
        task_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<TaskEvent>, CoreError> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT id, task_id, event_type, detail, created_at
            FROM task_events
            WHERE task_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(task_id.to_string())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TaskEvent::try_from).collect()
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        let one = sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(one == 1)
    }
}

#[async_trait]
impl SignalStore for PostgresStore {
    async fn send(&self, signal: &Signal) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO signals (signal_id, object_id, signal_type, sent_time, consumed_time, payload)
            VALUES ($1, $2, $3, $4, NULL, $5)
            ON CONFLICT (signal_id) DO UPDATE SET
                payload = EXCLUDED.payload,
                signal_type = EXCLUDED.signal_type
            "#,
        )
        .bind(&signal.signal_id)
        .bind(signal.object_id.to_string())
        .bind(signal.signal_type.as_str())
        .bind(signal.sent_time)
        .bind(serde_json::to_string(&signal.payload)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_all_active(&self, object_id: Uuid) -> Result<Vec<Signal>, CoreError> {
        let rows = sqlx::query_as::<_, SignalRow>(
            r#"
            SELECT signal_id, object_id, signal_type, sent_time, consumed_time, payload
            FROM signals
            WHERE object_id = $1 AND consumed_time IS NULL
            ORDER BY sent_time
            "#,
        )
        .bind(object_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Signal::try_from).collect()
    }

    async fn consume(&self, signal_id: &str, now: DateTime<Utc>) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE signals
            SET consumed_time = $1
            WHERE signal_id = $2 AND consumed_time IS NULL
            "#,
        )
        .bind(now)
        .bind(signal_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn prune_consumed_before(&self, horizon: DateTime<Utc>) -> Result<u64, CoreError> {
        let result = sqlx::query(
            "DELETE FROM signals WHERE consumed_time IS NOT NULL AND consumed_time < $1",
        )
        .bind(horizon)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl LockStore for PostgresStore {
    async fn try_acquire(
        &self,
        name: &str,
        owner: Uuid,
        ttl_secs: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let expires_at = now + Duration::seconds(ttl_secs);
        let result = sqlx::query(
            r#"
            INSERT INTO row_locks (name, owner, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (name) DO UPDATE SET
                owner = EXCLUDED.owner,
                expires_at = EXCLUDED.expires_at
            WHERE row_locks.expires_at <= $4
            "#,
        )
        .bind(name)
        .bind(owner.to_string())
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release(&self, name: &str, owner: Uuid) -> Result<bool, CoreError> {
        let result = sqlx::query("DELETE FROM row_locks WHERE name = $1 AND owner = $2")
            .bind(name)
            .bind(owner.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_lock(&self, name: &str) -> Result<Option<LockRecord>, CoreError> {
        let row = sqlx::query_as::<_, LockRow>(
            "SELECT name, owner, expires_at FROM row_locks WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(LockRecord::try_from).transpose()
    }
}
