// Copyright (C) 2025 Wipline Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The schedulable task record and its status vocabulary.
//!
//! A [`Task`] wraps one Wip state machine instance together with its
//! scheduling metadata. The status, exit-status and priority enums are the
//! stable contract other layers (REST, UI) read; their string forms are the
//! storage representation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::context::ContextSet;

/// Scheduling status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, never claimed.
    NotStarted,
    /// Suspended on a `wait` transition or a passive re-check.
    Waiting,
    /// A worker currently holds the claim and is ticking the machine.
    Processing,
    /// Recovered from a crashed worker; claimable like a waiting task.
    Restarted,
    /// Created but not yet eligible for claiming.
    NotReady,
    /// Reached a terminal state. The only status a ledger slot is released
    /// in.
    Complete,
}

impl TaskStatus {
    /// Storage/API string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Waiting => "waiting",
            Self::Processing => "processing",
            Self::Restarted => "restarted",
            Self::NotReady => "not_ready",
            Self::Complete => "complete",
        }
    }

    /// Parse from the storage string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "not_started" => Some(Self::NotStarted),
            "waiting" => Some(Self::Waiting),
            "processing" => Some(Self::Processing),
            "restarted" => Some(Self::Restarted),
            "not_ready" => Some(Self::NotReady),
            "complete" => Some(Self::Complete),
            _ => None,
        }
    }

    /// True while the task holds its work-id exclusively.
    ///
    /// Waiting tasks keep the hold across suspend/resume; restarted tasks
    /// keep it until they are re-driven to a terminal state.
    pub fn holds_work_id(&self) -> bool {
        matches!(self, Self::Waiting | Self::Processing | Self::Restarted)
    }

    /// True once no further ticks will run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a completed task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    /// Finished cleanly.
    Ok,
    /// Finished with a warning.
    Warning,
    /// Failed because of a domain/user problem.
    ErrorUser,
    /// Failed because of an infrastructure/system problem.
    ErrorSystem,
    /// Stopped by a termination request.
    Terminated,
    /// Still running (the default until a terminal state is reached).
    NotFinished,
}

impl ExitStatus {
    /// Storage/API string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Warning => "warning",
            Self::ErrorUser => "error_user",
            Self::ErrorSystem => "error_system",
            Self::Terminated => "terminated",
            Self::NotFinished => "not_finished",
        }
    }

    /// Parse from the storage string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ok" => Some(Self::Ok),
            "warning" => Some(Self::Warning),
            "error_user" => Some(Self::ErrorUser),
            "error_system" => Some(Self::ErrorSystem),
            "terminated" => Some(Self::Terminated),
            "not_finished" => Some(Self::NotFinished),
            _ => None,
        }
    }

    /// True for endings an operator should look at.
    pub fn is_abnormal(&self) -> bool {
        matches!(self, Self::ErrorUser | Self::ErrorSystem | Self::Terminated)
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Claim ordering hint. Lower rank claims first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Jump the queue.
    Critical,
    /// Ahead of routine work.
    High,
    /// The default.
    Medium,
    /// Backfill work.
    Low,
}

impl Priority {
    /// Numeric rank used for ordering in storage (0 = highest).
    pub fn rank(&self) -> i32 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Medium => 2,
            Self::Low => 3,
        }
    }

    /// Inverse of [`rank`](Self::rank).
    pub fn from_rank(rank: i32) -> Option<Self> {
        match rank {
            0 => Some(Self::Critical),
            1 => Some(Self::High),
            2 => Some(Self::Medium),
            3 => Some(Self::Low),
            _ => None,
        }
    }

    /// Storage/API string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    /// Parse from the storage string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "critical" => Some(Self::Critical),
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One schedulable unit of work: a Wip state machine plus scheduling
/// metadata.
///
/// `claimed_timestamp == None` is the NOT_CLAIMED sentinel: any worker may
/// attempt the atomic claim. The embedded [`ContextSet`] is the machine's
/// entire mutable state and is serialized with the task, so the worker that
/// resumes a suspended task need not be the one that suspended it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    pub task_id: Uuid,
    /// The owning Wip instance.
    pub wip_id: Uuid,
    /// Name of the state table definition this task runs against.
    pub wip_name: String,
    /// Current state name.
    pub state: String,
    /// Serialized per-state data, counters and transcript.
    pub context: ContextSet,
    /// Scheduling status.
    pub status: TaskStatus,
    /// How the task ended (NOT_FINISHED until terminal).
    pub exit_status: ExitStatus,
    /// Claim ordering hint.
    pub priority: Priority,
    /// Concurrency ledger bucket.
    pub group_name: String,
    /// Singleton-resource fingerprint; at most one holder may be active.
    pub work_id: Option<String>,
    /// Earliest time the next tick may run.
    pub wake_timestamp: Option<DateTime<Utc>>,
    /// When a worker claimed the task; None = NOT_CLAIMED.
    pub claimed_timestamp: Option<DateTime<Utc>>,
    /// Parent task, for fan-out pipelines.
    pub parent_id: Option<Uuid>,
    /// Short, operator-facing exit message.
    pub exit_message: Option<String>,
    /// Verbose internal exit details.
    pub exit_details: Option<String>,
    /// When the task was enqueued.
    pub created_at: DateTime<Utc>,
    /// When the task reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a fresh NOT_STARTED task for the named workflow definition.
    pub fn new(wip_name: impl Into<String>) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            wip_id: Uuid::new_v4(),
            wip_name: wip_name.into(),
            state: wipline_dsl::STATE_START.to_string(),
            context: ContextSet::new(),
            status: TaskStatus::NotStarted,
            exit_status: ExitStatus::NotFinished,
            priority: Priority::Medium,
            group_name: "default".to_string(),
            work_id: None,
            wake_timestamp: None,
            claimed_timestamp: None,
            parent_id: None,
            exit_message: None,
            exit_details: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the concurrency group.
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group_name = group.into();
        self
    }

    /// Set the work-id fingerprint.
    pub fn with_work_id(mut self, work_id: impl Into<String>) -> Self {
        self.work_id = Some(work_id.into());
        self
    }

    /// Link to a parent task.
    pub fn with_parent(mut self, parent: Uuid) -> Self {
        self.parent_id = Some(parent);
        self
    }

    /// True while the task is claimable by a worker.
    pub fn is_claimable(&self) -> bool {
        self.claimed_timestamp.is_none()
            && matches!(
                self.status,
                TaskStatus::NotStarted | TaskStatus::Waiting | TaskStatus::Restarted
            )
    }
}

/// Derive a work-id fingerprint from the identifiers of the singleton
/// resource a task writes to (for example source and destination names).
///
/// The same parts always produce the same fingerprint, so conflicting tasks
/// serialize on it.
pub fn work_id_fingerprint(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(32);
    for byte in &digest[..16] {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            TaskStatus::NotStarted,
            TaskStatus::Waiting,
            TaskStatus::Processing,
            TaskStatus::Restarted,
            TaskStatus::NotReady,
            TaskStatus::Complete,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::parse("bogus"), None);
    }

    #[test]
    fn test_exit_status_round_trip() {
        for exit in [
            ExitStatus::Ok,
            ExitStatus::Warning,
            ExitStatus::ErrorUser,
            ExitStatus::ErrorSystem,
            ExitStatus::Terminated,
            ExitStatus::NotFinished,
        ] {
            assert_eq!(ExitStatus::parse(exit.as_str()), Some(exit));
        }
    }

    #[test]
    fn test_priority_rank_ordering() {
        assert!(Priority::Critical.rank() < Priority::High.rank());
        assert!(Priority::High.rank() < Priority::Medium.rank());
        assert!(Priority::Medium.rank() < Priority::Low.rank());
        assert_eq!(Priority::from_rank(2), Some(Priority::Medium));
        assert_eq!(Priority::from_rank(9), None);
    }

    #[test]
    fn test_work_id_hold() {
        assert!(TaskStatus::Waiting.holds_work_id());
        assert!(TaskStatus::Processing.holds_work_id());
        assert!(TaskStatus::Restarted.holds_work_id());
        assert!(!TaskStatus::NotStarted.holds_work_id());
        assert!(!TaskStatus::Complete.holds_work_id());
    }

    #[test]
    fn test_new_task_defaults() {
        let task = Task::new("deploy");
        assert_eq!(task.state, "start");
        assert_eq!(task.status, TaskStatus::NotStarted);
        assert_eq!(task.exit_status, ExitStatus::NotFinished);
        assert_eq!(task.priority, Priority::Medium);
        assert!(task.claimed_timestamp.is_none());
        assert!(task.is_claimable());
    }

    #[test]
    fn test_work_id_fingerprint_deterministic() {
        let a = work_id_fingerprint(&["git@src", "server-1"]);
        let b = work_id_fingerprint(&["git@src", "server-1"]);
        let c = work_id_fingerprint(&["git@src", "server-2"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }
}
