// Copyright (C) 2025 Wipline Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wipline Core - Durable State Machine Engine
//!
//! This crate runs long-lived automation jobs as explicit, persisted finite
//! state machines ("Wip" = work-in-progress) distributed across many worker
//! processes and machines. Jobs may suspend for minutes or hours while
//! remote work completes asynchronously, and survive worker crashes and
//! restarts without losing state or double-executing side effects.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      Worker processes (N machines)               │
//! │                                                                  │
//! │  TaskWorker poll loop                                            │
//! │     │ get_next_runnable_tasks()                                  │
//! │     ▼                                                            │
//! │  TaskPoolScheduler ──── atomic claim / ledger / work-id ────┐    │
//! │     │                                                       │    │
//! │     ▼                                                       ▼    │
//! │  StateMachineExecutor ── tick ── actions ── wait/suspend  Storage│
//! │     ▲                                                     (SQL)  │
//! │     │ remote-exit / terminate signals                       ▲    │
//! │     └────────────────── SignalStore ────────────────────────┘    │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Control flow: the scheduler hands a claimed [`task::Task`] to a worker,
//! which resumes the task's [`executor::StateMachineExecutor`]. The current
//! state's bound action either returns a transition symbol synchronously or
//! starts remote work and suspends via a `wait` transition. When the remote
//! side reports completion through a [`signals::Signal`], the next tick
//! observes the payload in the task's [`context::ContextSet`] and
//! transitions. At a terminal state the scheduler marks the task COMPLETE
//! and releases its concurrency slot.
//!
//! # Exactly-once and crash safety
//!
//! - Claims, concurrency-ledger slots and work-id uniqueness are guarded by
//!   storage-level atomic conditional updates and a partial unique index -
//!   never by in-process coordination.
//! - Signals are consumed at most once: concurrent consumers race on a
//!   conditional update and exactly one wins.
//! - [`lock::RowLock`] covers the compound multi-statement operations that
//!   single-statement atomicity cannot express.
//! - The entire task context is plain serializable data, so the worker that
//!   resumes a suspended task need not be the one that suspended it.
//!
//! # Tables
//!
//! Workflows are defined in the `wipline-dsl` state table text format and
//! compiled once at startup; actions are bound by name through
//! [`actions::ActionRegistry`], erroring at build time when a binding is
//! missing.

pub mod actions;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod lock;
pub mod logsink;
pub mod migrations;
pub mod persistence;
pub mod remote;
pub mod scheduler;
pub mod signals;
pub mod task;
pub mod transcript;
pub mod worker;

pub mod runtime;

pub use actions::{ActionError, ActionInvoker, ActionRegistry};
pub use context::{Context, ContextSet};
pub use error::{CoreError, Result};
pub use executor::{ExecutorConfig, RunOutcome, StateMachineExecutor, TickOutcome};
pub use lock::{RowLock, RowLockConfig};
pub use scheduler::{PauseKind, SchedulerConfig, TaskPoolScheduler};
pub use signals::{Signal, SignalPayload, SignalType};
pub use task::{ExitStatus, Priority, Task, TaskStatus, work_id_fingerprint};
pub use transcript::{Transcript, TranscriptEntry};
pub use worker::WipDefinition;
