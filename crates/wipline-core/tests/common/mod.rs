// Copyright (C) 2025 Wipline Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for wipline-core integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use wipline_core::actions::{ActionError, ActionInvoker, ActionRegistry};
use wipline_core::executor::{ExecutorConfig, StateMachineExecutor};
use wipline_core::logsink::TracingLogSink;
use wipline_core::persistence::{MemoryStore, SignalStore, TaskStore};
use wipline_core::scheduler::{SchedulerConfig, TaskPoolScheduler};

/// One scripted step of an action.
pub enum Step {
    /// Return this symbol.
    Symbol(&'static str),
    /// Fail with a system error.
    SystemError(&'static str),
    /// Fail with a user error.
    UserError(&'static str),
}

/// Action that replays a fixed script of symbols and errors.
///
/// Exhausting the script is a system error, so a test that ticks more often
/// than it scripted fails loudly instead of looping.
pub struct ScriptedAction {
    steps: Mutex<VecDeque<Step>>,
}

impl ScriptedAction {
    pub fn new(steps: Vec<Step>) -> Arc<dyn ActionInvoker> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
        })
    }

    /// Script of plain symbols.
    pub fn of(symbols: &[&'static str]) -> Arc<dyn ActionInvoker> {
        Self::new(symbols.iter().map(|&s| Step::Symbol(s)).collect())
    }
}

#[async_trait]
impl ActionInvoker for ScriptedAction {
    async fn invoke(
        &self,
        _state: &str,
        _task: &mut wipline_core::Task,
    ) -> Result<String, ActionError> {
        let step = self.steps.lock().unwrap().pop_front();
        match step {
            Some(Step::Symbol(s)) => Ok(s.to_string()),
            Some(Step::SystemError(msg)) => Err(ActionError::system(msg)),
            Some(Step::UserError(msg)) => Err(ActionError::user(msg)),
            None => Err(ActionError::system("scripted action exhausted")),
        }
    }
}

/// Compile a table, bind actions and build an executor over the store.
pub fn build_executor(
    table_src: &str,
    bindings: Vec<(&str, Arc<dyn ActionInvoker>)>,
    signals: Arc<dyn SignalStore>,
    config: ExecutorConfig,
) -> StateMachineExecutor {
    let table = Arc::new(wipline_dsl::compile(table_src).expect("table compiles"));
    let mut builder = ActionRegistry::builder();
    for (name, handler) in bindings {
        builder = builder.bind(name, handler);
    }
    let registry = Arc::new(builder.build_for(&table).expect("actions bound"));
    StateMachineExecutor::new(table, registry, signals, Arc::new(TracingLogSink), config)
}

/// Scheduler over a shared in-memory store.
pub fn memory_scheduler(store: Arc<MemoryStore>) -> TaskPoolScheduler {
    TaskPoolScheduler::new(
        store.clone(),
        store.clone(),
        store,
        Arc::new(TracingLogSink),
        SchedulerConfig::default(),
    )
}

/// Scheduler with custom config over a shared in-memory store.
pub fn memory_scheduler_with(
    store: Arc<MemoryStore>,
    config: SchedulerConfig,
) -> TaskPoolScheduler {
    TaskPoolScheduler::new(
        store.clone(),
        store.clone(),
        store,
        Arc::new(TracingLogSink),
        config,
    )
}

/// Mark a claimed task complete the way a worker would: persist, then
/// release its concurrency slot.
pub async fn complete_task(
    store: &Arc<MemoryStore>,
    scheduler: &TaskPoolScheduler,
    task: &mut wipline_core::Task,
) {
    task.status = wipline_core::TaskStatus::Complete;
    task.exit_status = wipline_core::ExitStatus::Ok;
    task.finished_at = Some(chrono::Utc::now());
    task.claimed_timestamp = None;
    TaskStore::update_task(store.as_ref(), task).await.unwrap();
    scheduler.stop_progress(task).await.unwrap();
}
