// Copyright (C) 2025 Wipline Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The state machine executor.
//!
//! Drives one task's compiled table one tick at a time. A tick checks
//! signals, runs the state's action (or its passive status check), resolves
//! the returned symbol against the transition map, applies retry/wait/exec
//! policy and moves the machine. Action errors never propagate out of a
//! tick: they are converted to the state's `!` edge or to a system failure
//! that forwards to the `failure` terminal.
//!
//! Exactly one tick of a given task runs at a time; the scheduler's claim
//! protocol guarantees no second worker drives the same task concurrently.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{debug, warn};
use wipline_dsl::{
    CompiledTable, STATE_FAILURE, STATE_FINISH, STATE_TERMINATE, StateNode, Symbol, Transition,
};

use crate::actions::{ActionError, ActionRegistry, SYMBOL_NO_PROGRESS};
use crate::context::{CapturedError, REMOTE_EXIT_KEY, SIGNAL_KEY};
use crate::error::CoreError;
use crate::logsink::{LogLevel, LogSink};
use crate::persistence::SignalStore;
use crate::signals::SignalPayload;
use crate::task::{ExitStatus, Task, TaskStatus};

/// Executor tuning.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// How many recent transitions a system failure captures for
    /// diagnostics.
    pub history_window: usize,
    /// Force a `no_progress_fail` resolution when a suspended state has made
    /// no progress for this long. None disables the watchdog.
    pub no_progress_timeout: Option<std::time::Duration>,
    /// Whether transitions are recorded into the transcript.
    pub record_transcript: bool,
    /// Re-check delay for passive ticks whose transition declared no `wait`.
    pub recheck_wait_secs: u64,
    /// Upper bound on ticks per `run` call; a table cycling without any
    /// `wait` is cut off as a system failure.
    pub max_ticks_per_run: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            history_window: 10,
            no_progress_timeout: None,
            record_transcript: true,
            recheck_wait_secs: 30,
            max_ticks_per_run: 1000,
        }
    }
}

/// What a single tick did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// The machine moved to another state and can tick again immediately.
    Transitioned {
        /// State the tick started in.
        from: String,
        /// Symbol that fired.
        symbol: String,
        /// State the machine is now in.
        to: String,
    },
    /// The task suspended; no further ticks until `until`.
    Suspended {
        /// Wake time.
        until: DateTime<Utc>,
    },
    /// The machine reached a terminal state.
    Completed {
        /// Final exit status.
        exit: ExitStatus,
    },
}

/// What a `run` call ended with.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The task suspended until the given wake time.
    Suspended {
        /// Wake time.
        until: DateTime<Utc>,
    },
    /// The task reached a terminal state.
    Completed {
        /// Final exit status.
        exit: ExitStatus,
    },
}

/// Drives one task's state machine.
pub struct StateMachineExecutor {
    table: Arc<CompiledTable>,
    actions: Arc<ActionRegistry>,
    signals: Arc<dyn SignalStore>,
    log: Arc<dyn LogSink>,
    config: ExecutorConfig,
}

impl StateMachineExecutor {
    /// Create an executor over a compiled table and its bound actions.
    pub fn new(
        table: Arc<CompiledTable>,
        actions: Arc<ActionRegistry>,
        signals: Arc<dyn SignalStore>,
        log: Arc<dyn LogSink>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            table,
            actions,
            signals,
            log,
            config,
        }
    }

    /// The compiled table this executor drives.
    pub fn table(&self) -> &Arc<CompiledTable> {
        &self.table
    }

    /// Tick the machine until it suspends or completes.
    pub async fn run(&self, task: &mut Task) -> Result<RunOutcome, CoreError> {
        for _ in 0..self.config.max_ticks_per_run {
            match self.tick(task).await? {
                TickOutcome::Transitioned { .. } => continue,
                TickOutcome::Suspended { until } => return Ok(RunOutcome::Suspended { until }),
                TickOutcome::Completed { exit } => return Ok(RunOutcome::Completed { exit }),
            }
        }
        let outcome = self
            .system_failure(
                task,
                "*",
                format!(
                    "tick budget of {} exhausted without suspension",
                    self.config.max_ticks_per_run
                ),
                Utc::now(),
            )
            .await;
        match outcome {
            TickOutcome::Completed { exit } => Ok(RunOutcome::Completed { exit }),
            _ => unreachable!("system failure always completes"),
        }
    }

    /// One tick of the machine.
    pub async fn tick(&self, task: &mut Task) -> Result<TickOutcome, CoreError> {
        let now = Utc::now();
        if task.status != TaskStatus::Processing {
            task.status = TaskStatus::Processing;
        }

        // Out-of-band signals first: termination wins, remote completions
        // are materialized into the current state's context.
        if let Some(reason) = self.drain_signals(task, now).await? {
            return Ok(self.finalize_terminated(task, &reason, now));
        }

        let node = self
            .table
            .state(&task.state)
            .cloned()
            .ok_or_else(|| CoreError::UnknownState {
                state: task.state.clone(),
                wip_name: task.wip_name.clone(),
            })?;

        if node.is_terminal() {
            return Ok(self.finalize_terminal(task, &node, now).await);
        }

        let passive = task.context.is_passive(&task.state);

        // No-progress watchdog for suspended states.
        if let Some(timeout) = self.config.no_progress_timeout
            && passive
            && let Some(last) = task.context.last_progress_at()
            && now
                .signed_duration_since(last)
                .to_std()
                .is_ok_and(|elapsed| elapsed > timeout)
        {
            warn!(
                task = %task.task_id,
                state = %task.state,
                "no progress within timeout, forcing failure edge"
            );
            return self
                .resolve_watchdog(task, &node, now)
                .await;
        }

        let produced: Result<Option<String>, ActionError> = if node.is_wildcard_only() {
            // Pure router: the wildcard fires without invoking anything.
            Ok(Some(Symbol::Any.to_string()))
        } else {
            let handler =
                self.actions
                    .get(node.action_name())
                    .cloned()
                    .ok_or_else(|| CoreError::ActionNotBound {
                        action: node.action_name().to_string(),
                    })?;
            let state = task.state.clone();
            if passive {
                handler.check(&state, task).await
            } else {
                handler.invoke(&state, task).await.map(Some)
            }
        };

        match produced {
            Ok(Some(symbol)) => self.resolve_symbol(task, &node, &symbol, now).await,
            Ok(None) => {
                // Passive re-check observed nothing; stay suspended.
                let wait = task
                    .context
                    .last_wait()
                    .unwrap_or(self.config.recheck_wait_secs);
                Ok(self.suspend(task, wait, now))
            }
            Err(error) => self.resolve_error(task, &node, error, now).await,
        }
    }

    /// Resolve a returned symbol: exact match, then `*`, else system
    /// failure; a `max` overrun overrides the resolution with the `!` edge.
    async fn resolve_symbol(
        &self,
        task: &mut Task,
        node: &StateNode,
        symbol: &str,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome, CoreError> {
        let count = task.context.bump_counter(&task.state, symbol);

        let Some(transition) = node.exact(symbol).or_else(|| node.wildcard()).cloned() else {
            let message = format!(
                "state '{}' has no transition for symbol '{}'",
                task.state, symbol
            );
            return Ok(self.system_failure(task, symbol, message, now).await);
        };

        if let Some(max) = transition.max
            && count > max
        {
            let message = format!(
                "symbol '{}' repeated {} times in state '{}', exceeding max={}",
                symbol, count, task.state, max
            );
            task.context.capture_error(CapturedError {
                state: task.state.clone(),
                message: message.clone(),
                user_error: false,
                at: now,
            });
            return match node.error_edge().cloned() {
                Some(edge) => self.apply_transition(task, "!", &edge, now).await,
                None => Ok(self.system_failure(task, symbol, message, now).await),
            };
        }

        self.apply_transition(task, symbol, &transition, now).await
    }

    /// Convert a captured action error into the `!` edge or a system
    /// failure.
    async fn resolve_error(
        &self,
        task: &mut Task,
        node: &StateNode,
        error: ActionError,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome, CoreError> {
        self.log.log(
            LogLevel::Warning,
            &format!("action failed in state '{}': {}", task.state, error.message),
            Some(task.task_id),
            error.user_error,
        );
        task.context.capture_error(CapturedError {
            state: task.state.clone(),
            message: error.message.clone(),
            user_error: error.user_error,
            at: now,
        });

        match node.error_edge().cloned() {
            Some(edge) => self.apply_transition(task, "!", &edge, now).await,
            None => {
                let message = format!(
                    "action for state '{}' failed with no '!' edge: {}",
                    task.state, error.message
                );
                Ok(self.system_failure(task, "!", message, now).await)
            }
        }
    }

    /// Watchdog resolution: exact `no_progress_fail` edge, else `!`, else
    /// system failure. The `*` wildcard is deliberately skipped so normal
    /// routing cannot swallow a forced failure.
    async fn resolve_watchdog(
        &self,
        task: &mut Task,
        node: &StateNode,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome, CoreError> {
        let message = format!("state '{}' made no progress within timeout", task.state);
        task.context.capture_error(CapturedError {
            state: task.state.clone(),
            message: message.clone(),
            user_error: false,
            at: now,
        });

        if let Some(edge) = node.exact(SYMBOL_NO_PROGRESS).cloned() {
            return self.apply_transition(task, SYMBOL_NO_PROGRESS, &edge, now).await;
        }
        if let Some(edge) = node.error_edge().cloned() {
            return self.apply_transition(task, "!", &edge, now).await;
        }
        Ok(self
            .system_failure(task, SYMBOL_NO_PROGRESS, message, now)
            .await)
    }

    /// Move the machine along a transition, applying wait/exec attributes.
    async fn apply_transition(
        &self,
        task: &mut Task,
        symbol: &str,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome, CoreError> {
        let from = task.state.clone();

        if self.config.record_transcript {
            task.context
                .transcript_mut()
                .record(&from, symbol, &transition.target, now);
        }

        task.context.clear_passive();
        if !transition.exec {
            task.context.set_passive(&transition.target);
        }
        if let Some(wait) = transition.wait {
            task.context.set_last_wait(wait);
        }
        if from != transition.target {
            task.context.note_progress(now);
            // A materialized remote result belongs to the decision just
            // made; it must not leak into a later visit.
            task.context.context_mut(&from).remove(REMOTE_EXIT_KEY);
        }

        task.state = transition.target.clone();
        debug!(
            task = %task.task_id,
            from = %from,
            symbol = %symbol,
            to = %task.state,
            "transition"
        );

        let target = self
            .table
            .state(&task.state)
            .cloned()
            .ok_or_else(|| CoreError::UnknownState {
                state: task.state.clone(),
                wip_name: task.wip_name.clone(),
            })?;
        if target.is_terminal() {
            return Ok(self.finalize_terminal(task, &target, now).await);
        }

        if let Some(wait) = transition.wait {
            return Ok(self.suspend(task, wait, now));
        }

        Ok(TickOutcome::Transitioned {
            from,
            symbol: symbol.to_string(),
            to: task.state.clone(),
        })
    }

    fn suspend(&self, task: &mut Task, wait_secs: u64, now: DateTime<Utc>) -> TickOutcome {
        let until = now + ChronoDuration::seconds(wait_secs as i64);
        task.wake_timestamp = Some(until);
        task.status = TaskStatus::Waiting;
        TickOutcome::Suspended { until }
    }

    /// Finish the task in a terminal state.
    async fn finalize_terminal(
        &self,
        task: &mut Task,
        node: &StateNode,
        now: DateTime<Utc>,
    ) -> TickOutcome {
        match node.name.as_str() {
            STATE_FINISH => {
                if task.exit_status == ExitStatus::NotFinished {
                    task.exit_status = ExitStatus::Ok;
                }
                task.context.clear_error();
            }
            STATE_TERMINATE => {
                task.exit_status = ExitStatus::Terminated;
                if task.exit_message.is_none() {
                    task.exit_message = Some("task terminated".to_string());
                }
            }
            STATE_FAILURE => {
                self.finalize_failure(task).await;
            }
            _ => {
                // Caller-declared custom terminal.
                if task.exit_status == ExitStatus::NotFinished {
                    task.exit_status = ExitStatus::Ok;
                }
            }
        }

        task.status = TaskStatus::Complete;
        task.finished_at = Some(now);
        task.wake_timestamp = None;

        self.log.log(
            LogLevel::Info,
            &format!(
                "task reached '{}' with exit status {}",
                node.name, task.exit_status
            ),
            Some(task.task_id),
            task.exit_status.is_abnormal(),
        );

        TickOutcome::Completed {
            exit: task.exit_status,
        }
    }

    /// Failure terminal: derive the exit status from the captured error, set
    /// the structured exit messages and invoke the designated failure
    /// handler if one is bound. Handler errors are logged, never raised.
    async fn finalize_failure(&self, task: &mut Task) {
        let captured = task.context.last_error().cloned();

        if task.exit_status == ExitStatus::NotFinished {
            task.exit_status = match &captured {
                Some(err) if err.user_error => ExitStatus::ErrorUser,
                _ => ExitStatus::ErrorSystem,
            };
        }

        if task.exit_message.is_none() {
            task.exit_message = Some(match &captured {
                Some(err) => err.message.clone(),
                None => "task failed".to_string(),
            });
        }
        if task.exit_details.is_none() {
            let trail = task.context.transcript().render();
            task.exit_details = Some(match &captured {
                Some(err) => format!(
                    "failed in state '{}': {}\ntransitions: {}",
                    err.state, err.message, trail
                ),
                None => format!("transitions: {}", trail),
            });
        }

        // Designated failure handler, bound under the failure state's action
        // name.
        let failure_action = self
            .table
            .state(STATE_FAILURE)
            .map(|node| node.action_name().to_string())
            .unwrap_or_else(|| STATE_FAILURE.to_string());
        if let Some(handler) = self.actions.get(&failure_action).cloned() {
            if let Err(e) = handler.invoke(STATE_FAILURE, task).await {
                warn!(task = %task.task_id, error = %e, "failure handler failed");
            }
        }
    }

    /// Unrecoverable resolution: capture recent history, set ERROR_SYSTEM
    /// and the structured exit messages, then forward to `failure`.
    async fn system_failure(
        &self,
        task: &mut Task,
        symbol: &str,
        message: String,
        now: DateTime<Utc>,
    ) -> TickOutcome {
        let history: Vec<String> = task
            .context
            .transcript()
            .tail(self.config.history_window)
            .iter()
            .map(|e| format!("{} -> '{}' -> {}", e.from, e.symbol, e.to))
            .collect();

        self.log.log(
            LogLevel::Error,
            &format!("system failure in state '{}': {}", task.state, message),
            Some(task.task_id),
            false,
        );

        if self.config.record_transcript {
            task.context
                .transcript_mut()
                .record(&task.state, symbol, STATE_FAILURE, now);
        }

        task.exit_status = ExitStatus::ErrorSystem;
        task.exit_message = Some(format!("system failure in state '{}'", task.state));
        task.exit_details = Some(format!(
            "{}\nrecent transitions:\n{}",
            message,
            history.join("\n")
        ));

        task.state = STATE_FAILURE.to_string();
        self.finalize_failure(task).await;

        task.status = TaskStatus::Complete;
        task.finished_at = Some(now);
        task.wake_timestamp = None;

        TickOutcome::Completed {
            exit: task.exit_status,
        }
    }

    /// Finish on a termination request.
    fn finalize_terminated(
        &self,
        task: &mut Task,
        reason: &str,
        now: DateTime<Utc>,
    ) -> TickOutcome {
        if self.config.record_transcript {
            task.context
                .transcript_mut()
                .record(&task.state, "terminate", STATE_TERMINATE, now);
        }

        task.state = STATE_TERMINATE.to_string();
        task.exit_status = ExitStatus::Terminated;
        task.exit_message = Some(format!("terminated: {}", reason));
        task.status = TaskStatus::Complete;
        task.finished_at = Some(now);
        task.wake_timestamp = None;

        self.log.log(
            LogLevel::Info,
            &format!("task terminated: {}", reason),
            Some(task.task_id),
            true,
        );

        TickOutcome::Completed {
            exit: ExitStatus::Terminated,
        }
    }

    /// Consume active signals. Remote completions and custom payloads are
    /// materialized into the current state's context; a consumed termination
    /// request is returned so the tick can route to the terminal.
    async fn drain_signals(
        &self,
        task: &mut Task,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, CoreError> {
        let active = self.signals.load_all_active(task.task_id).await?;
        let mut terminate: Option<String> = None;

        for signal in active {
            // At-most-once: only the consumer that wins the flip acts on the
            // payload.
            if !self.signals.consume(&signal.signal_id, now).await? {
                continue;
            }
            match &signal.payload {
                SignalPayload::Terminate { reason } => {
                    terminate.get_or_insert_with(|| reason.clone());
                }
                SignalPayload::RemoteProcessExit { .. } => {
                    let value = serde_json::to_value(&signal.payload)?;
                    task.context
                        .context_mut(&task.state)
                        .set(REMOTE_EXIT_KEY, value);
                }
                SignalPayload::Custom { data } => {
                    task.context
                        .context_mut(&task.state)
                        .set(SIGNAL_KEY, data.clone());
                }
            }
        }

        Ok(terminate)
    }
}
