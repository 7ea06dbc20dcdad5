// Copyright (C) 2025 Wipline Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The action port and the explicit action registry.
//!
//! States never dispatch dynamically by name at runtime. Instead every
//! action name a table declares is bound to an [`ActionInvoker`] once, when
//! the registry is built against the compiled table; a missing binding is an
//! error at that point, not during execution.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use wipline_dsl::CompiledTable;

use crate::context::REMOTE_EXIT_KEY;
use crate::error::CoreError;
use crate::task::Task;

/// Symbol the default passive check reports for a clean remote exit.
pub const SYMBOL_REMOTE_OK: &str = "remote_ok";
/// Symbol the default passive check reports for a failed remote exit.
pub const SYMBOL_REMOTE_FAIL: &str = "remote_fail";
/// Symbol the executor synthesizes when the no-progress watchdog fires.
pub const SYMBOL_NO_PROGRESS: &str = "no_progress_fail";

/// Error an action reports back to the executor.
///
/// Action errors never propagate out of the executor: they are converted to
/// the state's `!` edge, or to a system failure when no `!` edge exists.
#[derive(Debug, Clone)]
pub struct ActionError {
    /// What went wrong.
    pub message: String,
    /// True for domain/user problems (surfaced as ERROR_USER), false for
    /// infrastructure problems (ERROR_SYSTEM).
    pub user_error: bool,
}

impl ActionError {
    /// A system error.
    pub fn system(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            user_error: false,
        }
    }

    /// A domain/user error.
    pub fn user(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            user_error: true,
        }
    }
}

impl std::fmt::Display for ActionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ActionError {}

/// Business logic bound to a state.
///
/// Actions receive the task (including its [`crate::context::ContextSet`])
/// and return the transition symbol. They must not hold live resources
/// across a tick boundary - store identifiers in the context and re-acquire.
#[async_trait]
pub trait ActionInvoker: Send + Sync {
    /// Run the action for `state` and return the transition symbol.
    async fn invoke(&self, state: &str, task: &mut Task) -> Result<String, ActionError>;

    /// Passive status check for ticks entered via `exec=false`.
    ///
    /// Returns `None` while nothing has happened yet (the task stays
    /// suspended). The default implementation reports the symbol derived
    /// from a materialized remote completion, if one arrived.
    async fn check(&self, state: &str, task: &mut Task) -> Result<Option<String>, ActionError> {
        Ok(remote_exit_symbol(state, task))
    }
}

/// Derive a symbol from a remote completion the executor materialized into
/// the state's context: exit code 0 reports [`SYMBOL_REMOTE_OK`], anything
/// else [`SYMBOL_REMOTE_FAIL`].
pub fn remote_exit_symbol(state: &str, task: &Task) -> Option<String> {
    let ctx = task.context.context(state)?;
    let exit = ctx.get(REMOTE_EXIT_KEY)?;
    let code = exit.get("exit_code").and_then(Value::as_i64)?;
    if code == 0 {
        Some(SYMBOL_REMOTE_OK.to_string())
    } else {
        Some(SYMBOL_REMOTE_FAIL.to_string())
    }
}

/// Immutable map from action name to handler, verified against a table.
pub struct ActionRegistry {
    handlers: HashMap<String, Arc<dyn ActionInvoker>>,
}

impl ActionRegistry {
    /// Start building a registry.
    pub fn builder() -> ActionRegistryBuilder {
        ActionRegistryBuilder {
            handlers: HashMap::new(),
        }
    }

    /// Look up the handler for an action name.
    pub fn get(&self, action: &str) -> Option<&Arc<dyn ActionInvoker>> {
        self.handlers.get(action)
    }

    /// Bound action names, sorted.
    pub fn bound_actions(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.bound_actions())
            .finish()
    }
}

/// Builder collecting bindings before they are verified against a table.
pub struct ActionRegistryBuilder {
    handlers: HashMap<String, Arc<dyn ActionInvoker>>,
}

impl ActionRegistryBuilder {
    /// Bind `action` to a handler.
    pub fn bind(mut self, action: impl Into<String>, handler: Arc<dyn ActionInvoker>) -> Self {
        self.handlers.insert(action.into(), handler);
        self
    }

    /// Verify every action the table dispatches on has a binding and build
    /// the registry.
    ///
    /// States that are terminal or route purely through wildcards need no
    /// binding. Fails with [`CoreError::ActionNotBound`] otherwise.
    pub fn build_for(self, table: &CompiledTable) -> Result<ActionRegistry, CoreError> {
        for action in table.required_actions() {
            if !self.handlers.contains_key(action) {
                return Err(CoreError::ActionNotBound {
                    action: action.to_string(),
                });
            }
        }
        Ok(ActionRegistry {
            handlers: self.handlers,
        })
    }

    /// Build without a table check, for handlers shared across tables.
    pub fn build_unchecked(self) -> ActionRegistry {
        ActionRegistry {
            handlers: self.handlers,
        }
    }
}
