// Copyright (C) 2025 Wipline Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Immutable transition graph produced by the compiler.
//!
//! A [`CompiledTable`] maps state names to [`StateNode`]s. Nodes carry the
//! bound action name, an optional capability tag (pure metadata), and an
//! ordered list of transitions keyed by [`Symbol`]. The graph is plain
//! serializable data so it can be stored or shipped between processes.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Entry state every table must declare.
pub const STATE_START: &str = "start";
/// Built-in terminal for successful completion.
pub const STATE_FINISH: &str = "finish";
/// Built-in terminal reached after a handled failure.
pub const STATE_FAILURE: &str = "failure";
/// Built-in terminal reached on a termination request.
pub const STATE_TERMINATE: &str = "terminate";

/// The three built-in terminal states, always present in a compiled table.
pub const BUILTIN_TERMINALS: [&str; 3] = [STATE_FINISH, STATE_FAILURE, STATE_TERMINATE];

/// A transition key: a literal string returned by an action, or one of the
/// two wildcards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Symbol {
    /// Exact match on the string an action returned.
    Literal(String),
    /// `*` - fires for any symbol without an exact match.
    Any,
    /// `!` - fires when the action raised an error or a `max` count was
    /// exceeded.
    Error,
}

impl Symbol {
    /// Build a literal symbol.
    pub fn literal(s: impl Into<String>) -> Self {
        Symbol::Literal(s.into())
    }

    /// True for the `*` wildcard.
    pub fn is_any(&self) -> bool {
        matches!(self, Symbol::Any)
    }

    /// True for the `!` error edge.
    pub fn is_error(&self) -> bool {
        matches!(self, Symbol::Error)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Symbol::Literal(s) => write!(f, "{}", s),
            Symbol::Any => write!(f, "*"),
            Symbol::Error => write!(f, "!"),
        }
    }
}

fn default_exec() -> bool {
    true
}

/// A single edge in the transition graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    /// Target state name. Guaranteed by validation to exist in the table.
    pub target: String,
    /// Suspend for this many seconds before the next tick.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait: Option<u64>,
    /// Whether the action is invoked again on the next tick (default true).
    /// `false` means the next tick only runs the passive status check bound
    /// to the target state.
    #[serde(default = "default_exec")]
    pub exec: bool,
    /// Retry ceiling: once the per-(state, symbol) counter exceeds this, the
    /// `!` edge is taken instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<u32>,
}

impl Transition {
    /// A plain edge to `target` with default attributes.
    pub fn to(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            wait: None,
            exec: true,
            max: None,
        }
    }
}

/// One state in the compiled graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateNode {
    /// State name.
    pub name: String,
    /// Explicit action name from `name:action`, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Capability tag. Dependency-hint metadata only; never affects control
    /// flow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    /// Transitions in declaration order.
    pub transitions: Vec<(Symbol, Transition)>,
}

impl StateNode {
    /// A state with no transitions is terminal: the machine stops here.
    pub fn is_terminal(&self) -> bool {
        self.transitions.is_empty()
    }

    /// The action name the executor dispatches on: the explicit `:action`
    /// override, or the state name itself.
    pub fn action_name(&self) -> &str {
        self.action.as_deref().unwrap_or(&self.name)
    }

    /// True when this state routes purely through its `*` edge and never
    /// needs a bound action.
    pub fn is_wildcard_only(&self) -> bool {
        !self.transitions.is_empty()
            && self
                .transitions
                .iter()
                .all(|(sym, _)| sym.is_any() || sym.is_error())
    }

    /// Exact-match transition for a literal symbol.
    pub fn exact(&self, symbol: &str) -> Option<&Transition> {
        self.transitions.iter().find_map(|(sym, tr)| match sym {
            Symbol::Literal(s) if s == symbol => Some(tr),
            _ => None,
        })
    }

    /// The `*` wildcard edge, if declared.
    pub fn wildcard(&self) -> Option<&Transition> {
        self.transitions
            .iter()
            .find_map(|(sym, tr)| sym.is_any().then_some(tr))
    }

    /// The `!` error edge, if declared.
    pub fn error_edge(&self) -> Option<&Transition> {
        self.transitions
            .iter()
            .find_map(|(sym, tr)| sym.is_error().then_some(tr))
    }
}

/// An immutable, validated transition graph.
///
/// Produced by [`crate::compile`]; every transition target is guaranteed to
/// exist and the built-in terminals are always present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledTable {
    states: HashMap<String, StateNode>,
    /// Declaration order of the states that appeared in the source text.
    declared: Vec<String>,
}

impl CompiledTable {
    pub(crate) fn new(states: HashMap<String, StateNode>, declared: Vec<String>) -> Self {
        Self { states, declared }
    }

    /// Look up a state by name.
    pub fn state(&self, name: &str) -> Option<&StateNode> {
        self.states.get(name)
    }

    /// True if `name` exists in the table (declared or built-in terminal).
    pub fn contains(&self, name: &str) -> bool {
        self.states.contains_key(name)
    }

    /// Names of the states declared in the source, in declaration order.
    pub fn declared_states(&self) -> impl Iterator<Item = &str> {
        self.declared.iter().map(String::as_str)
    }

    /// All states, including injected built-in terminals.
    pub fn states(&self) -> impl Iterator<Item = &StateNode> {
        self.states.values()
    }

    /// Number of states, built-in terminals included.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// True when the table holds no states at all.
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Action names the executor will dispatch on, for registry binding.
    ///
    /// Terminal and wildcard-only states are excluded: they never invoke an
    /// action.
    pub fn required_actions(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .states
            .values()
            .filter(|node| !node.is_terminal() && !node.is_wildcard_only())
            .map(|node| node.action_name())
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_with(transitions: Vec<(Symbol, Transition)>) -> StateNode {
        StateNode {
            name: "build".to_string(),
            action: None,
            capability: None,
            transitions,
        }
    }

    #[test]
    fn test_symbol_display() {
        assert_eq!(Symbol::literal("done").to_string(), "done");
        assert_eq!(Symbol::Any.to_string(), "*");
        assert_eq!(Symbol::Error.to_string(), "!");
    }

    #[test]
    fn test_state_node_lookup_order() {
        let node = node_with(vec![
            (Symbol::literal("ok"), Transition::to("finish")),
            (Symbol::Any, Transition::to("retry")),
            (Symbol::Error, Transition::to("failure")),
        ]);
        assert_eq!(node.exact("ok").unwrap().target, "finish");
        assert!(node.exact("missing").is_none());
        assert_eq!(node.wildcard().unwrap().target, "retry");
        assert_eq!(node.error_edge().unwrap().target, "failure");
    }

    #[test]
    fn test_terminal_and_wildcard_only() {
        assert!(node_with(vec![]).is_terminal());
        let router = node_with(vec![(Symbol::Any, Transition::to("finish"))]);
        assert!(router.is_wildcard_only());
        assert!(!router.is_terminal());
        let mixed = node_with(vec![
            (Symbol::literal("ok"), Transition::to("finish")),
            (Symbol::Any, Transition::to("finish")),
        ]);
        assert!(!mixed.is_wildcard_only());
    }

    #[test]
    fn test_action_name_defaults_to_state_name() {
        let mut node = node_with(vec![(Symbol::Any, Transition::to("finish"))]);
        assert_eq!(node.action_name(), "build");
        node.action = Some("run_build".to_string());
        assert_eq!(node.action_name(), "run_build");
    }

    #[test]
    fn test_transition_serde_defaults() {
        let json = r#"{"target":"finish"}"#;
        let tr: Transition = serde_json::from_str(json).unwrap();
        assert_eq!(tr.target, "finish");
        assert!(tr.exec);
        assert!(tr.wait.is_none());
        assert!(tr.max.is_none());
    }
}
