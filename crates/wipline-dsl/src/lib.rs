// Copyright (C) 2025 Wipline Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wipline DSL - State Table Compiler
//!
//! This crate turns the declarative state-table text format into an
//! immutable, validated transition graph. The text grammar is the stable
//! wire format for defining a workflow; compiled tables are consumed by the
//! executor in `wipline-core`.
//!
//! # Grammar
//!
//! ```text
//! # a build/deploy pipeline
//! start {
//!     * checkout
//! }
//! checkout:clone_sources git {
//!     ok        build
//!     !         failure
//! }
//! build ssh {
//!     ok        deploy
//!     running   build    wait=30 exec=false
//!     fail      checkout max=3
//!     !         failure
//! }
//! deploy ssh {
//!     ok        finish
//!     !         failure
//! }
//! ```
//!
//! A state block is `name[:actionName] [capabilityTag]` followed by braces
//! with one transition per line: `symbol target [wait=N] [exec=false]
//! [max=N]`. The symbol is a bare word, a single-quoted string, `*` (fires
//! for any unmatched symbol) or `!` (fires when the action errored or a
//! `max` retry count was exceeded). Capability tags are dependency-hint
//! metadata and never affect control flow.
//!
//! `${name}` macro placeholders are substituted from a caller-supplied map
//! before parsing, so shared transition fragments can be reused across
//! tables without any runtime string evaluation.
//!
//! # Compile-time guarantees
//!
//! Compilation fails (never at runtime) when a transition targets an
//! undefined state, the entry state `start` is missing, a state or symbol is
//! declared twice, a macro is unresolved, or a declared state is unreachable
//! from `start`. The built-in terminals `finish`, `failure` and `terminate`
//! are always present in the compiled graph.

use std::collections::HashMap;

use tracing::debug;

pub mod error;
pub mod macros;
mod parser;
pub mod table;
mod validate;

pub use error::{CompileError, Result};
pub use table::{
    BUILTIN_TERMINALS, CompiledTable, STATE_FAILURE, STATE_FINISH, STATE_START, STATE_TERMINATE,
    StateNode, Symbol, Transition,
};

/// Compile state table source text into an immutable graph.
///
/// Equivalent to [`compile_with_macros`] with an empty macro map; any
/// `${name}` placeholder in the source is therefore an error.
pub fn compile(source: &str) -> Result<CompiledTable> {
    compile_with_macros(source, &HashMap::new())
}

/// Compile state table source text after substituting `${name}` placeholders
/// from `macros`.
pub fn compile_with_macros(
    source: &str,
    macros: &HashMap<String, String>,
) -> Result<CompiledTable> {
    let substituted = macros::substitute(source, macros)?;
    let parsed = parser::parse(&substituted)?;
    validate::validate(&parsed)?;
    debug!(
        states = parsed.declared.len(),
        "compiled state table"
    );
    Ok(CompiledTable::new(parsed.states, parsed.declared))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_end_to_end() {
        let table = compile("start {\nok finish\n! failure\n}").unwrap();
        assert!(table.contains("start"));
        assert!(table.contains("finish"));
        assert_eq!(table.state("start").unwrap().exact("ok").unwrap().target, "finish");
    }

    #[test]
    fn test_compile_rejects_placeholders_without_macros() {
        let err = compile("start {\n${edges}\n}").unwrap_err();
        assert!(matches!(err, CompileError::UnresolvedMacro { .. }));
    }

    #[test]
    fn test_compile_with_macros_shared_fragment() {
        let mut macros = HashMap::new();
        macros.insert(
            "standard_failure".to_string(),
            "! failure".to_string(),
        );
        let table = compile_with_macros(
            "start {\nok finish\n${standard_failure}\n}",
            &macros,
        )
        .unwrap();
        assert_eq!(
            table.state("start").unwrap().error_edge().unwrap().target,
            "failure"
        );
    }

    #[test]
    fn test_required_actions_skips_routers_and_terminals() {
        let src = "start {\n* build\n}\nbuild:run_build {\nok finish\n! failure\n}";
        let table = compile(src).unwrap();
        // `start` is wildcard-only and `finish`/`failure` are terminals; only
        // the build action needs a binding.
        assert_eq!(table.required_actions(), vec!["run_build"]);
    }

    #[test]
    fn test_compiled_table_serde_round_trip() {
        let table = compile("start {\nok finish\nfail start max=3\n! failure\n}").unwrap();
        let json = serde_json::to_string(&table).unwrap();
        let back: CompiledTable = serde_json::from_str(&json).unwrap();
        assert_eq!(table, back);
    }
}
