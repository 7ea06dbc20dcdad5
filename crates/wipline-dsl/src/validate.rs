// Copyright (C) 2025 Wipline Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Validation pass over a parsed table.
//!
//! Checks run in a fixed order so errors are deterministic: the entry state
//! must be declared, every transition target must exist, and every declared
//! state must be reachable from `start`. Built-in terminals are exempt from
//! the reachability check because the executor routes to them implicitly.

use std::collections::HashSet;

use crate::error::CompileError;
use crate::parser::ParsedTable;
use crate::table::{BUILTIN_TERMINALS, STATE_START};

pub(crate) fn validate(parsed: &ParsedTable) -> Result<(), CompileError> {
    if !parsed.declared.iter().any(|s| s == STATE_START) {
        return Err(CompileError::MissingStart);
    }

    // Every transition target must exist somewhere in the table.
    for name in &parsed.declared {
        let node = &parsed.states[name];
        for (symbol, transition) in &node.transitions {
            if !parsed.states.contains_key(&transition.target) {
                return Err(CompileError::UndefinedTarget {
                    state: name.clone(),
                    symbol: symbol.to_string(),
                    target: transition.target.clone(),
                });
            }
        }
    }

    // Breadth-first reachability from the entry state.
    let mut visited: HashSet<&str> = HashSet::new();
    let mut queue: Vec<&str> = vec![STATE_START];
    while let Some(name) = queue.pop() {
        if !visited.insert(name) {
            continue;
        }
        if let Some(node) = parsed.states.get(name) {
            for (_, transition) in &node.transitions {
                queue.push(&transition.target);
            }
        }
    }

    for name in &parsed.declared {
        if !visited.contains(name.as_str()) && !BUILTIN_TERMINALS.contains(&name.as_str()) {
            return Err(CompileError::UnreachableState {
                state: name.clone(),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    #[test]
    fn test_missing_start() {
        let parsed = parse("build {\n* finish\n}").unwrap();
        assert_eq!(validate(&parsed).unwrap_err(), CompileError::MissingStart);
    }

    #[test]
    fn test_undefined_target() {
        let parsed = parse("start {\nok nowhere\n}").unwrap();
        let err = validate(&parsed).unwrap_err();
        assert!(
            matches!(err, CompileError::UndefinedTarget { target, .. } if target == "nowhere")
        );
    }

    #[test]
    fn test_builtin_targets_always_defined() {
        let parsed = parse("start {\nok finish\nbad failure\nstop terminate\n}").unwrap();
        assert!(validate(&parsed).is_ok());
    }

    #[test]
    fn test_unreachable_state() {
        let parsed = parse("start {\n* finish\n}\nisland {\n* finish\n}").unwrap();
        let err = validate(&parsed).unwrap_err();
        assert!(matches!(err, CompileError::UnreachableState { state } if state == "island"));
    }

    #[test]
    fn test_explicitly_declared_failure_is_exempt_from_reachability() {
        // `failure` is routed to implicitly via `!`, so declaring it with an
        // action but no inbound edge is legal.
        let parsed = parse("start {\n* finish\n}\nfailure:notify_operator {}").unwrap();
        assert!(validate(&parsed).is_ok());
    }

    #[test]
    fn test_reachability_through_chain() {
        let src = "start {\n* build\n}\nbuild {\nok deploy\n! failure\n}\ndeploy {\n* finish\n}";
        let parsed = parse(src).unwrap();
        assert!(validate(&parsed).is_ok());
    }
}
