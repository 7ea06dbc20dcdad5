// Copyright (C) 2025 Wipline Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Line-oriented parser for the state table grammar.
//!
//! A state block is `name[:actionName] [capabilityTag]` followed by `{ ... }`
//! with one transition per line:
//!
//! ```text
//! build:run_build ssh {
//!     ok        deploy
//!     'not yet' build   wait=30 exec=false
//!     fail      build   max=3
//!     *         finish
//!     !         failure
//! }
//! ```
//!
//! Comments start with `#` and run to end of line. A state declared with an
//! empty block is a caller-defined terminal. Macro placeholders are resolved
//! before this parser ever sees the text.

use std::collections::{HashMap, HashSet};

use crate::error::CompileError;
use crate::table::{BUILTIN_TERMINALS, StateNode, Symbol, Transition};

/// Raw parse result, before validation.
#[derive(Debug)]
pub(crate) struct ParsedTable {
    pub states: HashMap<String, StateNode>,
    /// State names in declaration order (built-in terminals excluded unless
    /// explicitly declared).
    pub declared: Vec<String>,
}

/// Parse substituted source text into states.
///
/// Built-in terminals (`finish`, `failure`, `terminate`) are injected if the
/// source does not declare them.
pub(crate) fn parse(source: &str) -> Result<ParsedTable, CompileError> {
    let mut states: HashMap<String, StateNode> = HashMap::new();
    let mut declared: Vec<String> = Vec::new();

    // Header parsed but `{` not yet seen (brace on the following line).
    let mut pending: Option<Header> = None;
    // Block currently being filled.
    let mut open: Option<OpenState> = None;

    for (idx, raw) in source.lines().enumerate() {
        let line_no = idx + 1;
        let line = strip_comment(raw).trim().to_string();
        if line.is_empty() {
            continue;
        }

        if open.is_some() {
            if line == "}" {
                let block = open.take().expect("open block");
                insert_state(&mut states, &mut declared, block.into_node(), line_no)?;
            } else {
                let block = open.as_mut().expect("open block");
                let (symbol, transition) = parse_transition(&line, line_no)?;
                if !block.seen.insert(symbol.clone()) {
                    return Err(CompileError::DuplicateSymbol {
                        line: line_no,
                        state: block.header.name.clone(),
                        symbol: symbol.to_string(),
                    });
                }
                block.transitions.push((symbol, transition));
            }
            continue;
        }

        if pending.is_some() {
            let header = pending.take().expect("pending header");
            if line == "{" {
                open = Some(OpenState::new(header));
            } else if line == "{}" {
                insert_state(
                    &mut states,
                    &mut declared,
                    OpenState::new(header).into_node(),
                    line_no,
                )?;
            } else {
                return Err(CompileError::Syntax {
                    line: line_no,
                    message: "expected '{' after state header".to_string(),
                });
            }
            continue;
        }

        let (header, brace) = parse_header(&line, line_no)?;
        match brace {
            Brace::Open => open = Some(OpenState::new(header)),
            Brace::Closed => insert_state(
                &mut states,
                &mut declared,
                OpenState::new(header).into_node(),
                line_no,
            )?,
            Brace::None => pending = Some(header),
        }
    }

    if let Some(block) = open {
        return Err(CompileError::Syntax {
            line: source.lines().count(),
            message: format!("unterminated block for state '{}'", block.header.name),
        });
    }
    if let Some(header) = pending {
        return Err(CompileError::Syntax {
            line: source.lines().count(),
            message: format!("state '{}' has no block", header.name),
        });
    }

    for name in BUILTIN_TERMINALS {
        states.entry(name.to_string()).or_insert_with(|| StateNode {
            name: name.to_string(),
            action: None,
            capability: None,
            transitions: Vec::new(),
        });
    }

    Ok(ParsedTable { states, declared })
}

struct Header {
    name: String,
    action: Option<String>,
    capability: Option<String>,
}

struct OpenState {
    header: Header,
    transitions: Vec<(Symbol, Transition)>,
    seen: HashSet<Symbol>,
}

impl OpenState {
    fn new(header: Header) -> Self {
        Self {
            header,
            transitions: Vec::new(),
            seen: HashSet::new(),
        }
    }

    fn into_node(self) -> StateNode {
        StateNode {
            name: self.header.name,
            action: self.header.action,
            capability: self.header.capability,
            transitions: self.transitions,
        }
    }
}

fn insert_state(
    states: &mut HashMap<String, StateNode>,
    declared: &mut Vec<String>,
    node: StateNode,
    line: usize,
) -> Result<(), CompileError> {
    if states.contains_key(&node.name) {
        return Err(CompileError::DuplicateState {
            line,
            name: node.name,
        });
    }
    declared.push(node.name.clone());
    states.insert(node.name.clone(), node);
    Ok(())
}

enum Brace {
    /// Header line ends with `{`.
    Open,
    /// Header line ends with `{}` - an empty (terminal) block.
    Closed,
    /// No brace on the header line.
    None,
}

fn parse_header(line: &str, line_no: usize) -> Result<(Header, Brace), CompileError> {
    let (head, brace) = if let Some(stripped) = line.strip_suffix("{}") {
        (stripped.trim_end(), Brace::Closed)
    } else if let Some(stripped) = line.strip_suffix('{') {
        (stripped.trim_end(), Brace::Open)
    } else {
        (line, Brace::None)
    };

    let mut parts = head.split_whitespace();
    let name_part = parts.next().ok_or_else(|| CompileError::Syntax {
        line: line_no,
        message: "missing state name".to_string(),
    })?;
    let capability = parts.next().map(str::to_string);
    if parts.next().is_some() {
        return Err(CompileError::Syntax {
            line: line_no,
            message: "unexpected tokens after capability tag".to_string(),
        });
    }

    let (name, action) = match name_part.split_once(':') {
        Some((name, action)) => {
            check_ident(action, "action name", line_no)?;
            (name, Some(action.to_string()))
        }
        None => (name_part, None),
    };
    check_ident(name, "state name", line_no)?;
    if let Some(cap) = &capability {
        check_ident(cap, "capability tag", line_no)?;
    }

    Ok((
        Header {
            name: name.to_string(),
            action,
            capability,
        },
        brace,
    ))
}

fn parse_transition(line: &str, line_no: usize) -> Result<(Symbol, Transition), CompileError> {
    let (symbol, rest) = parse_symbol(line, line_no)?;

    let mut tokens = rest.split_whitespace();
    let target = tokens.next().ok_or_else(|| CompileError::Syntax {
        line: line_no,
        message: format!("transition '{}' is missing a target state", symbol),
    })?;
    check_ident(target, "target state", line_no)?;

    let mut transition = Transition::to(target);
    for token in tokens {
        let (key, value) = token.split_once('=').ok_or_else(|| CompileError::Syntax {
            line: line_no,
            message: format!("expected attribute 'key=value', found '{}'", token),
        })?;
        match key {
            "wait" => {
                transition.wait = Some(value.parse().map_err(|_| CompileError::Syntax {
                    line: line_no,
                    message: format!("wait wants a non-negative integer, found '{}'", value),
                })?);
            }
            "exec" => {
                transition.exec = match value {
                    "true" => true,
                    "false" => false,
                    other => {
                        return Err(CompileError::Syntax {
                            line: line_no,
                            message: format!("exec wants true or false, found '{}'", other),
                        });
                    }
                };
            }
            "max" => {
                transition.max = Some(value.parse().map_err(|_| CompileError::Syntax {
                    line: line_no,
                    message: format!("max wants a positive integer, found '{}'", value),
                })?);
            }
            other => {
                return Err(CompileError::Syntax {
                    line: line_no,
                    message: format!("unknown transition attribute '{}'", other),
                });
            }
        }
    }

    Ok((symbol, transition))
}

/// Parse the leading symbol of a transition line, returning the remainder.
fn parse_symbol<'a>(line: &'a str, line_no: usize) -> Result<(Symbol, &'a str), CompileError> {
    if let Some(rest) = line.strip_prefix('\'') {
        let close = rest.find('\'').ok_or_else(|| CompileError::Syntax {
            line: line_no,
            message: "unterminated quoted symbol".to_string(),
        })?;
        return Ok((Symbol::literal(&rest[..close]), &rest[close + 1..]));
    }

    let token_end = line
        .find(char::is_whitespace)
        .unwrap_or(line.len());
    let token = &line[..token_end];
    let rest = &line[token_end..];
    let symbol = match token {
        "*" => Symbol::Any,
        "!" => Symbol::Error,
        word => Symbol::literal(word),
    };
    Ok((symbol, rest))
}

/// Cut a `#` comment, respecting single-quoted symbols.
fn strip_comment(line: &str) -> &str {
    let mut in_quote = false;
    for (i, c) in line.char_indices() {
        match c {
            '\'' => in_quote = !in_quote,
            '#' if !in_quote => return &line[..i],
            _ => {}
        }
    }
    line
}

fn check_ident(s: &str, what: &str, line_no: usize) -> Result<(), CompileError> {
    let mut chars = s.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(CompileError::Syntax {
            line: line_no,
            message: format!("invalid {} '{}'", what, s),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{STATE_FAILURE, STATE_FINISH, STATE_TERMINATE};

    #[test]
    fn test_parse_minimal_table() {
        let parsed = parse("start {\n* finish\n}").unwrap();
        assert_eq!(parsed.declared, vec!["start"]);
        let start = &parsed.states["start"];
        assert_eq!(start.transitions.len(), 1);
        assert_eq!(start.transitions[0].1.target, "finish");
    }

    #[test]
    fn test_builtin_terminals_injected() {
        let parsed = parse("start {\n* finish\n}").unwrap();
        for name in [STATE_FINISH, STATE_FAILURE, STATE_TERMINATE] {
            assert!(parsed.states[name].is_terminal(), "{} should exist", name);
        }
        // Injected terminals are not "declared".
        assert!(!parsed.declared.iter().any(|s| s == STATE_FINISH));
    }

    #[test]
    fn test_header_with_action_and_capability() {
        let parsed = parse("start:kickoff ssh {\n* finish\n}").unwrap();
        let start = &parsed.states["start"];
        assert_eq!(start.action.as_deref(), Some("kickoff"));
        assert_eq!(start.capability.as_deref(), Some("ssh"));
        assert_eq!(start.action_name(), "kickoff");
    }

    #[test]
    fn test_brace_on_next_line() {
        let parsed = parse("start\n{\n* finish\n}").unwrap();
        assert!(parsed.states.contains_key("start"));
    }

    #[test]
    fn test_empty_block_is_terminal() {
        let parsed = parse("start {\n* done\n}\ndone {}").unwrap();
        assert!(parsed.states["done"].is_terminal());
        assert_eq!(parsed.declared, vec!["start", "done"]);
    }

    #[test]
    fn test_transition_attributes() {
        let parsed = parse("start {\npoll start wait=30 exec=false max=5\n* finish\n}").unwrap();
        let tr = parsed.states["start"].exact("poll").unwrap();
        assert_eq!(tr.wait, Some(30));
        assert!(!tr.exec);
        assert_eq!(tr.max, Some(5));
    }

    #[test]
    fn test_quoted_symbol_with_spaces() {
        let parsed = parse("start {\n'not yet' start wait=10\n* finish\n}").unwrap();
        assert!(parsed.states["start"].exact("not yet").is_some());
    }

    #[test]
    fn test_comments_ignored() {
        let src = "# table comment\nstart { # trailing\n* finish # edge comment\n}\n";
        let parsed = parse(src).unwrap();
        assert_eq!(parsed.states["start"].transitions.len(), 1);
    }

    #[test]
    fn test_duplicate_state_rejected() {
        let err = parse("start {\n* finish\n}\nstart {\n* finish\n}").unwrap_err();
        assert!(matches!(err, CompileError::DuplicateState { name, .. } if name == "start"));
    }

    #[test]
    fn test_duplicate_symbol_rejected() {
        let err = parse("start {\nok finish\nok failure\n}").unwrap_err();
        assert!(matches!(err, CompileError::DuplicateSymbol { symbol, .. } if symbol == "ok"));
    }

    #[test]
    fn test_missing_target_rejected() {
        let err = parse("start {\nok\n}").unwrap_err();
        assert!(matches!(err, CompileError::Syntax { line: 2, .. }));
    }

    #[test]
    fn test_unknown_attribute_rejected() {
        let err = parse("start {\nok finish backoff=2\n}").unwrap_err();
        assert!(matches!(err, CompileError::Syntax { .. }));
    }

    #[test]
    fn test_unterminated_block_rejected() {
        let err = parse("start {\nok finish\n").unwrap_err();
        assert!(matches!(err, CompileError::Syntax { .. }));
    }
}
