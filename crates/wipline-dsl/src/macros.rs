// Copyright (C) 2025 Wipline Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Macro substitution for the state table DSL.
//!
//! `${name}` placeholders are replaced from a caller-supplied map before the
//! text is tokenized. A placeholder value may itself contain placeholders
//! (sub-table variables), so substitution runs in passes until the text
//! settles, bounded by [`MAX_PASSES`].

use std::collections::HashMap;

use crate::error::CompileError;

/// Upper bound on substitution passes before assuming a macro cycle.
pub const MAX_PASSES: usize = 8;

/// Replace every `${name}` placeholder in `source` from `macros`.
///
/// Returns the fully substituted text. Fails with
/// [`CompileError::UnresolvedMacro`] when a placeholder has no entry, and
/// [`CompileError::MacroDepthExceeded`] when expansion does not settle.
pub fn substitute(
    source: &str,
    macros: &HashMap<String, String>,
) -> Result<String, CompileError> {
    let mut text = source.to_string();
    for _ in 0..MAX_PASSES {
        if !text.contains("${") {
            return Ok(text);
        }
        text = substitute_pass(&text, macros)?;
    }
    if text.contains("${") {
        return Err(CompileError::MacroDepthExceeded { limit: MAX_PASSES });
    }
    Ok(text)
}

/// One substitution pass over the whole text.
fn substitute_pass(
    text: &str,
    macros: &HashMap<String, String>,
) -> Result<String, CompileError> {
    let mut out = String::with_capacity(text.len());
    for (line_no, line) in text.lines().enumerate() {
        if line_no > 0 {
            out.push('\n');
        }
        out.push_str(&substitute_line(line, line_no + 1, macros)?);
    }
    Ok(out)
}

fn substitute_line(
    line: &str,
    line_no: usize,
    macros: &HashMap<String, String>,
) -> Result<String, CompileError> {
    let mut out = String::with_capacity(line.len());
    let mut rest = line;
    while let Some(open) = rest.find("${") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let close = after.find('}').ok_or_else(|| CompileError::Syntax {
            line: line_no,
            message: "unterminated macro placeholder".to_string(),
        })?;
        let name = &after[..close];
        match macros.get(name) {
            Some(value) => out.push_str(value),
            None => {
                return Err(CompileError::UnresolvedMacro {
                    line: line_no,
                    name: name.to_string(),
                });
            }
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_simple_substitution() {
        let out = substitute("a ${x} b", &map(&[("x", "middle")])).unwrap();
        assert_eq!(out, "a middle b");
    }

    #[test]
    fn test_multiline_value() {
        let macros = map(&[("retry_edges", "fail  start max=3\n! failure")]);
        let out = substitute("build {\n${retry_edges}\n}", &macros).unwrap();
        assert_eq!(out, "build {\nfail  start max=3\n! failure\n}");
    }

    #[test]
    fn test_nested_macro_resolves() {
        let macros = map(&[("outer", "x ${inner} y"), ("inner", "core")]);
        let out = substitute("${outer}", &macros).unwrap();
        assert_eq!(out, "x core y");
    }

    #[test]
    fn test_unresolved_placeholder() {
        let err = substitute("line one\n${missing}", &map(&[])).unwrap_err();
        assert_eq!(
            err,
            CompileError::UnresolvedMacro {
                line: 2,
                name: "missing".to_string()
            }
        );
    }

    #[test]
    fn test_macro_cycle_detected() {
        let macros = map(&[("a", "${b}"), ("b", "${a}")]);
        let err = substitute("${a}", &macros).unwrap_err();
        assert!(matches!(err, CompileError::MacroDepthExceeded { .. }));
    }

    #[test]
    fn test_unterminated_placeholder() {
        let err = substitute("${open", &map(&[])).unwrap_err();
        assert!(matches!(err, CompileError::Syntax { line: 1, .. }));
    }

    #[test]
    fn test_no_placeholders_is_identity() {
        let src = "start { * finish }";
        assert_eq!(substitute(src, &map(&[])).unwrap(), src);
    }
}
