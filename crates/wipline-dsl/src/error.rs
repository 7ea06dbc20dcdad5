// Copyright (C) 2025 Wipline Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Compile errors for the state table DSL.

use thiserror::Error;

/// Result type using CompileError.
pub type Result<T> = std::result::Result<T, CompileError>;

/// Errors raised while compiling a state table.
///
/// All of these are compile-time failures: a table that produces any of them
/// cannot be scheduled.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum CompileError {
    /// A `${name}` placeholder had no entry in the macro map.
    #[error("line {line}: unresolved macro placeholder '${{{name}}}'")]
    UnresolvedMacro {
        /// Line number (1-based) where the placeholder appears.
        line: usize,
        /// Placeholder name.
        name: String,
    },

    /// Macro expansion did not settle within the substitution depth limit.
    #[error("macro substitution exceeded {limit} passes (cycle in macro definitions?)")]
    MacroDepthExceeded {
        /// Maximum number of substitution passes.
        limit: usize,
    },

    /// A line could not be parsed.
    #[error("line {line}: {message}")]
    Syntax {
        /// Line number (1-based).
        line: usize,
        /// What went wrong.
        message: String,
    },

    /// The same state name was declared twice.
    #[error("line {line}: duplicate state '{name}'")]
    DuplicateState {
        /// Line number of the second declaration.
        line: usize,
        /// The state name.
        name: String,
    },

    /// The same transition symbol appeared twice within one state block.
    #[error("line {line}: duplicate transition symbol '{symbol}' in state '{state}'")]
    DuplicateSymbol {
        /// Line number of the second occurrence.
        line: usize,
        /// The state being parsed.
        state: String,
        /// The repeated symbol.
        symbol: String,
    },

    /// A transition points at a state that is not declared anywhere.
    #[error("state '{state}': transition '{symbol}' targets undefined state '{target}'")]
    UndefinedTarget {
        /// The state owning the transition.
        state: String,
        /// The transition symbol.
        symbol: String,
        /// The missing target state.
        target: String,
    },

    /// The table does not declare the entry state.
    #[error("table does not declare the entry state 'start'")]
    MissingStart,

    /// A declared state can never be reached from `start`.
    #[error("state '{state}' is unreachable from 'start'")]
    UnreachableState {
        /// The unreachable state.
        state: String,
    },
}

impl CompileError {
    /// Machine-readable error code for this error variant.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::UnresolvedMacro { .. } => "UNRESOLVED_MACRO",
            Self::MacroDepthExceeded { .. } => "MACRO_DEPTH_EXCEEDED",
            Self::Syntax { .. } => "SYNTAX_ERROR",
            Self::DuplicateState { .. } => "DUPLICATE_STATE",
            Self::DuplicateSymbol { .. } => "DUPLICATE_SYMBOL",
            Self::UndefinedTarget { .. } => "UNDEFINED_TARGET",
            Self::MissingStart => "MISSING_START",
            Self::UnreachableState { .. } => "UNREACHABLE_STATE",
        }
    }
}
