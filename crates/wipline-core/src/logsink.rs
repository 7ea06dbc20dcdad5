// Copyright (C) 2025 Wipline Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Observability port.
//!
//! The executor and scheduler report through a [`LogSink`] so the embedding
//! application decides where messages land. The sink never participates in
//! control flow. The default implementation forwards to `tracing`.

use uuid::Uuid;

/// Severity of a log message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Internal detail.
    Debug,
    /// Normal progress.
    Info,
    /// Something unexpected but recoverable.
    Warning,
    /// Something failed.
    Error,
}

impl LogLevel {
    /// String form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

/// Where executor and scheduler messages go.
pub trait LogSink: Send + Sync {
    /// Record a message.
    ///
    /// `object_id` ties the message to a task; `user_readable` marks
    /// messages fit for operator-facing surfaces (as opposed to internal
    /// diagnostics).
    fn log(&self, level: LogLevel, message: &str, object_id: Option<Uuid>, user_readable: bool);
}

/// Default sink forwarding to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn log(&self, level: LogLevel, message: &str, object_id: Option<Uuid>, user_readable: bool) {
        let task = object_id.map(|id| id.to_string()).unwrap_or_default();
        match level {
            LogLevel::Debug => {
                tracing::debug!(task = %task, user_readable, "{}", message)
            }
            LogLevel::Info => tracing::info!(task = %task, user_readable, "{}", message),
            LogLevel::Warning => {
                tracing::warn!(task = %task, user_readable, "{}", message)
            }
            LogLevel::Error => {
                tracing::error!(task = %task, user_readable, "{}", message)
            }
        }
    }
}
