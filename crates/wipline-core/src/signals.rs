// Copyright (C) 2025 Wipline Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Asynchronous signals: durable, at-most-once-consumed messages.
//!
//! Signals report out-of-band completions (a remote process the scheduler
//! never observed finishing) or termination requests for a suspended task.
//! Sending is an idempotent upsert keyed by the signal id; consuming flips
//! `consumed_time` from unset to set exactly once, safely under concurrent
//! consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Signal category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    /// A remote process finished; carries its terminal result.
    RemoteExit,
    /// Request the task to route to a terminal state on its next tick.
    Terminate,
    /// Application-defined payload.
    Custom,
}

impl SignalType {
    /// Storage string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RemoteExit => "remote_exit",
            Self::Terminate => "terminate",
            Self::Custom => "custom",
        }
    }

    /// Parse from the storage string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "remote_exit" => Some(Self::RemoteExit),
            "terminate" => Some(Self::Terminate),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Typed signal payload, serialized as tagged JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalPayload {
    /// Terminal result of a remote process.
    RemoteProcessExit {
        /// Process id on the originating server.
        pid: i64,
        /// Process exit code.
        exit_code: i32,
        /// Captured output (stdout/stderr interleaved).
        output: String,
        /// Originating server name.
        server: String,
    },
    /// Graceful termination request.
    Terminate {
        /// Why termination was requested.
        reason: String,
    },
    /// Application-defined data.
    Custom {
        /// Opaque payload.
        data: Value,
    },
}

/// A durable asynchronous message addressed to one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// Identity; re-sending the same id is a no-op upsert.
    pub signal_id: String,
    /// The task this signal is for.
    pub object_id: Uuid,
    /// Signal category.
    pub signal_type: SignalType,
    /// When the signal was sent.
    pub sent_time: DateTime<Utc>,
    /// When the signal was consumed; None while active.
    pub consumed_time: Option<DateTime<Utc>>,
    /// Typed payload.
    pub payload: SignalPayload,
}

impl Signal {
    /// Completion report for a remote process.
    ///
    /// The id is derived from (task, server, pid) so a reporter retrying the
    /// send never duplicates the signal.
    pub fn remote_exit(
        object_id: Uuid,
        server: impl Into<String>,
        pid: i64,
        exit_code: i32,
        output: impl Into<String>,
    ) -> Self {
        let server = server.into();
        Self {
            signal_id: format!("remote-{}-{}-{}", object_id, server, pid),
            object_id,
            signal_type: SignalType::RemoteExit,
            sent_time: Utc::now(),
            consumed_time: None,
            payload: SignalPayload::RemoteProcessExit {
                pid,
                exit_code,
                output: output.into(),
                server,
            },
        }
    }

    /// Termination request.
    ///
    /// One per task: repeated requests collapse onto the same signal id.
    pub fn terminate(object_id: Uuid, reason: impl Into<String>) -> Self {
        Self {
            signal_id: format!("terminate-{}", object_id),
            object_id,
            signal_type: SignalType::Terminate,
            sent_time: Utc::now(),
            consumed_time: None,
            payload: SignalPayload::Terminate {
                reason: reason.into(),
            },
        }
    }

    /// Application-defined signal with an explicit id.
    pub fn custom(object_id: Uuid, signal_id: impl Into<String>, data: Value) -> Self {
        Self {
            signal_id: signal_id.into(),
            object_id,
            signal_type: SignalType::Custom,
            sent_time: Utc::now(),
            consumed_time: None,
            payload: SignalPayload::Custom { data },
        }
    }

    /// True while the signal has not been consumed.
    pub fn is_active(&self) -> bool {
        self.consumed_time.is_none()
    }
}
