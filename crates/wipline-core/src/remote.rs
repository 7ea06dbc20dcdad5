// Copyright (C) 2025 Wipline Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Remote execution port, consumed by actions.
//!
//! SSH and container specifics live behind this boundary, outside the core.
//! Actions submit work, store the returned handle's identifiers in their
//! context (never the live connection), suspend, and later poll by handle.
//! Completion usually arrives instead as a remote-exit signal from the
//! executing side, which is why the core itself never calls this port.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::actions::ActionError;

/// Identifier for submitted remote work. Plain data, safe to serialize into
/// a task context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteHandle {
    /// Server the command runs on.
    pub server: String,
    /// Process id on that server.
    pub pid: i64,
}

/// Result of polling a remote handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteStatus {
    /// Still running.
    Running,
    /// Finished with this exit code and captured output.
    Exited {
        /// Process exit code.
        exit_code: i32,
        /// Captured output.
        output: String,
    },
    /// The handle no longer maps to a known process.
    Unknown,
}

/// Transport for executing and polling remote commands.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Start a command on a server, returning an opaque handle.
    async fn submit(&self, server: &str, command: &str) -> Result<RemoteHandle, ActionError>;

    /// Poll a previously submitted handle.
    async fn poll(&self, handle: &RemoteHandle) -> Result<RemoteStatus, ActionError>;
}
