// Copyright (C) 2025 Wipline Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-task mutable state: contexts, counters, links and the transcript.
//!
//! A [`ContextSet`] holds one [`Context`] bag per state plus the bookkeeping
//! the executor needs across ticks: per-(state, symbol) retry counters, the
//! passive-tick flag, the last captured action error and the transcript.
//! Everything here is plain serializable data - never live resources - so a
//! suspended task can resume on any worker.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::transcript::Transcript;

/// Reserved context key the executor materializes remote completion signals
/// under.
pub const REMOTE_EXIT_KEY: &str = "remote_exit";

/// Reserved context key custom signal payloads are materialized under.
pub const SIGNAL_KEY: &str = "signal";

/// One state's key/value bag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Context {
    values: HashMap<String, Value>,
}

impl Context {
    /// Read a value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Read a string value.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    /// Write a value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    /// Remove a value, returning it.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    /// True when the bag holds no values.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// An action error captured by the executor, kept until a terminal state
/// decides the exit status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedError {
    /// The state whose action failed.
    pub state: String,
    /// Error message.
    pub message: String,
    /// True for domain/user errors (ERROR_USER), false for system errors.
    pub user_error: bool,
    /// When the error was captured.
    pub at: DateTime<Utc>,
}

/// The full mutable state of one task's state machine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextSet {
    /// State name -> context bag.
    contexts: HashMap<String, Context>,
    /// Alias name -> canonical state name. Links are lookups, never copies.
    links: HashMap<String, String>,
    /// Per-state, per-symbol retry counters.
    counters: HashMap<String, HashMap<String, u32>>,
    /// The symbol that last fired from each state; a different symbol resets
    /// that state's counter run.
    last_symbol: HashMap<String, String>,
    /// State whose next ticks are passive (entered via `exec=false`).
    skip_exec: Option<String>,
    /// Seconds of the most recent `wait` attribute, reused when a passive
    /// re-check observes nothing.
    last_wait: Option<u64>,
    /// Last time the machine moved to a *different* state. Drives the
    /// no-progress watchdog; self-transitions do not reset it.
    last_progress_at: Option<DateTime<Utc>>,
    /// Last captured action error, if any.
    last_error: Option<CapturedError>,
    /// Recorded (state, symbol) history.
    transcript: Transcript,
}

impl ContextSet {
    /// An empty context set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a state name through the link table to its canonical owner.
    pub fn resolve(&self, state: &str) -> String {
        match self.links.get(state) {
            Some(canonical) => canonical.clone(),
            None => state.to_string(),
        }
    }

    /// Read-only access to a state's context (link-aware).
    pub fn context(&self, state: &str) -> Option<&Context> {
        self.contexts.get(&self.resolve(state))
    }

    /// Mutable access to a state's context (link-aware), created on first
    /// use.
    pub fn context_mut(&mut self, state: &str) -> &mut Context {
        let canonical = self.resolve(state);
        self.contexts.entry(canonical).or_default()
    }

    /// Alias `alias` to `canonical` so two states share one context.
    ///
    /// The alias never owns data: writes through it land in the canonical
    /// state's bag.
    pub fn link(&mut self, alias: impl Into<String>, canonical: impl Into<String>) {
        self.links.insert(alias.into(), canonical.into());
    }

    /// Drop an alias. The canonical data is untouched.
    pub fn unlink(&mut self, alias: &str) {
        self.links.remove(alias);
    }

    /// Bump the retry counter for (state, symbol).
    ///
    /// Repeating the same symbol from the same state increments; a different
    /// symbol resets the run to 1.
    pub fn bump_counter(&mut self, state: &str, symbol: &str) -> u32 {
        let repeat = self
            .last_symbol
            .get(state)
            .is_some_and(|last| last == symbol);
        let per_state = self.counters.entry(state.to_string()).or_default();
        let count = if repeat {
            per_state
                .entry(symbol.to_string())
                .and_modify(|c| *c += 1)
                .or_insert(1)
        } else {
            per_state.clear();
            per_state.entry(symbol.to_string()).or_insert(1)
        };
        let count = *count;
        self.last_symbol
            .insert(state.to_string(), symbol.to_string());
        count
    }

    /// Current counter value for (state, symbol), 0 if never fired.
    pub fn counter(&self, state: &str, symbol: &str) -> u32 {
        self.counters
            .get(state)
            .and_then(|per_state| per_state.get(symbol))
            .copied()
            .unwrap_or(0)
    }

    /// Mark `state` so its next ticks skip the action and only run the
    /// passive status check.
    pub fn set_passive(&mut self, state: &str) {
        self.skip_exec = Some(state.to_string());
    }

    /// Clear the passive flag (on any transition).
    pub fn clear_passive(&mut self) {
        self.skip_exec = None;
    }

    /// True when ticks of `state` are currently passive.
    pub fn is_passive(&self, state: &str) -> bool {
        self.skip_exec.as_deref() == Some(state)
    }

    /// Remember the most recent `wait` attribute.
    pub fn set_last_wait(&mut self, secs: u64) {
        self.last_wait = Some(secs);
    }

    /// The most recent `wait` attribute, if any.
    pub fn last_wait(&self) -> Option<u64> {
        self.last_wait
    }

    /// Record that the machine moved to a different state.
    pub fn note_progress(&mut self, at: DateTime<Utc>) {
        self.last_progress_at = Some(at);
    }

    /// Last time the machine moved to a different state.
    pub fn last_progress_at(&self) -> Option<DateTime<Utc>> {
        self.last_progress_at
    }

    /// Store a captured action error.
    pub fn capture_error(&mut self, error: CapturedError) {
        self.last_error = Some(error);
    }

    /// The last captured action error.
    pub fn last_error(&self) -> Option<&CapturedError> {
        self.last_error.as_ref()
    }

    /// Clear the captured error (on clean completion).
    pub fn clear_error(&mut self) {
        self.last_error = None;
    }

    /// The recorded transcript.
    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    /// Mutable transcript access for the executor.
    pub fn transcript_mut(&mut self) -> &mut Transcript {
        &mut self.transcript
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_values() {
        let mut ctx = Context::default();
        ctx.set("build_host", "worker-3");
        ctx.set("attempt", 2);
        assert_eq!(ctx.get_str("build_host"), Some("worker-3"));
        assert_eq!(ctx.get("attempt"), Some(&Value::from(2)));
        assert!(ctx.remove("attempt").is_some());
        assert!(ctx.get("attempt").is_none());
    }

    #[test]
    fn test_linked_context_shares_data_without_copying() {
        let mut set = ContextSet::new();
        set.context_mut("build").set("artifact", "app.tar.gz");
        set.link("deploy", "build");

        // Reads through the alias see the canonical data.
        assert_eq!(
            set.context("deploy").unwrap().get_str("artifact"),
            Some("app.tar.gz")
        );

        // Writes through the alias land in the canonical bag.
        set.context_mut("deploy").set("checksum", "abc123");
        assert_eq!(
            set.context("build").unwrap().get_str("checksum"),
            Some("abc123")
        );

        set.unlink("deploy");
        assert!(set.context("deploy").is_none());
        assert_eq!(
            set.context("build").unwrap().get_str("artifact"),
            Some("app.tar.gz")
        );
    }

    #[test]
    fn test_counter_increments_on_repeat() {
        let mut set = ContextSet::new();
        assert_eq!(set.bump_counter("build", "fail"), 1);
        assert_eq!(set.bump_counter("build", "fail"), 2);
        assert_eq!(set.bump_counter("build", "fail"), 3);
        assert_eq!(set.counter("build", "fail"), 3);
    }

    #[test]
    fn test_counter_resets_on_different_symbol() {
        let mut set = ContextSet::new();
        set.bump_counter("build", "fail");
        set.bump_counter("build", "fail");
        // A different symbol from the same state resets the run.
        assert_eq!(set.bump_counter("build", "ok"), 1);
        assert_eq!(set.counter("build", "fail"), 0);
        assert_eq!(set.bump_counter("build", "fail"), 1);
    }

    #[test]
    fn test_counters_are_per_state() {
        let mut set = ContextSet::new();
        set.bump_counter("build", "fail");
        set.bump_counter("deploy", "fail");
        assert_eq!(set.counter("build", "fail"), 1);
        assert_eq!(set.counter("deploy", "fail"), 1);
    }

    #[test]
    fn test_passive_flag() {
        let mut set = ContextSet::new();
        set.set_passive("build");
        assert!(set.is_passive("build"));
        assert!(!set.is_passive("deploy"));
        set.clear_passive();
        assert!(!set.is_passive("build"));
    }

    #[test]
    fn test_serde_round_trip_preserves_everything() {
        let mut set = ContextSet::new();
        set.context_mut("build").set("artifact", "x");
        set.link("deploy", "build");
        set.bump_counter("build", "fail");
        set.set_passive("build");
        set.set_last_wait(30);
        set.note_progress(Utc::now());

        let json = serde_json::to_string(&set).unwrap();
        let back: ContextSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back.counter("build", "fail"), 1);
        assert!(back.is_passive("build"));
        assert_eq!(back.last_wait(), Some(30));
        assert_eq!(
            back.context("deploy").unwrap().get_str("artifact"),
            Some("x")
        );
    }
}
