// Copyright (C) 2025 Wipline Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution transcripts and the simulation-script view.
//!
//! When recording is enabled the executor appends one entry per transition.
//! The rendered form is the chain of states and symbols the machine walked,
//! e.g. `start => 'value' => finish`; the simulation-script view groups
//! symbols per state so a completed run can be replayed in tests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One recorded transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    /// State the machine was in.
    pub from: String,
    /// Symbol that fired.
    pub symbol: String,
    /// State the machine moved to.
    pub to: String,
    /// When the transition happened.
    pub at: DateTime<Utc>,
}

/// Ordered record of every transition a task took.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
}

impl Transcript {
    /// Append a transition.
    pub fn record(
        &mut self,
        from: impl Into<String>,
        symbol: impl Into<String>,
        to: impl Into<String>,
        at: DateTime<Utc>,
    ) {
        self.entries.push(TranscriptEntry {
            from: from.into(),
            symbol: symbol.into(),
            to: to.into(),
            at,
        });
    }

    /// The recorded entries, oldest first.
    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    /// The most recent `n` entries, oldest first.
    pub fn tail(&self, n: usize) -> &[TranscriptEntry] {
        let start = self.entries.len().saturating_sub(n);
        &self.entries[start..]
    }

    /// True when nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of recorded transitions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Render the walked chain: `start => 'sym' => next => 'sym2' => finish`.
    pub fn render(&self) -> String {
        let Some(first) = self.entries.first() else {
            return String::new();
        };
        let mut out = first.from.clone();
        for entry in &self.entries {
            out.push_str(&format!(" => '{}' => {}", entry.symbol, entry.to));
        }
        out
    }

    /// Group the recorded symbols per state, in first-seen order.
    ///
    /// This is the replay view: feeding each state's symbol list back through
    /// the table must reproduce the run.
    pub fn simulation_script(&self) -> Vec<(String, Vec<String>)> {
        let mut script: Vec<(String, Vec<String>)> = Vec::new();
        for entry in &self.entries {
            match script.iter_mut().find(|(state, _)| state == &entry.from) {
                Some((_, symbols)) => symbols.push(entry.symbol.clone()),
                None => script.push((entry.from.clone(), vec![entry.symbol.clone()])),
            }
        }
        script
    }
}
