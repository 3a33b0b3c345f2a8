//! Candidate code state with copy-on-success commits.
//!
//! `lines` only changes through [`CodeState::commit`], which receives a buffer
//! that already executed successfully. Edits are built with [`splice`], which
//! never touches its input.
//!
//! Scored commits also feed a small pool of the best programs so far, sorted
//! by score with the best first.

use std::collections::VecDeque;

use crate::core::errors::ExecutionError;
use crate::core::types::{HistoryEntry, ScoreReport};

/// Return a copy of `lines` with `start..=end` replaced by `replacement`.
pub fn splice(
    lines: &[String],
    start: usize,
    end: usize,
    replacement: &[String],
) -> Result<Vec<String>, ExecutionError> {
    if start > end || end >= lines.len() {
        return Err(ExecutionError::OutOfBounds {
            start,
            end,
            len: lines.len(),
        });
    }
    let mut next = Vec::with_capacity(lines.len() - (end - start + 1) + replacement.len());
    next.extend_from_slice(&lines[..start]);
    next.extend_from_slice(replacement);
    next.extend_from_slice(&lines[end + 1..]);
    Ok(next)
}

/// A committed program kept in the best-code pool.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredCode {
    pub lines: Vec<String>,
    pub score: f64,
    pub output: String,
}

/// Effect of one score on the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolUpdate {
    /// The best score moved up.
    pub improved: bool,
    /// A lower-scoring entry was pushed out to make room.
    pub evicted: bool,
}

/// Mutable artifact under refinement, owned by one solve session.
#[derive(Debug, Clone)]
pub struct CodeState {
    lines: Vec<String>,
    last_output: String,
    history: VecDeque<HistoryEntry>,
    history_length: usize,
    best_score: f64,
    pool: Vec<ScoredCode>,
    pool_size: usize,
    commits: u32,
}

impl CodeState {
    pub fn new(initial: Vec<String>, history_length: usize) -> Self {
        Self {
            lines: initial,
            last_output: String::new(),
            history: VecDeque::with_capacity(history_length),
            history_length,
            best_score: f64::NEG_INFINITY,
            pool: Vec::new(),
            pool_size: 1,
            commits: 0,
        }
    }

    /// Keep up to `size` scored programs (at least one).
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size.max(1);
        self
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn last_output(&self) -> &str {
        &self.last_output
    }

    /// Recency window, oldest first.
    pub fn history(&self) -> &VecDeque<HistoryEntry> {
        &self.history
    }

    /// Highest valid score seen so far (`-inf` before the first).
    pub fn best_score(&self) -> f64 {
        self.best_score
    }

    pub fn best_code(&self) -> Option<&[String]> {
        self.pool.first().map(|entry| entry.lines.as_slice())
    }

    /// Best programs so far, highest score first.
    pub fn best_codes(&self) -> &[ScoredCode] {
        &self.pool
    }

    /// Number of successful commits in this session.
    pub fn commits(&self) -> u32 {
        self.commits
    }

    /// Replace the current lines with an executed candidate.
    pub fn commit(&mut self, lines: Vec<String>, output: String) {
        self.lines = lines;
        self.last_output = output;
        self.commits += 1;
    }

    /// Offer the current lines to the pool under `report`.
    ///
    /// Invalid or non-finite reports are ignored. A full pool admits the
    /// lines only when they beat its lowest entry, which is evicted. Equal
    /// scores rank behind entries already present.
    pub fn record_score(&mut self, report: &ScoreReport) -> PoolUpdate {
        if !report.valid || !report.value.is_finite() {
            return PoolUpdate::default();
        }
        let value = report.value;
        let full = self.pool.len() >= self.pool_size;
        if full && self.pool.last().is_some_and(|lowest| value <= lowest.score) {
            return PoolUpdate::default();
        }
        let evicted = full && self.pool.pop().is_some();
        let at = self
            .pool
            .iter()
            .position(|entry| entry.score < value)
            .unwrap_or(self.pool.len());
        self.pool.insert(
            at,
            ScoredCode {
                lines: self.lines.clone(),
                score: value,
                output: self.last_output.clone(),
            },
        );
        let improved = value > self.best_score;
        if improved {
            self.best_score = value;
        }
        PoolUpdate { improved, evicted }
    }

    /// Append a history entry, evicting the oldest beyond the window.
    pub fn push_history(&mut self, entry: HistoryEntry) {
        if self.history_length == 0 {
            return;
        }
        while self.history.len() >= self.history_length {
            self.history.pop_front();
        }
        self.history.push_back(entry);
    }
}
