//! Shared deterministic types for the solve loop.
//!
//! These types define stable contracts between core components. They do not
//! depend on external state or I/O.

use serde::{Deserialize, Serialize};

use crate::core::errors::StepError;

/// Tag of a registered command variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Edit,
    Replace,
}

impl CommandKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::Edit => "edit",
            CommandKind::Replace => "replace",
        }
    }
}

/// Scorer verdict for a committed program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreReport {
    /// Score in `[0, 1]` when `valid`.
    pub value: f64,
    /// Rationale, appended to the running notes.
    pub explanation: String,
    /// Whether `value` may be compared against the best score.
    pub valid: bool,
}

impl ScoreReport {
    pub fn invalid(explanation: impl Into<String>) -> Self {
        Self {
            value: 0.0,
            explanation: explanation.into(),
            valid: false,
        }
    }
}

/// Which repair prompt applies to a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepairKind {
    /// The failing text is an EDIT block.
    Edit,
    /// The failing text is a full program (REPLACE body).
    Replace,
    /// No registered command matched the text.
    Unmatched,
}

/// Which reflection prompt applies after a step or a pool change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReflectKind {
    /// The step's program raised or timed out.
    Failed,
    /// The step committed and was scored.
    Scored,
    /// The step committed but no usable score came back.
    Unscored,
    /// No command executed, so the code did not change.
    NoChange,
    /// The best-code pool evicted an entry; compare what is left.
    Pool,
}

/// Result of one loop step as recorded in history.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The candidate executed and replaced the current lines.
    Committed { output: String, score: ScoreReport },
    /// Every attempt failed; lines were left untouched.
    Rejected { error: StepError },
}

impl StepOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            StepOutcome::Committed { .. } => "committed",
            StepOutcome::Rejected { .. } => "rejected",
        }
    }
}

/// One entry of the bounded recency window kept by the code state.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    /// Step number (0-indexed) that produced the entry.
    pub step: u32,
    /// Command that was dispatched last, if any matched.
    pub command: Option<CommandKind>,
    /// Final command text (after repairs).
    pub response: String,
    pub outcome: StepOutcome,
    /// Reflector notes on the outcome, when a reflector is configured.
    pub reflection: Option<String>,
}
