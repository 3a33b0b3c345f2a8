//! Error taxonomy for the solve loop.
//!
//! Every variant of [`StepError`] is recovered inside the loop and recorded in
//! history. Only [`SolveError`] ends a session early, and it means the
//! orchestration cannot proceed at all (as opposed to a score-0 outcome).

use thiserror::Error;

/// A command block that could not be turned into structured arguments.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("command block is empty")]
    EmptyBlock,

    #[error("expected `N M` line range, got {0:?}")]
    MalformedRange(String),

    #[error("line index {0:?} is not a non-negative integer")]
    NonIntegerIndex(String),

    #[error("line range {start}..={end} is inverted (N must be <= M)")]
    InvertedRange { start: usize, end: usize },

    #[error("no replacement lines follow the line range")]
    MissingReplacementLines,

    #[error("replacement body is empty")]
    EmptyBody,
}

/// Failure while applying a parsed command or running the resulting program.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("line range {start}..={end} is out of bounds for {len} lines")]
    OutOfBounds { start: usize, end: usize, len: usize },

    #[error("[CODE EXECUTION ERROR] {message}")]
    Failed { message: String },

    #[error("[CODE EXECUTION ERROR] execution timed out after {secs}s")]
    TimedOut { secs: u64 },

    #[error("[CODE EXECUTION ERROR] sandbox unavailable: {0}")]
    Unavailable(String),
}

/// Locally recovered failure of a single step attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    #[error("command not supported, choose from the existing commands")]
    NoCommandMatched,

    #[error("parse failed: {0}")]
    Parse(#[from] ParseError),

    #[error("execution failed: {0}")]
    Execution(#[from] ExecutionError),

    #[error("score is not usable: {0}")]
    ScoreInvalid(String),

    #[error("{collaborator} call failed: {message}")]
    Transport {
        collaborator: &'static str,
        message: String,
    },

    #[error("all {trials} repair trials failed; last error: {last}")]
    RepairExhausted { trials: u32, last: Box<StepError> },
}

impl StepError {
    /// Innermost error, unwrapping repair exhaustion.
    pub fn root(&self) -> &StepError {
        match self {
            StepError::RepairExhausted { last, .. } => last.root(),
            other => other,
        }
    }
}

/// Terminal session failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SolveError {
    #[error("{collaborator} unavailable after {failures} consecutive transport failures: {message}")]
    CollaboratorUnavailable {
        collaborator: &'static str,
        failures: u32,
        message: String,
    },

    #[error("prompt rendering failed: {0}")]
    Prompt(String),
}

/// Invalid command registration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("at least one command must be registered")]
    Empty,

    #[error("command markers {first:?} and {second:?} overlap")]
    OverlappingTags { first: String, second: String },
}
