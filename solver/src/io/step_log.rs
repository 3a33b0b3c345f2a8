//! Step logs and final result artifacts under the session output directory.
//!
//! Layout:
//! ```text
//! <out>/steps/<NNNN>/meta.json
//! <out>/steps/<NNNN>/response.txt
//! <out>/steps/<NNNN>/code.after.py
//! <out>/steps/<NNNN>/output.log      (committed steps only)
//! <out>/steps/<NNNN>/reflection.txt  (when a reflector answered)
//! <out>/experiment/result.json
//! <out>/experiment/solution.py
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use crate::core::types::{CommandKind, HistoryEntry, StepOutcome};
use crate::solve::{SolveOutcome, SolveStop};

/// Per-step metadata, persisted to `meta.json`.
#[derive(Debug, Clone, Serialize)]
pub struct StepMeta {
    pub step: u32,
    pub command: Option<CommandKind>,
    pub outcome: &'static str,
    pub error: Option<String>,
    pub score: Option<f64>,
    pub score_valid: Option<bool>,
    /// Best valid score after this step; `None` before the first.
    pub best_score: Option<f64>,
    pub repair_trials: u32,
    pub started_at: String,
    pub ended_at: String,
    pub duration_ms: u64,
    /// SHA-256 of the committed lines after this step.
    pub code_sha256: String,
    pub code_lines: usize,
}

impl StepMeta {
    /// Summarize a recorded history entry.
    pub fn from_entry(
        entry: &HistoryEntry,
        timing: StepTiming,
        code: &[String],
        best_score: f64,
        repair_trials: u32,
    ) -> Self {
        let (error, score, score_valid) = match &entry.outcome {
            StepOutcome::Committed { score, .. } => (None, Some(score.value), Some(score.valid)),
            StepOutcome::Rejected { error } => (Some(error.to_string()), None, None),
        };
        let ended_at = Utc::now();
        Self {
            step: entry.step,
            command: entry.command,
            outcome: entry.outcome.label(),
            error,
            score,
            score_valid,
            best_score: best_score.is_finite().then_some(best_score),
            repair_trials,
            started_at: timing.started_at.to_rfc3339(),
            ended_at: ended_at.to_rfc3339(),
            duration_ms: timing.duration_ms,
            code_sha256: code_digest(code),
            code_lines: code.len(),
        }
    }
}

/// Wall-clock bounds of one step.
#[derive(Debug, Clone, Copy)]
pub struct StepTiming {
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct StepPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub response_path: PathBuf,
    pub code_path: PathBuf,
    pub output_path: PathBuf,
    pub reflection_path: PathBuf,
}

impl StepPaths {
    pub fn new(log_dir: &Path, step: u32) -> Self {
        let dir = log_dir.join("steps").join(format!("{step:04}"));
        Self {
            meta_path: dir.join("meta.json"),
            response_path: dir.join("response.txt"),
            code_path: dir.join("code.after.py"),
            output_path: dir.join("output.log"),
            reflection_path: dir.join("reflection.txt"),
            dir,
        }
    }
}

pub struct StepWriteRequest<'a> {
    pub log_dir: &'a Path,
    pub meta: &'a StepMeta,
    pub entry: &'a HistoryEntry,
    pub code: &'a [String],
}

#[instrument(skip_all, fields(step = request.meta.step))]
pub fn write_step(request: &StepWriteRequest<'_>) -> Result<StepPaths> {
    let paths = StepPaths::new(request.log_dir, request.meta.step);
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create step dir {}", paths.dir.display()))?;

    write_json(&paths.meta_path, request.meta)?;
    write_text(&paths.response_path, &request.entry.response)?;
    write_text(&paths.code_path, &join_lines(request.code))?;
    if let StepOutcome::Committed { output, .. } = &request.entry.outcome {
        write_text(&paths.output_path, output)?;
    }
    if let Some(reflection) = &request.entry.reflection {
        write_text(&paths.reflection_path, reflection)?;
    }
    debug!(dir = %paths.dir.display(), "step log written");
    Ok(paths)
}

/// Final session record, persisted to `result.json`.
#[derive(Debug, Clone, Serialize)]
pub struct ResultRecord {
    pub score: f64,
    pub stop: SolveStop,
    pub steps: u32,
    pub commits: u32,
    pub code_sha256: String,
    pub code: Vec<String>,
    pub program: String,
    pub notes: String,
    /// Latest reflection across the best-code pool, empty when none ran.
    pub code_reflection: String,
    pub last_output: String,
    pub written_at: String,
}

impl ResultRecord {
    pub fn from_outcome(outcome: &SolveOutcome) -> Self {
        Self {
            score: outcome.score,
            stop: outcome.stop,
            steps: outcome.steps,
            commits: outcome.commits,
            code_sha256: code_digest(&outcome.code),
            code: outcome.code.clone(),
            program: outcome.program.clone(),
            notes: outcome.notes.clone(),
            code_reflection: outcome.code_reflection.clone(),
            last_output: outcome.last_output.clone(),
            written_at: Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResultPaths {
    pub result_path: PathBuf,
    pub solution_path: PathBuf,
}

/// Write `result.json` and the runnable `solution.py` into `out_dir`.
#[instrument(skip_all, fields(out_dir = %out_dir.display()))]
pub fn write_result(out_dir: &Path, outcome: &SolveOutcome) -> Result<ResultPaths> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("create output dir {}", out_dir.display()))?;
    let paths = ResultPaths {
        result_path: out_dir.join("result.json"),
        solution_path: out_dir.join("solution.py"),
    };
    write_json(&paths.result_path, &ResultRecord::from_outcome(outcome))?;
    let mut program = outcome.program.clone();
    if !program.ends_with('\n') {
        program.push('\n');
    }
    write_text(&paths.solution_path, &program)?;
    Ok(paths)
}

/// Hex SHA-256 of the lines joined with newlines.
pub fn code_digest(lines: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(lines.join("\n").as_bytes());
    hex::encode(hasher.finalize())
}

fn join_lines(lines: &[String]) -> String {
    let mut buf = lines.join("\n");
    if !buf.is_empty() {
        buf.push('\n');
    }
    buf
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value).context("serialize json")?;
    buf.push('\n');
    write_text(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::StepError;
    use crate::core::types::ScoreReport;

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn timing() -> StepTiming {
        StepTiming {
            started_at: Utc::now(),
            duration_ms: 12,
        }
    }

    #[test]
    fn step_paths_are_stable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = StepPaths::new(temp.path(), 7);
        assert!(paths.dir.ends_with(Path::new("steps/0007")));
        assert!(paths.meta_path.ends_with("meta.json"));
        assert!(paths.response_path.ends_with("response.txt"));
        assert!(paths.code_path.ends_with("code.after.py"));
        assert!(paths.output_path.ends_with("output.log"));
        assert!(paths.reflection_path.ends_with("reflection.txt"));
    }

    #[test]
    fn committed_step_writes_output_and_score() {
        let temp = tempfile::tempdir().expect("tempdir");
        let code = lines(&["print(1)"]);
        let entry = HistoryEntry {
            step: 0,
            command: Some(CommandKind::Replace),
            response: "```REPLACE\nprint(1)\n```".to_string(),
            outcome: StepOutcome::Committed {
                output: "1\n".to_string(),
                score: ScoreReport {
                    value: 0.5,
                    explanation: "ok".to_string(),
                    valid: true,
                },
            },
            reflection: Some("raise the learning rate".to_string()),
        };
        let meta = StepMeta::from_entry(&entry, timing(), &code, 0.5, 0);
        let paths = write_step(&StepWriteRequest {
            log_dir: temp.path(),
            meta: &meta,
            entry: &entry,
            code: &code,
        })
        .expect("write");

        assert_eq!(fs::read_to_string(&paths.output_path).expect("output"), "1\n");
        assert_eq!(fs::read_to_string(&paths.code_path).expect("code"), "print(1)\n");
        assert_eq!(
            fs::read_to_string(&paths.reflection_path).expect("reflection"),
            "raise the learning rate"
        );
        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&paths.meta_path).expect("meta")).expect("json");
        assert_eq!(json["outcome"], "committed");
        assert_eq!(json["command"], "replace");
        assert_eq!(json["score"], 0.5);
        assert_eq!(json["code_sha256"], code_digest(&code));
    }

    #[test]
    fn rejected_step_has_error_and_no_output_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let entry = HistoryEntry {
            step: 3,
            command: None,
            response: "hello".to_string(),
            outcome: StepOutcome::Rejected {
                error: StepError::NoCommandMatched,
            },
            reflection: None,
        };
        let meta = StepMeta::from_entry(&entry, timing(), &[], f64::NEG_INFINITY, 2);
        let paths = write_step(&StepWriteRequest {
            log_dir: temp.path(),
            meta: &meta,
            entry: &entry,
            code: &[],
        })
        .expect("write");

        assert!(!paths.output_path.exists());
        assert!(!paths.reflection_path.exists());
        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&paths.meta_path).expect("meta")).expect("json");
        assert_eq!(json["outcome"], "rejected");
        assert_eq!(json["best_score"], serde_json::Value::Null);
        assert_eq!(json["repair_trials"], 2);
    }

    #[test]
    fn digest_is_hex_sha256() {
        let digest = code_digest(&[]);
        assert_eq!(
            digest,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
