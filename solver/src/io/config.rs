//! Solver configuration stored as TOML (default `solver.toml`).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Solver configuration (TOML).
///
/// Intended to be edited by humans. Missing fields take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SolverConfig {
    /// Upper bound on loop iterations per session.
    pub max_steps: u32,

    /// Number of recent steps rendered back into the step prompt.
    pub history_length: usize,

    /// Repair rounds attempted after a failed step before giving up on it.
    pub min_gen_trials: u32,

    /// Consecutive collaborator transport failures that abort the session.
    pub max_transport_failures: u32,

    /// Optional wall-clock budget for a whole session; `0` disables it.
    pub session_timeout_secs: u64,

    /// Maximum bytes for a rendered prompt before sections are dropped.
    pub prompt_budget_bytes: usize,

    /// Scored programs kept in the best-code pool.
    pub max_best_codes: usize,

    pub sandbox: SandboxConfig,

    pub collaborator: CollaboratorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxConfig {
    /// Interpreter command that reads the program on stdin.
    pub command: Vec<String>,

    /// Working directory for runs; relative paths resolve against the output
    /// dir. Defaults to `<out>/sandbox`.
    pub workdir: Option<PathBuf>,

    /// Per-execution timeout in seconds.
    pub timeout_secs: u64,

    /// Truncate captured stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CollaboratorConfig {
    /// Command that receives a JSON generation request on stdin and prints the reply.
    pub command: Vec<String>,

    pub timeout_secs: u64,

    pub output_limit_bytes: usize,

    /// Sampling temperature forwarded with every request.
    pub temperature: f64,

    /// Attempts the scorer makes to obtain a parsable score.
    pub score_attempts: u32,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            command: vec!["python3".to_string(), "-".to_string()],
            workdir: None,
            timeout_secs: 600,
            output_limit_bytes: 100_000,
        }
    }
}

impl Default for CollaboratorConfig {
    fn default() -> Self {
        Self {
            command: vec!["llm-generate".to_string()],
            timeout_secs: 10 * 60,
            output_limit_bytes: 200_000,
            temperature: 0.8,
            score_attempts: 3,
        }
    }
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_steps: 10,
            history_length: 2,
            min_gen_trials: 2,
            max_transport_failures: 3,
            session_timeout_secs: 0,
            prompt_budget_bytes: 60_000,
            max_best_codes: 1,
            sandbox: SandboxConfig::default(),
            collaborator: CollaboratorConfig::default(),
        }
    }
}

impl SolverConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_steps == 0 {
            return Err(anyhow!("max_steps must be > 0"));
        }
        if self.max_transport_failures == 0 {
            return Err(anyhow!("max_transport_failures must be > 0"));
        }
        if self.prompt_budget_bytes == 0 {
            return Err(anyhow!("prompt_budget_bytes must be > 0"));
        }
        if self.max_best_codes == 0 {
            return Err(anyhow!("max_best_codes must be > 0"));
        }
        if self.sandbox.timeout_secs == 0 {
            return Err(anyhow!("sandbox.timeout_secs must be > 0"));
        }
        if self.sandbox.output_limit_bytes == 0 {
            return Err(anyhow!("sandbox.output_limit_bytes must be > 0"));
        }
        if self.sandbox.command.is_empty() || self.sandbox.command[0].trim().is_empty() {
            return Err(anyhow!("sandbox.command must be a non-empty array"));
        }
        if self.collaborator.timeout_secs == 0 {
            return Err(anyhow!("collaborator.timeout_secs must be > 0"));
        }
        if self.collaborator.output_limit_bytes == 0 {
            return Err(anyhow!("collaborator.output_limit_bytes must be > 0"));
        }
        if self.collaborator.command.is_empty() || self.collaborator.command[0].trim().is_empty() {
            return Err(anyhow!("collaborator.command must be a non-empty array"));
        }
        if !self.collaborator.temperature.is_finite() || self.collaborator.temperature < 0.0 {
            return Err(anyhow!("collaborator.temperature must be a finite value >= 0"));
        }
        if self.collaborator.score_attempts == 0 {
            return Err(anyhow!("collaborator.score_attempts must be > 0"));
        }
        Ok(())
    }

    pub fn sandbox_timeout(&self) -> Duration {
        Duration::from_secs(self.sandbox.timeout_secs)
    }

    /// Session budget, `None` when unlimited.
    pub fn session_timeout(&self) -> Option<Duration> {
        (self.session_timeout_secs > 0).then(|| Duration::from_secs(self.session_timeout_secs))
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `SolverConfig::default()`.
pub fn load_config(path: &Path) -> Result<SolverConfig> {
    if !path.exists() {
        let cfg = SolverConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: SolverConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &SolverConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, SolverConfig::default());
        assert_eq!(cfg.session_timeout(), None);
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("solver.toml");
        let cfg = SolverConfig {
            max_steps: 4,
            session_timeout_secs: 90,
            sandbox: SandboxConfig {
                workdir: Some(PathBuf::from("sandbox")),
                ..SandboxConfig::default()
            },
            ..SolverConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
        assert_eq!(loaded.session_timeout(), Some(Duration::from_secs(90)));
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("solver.toml");
        fs::write(&path, "max_steps = 3\n[sandbox]\ntimeout_secs = 5\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_steps, 3);
        assert_eq!(cfg.sandbox.timeout_secs, 5);
        assert_eq!(cfg.sandbox.command, SandboxConfig::default().command);
        assert_eq!(cfg.history_length, 2);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("solver.toml");
        fs::write(&path, "max_steps = 0\n").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("max_steps must be > 0"));

        fs::write(&path, "max_best_codes = 0\n").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("max_best_codes must be > 0"));

        let cfg = SolverConfig {
            sandbox: SandboxConfig {
                command: Vec::new(),
                ..SandboxConfig::default()
            },
            ..SolverConfig::default()
        };
        assert!(write_config(&path, &cfg).is_err());
    }
}
