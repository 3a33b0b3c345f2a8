//! Sandbox abstraction for running candidate programs.
//!
//! The [`Sandbox`] trait decouples the solve loop from how code is actually
//! executed. [`ProcessSandbox`] pipes the program into an interpreter
//! subprocess; tests use scripted sandboxes that never spawn anything.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{debug, instrument, warn};

use crate::io::config::SandboxConfig;
use crate::io::process::run_with_timeout;

/// Run directory under the output dir when the config names none.
const DEFAULT_WORKDIR: &str = "sandbox";

static FIGURE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Figure_\d+\.png$").expect("figure pattern is valid"));

/// Program to run and how long it may take.
#[derive(Debug, Clone)]
pub struct SandboxRequest {
    /// Full program text (preamble included).
    pub code: String,
    pub timeout: Duration,
}

/// Structured result of one sandbox run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxOutput {
    /// Captured standard output.
    pub output: String,
    /// Error text when the program failed; `None` on success.
    pub error: Option<String>,
    /// Figure files present after the run (`Figure_N.png`).
    pub artifacts: Vec<String>,
    pub timed_out: bool,
}

/// Abstraction over code execution backends.
pub trait Sandbox {
    /// Run `request.code`. `Err` means the sandbox itself could not run it.
    fn execute(&self, request: &SandboxRequest) -> Result<SandboxOutput>;
}

impl<S: Sandbox + ?Sized> Sandbox for &S {
    fn execute(&self, request: &SandboxRequest) -> Result<SandboxOutput> {
        (**self).execute(request)
    }
}

/// Sandbox that feeds the program to an interpreter on stdin.
#[derive(Debug, Clone)]
pub struct ProcessSandbox {
    command: Vec<String>,
    workdir: PathBuf,
    output_limit_bytes: usize,
}

impl ProcessSandbox {
    pub fn new(command: Vec<String>, workdir: PathBuf, output_limit_bytes: usize) -> Self {
        Self {
            command,
            workdir,
            output_limit_bytes,
        }
    }

    /// Build from config. A relative `workdir` resolves against `out_dir`;
    /// without one, runs happen in `<out_dir>/sandbox`.
    pub fn from_config(config: &SandboxConfig, out_dir: &Path) -> Self {
        let workdir = match &config.workdir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => out_dir.join(dir),
            None => out_dir.join(DEFAULT_WORKDIR),
        };
        Self::new(config.command.clone(), workdir, config.output_limit_bytes)
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }
}

impl Sandbox for ProcessSandbox {
    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs(), code_bytes = request.code.len()))]
    fn execute(&self, request: &SandboxRequest) -> Result<SandboxOutput> {
        fs::create_dir_all(&self.workdir)
            .with_context(|| format!("create sandbox dir {}", self.workdir.display()))?;
        remove_figures(&self.workdir)?;

        let run = run_with_timeout(
            &self.command,
            Some(&self.workdir),
            Some(request.code.as_bytes()),
            request.timeout,
            self.output_limit_bytes,
        )
        .context("run sandbox interpreter")?;
        let artifacts = list_figures(&self.workdir)?;

        let output = run.stdout_text();
        if run.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "sandbox run timed out");
            return Ok(SandboxOutput {
                output,
                error: Some(format!("timed out after {:?}", request.timeout)),
                artifacts,
                timed_out: true,
            });
        }
        if !run.status.success() {
            let stderr = run.stderr_text();
            let error = if stderr.trim().is_empty() {
                format!("interpreter exited with status {:?}", run.status.code())
            } else {
                stderr
            };
            debug!(exit_code = ?run.status.code(), "sandbox run failed");
            return Ok(SandboxOutput {
                output,
                error: Some(error),
                artifacts,
                timed_out: false,
            });
        }

        debug!(artifacts = artifacts.len(), "sandbox run succeeded");
        Ok(SandboxOutput {
            output,
            error: None,
            artifacts,
            timed_out: false,
        })
    }
}

/// Delete figures left over from a previous run.
fn remove_figures(dir: &Path) -> Result<()> {
    for name in list_figures(dir)? {
        let path = dir.join(&name);
        fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
    }
    Ok(())
}

/// Figure file names in `dir`, sorted.
fn list_figures(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read dir {}", dir.display()))? {
        let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if FIGURE_RE.is_match(&name) {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell_sandbox(dir: &Path) -> ProcessSandbox {
        ProcessSandbox::new(
            vec!["sh".to_string(), "-s".to_string()],
            dir.to_path_buf(),
            10_000,
        )
    }

    fn request(code: &str) -> SandboxRequest {
        SandboxRequest {
            code: code.to_string(),
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn successful_run_captures_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let out = shell_sandbox(temp.path())
            .execute(&request("echo hello"))
            .expect("execute");
        assert_eq!(out.output, "hello\n");
        assert_eq!(out.error, None);
        assert!(!out.timed_out);
    }

    #[test]
    fn failing_run_reports_stderr() {
        let temp = tempfile::tempdir().expect("tempdir");
        let out = shell_sandbox(temp.path())
            .execute(&request("echo partial\necho boom >&2\nexit 3"))
            .expect("execute");
        assert_eq!(out.output, "partial\n");
        assert_eq!(out.error.as_deref(), Some("boom\n"));
    }

    #[test]
    fn timeout_is_reported_as_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let out = shell_sandbox(temp.path())
            .execute(&SandboxRequest {
                code: "exec sleep 5".to_string(),
                timeout: Duration::from_millis(100),
            })
            .expect("execute");
        assert!(out.timed_out);
        assert!(out.error.is_some());
    }

    #[test]
    fn stale_figures_are_removed_and_new_ones_listed() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("Figure_9.png"), "stale").expect("write");
        fs::write(temp.path().join("notes.png"), "keep").expect("write");

        let out = shell_sandbox(temp.path())
            .execute(&request("touch Figure_1.png Figure_2.png"))
            .expect("execute");
        assert_eq!(out.artifacts, vec!["Figure_1.png", "Figure_2.png"]);
        assert!(!temp.path().join("Figure_9.png").exists());
        assert!(temp.path().join("notes.png").exists());
    }

    /// Verifies workdir resolution against the output dir.
    #[test]
    fn workdir_resolves_against_out_dir() {
        let out = Path::new("/tmp/run");
        let config = SandboxConfig::default();
        assert_eq!(
            ProcessSandbox::from_config(&config, out).workdir(),
            Path::new("/tmp/run/sandbox")
        );

        let relative = SandboxConfig {
            workdir: Some(PathBuf::from("scratch")),
            ..SandboxConfig::default()
        };
        assert_eq!(
            ProcessSandbox::from_config(&relative, out).workdir(),
            Path::new("/tmp/run/scratch")
        );

        let absolute = SandboxConfig {
            workdir: Some(PathBuf::from("/srv/sandbox")),
            ..SandboxConfig::default()
        };
        assert_eq!(
            ProcessSandbox::from_config(&absolute, out).workdir(),
            Path::new("/srv/sandbox")
        );
    }
}
