//! External collaborators of the solve loop: generator, scorer, repairer and
//! the optional reflector.
//!
//! Each collaborator is a trait so orchestration never depends on a concrete
//! model backend. `Err` from any of them is a transport failure (the backend
//! could not be reached or answered nothing usable at the process level);
//! well-formed but unhelpful answers are returned as `Ok`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::block::extract_block;
use crate::core::types::{ReflectKind, RepairKind, ScoreReport};
use crate::io::config::CollaboratorConfig;
use crate::io::process::run_with_timeout;
use crate::io::prompt::{reflect_prompt, repair_prompt, score_prompt};

const SCORE_TEMPERATURE: f64 = 0.6;
const REPAIR_EDIT_TEMPERATURE: f64 = 0.2;
const REPAIR_REPLACE_TEMPERATURE: f64 = 0.8;

/// One text-generation call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerateRequest {
    pub system_prompt: String,
    pub prompt: String,
    pub temperature: f64,
}

/// Produces free text for a prompt.
pub trait Generator {
    fn generate(&self, request: &GenerateRequest) -> Result<String>;
}

impl<G: Generator + ?Sized> Generator for &G {
    fn generate(&self, request: &GenerateRequest) -> Result<String> {
        (**self).generate(request)
    }
}

/// Grades a committed program against the plan.
pub trait Scorer {
    fn score(&self, plan: &str, code: &str, output: &str) -> Result<ScoreReport>;
}

impl<C: Scorer + ?Sized> Scorer for &C {
    fn score(&self, plan: &str, code: &str, output: &str) -> Result<ScoreReport> {
        (**self).score(plan, code, output)
    }
}

/// Failed attempt handed to a [`Repairer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairRequest {
    /// EDIT block, program body, or unmatched response, depending on `kind`.
    pub text: String,
    pub error: String,
    pub kind: RepairKind,
}

/// Rewrites a failed attempt into a new candidate command.
pub trait Repairer {
    /// Return raw text that is dispatched again like a generator response.
    fn repair(&self, request: &RepairRequest) -> Result<String>;
}

impl<R: Repairer + ?Sized> Repairer for &R {
    fn repair(&self, request: &RepairRequest) -> Result<String> {
        (**self).repair(request)
    }
}

/// Outcome handed to a [`Reflector`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReflectRequest {
    pub kind: ReflectKind,
    /// Engineer system prompt without the command menu.
    pub context: String,
    /// Numbered code of the step, or the rendered pool for [`ReflectKind::Pool`].
    pub code: String,
    /// Output, error or score text being reflected on.
    pub result: String,
}

/// Turns an outcome into free-text advice for later steps.
pub trait Reflector {
    fn reflect(&self, request: &ReflectRequest) -> Result<String>;
}

impl<F: Reflector + ?Sized> Reflector for &F {
    fn reflect(&self, request: &ReflectRequest) -> Result<String> {
        (**self).reflect(request)
    }
}

/// Reflector slot of a solver built without one. Never called.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoReflector;

impl Reflector for NoReflector {
    fn reflect(&self, _request: &ReflectRequest) -> Result<String> {
        Ok(String::new())
    }
}

/// Generator that pipes the request as JSON into a configured command.
///
/// The command reads `{"system_prompt", "prompt", "temperature"}` from stdin
/// and prints the reply on stdout.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    command: Vec<String>,
    workdir: Option<PathBuf>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandGenerator {
    pub fn new(command: Vec<String>, timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            command,
            workdir: None,
            timeout,
            output_limit_bytes,
        }
    }

    pub fn from_config(config: &CollaboratorConfig) -> Self {
        Self::new(
            config.command.clone(),
            Duration::from_secs(config.timeout_secs),
            config.output_limit_bytes,
        )
    }

    pub fn with_workdir(mut self, workdir: PathBuf) -> Self {
        self.workdir = Some(workdir);
        self
    }
}

impl Generator for CommandGenerator {
    #[instrument(skip_all, fields(timeout_secs = self.timeout.as_secs(), prompt_bytes = request.prompt.len()))]
    fn generate(&self, request: &GenerateRequest) -> Result<String> {
        let payload = serde_json::to_vec(request).context("serialize generate request")?;
        debug!(program = ?self.command.first(), "starting generator command");

        let output = run_with_timeout(
            &self.command,
            self.workdir.as_deref(),
            Some(&payload),
            self.timeout,
            self.output_limit_bytes,
        )
        .context("run generator command")?;

        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "generator timed out");
            return Err(anyhow!("generator timed out after {:?}", self.timeout));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "generator failed");
            return Err(anyhow!(
                "generator failed with status {:?}: {}",
                output.status.code(),
                output.stderr_text().trim()
            ));
        }

        let reply = output.stdout_text();
        debug!(reply_bytes = reply.len(), "generator replied");
        Ok(reply)
    }
}

/// Scorer that asks a generator for a "```SCORE" block.
#[derive(Debug, Clone)]
pub struct LlmScorer<G> {
    generator: G,
    attempts: u32,
}

impl<G: Generator> LlmScorer<G> {
    pub fn new(generator: G, attempts: u32) -> Self {
        Self {
            generator,
            attempts: attempts.max(1),
        }
    }
}

impl<G: Generator> Scorer for LlmScorer<G> {
    #[instrument(skip_all, fields(attempts = self.attempts))]
    fn score(&self, plan: &str, code: &str, output: &str) -> Result<ScoreReport> {
        let pair = score_prompt(plan, code, output)?;
        let request = GenerateRequest {
            system_prompt: pair.system,
            prompt: pair.prompt,
            temperature: SCORE_TEMPERATURE,
        };

        let mut last_problem = String::new();
        for attempt in 1..=self.attempts {
            let reply = self.generator.generate(&request)?;
            match parse_score(&reply) {
                Ok(value) => {
                    info!(attempt, value, "score parsed");
                    return Ok(ScoreReport {
                        value,
                        explanation: format!("The performance of your submission is: {value}"),
                        valid: true,
                    });
                }
                Err(problem) => {
                    debug!(attempt, %problem, "unusable score reply");
                    last_problem = problem;
                }
            }
        }
        warn!(attempts = self.attempts, "no usable score");
        Ok(ScoreReport::invalid(format!(
            "no usable score after {} attempts: {last_problem}",
            self.attempts
        )))
    }
}

/// Extract a finite score in `[0, 1]` from a reply.
pub fn parse_score(reply: &str) -> Result<f64, String> {
    let body = extract_block(reply, "SCORE").ok_or_else(|| "missing ```SCORE block".to_string())?;
    let text = body.trim();
    let value: f64 = text
        .parse()
        .map_err(|_| format!("score {text:?} is not a number"))?;
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        return Err(format!("score {value} is outside [0, 1]"));
    }
    Ok(value)
}

/// Repairer backed by a generator, with one prompt per [`RepairKind`].
#[derive(Debug, Clone)]
pub struct LlmRepairer<G> {
    generator: G,
}

impl<G: Generator> LlmRepairer<G> {
    pub fn new(generator: G) -> Self {
        Self { generator }
    }
}

impl<G: Generator> Repairer for LlmRepairer<G> {
    #[instrument(skip_all, fields(kind = ?request.kind))]
    fn repair(&self, request: &RepairRequest) -> Result<String> {
        let pair = repair_prompt(request)?;
        let temperature = match request.kind {
            RepairKind::Replace => REPAIR_REPLACE_TEMPERATURE,
            RepairKind::Edit | RepairKind::Unmatched => REPAIR_EDIT_TEMPERATURE,
        };
        let reply = self.generator.generate(&GenerateRequest {
            system_prompt: pair.system,
            prompt: pair.prompt,
            temperature,
        })?;

        if request.kind != RepairKind::Replace {
            return Ok(reply);
        }
        match extract_block(&reply, "python") {
            Some(body) => Ok(format!("```REPLACE\n{}\n```", body.trim_matches('\n'))),
            None => {
                debug!("repair reply had no python block");
                Ok(reply)
            }
        }
    }
}

/// Reflector backed by a generator.
#[derive(Debug, Clone)]
pub struct LlmReflector<G> {
    generator: G,
    temperature: f64,
}

impl<G: Generator> LlmReflector<G> {
    pub fn new(generator: G, temperature: f64) -> Self {
        Self {
            generator,
            temperature,
        }
    }
}

impl<G: Generator> Reflector for LlmReflector<G> {
    #[instrument(skip_all, fields(kind = ?request.kind))]
    fn reflect(&self, request: &ReflectRequest) -> Result<String> {
        let pair = reflect_prompt(request)?;
        let reply = self.generator.generate(&GenerateRequest {
            system_prompt: pair.system,
            prompt: pair.prompt,
            temperature: self.temperature,
        })?;
        debug!(reply_bytes = reply.len(), "reflection received");
        Ok(reply.trim().to_string())
    }
}
