//! The solve loop: generate a command, execute it, score commits, repair
//! failures, and optionally reflect on each outcome.
//!
//! One call to [`Solver::solve`] runs a whole session. Loop state lives in a
//! [`LoopState`] value that each step takes by value and hands back, so a
//! session never shares mutable state with anything else.
//!
//! Every step failure is recovered locally and recorded in history. The only
//! early exit is [`SolveError`], raised when collaborators stop answering.

use std::path::PathBuf;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::command::{Command, CommandRegistry, ExecContext, Executed};
use crate::core::block::{assemble_program, extract_block, normalize_response, render_numbered};
use crate::core::budget::{CancelFlag, bounded_timeout, remaining_budget};
use crate::core::code_state::{CodeState, ScoredCode};
use crate::core::errors::{SolveError, StepError};
use crate::core::types::{HistoryEntry, ReflectKind, RepairKind, ScoreReport, StepOutcome};
use crate::io::collaborators::{
    GenerateRequest, Generator, NoReflector, ReflectRequest, Reflector, RepairRequest, Repairer,
    Scorer,
};
use crate::io::config::SolverConfig;
use crate::io::prompt::{PromptBuilder, StepPromptInputs, SystemPromptInputs};
use crate::io::sandbox::Sandbox;
use crate::io::step_log::{StepMeta, StepTiming, StepWriteRequest, write_step};

/// Immutable inputs of one solve session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SolveSession {
    /// Dataset code prepended to every program run.
    pub preamble: String,
    pub plan: String,
    pub insights: String,
    pub notes: String,
    /// Starting candidate; empty asks the model to bootstrap with REPLACE.
    pub initial_code: Vec<String>,
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SolveStop {
    /// `max_steps` steps ran.
    Completed,
    /// The cancel flag was raised between steps.
    Cancelled,
    /// The session wall-clock budget ran out between steps.
    DeadlineReached,
}

/// Result of a finished session.
#[derive(Debug, Clone)]
pub struct SolveOutcome {
    /// Best-scoring lines (see [`Solver::solve`] for fallbacks).
    pub code: Vec<String>,
    pub score: f64,
    /// Preamble plus `code`, ready to run.
    pub program: String,
    pub stop: SolveStop,
    pub steps: u32,
    pub commits: u32,
    /// Final recency window, oldest first.
    pub history: Vec<HistoryEntry>,
    /// Session notes followed by every score rationale.
    pub notes: String,
    /// Latest reflection across the best-code pool.
    pub code_reflection: String,
    /// Best programs kept by the pool, highest score first.
    pub best_codes: Vec<ScoredCode>,
    pub last_output: String,
}

impl SolveOutcome {
    pub fn committed(&self) -> bool {
        self.commits > 0
    }
}

/// Counts consecutive collaborator transport failures across all collaborators.
#[derive(Debug)]
struct TransportGuard {
    consecutive: u32,
    limit: u32,
}

impl TransportGuard {
    fn succeeded(&mut self) {
        self.consecutive = 0;
    }

    /// Record a failure; returns the step-level error, or the fatal one at the limit.
    fn failed(
        &mut self,
        collaborator: &'static str,
        err: &anyhow::Error,
    ) -> Result<StepError, SolveError> {
        self.consecutive += 1;
        let message = format!("{err:#}");
        warn!(collaborator, failures = self.consecutive, %message, "collaborator transport failure");
        if self.consecutive >= self.limit {
            return Err(SolveError::CollaboratorUnavailable {
                collaborator,
                failures: self.consecutive,
                message,
            });
        }
        Ok(StepError::Transport {
            collaborator,
            message,
        })
    }
}

/// Accumulator threaded through every step.
#[derive(Debug)]
struct LoopState {
    code: CodeState,
    notes: String,
    code_reflection: String,
    step: u32,
    consecutive_failures: u32,
    transport: TransportGuard,
}

/// One dispatch + parse + execute attempt on a piece of text.
#[derive(Debug)]
struct Attempt {
    text: String,
    command: Option<Command>,
    result: Result<Executed, StepError>,
}

/// Runs solve sessions against a fixed set of collaborators.
pub struct Solver<S, G, C, R, F = NoReflector> {
    registry: CommandRegistry,
    sandbox: S,
    generator: G,
    scorer: C,
    repairer: R,
    reflector: Option<F>,
    config: SolverConfig,
    prompts: PromptBuilder,
    cancel: Option<CancelFlag>,
    log_dir: Option<PathBuf>,
}

impl<S: Sandbox, G: Generator, C: Scorer, R: Repairer> Solver<S, G, C, R> {
    /// Solver without a reflector; steps record no reflections.
    pub fn new(sandbox: S, generator: G, scorer: C, repairer: R, config: SolverConfig) -> Self {
        let prompts = PromptBuilder::new(config.prompt_budget_bytes);
        Self {
            registry: CommandRegistry::default(),
            sandbox,
            generator,
            scorer,
            repairer,
            reflector: None,
            config,
            prompts,
            cancel: None,
            log_dir: None,
        }
    }
}

impl<S, G, C, R, F> Solver<S, G, C, R, F> {
    /// Reflect on every step outcome and on best-code pool evictions.
    pub fn with_reflector<F2: Reflector>(self, reflector: F2) -> Solver<S, G, C, R, F2> {
        Solver {
            registry: self.registry,
            sandbox: self.sandbox,
            generator: self.generator,
            scorer: self.scorer,
            repairer: self.repairer,
            reflector: Some(reflector),
            config: self.config,
            prompts: self.prompts,
            cancel: self.cancel,
            log_dir: self.log_dir,
        }
    }

    pub fn with_registry(mut self, registry: CommandRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Stop before the next step once `flag` is raised.
    pub fn with_cancel_flag(mut self, flag: CancelFlag) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Write per-step logs under `dir/steps/`.
    pub fn with_log_dir(mut self, dir: PathBuf) -> Self {
        self.log_dir = Some(dir);
        self
    }
}

impl<S: Sandbox, G: Generator, C: Scorer, R: Repairer, F: Reflector> Solver<S, G, C, R, F> {
    /// Run one session to completion.
    ///
    /// Returns the best-scoring code. When commits happened but none scored
    /// validly, the last committed lines are returned with score 0; when
    /// nothing committed, the code is empty and the program is the preamble.
    #[instrument(skip_all, fields(max_steps = self.config.max_steps))]
    pub fn solve(&self, session: &SolveSession) -> Result<SolveOutcome, SolveError> {
        let deadline = self
            .config
            .session_timeout()
            .map(|budget| Instant::now() + budget);
        let mut state = LoopState {
            code: CodeState::new(session.initial_code.clone(), self.config.history_length)
                .with_pool_size(self.config.max_best_codes),
            notes: session.notes.trim().to_string(),
            code_reflection: String::new(),
            step: 0,
            consecutive_failures: 0,
            transport: TransportGuard {
                consecutive: 0,
                limit: self.config.max_transport_failures,
            },
        };
        info!(initial_lines = session.initial_code.len(), "solve session started");

        let stop = loop {
            if self.cancel.as_ref().is_some_and(CancelFlag::is_cancelled) {
                info!(step = state.step, "solve cancelled");
                break SolveStop::Cancelled;
            }
            if let Some(deadline) = deadline
                && remaining_budget(deadline).is_none()
            {
                warn!(step = state.step, "session deadline reached");
                break SolveStop::DeadlineReached;
            }
            if state.step >= self.config.max_steps {
                break SolveStop::Completed;
            }
            state = self.run_step(session, state, deadline)?;
        };

        Ok(finish(session, state, stop))
    }

    #[instrument(skip_all, fields(step = state.step))]
    fn run_step(
        &self,
        session: &SolveSession,
        mut state: LoopState,
        deadline: Option<Instant>,
    ) -> Result<LoopState, SolveError> {
        let started_at = Utc::now();
        let timer = Instant::now();

        let request = self.step_request(session, &state)?;
        let (response, mut attempt) = match self.generator.generate(&request) {
            Ok(raw) => {
                state.transport.succeeded();
                let response = normalize_response(&raw);
                let attempt = self.attempt(&response, session, &state.code, deadline);
                (response, attempt)
            }
            Err(err) => {
                let error = state.transport.failed("generator", &err)?;
                let attempt = Attempt {
                    text: String::new(),
                    command: None,
                    result: Err(error),
                };
                (String::new(), attempt)
            }
        };

        let mut trials = 0u32;
        while trials < self.config.min_gen_trials {
            let error = match &attempt.result {
                Err(error) if !matches!(error, StepError::Transport { .. }) => error.clone(),
                _ => break,
            };
            state.consecutive_failures += 1;
            trials += 1;
            let request = repair_request(&attempt, &error, state.code.lines());
            debug!(trial = trials, kind = ?request.kind, %error, "attempting repair");
            attempt = match self.repairer.repair(&request) {
                Ok(raw) => {
                    state.transport.succeeded();
                    let text = normalize_response(&raw);
                    self.attempt(&text, session, &state.code, deadline)
                }
                Err(err) => Attempt {
                    text: String::new(),
                    command: attempt.command,
                    result: Err(state.transport.failed("repairer", &err)?),
                },
            };
        }

        let command = attempt.command.map(Command::kind);
        // Repairer transport failures leave no text; keep the generator's then.
        let response = if attempt.text.is_empty() {
            response
        } else {
            attempt.text
        };
        let outcome = match attempt.result {
            Ok(executed) => self.commit(session, &mut state, executed)?,
            Err(error) => {
                state.consecutive_failures += 1;
                let error = if trials > 0 {
                    StepError::RepairExhausted {
                        trials,
                        last: Box::new(error),
                    }
                } else {
                    error
                };
                info!(%error, "step rejected");
                StepOutcome::Rejected { error }
            }
        };

        let reflection = self.reflect_on_step(session, &mut state, &response, &outcome)?;
        let entry = HistoryEntry {
            step: state.step,
            command,
            response,
            outcome,
            reflection,
        };
        if let Some(log_dir) = &self.log_dir {
            let timing = StepTiming {
                started_at,
                duration_ms: u64::try_from(timer.elapsed().as_millis()).unwrap_or(u64::MAX),
            };
            let code = state.code.lines();
            let meta = StepMeta::from_entry(&entry, timing, code, state.code.best_score(), trials);
            let request = StepWriteRequest {
                log_dir,
                meta: &meta,
                entry: &entry,
                code,
            };
            if let Err(err) = write_step(&request) {
                warn!(error = %format!("{err:#}"), "failed to write step log");
            }
        }
        state.code.push_history(entry);
        state.step += 1;
        Ok(state)
    }

    /// Engineer system prompt; `menu` is `None` for reflection requests.
    fn system_prompt(
        &self,
        session: &SolveSession,
        state: &LoopState,
        menu: Option<&str>,
    ) -> Result<String, SolveError> {
        self.prompts
            .build_system(&SystemPromptInputs {
                plan: &session.plan,
                preamble: &session.preamble,
                insights: &session.insights,
                notes: &state.notes,
                reflection: &state.code_reflection,
                menu,
            })
            .map_err(prompt_error)
    }

    fn step_request(
        &self,
        session: &SolveSession,
        state: &LoopState,
    ) -> Result<GenerateRequest, SolveError> {
        let menu = self.registry.menu();
        let system_prompt = self.system_prompt(session, state, Some(&menu))?;

        let window: Vec<HistoryEntry> = state.code.history().iter().cloned().collect();
        let prompt = self
            .prompts
            .build_step(&StepPromptInputs {
                lines: state.code.lines(),
                history: &window,
                last_output: state.code.last_output(),
                reminder: state.consecutive_failures > 0,
            })
            .map_err(prompt_error)?;

        Ok(GenerateRequest {
            system_prompt,
            prompt,
            temperature: self.config.collaborator.temperature,
        })
    }

    /// Dispatch `text`, parse it, and execute it against the committed lines.
    fn attempt(
        &self,
        text: &str,
        session: &SolveSession,
        code: &CodeState,
        deadline: Option<Instant>,
    ) -> Attempt {
        let Some(command) = self.registry.dispatch(text) else {
            return Attempt {
                text: text.to_string(),
                command: None,
                result: Err(StepError::NoCommandMatched),
            };
        };
        let result = command
            .parse(text)
            .map_err(StepError::from)
            .and_then(|parsed| {
                let ctx = ExecContext {
                    lines: code.lines(),
                    preamble: &session.preamble,
                    sandbox: &self.sandbox,
                    timeout: bounded_timeout(self.config.sandbox_timeout(), deadline),
                };
                command.execute(&parsed, &ctx).map_err(StepError::from)
            });
        Attempt {
            text: text.to_string(),
            command: Some(command),
            result,
        }
    }

    fn commit(
        &self,
        session: &SolveSession,
        state: &mut LoopState,
        executed: Executed,
    ) -> Result<StepOutcome, SolveError> {
        let Executed {
            lines,
            output,
            artifacts,
        } = executed;
        let program = assemble_program(&session.preamble, &lines);
        state.code.commit(lines, output.clone());
        state.consecutive_failures = 0;

        let score = match self.scorer.score(&session.plan, &program, &output) {
            Ok(report) => {
                state.transport.succeeded();
                report
            }
            Err(err) => {
                let error = state.transport.failed("scorer", &err)?;
                ScoreReport::invalid(error.to_string())
            }
        };

        let update = state.code.record_score(&score);
        if score.valid {
            push_note(&mut state.notes, &score.explanation);
            info!(
                score = score.value,
                improved = update.improved,
                best = state.code.best_score(),
                artifacts = artifacts.len(),
                "candidate committed"
            );
        } else {
            let error = StepError::ScoreInvalid(score.explanation.clone());
            push_note(&mut state.notes, &error.to_string());
            warn!(%error, "candidate committed without a usable score");
        }
        if update.evicted {
            self.reflect_on_pool(session, state)?;
        }
        Ok(StepOutcome::Committed { output, score })
    }

    /// Ask the reflector about this step's outcome.
    ///
    /// Transport failures of the generator skip reflection; reflector
    /// transport failures count toward the fatal limit but otherwise only
    /// leave the entry without a reflection.
    fn reflect_on_step(
        &self,
        session: &SolveSession,
        state: &mut LoopState,
        response: &str,
        outcome: &StepOutcome,
    ) -> Result<Option<String>, SolveError> {
        if self.reflector.is_none() {
            return Ok(None);
        }
        let code = render_numbered(state.code.lines());
        let (kind, code, result) = match outcome {
            StepOutcome::Committed { output, score } => {
                let kind = if score.valid {
                    ReflectKind::Scored
                } else {
                    ReflectKind::Unscored
                };
                (kind, code, format!("{}\n{}", output.trim(), score.explanation.trim()))
            }
            StepOutcome::Rejected { error } => match error.root() {
                StepError::Transport { .. } => return Ok(None),
                StepError::Execution(_) => (
                    ReflectKind::Failed,
                    format!("{code}\nAttempted command:\n{}", response.trim()),
                    error.to_string(),
                ),
                _ => (ReflectKind::NoChange, code, error.to_string()),
            },
        };
        let request = ReflectRequest {
            kind,
            context: self.system_prompt(session, state, None)?,
            code,
            result,
        };
        self.reflect(&request, &mut state.transport)
    }

    /// Refresh the pool reflection shown in the system prompt.
    fn reflect_on_pool(
        &self,
        session: &SolveSession,
        state: &mut LoopState,
    ) -> Result<(), SolveError> {
        if self.reflector.is_none() {
            return Ok(());
        }
        let request = ReflectRequest {
            kind: ReflectKind::Pool,
            context: self.system_prompt(session, state, None)?,
            code: render_pool(state.code.best_codes()),
            result: String::new(),
        };
        if let Some(text) = self.reflect(&request, &mut state.transport)? {
            debug!(bytes = text.len(), "pool reflection updated");
            state.code_reflection = text;
        }
        Ok(())
    }

    fn reflect(
        &self,
        request: &ReflectRequest,
        transport: &mut TransportGuard,
    ) -> Result<Option<String>, SolveError> {
        let Some(reflector) = &self.reflector else {
            return Ok(None);
        };
        match reflector.reflect(request) {
            Ok(text) => {
                transport.succeeded();
                Ok(Some(text.trim().to_string()).filter(|text| !text.is_empty()))
            }
            Err(err) => {
                transport.failed("reflector", &err)?;
                Ok(None)
            }
        }
    }
}

fn render_pool(pool: &[ScoredCode]) -> String {
    pool.iter()
        .enumerate()
        .map(|(idx, entry)| {
            format!(
                "[Code #{idx}] score {:.4}\n{}\nOutput:\n{}",
                entry.score,
                entry.lines.join("\n"),
                entry.output.trim()
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Build the repair request for a failed attempt.
///
/// REPLACE failures send the program body; EDIT failures send the numbered
/// current code with the failing block so line indices can be corrected.
fn repair_request(attempt: &Attempt, error: &StepError, lines: &[String]) -> RepairRequest {
    let kind = attempt
        .command
        .map_or(RepairKind::Unmatched, Command::repair_kind);
    let text = match kind {
        RepairKind::Replace => extract_block(&attempt.text, Command::Replace.tag())
            .map(|body| body.trim_matches('\n').to_string())
            .unwrap_or_else(|| attempt.text.clone()),
        RepairKind::Edit => format!(
            "Current code:\n{}\nFailed command:\n{}",
            render_numbered(lines),
            attempt.text.trim()
        ),
        RepairKind::Unmatched => attempt.text.clone(),
    };
    RepairRequest {
        text,
        error: error.to_string(),
        kind,
    }
}

fn finish(session: &SolveSession, state: LoopState, stop: SolveStop) -> SolveOutcome {
    let LoopState {
        code,
        notes,
        code_reflection,
        step,
        ..
    } = state;
    let (best, score) = match code.best_code() {
        Some(best) => (best.to_vec(), code.best_score()),
        None if code.commits() > 0 => (code.lines().to_vec(), 0.0),
        None => (Vec::new(), 0.0),
    };
    info!(?stop, steps = step, commits = code.commits(), score, "solve session finished");
    SolveOutcome {
        program: assemble_program(&session.preamble, &best),
        code: best,
        score,
        stop,
        steps: step,
        commits: code.commits(),
        history: code.history().iter().cloned().collect(),
        notes,
        code_reflection,
        best_codes: code.best_codes().to_vec(),
        last_output: code.last_output().to_string(),
    }
}

fn push_note(notes: &mut String, note: &str) {
    if !notes.is_empty() {
        notes.push('\n');
    }
    notes.push_str(note.trim());
}

fn prompt_error(err: anyhow::Error) -> SolveError {
    SolveError::Prompt(format!("{err:#}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::ExecutionError;
    use crate::test_support::{
        ScriptedGenerator, ScriptedReflector, ScriptedRepairer, ScriptedReply, ScriptedSandbox,
        ScriptedScorer, lines, valid_score,
    };

    fn config(max_steps: u32) -> SolverConfig {
        SolverConfig {
            max_steps,
            ..SolverConfig::default()
        }
    }

    fn session(initial: &[&str]) -> SolveSession {
        SolveSession {
            preamble: "import numpy as np".to_string(),
            plan: "compute the mean".to_string(),
            initial_code: lines(initial),
            ..SolveSession::default()
        }
    }

    /// Verifies a failing EDIT is repaired and the repaired edit commits.
    #[test]
    fn repair_recovers_failed_edit() {
        let sandbox = ScriptedSandbox::failing_on("undefined", "NameError: undefined");
        let generator = ScriptedGenerator::from_texts(&["```EDIT 0 0\ny = undefined\n```"]);
        let repairer = ScriptedRepairer::new(vec![ScriptedReply::text("```EDIT 0 0\ny = 2\n```")]);
        let solver = Solver::new(
            &sandbox,
            &generator,
            ScriptedScorer::constant(0.5),
            &repairer,
            config(1),
        );

        let outcome = solver.solve(&session(&["x = 1"])).expect("solve");
        assert_eq!(outcome.code, lines(&["y = 2"]));
        assert_eq!(outcome.score, 0.5);
        assert_eq!(outcome.commits, 1);

        let requests = repairer.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].kind, RepairKind::Edit);
        assert!(requests[0].error.contains("NameError"));
        assert!(requests[0].text.contains("0 |x = 1"));
    }

    /// Verifies exhausted repairs record the last error and keep the lines.
    #[test]
    fn exhausted_repairs_record_last_error() {
        let generator = ScriptedGenerator::from_texts(&["I would rather chat"]);
        let repairer = ScriptedRepairer::repeating("still no command");
        let solver = Solver::new(
            ScriptedSandbox::always_ok("unused"),
            &generator,
            ScriptedScorer::constant(1.0),
            &repairer,
            config(1),
        );

        let outcome = solver.solve(&session(&["x = 1"])).expect("solve");
        assert_eq!(outcome.commits, 0);
        assert_eq!(outcome.code, Vec::<String>::new());
        assert_eq!(outcome.program, "import numpy as np");
        assert_eq!(
            outcome.history[0].outcome,
            StepOutcome::Rejected {
                error: StepError::RepairExhausted {
                    trials: 2,
                    last: Box::new(StepError::NoCommandMatched),
                },
            }
        );
        let requests = repairer.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests.iter().all(|r| r.kind == RepairKind::Unmatched));
    }

    /// Verifies REPLACE repairs receive the program body, not the fenced block.
    #[test]
    fn replace_repair_receives_program_body() {
        let sandbox = ScriptedSandbox::failing_on("boom", "RuntimeError: boom");
        let generator = ScriptedGenerator::from_texts(&["```REPLACE\nboom()\n```"]);
        let repairer = ScriptedRepairer::new(vec![ScriptedReply::text("```REPLACE\nprint(1)\n```")]);
        let solver = Solver::new(
            &sandbox,
            &generator,
            ScriptedScorer::constant(0.2),
            &repairer,
            config(1),
        );

        let outcome = solver.solve(&session(&[])).expect("solve");
        assert_eq!(outcome.code, lines(&["print(1)"]));
        let requests = repairer.requests();
        assert_eq!(requests[0].kind, RepairKind::Replace);
        assert_eq!(requests[0].text, "boom()");
    }

    /// Verifies an unusable score still commits but never becomes the best.
    #[test]
    fn invalid_score_commits_without_moving_best() {
        let generator = ScriptedGenerator::from_texts(&[
            "```REPLACE\nprint(1)\n```",
            "```REPLACE\nprint(2)\n```",
        ]);
        let scorer = ScriptedScorer::new(vec![
            Ok(valid_score(0.3)),
            Ok(ScoreReport::invalid("garbled")),
        ]);
        let solver = Solver::new(
            ScriptedSandbox::always_ok("ok"),
            &generator,
            scorer,
            ScriptedRepairer::new(Vec::new()),
            config(2),
        );

        let outcome = solver.solve(&session(&[])).expect("solve");
        assert_eq!(outcome.commits, 2);
        assert_eq!(outcome.code, lines(&["print(1)"]));
        assert_eq!(outcome.score, 0.3);
        assert!(outcome.notes.contains("The performance of your submission is: 0.3"));
        assert!(outcome.notes.contains("score is not usable: garbled"));
    }

    /// Verifies commits without any valid score return the last lines at score 0.
    #[test]
    fn commits_without_valid_score_return_last_lines() {
        let generator = ScriptedGenerator::repeating("```REPLACE\nprint(3)\n```");
        let solver = Solver::new(
            ScriptedSandbox::always_ok("3"),
            &generator,
            ScriptedScorer::new(vec![Ok(ScoreReport::invalid("no number"))]),
            ScriptedRepairer::new(Vec::new()),
            config(2),
        );

        let outcome = solver.solve(&session(&[])).expect("solve");
        assert_eq!(outcome.code, lines(&["print(3)"]));
        assert_eq!(outcome.score, 0.0);
        assert_eq!(outcome.program, "import numpy as np\nprint(3)");
    }

    #[test]
    fn single_scorer_transport_failure_is_recovered() {
        let generator = ScriptedGenerator::repeating("```REPLACE\nprint(1)\n```");
        let scorer = ScriptedScorer::new(vec![Err("timeout".to_string()), Ok(valid_score(0.7))]);
        let solver = Solver::new(
            ScriptedSandbox::always_ok("1"),
            &generator,
            scorer,
            ScriptedRepairer::new(Vec::new()),
            config(2),
        );

        let outcome = solver.solve(&session(&[])).expect("solve");
        assert_eq!(outcome.commits, 2);
        assert_eq!(outcome.score, 0.7);
    }

    /// Verifies the transport counter resets after any successful call.
    #[test]
    fn transport_failures_reset_after_success() {
        let generator = ScriptedGenerator::new(vec![
            ScriptedReply::Transport("down".to_string()),
            ScriptedReply::Transport("down".to_string()),
            ScriptedReply::text("```REPLACE\nprint(1)\n```"),
            ScriptedReply::Transport("down".to_string()),
            ScriptedReply::Transport("down".to_string()),
        ]);
        let solver = Solver::new(
            ScriptedSandbox::always_ok("1"),
            &generator,
            ScriptedScorer::constant(0.1),
            ScriptedRepairer::new(Vec::new()),
            config(5),
        );

        let outcome = solver.solve(&session(&[])).expect("solve");
        assert_eq!(outcome.steps, 5);
        assert_eq!(outcome.commits, 1);
        generator.assert_drained().expect("drained");
        assert!(matches!(
            outcome.history.last().map(|entry| &entry.outcome),
            Some(StepOutcome::Rejected {
                error: StepError::Transport { collaborator: "generator", .. }
            })
        ));
    }

    /// Verifies prompts bootstrap with REPLACE and remind after a failure.
    #[test]
    fn prompts_bootstrap_and_remind_after_failure() {
        let generator = ScriptedGenerator::from_texts(&["no command", "```REPLACE\nprint(1)\n```"]);
        let solver = Solver::new(
            ScriptedSandbox::always_ok("1"),
            &generator,
            ScriptedScorer::constant(0.4),
            ScriptedRepairer::new(Vec::new()),
            SolverConfig {
                min_gen_trials: 0,
                ..config(2)
            },
        );

        let outcome = solver.solve(&session(&[])).expect("solve");
        assert_eq!(outcome.commits, 1);
        assert_eq!(
            outcome.history[0].outcome,
            StepOutcome::Rejected {
                error: StepError::NoCommandMatched
            }
        );

        let requests = generator.requests();
        assert!(requests[0].system_prompt.contains("CODE EDITING TOOL"));
        assert!(requests[0].system_prompt.contains("compute the mean"));
        assert!(requests[0].prompt.contains("use ```REPLACE to create initial code"));
        assert!(!requests[0].prompt.contains("immediately"));
        assert!(requests[1].prompt.contains("command immediately"));
    }

    /// Verifies a sandbox outage becomes an execution error, not a fatal one.
    #[test]
    fn sandbox_outage_is_step_failure() {
        let sandbox = ScriptedSandbox::new(|_| {
            crate::test_support::SandboxReply::Unavailable("spawn failed".to_string())
        });
        let generator = ScriptedGenerator::repeating("```REPLACE\nprint(1)\n```");
        let solver = Solver::new(
            sandbox,
            &generator,
            ScriptedScorer::constant(0.4),
            ScriptedRepairer::new(Vec::new()),
            SolverConfig {
                min_gen_trials: 0,
                ..config(1)
            },
        );

        let outcome = solver.solve(&session(&[])).expect("solve");
        assert!(matches!(
            &outcome.history[0].outcome,
            StepOutcome::Rejected {
                error: StepError::Execution(ExecutionError::Unavailable(_))
            }
        ));
    }

    #[test]
    fn step_logs_are_written_when_configured() {
        let temp = tempfile::tempdir().expect("tempdir");
        let generator = ScriptedGenerator::repeating("```REPLACE\nprint(1)\n```");
        let solver = Solver::new(
            ScriptedSandbox::always_ok("1"),
            &generator,
            ScriptedScorer::constant(0.4),
            ScriptedRepairer::new(Vec::new()),
            config(2),
        )
        .with_log_dir(temp.path().to_path_buf());

        solver.solve(&session(&[])).expect("solve");
        assert!(temp.path().join("steps/0000/meta.json").is_file());
        assert!(temp.path().join("steps/0001/output.log").is_file());
    }

    /// Verifies each outcome gets the matching reflection and the next prompt shows it.
    #[test]
    fn reflections_follow_step_outcomes() {
        let generator = ScriptedGenerator::from_texts(&[
            "no command here",
            "```REPLACE\nboom()\n```",
            "```REPLACE\nprint(1)\n```",
        ]);
        let reflector = ScriptedReflector::repeating("think harder");
        let solver = Solver::new(
            ScriptedSandbox::failing_on("boom", "RuntimeError: boom"),
            &generator,
            ScriptedScorer::constant(0.5),
            ScriptedRepairer::new(Vec::new()),
            SolverConfig {
                min_gen_trials: 0,
                ..config(3)
            },
        )
        .with_reflector(&reflector);

        let outcome = solver.solve(&session(&[])).expect("solve");
        assert_eq!(outcome.commits, 1);
        assert!(
            outcome
                .history
                .iter()
                .all(|entry| entry.reflection.as_deref() == Some("think harder"))
        );

        let requests = reflector.requests();
        let kinds: Vec<ReflectKind> = requests.iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            vec![ReflectKind::NoChange, ReflectKind::Failed, ReflectKind::Scored]
        );
        assert!(requests[1].code.contains("Attempted command:"));
        assert!(requests[1].code.contains("boom()"));
        assert!(requests[1].result.contains("RuntimeError: boom"));
        assert!(requests[2].code.contains("0 |print(1)"));
        assert!(requests[2].result.contains("The performance of your submission is: 0.5"));
        assert!(requests[0].context.contains("compute the mean"));
        assert!(!requests[0].context.contains("CODE EDITING TOOL"));

        let prompts = generator.requests();
        assert!(!prompts[0].prompt.contains("Reflection:"));
        assert!(prompts[1].prompt.contains("Reflection: think harder"));
    }

    /// Verifies a pool eviction reflects across the pool and feeds the system prompt.
    #[test]
    fn pool_eviction_refreshes_code_reflection() {
        let generator = ScriptedGenerator::from_texts(&[
            "```REPLACE\nprint('a')\n```",
            "```REPLACE\nprint('b')\n```",
            "```REPLACE\nprint('c')\n```",
        ]);
        let reflector = ScriptedReflector::new(vec![
            ScriptedReply::text("step 0"),
            ScriptedReply::text("pool insight"),
            ScriptedReply::text("step 1"),
            ScriptedReply::text("step 2"),
        ]);
        let solver = Solver::new(
            ScriptedSandbox::always_ok("ok"),
            &generator,
            ScriptedScorer::sequence(&[0.2, 0.6]),
            ScriptedRepairer::new(Vec::new()),
            config(3),
        )
        .with_reflector(&reflector);

        let outcome = solver.solve(&session(&[])).expect("solve");
        assert_eq!(outcome.code_reflection, "pool insight");
        assert_eq!(outcome.best_codes.len(), 1);
        assert_eq!(outcome.code, lines(&["print('b')"]));

        let requests = reflector.requests();
        assert_eq!(requests.len(), 4);
        assert_eq!(requests[1].kind, ReflectKind::Pool);
        assert!(requests[1].code.contains("[Code #0] score 0.6000"));
        assert!(requests[1].code.contains("print('b')"));

        let prompts = generator.requests();
        assert!(!prompts[1].system_prompt.contains("pool insight"));
        assert!(prompts[2].system_prompt.contains("### Reflection On Your Best Code"));
        assert!(prompts[2].system_prompt.contains("pool insight"));
    }

    /// Verifies an unreachable reflector leaves steps without reflections.
    #[test]
    fn reflector_outage_is_not_fatal() {
        let generator = ScriptedGenerator::repeating("```REPLACE\nprint(1)\n```");
        let reflector = ScriptedReflector::new(vec![ScriptedReply::Transport(
            "connection reset".to_string(),
        )]);
        let solver = Solver::new(
            ScriptedSandbox::always_ok("1"),
            &generator,
            ScriptedScorer::constant(0.4),
            ScriptedRepairer::new(Vec::new()),
            config(3),
        )
        .with_reflector(&reflector);

        let outcome = solver.solve(&session(&[])).expect("solve");
        assert_eq!(outcome.steps, 3);
        assert_eq!(outcome.commits, 3);
        assert!(outcome.history.iter().all(|entry| entry.reflection.is_none()));
        assert_eq!(reflector.requests().len(), 3);
    }
}
