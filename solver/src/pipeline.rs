//! Phase orchestration: named phases run in order, each leaving a JSON result.
//!
//! Phases never retry and never run concurrently. Each result is stored in the
//! shared [`PhaseContext`] for later phases and written to `<out>/<phase>.json`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde_json::Value;
use tracing::{info, instrument};

use crate::io::collaborators::{Generator, NoReflector, Reflector, Repairer, Scorer};
use crate::io::sandbox::Sandbox;
use crate::io::step_log::{ResultRecord, write_result};
use crate::solve::{SolveSession, Solver};

/// Results of the phases that already ran.
#[derive(Debug, Clone)]
pub struct PhaseContext {
    out_dir: PathBuf,
    results: BTreeMap<String, Value>,
}

impl PhaseContext {
    pub fn new(out_dir: PathBuf) -> Self {
        Self {
            out_dir,
            results: BTreeMap::new(),
        }
    }

    /// Directory reserved for one phase's own artifacts.
    pub fn phase_dir(&self, phase: &str) -> PathBuf {
        self.out_dir.join(phase)
    }

    pub fn result(&self, phase: &str) -> Option<&Value> {
        self.results.get(phase)
    }

    pub fn results(&self) -> &BTreeMap<String, Value> {
        &self.results
    }
}

/// One named step of a research pipeline.
pub trait Phase {
    fn name(&self) -> &str;

    fn run(&mut self, ctx: &PhaseContext) -> Result<Value>;
}

/// Run `phases` in order, persisting each result before the next starts.
///
/// Stops at the first failing phase; earlier results stay on disk.
#[instrument(skip_all, fields(out_dir = %out_dir.display(), phases = phases.len()))]
pub fn run_pipeline(phases: &mut [Box<dyn Phase + '_>], out_dir: &Path) -> Result<PhaseContext> {
    let mut ctx = PhaseContext::new(out_dir.to_path_buf());
    fs::create_dir_all(out_dir)
        .with_context(|| format!("create output dir {}", out_dir.display()))?;

    for phase in &mut *phases {
        let name = phase.name().to_string();
        if ctx.results.contains_key(&name) {
            bail!("duplicate phase name {name:?}");
        }
        info!(phase = %name, "phase started");
        let result = phase
            .run(&ctx)
            .with_context(|| format!("phase {name} failed"))?;
        write_phase_result(out_dir, &name, &result)?;
        info!(phase = %name, "phase finished");
        ctx.results.insert(name, result);
    }
    Ok(ctx)
}

fn write_phase_result(out_dir: &Path, name: &str, result: &Value) -> Result<()> {
    let path = out_dir.join(format!("{name}.json"));
    let mut buf = serde_json::to_string_pretty(result).context("serialize phase result")?;
    buf.push('\n');
    fs::write(&path, buf).with_context(|| format!("write {}", path.display()))
}

/// Name under which [`ExperimentPhase`] stores its result.
pub const EXPERIMENT_PHASE: &str = "experiment";

/// Experiment phase: runs a solve session and records the best program.
///
/// An empty session plan is filled from a preceding `plan` phase result,
/// either a JSON string or an object with a `plan` field.
pub struct ExperimentPhase<S, G, C, R, F = NoReflector> {
    solver: Solver<S, G, C, R, F>,
    session: SolveSession,
}

impl<S, G, C, R, F> ExperimentPhase<S, G, C, R, F> {
    pub fn new(solver: Solver<S, G, C, R, F>, session: SolveSession) -> Self {
        Self { solver, session }
    }
}

impl<S, G, C, R, F> Phase for ExperimentPhase<S, G, C, R, F>
where
    S: Sandbox,
    G: Generator,
    C: Scorer,
    R: Repairer,
    F: Reflector,
{
    fn name(&self) -> &str {
        EXPERIMENT_PHASE
    }

    fn run(&mut self, ctx: &PhaseContext) -> Result<Value> {
        if self.session.plan.trim().is_empty()
            && let Some(plan) = ctx.result("plan").and_then(plan_text)
        {
            self.session.plan = plan.to_string();
        }
        let outcome = self.solver.solve(&self.session)?;
        write_result(&ctx.phase_dir(EXPERIMENT_PHASE), &outcome)?;
        serde_json::to_value(ResultRecord::from_outcome(&outcome)).context("serialize solve result")
    }
}

fn plan_text(value: &Value) -> Option<&str> {
    value
        .as_str()
        .or_else(|| value.get("plan").and_then(Value::as_str))
}
