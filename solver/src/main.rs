//! Bounded code-refinement solver CLI.
//!
//! `solve` runs one session: a model proposes `EDIT`/`REPLACE` commands, each
//! one runs in a sandbox against a copy of the code, and successful runs are
//! committed and scored. Artifacts land under the output directory.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use solver::command::{Command as ToolCommand, CommandRegistry};
use solver::core::errors::SolveError;
use solver::exit_codes;
use solver::io::collaborators::{CommandGenerator, LlmReflector, LlmRepairer, LlmScorer};
use solver::io::config::{SolverConfig, load_config, write_config};
use solver::io::sandbox::ProcessSandbox;
use solver::logging;
use solver::pipeline::{EXPERIMENT_PHASE, ExperimentPhase, Phase, run_pipeline};
use solver::solve::{SolveSession, Solver};
use tracing::info;

const DEFAULT_CONFIG: &str = "solver.toml";
const DEFAULT_OUT_DIR: &str = "solver-out";

#[derive(Parser)]
#[command(
    name = "solver",
    version,
    about = "Bounded iterative code-refinement solver"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default `solver.toml` if missing.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
    /// Print the command menu shown to the model.
    Menu,
    /// Run one solve session and write the best program.
    Solve(SolveArgs),
}

#[derive(clap::Args, Debug)]
struct SolveArgs {
    /// File with the experiment plan.
    #[arg(long)]
    plan: PathBuf,
    /// File with the dataset code prepended to every program.
    #[arg(long)]
    preamble: PathBuf,
    /// File with prior insights from literature review.
    #[arg(long)]
    insights: Option<PathBuf>,
    /// File with task notes.
    #[arg(long)]
    notes: Option<PathBuf>,
    /// Starting program; without it the model bootstraps with REPLACE.
    #[arg(long)]
    initial_code: Option<PathBuf>,
    #[arg(long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,
    /// Output directory for step logs and the final result.
    #[arg(long, default_value = DEFAULT_OUT_DIR)]
    out: PathBuf,
    /// Override `max_steps` from the config.
    #[arg(long)]
    max_steps: Option<u32>,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            let code = match err.downcast_ref::<SolveError>() {
                Some(SolveError::CollaboratorUnavailable { .. }) => exit_codes::UNAVAILABLE,
                _ => exit_codes::INVALID,
            };
            std::process::exit(code);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force, config } => cmd_init(&config, force),
        Command::Menu => {
            println!("{}", registry()?.menu());
            Ok(exit_codes::OK)
        }
        Command::Solve(args) => cmd_solve(&args),
    }
}

fn cmd_init(path: &Path, force: bool) -> Result<i32> {
    if !force && path.exists() {
        info!(path = %path.display(), "config exists; leaving it untouched");
        return Ok(exit_codes::OK);
    }
    write_config(path, &SolverConfig::default())?;
    println!("{}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_solve(args: &SolveArgs) -> Result<i32> {
    let mut config = load_config(&args.config)?;
    if let Some(max_steps) = args.max_steps {
        config.max_steps = max_steps;
        config.validate()?;
    }
    let session = SolveSession {
        preamble: read_text(&args.preamble)?,
        plan: read_text(&args.plan)?,
        insights: read_optional(args.insights.as_deref())?,
        notes: read_optional(args.notes.as_deref())?,
        initial_code: read_optional(args.initial_code.as_deref())?
            .lines()
            .map(str::to_string)
            .collect(),
    };

    fs::create_dir_all(&args.out)
        .with_context(|| format!("create output dir {}", args.out.display()))?;
    let sandbox = ProcessSandbox::from_config(&config.sandbox, &args.out);
    info!(workdir = %sandbox.workdir().display(), "sandbox ready");
    let generator =
        CommandGenerator::from_config(&config.collaborator).with_workdir(args.out.clone());
    let scorer = LlmScorer::new(generator.clone(), config.collaborator.score_attempts);
    let repairer = LlmRepairer::new(generator.clone());
    let reflector = LlmReflector::new(generator.clone(), config.collaborator.temperature);
    let solver = Solver::new(sandbox, generator, scorer, repairer, config)
        .with_registry(registry()?)
        .with_reflector(reflector)
        .with_log_dir(args.out.clone());

    let mut phases: Vec<Box<dyn Phase>> = vec![Box::new(ExperimentPhase::new(solver, session))];
    let ctx = run_pipeline(&mut phases, &args.out)?;
    let result = ctx
        .result(EXPERIMENT_PHASE)
        .context("experiment phase produced no result")?;

    println!("{}", serde_json::to_string_pretty(result).context("serialize result")?);
    let commits = result["commits"].as_u64().unwrap_or(0);
    if commits == 0 {
        return Ok(exit_codes::NO_COMMIT);
    }
    Ok(exit_codes::OK)
}

fn registry() -> Result<CommandRegistry> {
    CommandRegistry::new(vec![ToolCommand::Edit, ToolCommand::Replace])
        .context("build command registry")
}

fn read_text(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("read {}", path.display()))
}

fn read_optional(path: Option<&Path>) -> Result<String> {
    path.map_or_else(|| Ok(String::new()), read_text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init() {
        let cli = Cli::parse_from(["solver", "init"]);
        assert!(matches!(
            cli.command,
            Command::Init { force: false, ref config } if config == Path::new(DEFAULT_CONFIG)
        ));
    }

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["solver", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true, .. }));
    }

    #[test]
    fn parse_menu() {
        let cli = Cli::parse_from(["solver", "menu"]);
        assert!(matches!(cli.command, Command::Menu));
    }

    #[test]
    fn parse_solve_defaults() {
        let cli = Cli::parse_from([
            "solver",
            "solve",
            "--plan",
            "plan.md",
            "--preamble",
            "data.py",
        ]);
        let Command::Solve(args) = cli.command else {
            panic!("expected solve");
        };
        assert_eq!(args.plan, PathBuf::from("plan.md"));
        assert_eq!(args.preamble, PathBuf::from("data.py"));
        assert_eq!(args.config, PathBuf::from(DEFAULT_CONFIG));
        assert_eq!(args.out, PathBuf::from(DEFAULT_OUT_DIR));
        assert_eq!(args.insights, None);
        assert_eq!(args.max_steps, None);
    }

    #[test]
    fn parse_solve_requires_plan() {
        assert!(Cli::try_parse_from(["solver", "solve", "--preamble", "data.py"]).is_err());
    }

    #[test]
    fn init_writes_default_config_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("solver.toml");
        cmd_init(&path, false).expect("init");
        assert_eq!(load_config(&path).expect("load"), SolverConfig::default());

        fs::write(&path, "max_steps = 4\n").expect("write");
        cmd_init(&path, false).expect("init again");
        assert_eq!(load_config(&path).expect("load").max_steps, 4);

        cmd_init(&path, true).expect("force init");
        assert_eq!(load_config(&path).expect("load").max_steps, 10);
    }

    #[test]
    fn registry_lists_both_commands() {
        let menu = registry().expect("registry").menu();
        assert!(menu.contains("CODE EDITING TOOL"));
        assert!(menu.contains("REWRITE CODE TOOL"));
    }

    #[test]
    fn read_optional_missing_is_empty() {
        assert_eq!(read_optional(None).expect("read"), "");
    }
}
