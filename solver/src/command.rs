//! Command protocol: the closed set of code mutations a model may request.
//!
//! A command is recognised by its fenced marker ("```EDIT", "```REPLACE"),
//! parsed into structured arguments, then executed against a copy of the
//! current lines. Execution runs the full program through a [`Sandbox`]; the
//! caller only ever sees the new lines when the sandbox succeeded.

use std::time::Duration;

use tracing::{debug, instrument};

use crate::core::block::{FENCE, assemble_program, extract_block, first_block};
use crate::core::code_state::splice;
use crate::core::errors::{ExecutionError, ParseError, RegistryError};
use crate::core::types::{CommandKind, RepairKind};
use crate::io::sandbox::{Sandbox, SandboxRequest};

const MENU_HEADER: &str = "Commands are issued as a fenced block: ```COMMAND\n<command information here>\n```, \
where COMMAND is one of the command words below (EDIT, REPLACE) and the fences open and close the block. \
Both the opening and the closing ``` are required. Issue exactly one command per response.";

const EDIT_DOC: &str = "============= CODE EDITING TOOL =============\n\
Replaces lines N through M (inclusive, 0-indexed) of the current code with any number of new lines. \
This is the primary way to change code.\n\
Usage: ```EDIT N M\n<new lines to replace old lines>\n```\n\
N is the first line index to remove and M the last; every line between them is removed as well. \
The edited program is executed before it is accepted; if it raises an error the current code is kept unchanged.";

const REPLACE_DOC: &str = "============= REWRITE CODE TOOL =============\n\
Discards all current code and replaces it with a new program.\n\
Usage: ```REPLACE\n<code here>\n```\n\
Use this for sweeping changes such as switching the model or the training procedure. \
The new program is executed before it is accepted; if it raises an error the current code is kept unchanged. \
Prefer EDIT for incremental changes.";

/// A registered command variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Edit,
    Replace,
}

/// Structured arguments extracted from a command block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedCommand {
    /// Replace lines `start..=end` with `lines`.
    Edit {
        start: usize,
        end: usize,
        lines: Vec<String>,
    },
    /// Replace the whole program with `lines`.
    Replace { lines: Vec<String> },
}

impl ParsedCommand {
    pub fn kind(&self) -> CommandKind {
        match self {
            ParsedCommand::Edit { .. } => CommandKind::Edit,
            ParsedCommand::Replace { .. } => CommandKind::Replace,
        }
    }
}

/// Inputs needed to execute a parsed command.
pub struct ExecContext<'a, S: Sandbox> {
    /// Committed lines; never mutated by execution.
    pub lines: &'a [String],
    /// Dataset preamble prepended to every run.
    pub preamble: &'a str,
    pub sandbox: &'a S,
    pub timeout: Duration,
}

/// A candidate that ran successfully and may be committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Executed {
    pub lines: Vec<String>,
    pub output: String,
    pub artifacts: Vec<String>,
}

impl Command {
    pub fn kind(self) -> CommandKind {
        match self {
            Command::Edit => CommandKind::Edit,
            Command::Replace => CommandKind::Replace,
        }
    }

    /// Command word that follows the opening fence.
    pub fn tag(self) -> &'static str {
        match self {
            Command::Edit => "EDIT",
            Command::Replace => "REPLACE",
        }
    }

    pub fn marker(self) -> String {
        format!("{FENCE}{}", self.tag())
    }

    /// Repair prompt family to use when this command fails.
    pub fn repair_kind(self) -> RepairKind {
        match self {
            Command::Edit => RepairKind::Edit,
            Command::Replace => RepairKind::Replace,
        }
    }

    /// True iff the untouched raw text contains this command's marker.
    pub fn matches(self, raw: &str) -> bool {
        raw.contains(&self.marker())
    }

    pub fn parse(self, raw: &str) -> Result<ParsedCommand, ParseError> {
        match self {
            Command::Edit => parse_edit(raw),
            Command::Replace => parse_replace(raw),
        }
    }

    /// Apply `parsed` to a copy of the current lines and run the resulting program.
    #[instrument(skip_all, fields(command = self.tag()))]
    pub fn execute<S: Sandbox>(
        self,
        parsed: &ParsedCommand,
        ctx: &ExecContext<'_, S>,
    ) -> Result<Executed, ExecutionError> {
        debug_assert_eq!(self.kind(), parsed.kind());
        let lines = match parsed {
            ParsedCommand::Edit { start, end, lines } => splice(ctx.lines, *start, *end, lines)?,
            ParsedCommand::Replace { lines } => lines.clone(),
        };

        let request = SandboxRequest {
            code: assemble_program(ctx.preamble, &lines),
            timeout: ctx.timeout,
        };
        let output = ctx
            .sandbox
            .execute(&request)
            .map_err(|err| ExecutionError::Unavailable(format!("{err:#}")))?;

        if output.timed_out {
            return Err(ExecutionError::TimedOut {
                secs: ctx.timeout.as_secs(),
            });
        }
        if let Some(message) = output.error {
            return Err(ExecutionError::Failed { message });
        }

        debug!(lines = lines.len(), artifacts = output.artifacts.len(), "candidate executed");
        Ok(Executed {
            lines,
            output: output.output,
            artifacts: output.artifacts,
        })
    }

    pub fn docstring(self) -> &'static str {
        match self {
            Command::Edit => EDIT_DOC,
            Command::Replace => REPLACE_DOC,
        }
    }
}

fn parse_edit(raw: &str) -> Result<ParsedCommand, ParseError> {
    let body = first_block(raw, Command::Edit.tag()).ok_or(ParseError::EmptyBlock)?;
    if body.trim().is_empty() {
        return Err(ParseError::EmptyBlock);
    }

    let mut body_lines = body.lines();
    let header = body_lines.next().unwrap_or_default().trim();
    let tokens: Vec<&str> = header.split_whitespace().collect();
    let [first, second] = tokens.as_slice() else {
        return Err(ParseError::MalformedRange(header.to_string()));
    };
    let start = parse_index(first)?;
    let end = parse_index(second)?;
    if start > end {
        return Err(ParseError::InvertedRange { start, end });
    }

    let lines = trim_trailing_blank(body_lines.map(str::to_string).collect());
    if lines.is_empty() {
        return Err(ParseError::MissingReplacementLines);
    }
    Ok(ParsedCommand::Edit { start, end, lines })
}

fn parse_replace(raw: &str) -> Result<ParsedCommand, ParseError> {
    let body = extract_block(raw, Command::Replace.tag()).ok_or(ParseError::EmptyBody)?;
    if body.trim().is_empty() {
        return Err(ParseError::EmptyBody);
    }
    let lines: Vec<String> = body
        .lines()
        .skip_while(|line| line.trim().is_empty())
        .map(str::to_string)
        .collect();
    Ok(ParsedCommand::Replace {
        lines: trim_trailing_blank(lines),
    })
}

fn parse_index(token: &str) -> Result<usize, ParseError> {
    token
        .parse::<usize>()
        .map_err(|_| ParseError::NonIntegerIndex(token.to_string()))
}

fn trim_trailing_blank(mut lines: Vec<String>) -> Vec<String> {
    while lines.last().is_some_and(|line| line.trim().is_empty()) {
        lines.pop();
    }
    lines
}

/// Ordered set of commands available to a session.
///
/// Dispatch scans in registration order and the first match wins, so markers
/// must be pairwise non-overlapping. Overlap is rejected at construction.
#[derive(Debug, Clone)]
pub struct CommandRegistry {
    commands: Vec<Command>,
}

impl CommandRegistry {
    pub fn new(commands: Vec<Command>) -> Result<Self, RegistryError> {
        if commands.is_empty() {
            return Err(RegistryError::Empty);
        }
        for (idx, first) in commands.iter().enumerate() {
            for second in &commands[idx + 1..] {
                let (a, b) = (first.marker(), second.marker());
                if a.starts_with(&b) || b.starts_with(&a) {
                    return Err(RegistryError::OverlappingTags {
                        first: a,
                        second: b,
                    });
                }
            }
        }
        Ok(Self { commands })
    }

    /// First registered command whose marker appears in `raw`.
    pub fn dispatch(&self, raw: &str) -> Option<Command> {
        self.commands.iter().copied().find(|cmd| cmd.matches(raw))
    }

    /// Agent-facing command menu: usage header plus every docstring.
    pub fn menu(&self) -> String {
        let docs: Vec<&str> = self.commands.iter().map(|cmd| cmd.docstring()).collect();
        format!("{MENU_HEADER}\n{}", docs.join("\n"))
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self {
            commands: vec![Command::Edit, Command::Replace],
        }
    }
}
