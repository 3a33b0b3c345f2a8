//! Prompt builder for generator, scorer, repairer and reflector requests.
//!
//! Solver prompts are minijinja templates split into sections by
//! `<!-- section:KEY required|droppable -->` markers. When a rendered prompt
//! exceeds the byte budget, droppable sections go first, in a fixed order,
//! and then the largest content section is truncated. The command menu and
//! the closing request are never cut.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::block::render_numbered;
use crate::core::types::{HistoryEntry, RepairKind, StepOutcome};
use crate::io::collaborators::{ReflectRequest, RepairRequest};

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");
const STEP_TEMPLATE: &str = include_str!("prompts/step.md");
const SCORE_TEMPLATE: &str = include_str!("prompts/score.md");
const REPAIR_TEMPLATE: &str = include_str!("prompts/repair.md");
const REFLECT_TEMPLATE: &str = include_str!("prompts/reflect.md");

const SYSTEM_DROP_ORDER: &[&str] = &["insights", "reflection", "notes"];
const STEP_DROP_ORDER: &[&str] = &["history", "output"];

/// Sections carrying the command protocol; budget enforcement never cuts them.
const PROTOCOL_SECTIONS: &[&str] = &["commands", "request"];

const SECTION_JOINER: &str = "\n\n";
const TRUNCATION_MARKER: &str = "\n[truncated]";

/// Bytes of a history response kept when rendering the recency window.
const HISTORY_RESPONSE_LIMIT: usize = 4_000;

const SCORE_SYSTEM: &str = "You are a professor agent serving as an expert reward model. \
You read a research plan, research code and code output, and determine how well the engineer followed the plan, \
built the code and got the proper output, scored from 0 to 1 as a float.\n\n\
You must structure your score exactly in the following way: ```SCORE\n<score here>\n``` \
where SCORE is just the word score and <score here> is a floating point number between 0 and 1.";

const REPAIR_PREAMBLE: &str = "You are an automated code repair tool.\n\
Your goal is to take in code and an error and repair the code so the same error does not repeat itself, \
and to remove any other potential errors without affecting the code output.\n\
Your output should match the original code as closely as possible.\n";

const REPAIR_REPLACE_SYSTEM: &str = "You must wrap the code in the following ```python\n<code here>\n```\n\
Do not forget the opening ```python and the closing ```.";

const REPAIR_EDIT_SYSTEM: &str = "============= CODE EDITING TOOL =============\n\
You can replace lines N through M (inclusive, 0-indexed) of the current code with any number of new lines \
using: ```EDIT N M\n<new lines to replace old lines>\n```\n\
The new code is tested before it replaces the existing code.\n\
Please use the code editing tool to fix this code. Do not forget the opening ```EDIT N M and the closing ```.\n\
Your output should look like the following\n\n```EDIT N M\n<new lines to replace old lines>\n```";

const REPAIR_COMMAND_SYSTEM: &str = "The response below was meant to contain exactly one command, \
either ```EDIT N M\n<new lines>\n``` or ```REPLACE\n<code>\n```, but no command could be recognised.\n\
Rewrite it as a single well-formed command. Keep the intended code changes. \
Both the opening and the closing ``` are required.";

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").expect("section marker pattern")
});

/// A system prompt and the user prompt sent with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptPair {
    pub system: String,
    pub prompt: String,
}

/// Inputs for the engineer-facing system prompt.
#[derive(Debug, Clone, Copy)]
pub struct SystemPromptInputs<'a> {
    pub plan: &'a str,
    pub preamble: &'a str,
    pub insights: &'a str,
    /// Session notes plus every score rationale so far.
    pub notes: &'a str,
    /// Latest reflection across the best-code pool.
    pub reflection: &'a str,
    /// Command menu; `None` omits the commands section.
    pub menu: Option<&'a str>,
}

/// Inputs for one step prompt.
#[derive(Debug, Clone, Copy)]
pub struct StepPromptInputs<'a> {
    pub lines: &'a [String],
    /// Recency window, oldest first.
    pub history: &'a [HistoryEntry],
    pub last_output: &'a str,
    /// Whether the previous attempt failed to produce a working command.
    pub reminder: bool,
}

#[derive(Debug, Clone, Serialize)]
struct HistoryContext {
    ago: usize,
    command: Option<&'static str>,
    response: String,
    result: String,
    reflection: Option<String>,
}

impl HistoryContext {
    fn from_window(history: &[HistoryEntry]) -> Vec<Self> {
        let len = history.len();
        history
            .iter()
            .enumerate()
            .map(|(idx, entry)| Self {
                ago: len - idx,
                command: entry.command.map(|kind| kind.as_str()),
                response: clip(entry.response.trim(), HISTORY_RESPONSE_LIMIT),
                result: describe_outcome(&entry.outcome),
                reflection: entry
                    .reflection
                    .as_deref()
                    .and_then(optional)
                    .map(|text| clip(text, HISTORY_RESPONSE_LIMIT)),
            })
            .collect()
    }
}

fn describe_outcome(outcome: &StepOutcome) -> String {
    match outcome {
        StepOutcome::Committed { output, score } if score.valid => format!(
            "committed; score {:.4}. {}\nOutput:\n{}",
            score.value,
            score.explanation.trim(),
            clip(output.trim(), HISTORY_RESPONSE_LIMIT)
        ),
        StepOutcome::Committed { output, score } => format!(
            "committed; score unavailable ({}).\nOutput:\n{}",
            score.explanation.trim(),
            clip(output.trim(), HISTORY_RESPONSE_LIMIT)
        ),
        StepOutcome::Rejected { error } => {
            format!("FAILED: {error}. Code was reverted to its state before the command.")
        }
    }
}

fn clip(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n[truncated {} bytes]", &text[..end], text.len() - end)
}

fn optional(text: &str) -> Option<&str> {
    Some(text.trim()).filter(|s| !s.is_empty())
}

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("system", SYSTEM_TEMPLATE)
            .context("load system template")?;
        env.add_template("step", STEP_TEMPLATE)
            .context("load step template")?;
        env.add_template("score", SCORE_TEMPLATE)
            .context("load score template")?;
        env.add_template("repair", REPAIR_TEMPLATE)
            .context("load repair template")?;
        env.add_template("reflect", REFLECT_TEMPLATE)
            .context("load reflect template")?;
        Ok(Self { env })
    }

    fn render_system(&self, input: &SystemPromptInputs<'_>) -> Result<String> {
        let template = self.env.get_template("system")?;
        let rendered = template.render(context! {
            plan => input.plan.trim(),
            preamble => input.preamble.trim(),
            insights => optional(input.insights),
            notes => optional(input.notes),
            reflection => optional(input.reflection),
            commands => input.menu.and_then(optional),
        })?;
        Ok(rendered)
    }

    fn render_step(&self, input: &StepPromptInputs<'_>) -> Result<String> {
        let template = self.env.get_template("step")?;
        let code = render_numbered(input.lines);
        let rendered = template.render(context! {
            history => HistoryContext::from_window(input.history),
            last_output => optional(input.last_output),
            code => optional(&code),
            reminder => input.reminder,
            bootstrap => input.lines.is_empty(),
        })?;
        Ok(rendered)
    }

    fn render_score(&self, plan: &str, code: &str, output: &str) -> Result<String> {
        let template = self.env.get_template("score")?;
        Ok(template.render(context! {
            plan => plan.trim(),
            code => code,
            output => output.trim(),
        })?)
    }

    fn render_repair(&self, request: &RepairRequest) -> Result<String> {
        let template = self.env.get_template("repair")?;
        Ok(template.render(context! {
            kind => request.kind,
            error => request.error.trim(),
            text => request.text.as_str(),
        })?)
    }

    fn render_reflect(&self, request: &ReflectRequest) -> Result<String> {
        let template = self.env.get_template("reflect")?;
        Ok(template.render(context! {
            kind => request.kind,
            code => request.code.trim_end(),
            result => request.result.trim(),
        })?)
    }
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

/// Parse sections from rendered template output using HTML comment markers.
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::new();

    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        if !content.is_empty() {
            sections.push(ParsedSection {
                key: key.as_str().to_string(),
                required: kind.as_str() == "required",
                content,
            });
        }
    }

    sections
}

/// Rendered length of `sections` once joined by [`SECTION_JOINER`].
fn rendered_len(sections: &[ParsedSection]) -> usize {
    let content: usize = sections.iter().map(|s| s.content.len()).sum();
    content + SECTION_JOINER.len() * sections.len().saturating_sub(1)
}

/// Drop droppable sections in `drop_order` until the budget fits, then
/// truncate the largest remaining content section until it does.
///
/// Sections listed in [`PROTOCOL_SECTIONS`] are never cut.
fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize, drop_order: &[&str]) {
    if rendered_len(sections) <= budget {
        return;
    }

    for key in drop_order {
        if rendered_len(sections) <= budget {
            break;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == *key && !s.required) {
            let dropped_len = sections[idx].content.len();
            debug!(
                section = key,
                bytes_dropped = dropped_len,
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    while rendered_len(sections) > budget {
        let target = sections
            .iter()
            .enumerate()
            .filter(|(_, s)| !PROTOCOL_SECTIONS.contains(&s.key.as_str()))
            .max_by_key(|(_, s)| s.content.len())
            .map(|(idx, _)| idx);
        let Some(idx) = target else {
            debug!(budget, "protocol sections alone exceed the budget");
            return;
        };

        let excess = rendered_len(sections) - budget;
        let section = &mut sections[idx];
        let before_len = section.content.len();
        if before_len <= excess + TRUNCATION_MARKER.len() {
            debug!(section = %section.key, before_len, "removed section for budget");
            sections.remove(idx);
            continue;
        }
        let mut cut = before_len - excess - TRUNCATION_MARKER.len();
        while !section.content.is_char_boundary(cut) {
            cut -= 1;
        }
        section.content.truncate(cut);
        section.content.push_str(TRUNCATION_MARKER);
        debug!(
            section = %section.key,
            before_len,
            after_len = section.content.len(),
            "truncated section for budget"
        );
    }
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join(SECTION_JOINER)
}

/// Builds solver prompts within a byte budget, dropping less critical sections first.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    /// Render the engineer system prompt.
    pub fn build_system(&self, input: &SystemPromptInputs<'_>) -> Result<String> {
        let rendered = PromptEngine::new()?
            .render_system(input)
            .context("render system prompt")?;
        Ok(self.fit(&rendered, SYSTEM_DROP_ORDER))
    }

    /// Render the per-step prompt: history, last output, numbered code, request.
    pub fn build_step(&self, input: &StepPromptInputs<'_>) -> Result<String> {
        let rendered = PromptEngine::new()?
            .render_step(input)
            .context("render step prompt")?;
        Ok(self.fit(&rendered, STEP_DROP_ORDER))
    }

    fn fit(&self, rendered: &str, drop_order: &[&str]) -> String {
        let mut sections = parse_sections(rendered);
        apply_budget_to_sections(&mut sections, self.budget_bytes, drop_order);
        render_sections(&sections)
    }
}

/// Prompt asking the reward model to grade a committed program.
pub fn score_prompt(plan: &str, code: &str, output: &str) -> Result<PromptPair> {
    let prompt = PromptEngine::new()?
        .render_score(plan, code, output)
        .context("render score prompt")?;
    Ok(PromptPair {
        system: SCORE_SYSTEM.to_string(),
        prompt,
    })
}

/// Prompt asking the repair model to fix a failed attempt of the given kind.
pub fn repair_prompt(request: &RepairRequest) -> Result<PromptPair> {
    let prompt = PromptEngine::new()?
        .render_repair(request)
        .context("render repair prompt")?;
    let instructions = match request.kind {
        RepairKind::Edit => REPAIR_EDIT_SYSTEM,
        RepairKind::Replace => REPAIR_REPLACE_SYSTEM,
        RepairKind::Unmatched => REPAIR_COMMAND_SYSTEM,
    };
    Ok(PromptPair {
        system: format!("{REPAIR_PREAMBLE}{instructions}"),
        prompt,
    })
}

/// Prompt asking the reflector to comment on a step outcome or the best-code pool.
pub fn reflect_prompt(request: &ReflectRequest) -> Result<PromptPair> {
    let prompt = PromptEngine::new()?
        .render_reflect(request)
        .context("render reflect prompt")?;
    Ok(PromptPair {
        system: request.context.clone(),
        prompt,
    })
}
