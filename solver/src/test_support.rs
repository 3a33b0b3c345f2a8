//! Test-only collaborators with scripted behavior.
//!
//! Nothing here spawns processes or talks to a model. Each fake records the
//! requests it saw so tests can assert on prompts and programs.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};

use crate::core::types::ScoreReport;
use crate::io::collaborators::{
    GenerateRequest, Generator, ReflectRequest, Reflector, RepairRequest, Repairer, Scorer,
};
use crate::io::sandbox::{Sandbox, SandboxOutput, SandboxRequest};

/// Build owned lines from string slices.
pub fn lines(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// FIFO of scripted items with an optional value repeated once it drains.
struct ScriptQueue<T> {
    items: RefCell<VecDeque<T>>,
    fallback: Option<T>,
}

impl<T: Clone> ScriptQueue<T> {
    fn new(items: Vec<T>, fallback: Option<T>) -> Self {
        Self {
            items: RefCell::new(items.into()),
            fallback,
        }
    }

    fn next(&self) -> Option<T> {
        self.items
            .borrow_mut()
            .pop_front()
            .or_else(|| self.fallback.clone())
    }

    fn remaining(&self) -> usize {
        self.items.borrow().len()
    }
}

/// How a scripted sandbox answers one program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxReply {
    /// Program ran; stdout is the given text.
    Output(String),
    /// Program raised; the text is the error message.
    Error(String),
    Timeout,
    /// The sandbox itself could not run the program.
    Unavailable(String),
}

type Responder = Box<dyn Fn(&str) -> SandboxReply>;

/// Sandbox that answers from a closure over the full program text.
pub struct ScriptedSandbox {
    respond: Responder,
    programs: RefCell<Vec<String>>,
    timeouts: RefCell<Vec<Duration>>,
}

impl ScriptedSandbox {
    pub fn new(respond: impl Fn(&str) -> SandboxReply + 'static) -> Self {
        Self {
            respond: Box::new(respond),
            programs: RefCell::new(Vec::new()),
            timeouts: RefCell::new(Vec::new()),
        }
    }

    pub fn always_ok(output: &str) -> Self {
        let output = output.to_string();
        Self::new(move |_| SandboxReply::Output(output.clone()))
    }

    pub fn always_err(message: &str) -> Self {
        let message = message.to_string();
        Self::new(move |_| SandboxReply::Error(message.clone()))
    }

    pub fn always_timeout() -> Self {
        Self::new(|_| SandboxReply::Timeout)
    }

    /// Fail every program containing `needle`, run the rest successfully.
    pub fn failing_on(needle: &str, message: &str) -> Self {
        let needle = needle.to_string();
        let message = message.to_string();
        Self::new(move |code| {
            if code.contains(&needle) {
                SandboxReply::Error(message.clone())
            } else {
                SandboxReply::Output("ok".to_string())
            }
        })
    }

    /// Every program handed to the sandbox, in order.
    pub fn programs(&self) -> Vec<String> {
        self.programs.borrow().clone()
    }

    /// Timeout of every request, in the same order as [`Self::programs`].
    pub fn timeouts(&self) -> Vec<Duration> {
        self.timeouts.borrow().clone()
    }
}

impl Sandbox for ScriptedSandbox {
    fn execute(&self, request: &SandboxRequest) -> Result<SandboxOutput> {
        self.programs.borrow_mut().push(request.code.clone());
        self.timeouts.borrow_mut().push(request.timeout);
        match (self.respond)(&request.code) {
            SandboxReply::Output(output) => Ok(SandboxOutput {
                output,
                ..SandboxOutput::default()
            }),
            SandboxReply::Error(message) => Ok(SandboxOutput {
                error: Some(message),
                ..SandboxOutput::default()
            }),
            SandboxReply::Timeout => Ok(SandboxOutput {
                error: Some("timed out".to_string()),
                timed_out: true,
                ..SandboxOutput::default()
            }),
            SandboxReply::Unavailable(message) => Err(anyhow!(message)),
        }
    }
}

/// Scripted text reply, or a transport failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedReply {
    Text(String),
    Transport(String),
}

impl ScriptedReply {
    pub fn text(text: &str) -> Self {
        Self::Text(text.to_string())
    }

    fn into_result(self) -> Result<String> {
        match self {
            Self::Text(text) => Ok(text),
            Self::Transport(message) => Err(anyhow!(message)),
        }
    }
}

/// Generator that returns queued replies in order.
pub struct ScriptedGenerator {
    replies: ScriptQueue<ScriptedReply>,
    requests: RefCell<Vec<GenerateRequest>>,
}

impl ScriptedGenerator {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            replies: ScriptQueue::new(replies, None),
            requests: RefCell::new(Vec::new()),
        }
    }

    pub fn from_texts(texts: &[&str]) -> Self {
        Self::new(texts.iter().map(|text| ScriptedReply::text(text)).collect())
    }

    /// Return `text` for every call.
    pub fn repeating(text: &str) -> Self {
        Self {
            replies: ScriptQueue::new(Vec::new(), Some(ScriptedReply::text(text))),
            requests: RefCell::new(Vec::new()),
        }
    }

    /// Fail every call with a transport error.
    pub fn failing(message: &str) -> Self {
        Self {
            replies: ScriptQueue::new(
                Vec::new(),
                Some(ScriptedReply::Transport(message.to_string())),
            ),
            requests: RefCell::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.requests.borrow().clone()
    }

    pub fn assert_drained(&self) -> Result<()> {
        let remaining = self.replies.remaining();
        if remaining > 0 {
            bail!("scripted generator has {remaining} unused replies");
        }
        Ok(())
    }
}

impl Generator for ScriptedGenerator {
    fn generate(&self, request: &GenerateRequest) -> Result<String> {
        self.requests.borrow_mut().push(request.clone());
        self.replies
            .next()
            .ok_or_else(|| anyhow!("scripted generator exhausted"))?
            .into_result()
    }
}

/// Scorer that returns queued reports; the last one repeats.
pub struct ScriptedScorer {
    reports: ScriptQueue<std::result::Result<ScoreReport, String>>,
    calls: RefCell<Vec<String>>,
}

impl ScriptedScorer {
    pub fn new(reports: Vec<std::result::Result<ScoreReport, String>>) -> Self {
        let fallback = reports.last().cloned();
        Self {
            reports: ScriptQueue::new(reports, fallback),
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn constant(value: f64) -> Self {
        Self::sequence(&[value])
    }

    /// Valid scores in order; the last one repeats.
    pub fn sequence(values: &[f64]) -> Self {
        Self::new(values.iter().map(|value| Ok(valid_score(*value))).collect())
    }

    /// Programs that were scored, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }
}

impl Scorer for ScriptedScorer {
    fn score(&self, _plan: &str, code: &str, _output: &str) -> Result<ScoreReport> {
        self.calls.borrow_mut().push(code.to_string());
        match self.reports.next() {
            Some(Ok(report)) => Ok(report),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("scripted scorer exhausted")),
        }
    }
}

/// A valid report with the explanation the reward model would give.
pub fn valid_score(value: f64) -> ScoreReport {
    ScoreReport {
        value,
        explanation: format!("The performance of your submission is: {value}"),
        valid: true,
    }
}

/// Repairer that returns queued replies in order.
pub struct ScriptedRepairer {
    replies: ScriptQueue<ScriptedReply>,
    requests: RefCell<Vec<RepairRequest>>,
}

impl ScriptedRepairer {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            replies: ScriptQueue::new(replies, None),
            requests: RefCell::new(Vec::new()),
        }
    }

    pub fn repeating(text: &str) -> Self {
        Self {
            replies: ScriptQueue::new(Vec::new(), Some(ScriptedReply::text(text))),
            requests: RefCell::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<RepairRequest> {
        self.requests.borrow().clone()
    }
}

impl Repairer for ScriptedRepairer {
    fn repair(&self, request: &RepairRequest) -> Result<String> {
        self.requests.borrow_mut().push(request.clone());
        self.replies
            .next()
            .ok_or_else(|| anyhow!("scripted repairer exhausted"))?
            .into_result()
    }
}

/// Reflector that returns queued replies in order.
pub struct ScriptedReflector {
    replies: ScriptQueue<ScriptedReply>,
    requests: RefCell<Vec<ReflectRequest>>,
}

impl ScriptedReflector {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            replies: ScriptQueue::new(replies, None),
            requests: RefCell::new(Vec::new()),
        }
    }

    pub fn repeating(text: &str) -> Self {
        Self {
            replies: ScriptQueue::new(Vec::new(), Some(ScriptedReply::text(text))),
            requests: RefCell::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ReflectRequest> {
        self.requests.borrow().clone()
    }
}

impl Reflector for ScriptedReflector {
    fn reflect(&self, request: &ReflectRequest) -> Result<String> {
        self.requests.borrow_mut().push(request.clone());
        self.replies
            .next()
            .ok_or_else(|| anyhow!("scripted reflector exhausted"))?
            .into_result()
    }
}
