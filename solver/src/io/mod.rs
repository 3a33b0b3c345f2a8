//! I/O for the solver: processes, collaborators, prompts, config and logs.

pub mod collaborators;
pub mod config;
pub mod process;
pub mod prompt;
pub mod sandbox;
pub mod step_log;
