//! Bounded iterative code-refinement solver.
//!
//! A model proposes one command per step (`EDIT` a line range or `REPLACE` the
//! whole program). The command runs against a copy of the current code in a
//! sandbox; only a successful run is committed and scored. Failures go through
//! a bounded repair loop and never corrupt the committed code. The session
//! returns the best-scoring program it saw.
//!
//! - **[`core`]**: Pure logic (blocks, code state, errors, budgets).
//! - **[`io`]**: Side effects (processes, collaborators, prompts, config, logs).
//!
//! [`command`] defines the command protocol, [`solve`] the loop, and
//! [`pipeline`] the phase interface the loop plugs into.

pub mod command;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod pipeline;
pub mod solve;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
