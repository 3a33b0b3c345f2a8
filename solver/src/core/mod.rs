//! Deterministic logic shared by the solve loop.
//!
//! Core modules are free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests.

pub mod block;
pub mod budget;
pub mod code_state;
pub mod errors;
pub mod types;
