//! Sandbox core.
//!
//! Owns the single-use context model: wire protocol, launch and wait,
//! escalating termination, and verdict classification.

pub mod escalation;
pub mod supervisor;
pub mod types;
pub mod verdict;
