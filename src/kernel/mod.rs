//! Thin wrappers around Linux kernel primitives.
//!
//! All `unsafe` code for context setup is concentrated here.

pub mod preexec;
pub mod reaper;
pub mod sealed;
pub mod seccomp;
pub mod signal;
