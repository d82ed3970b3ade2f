//! Utilities
//!
//! Cross-cutting helpers for output collection and code fingerprints.

pub mod digest;
pub mod output;
