//! Sandboxed agent execution
//!
//! Registration, per-call isolated contexts, checkpoint filtering and the
//! code-source abstraction guests are launched from.

pub mod agent_executor;
pub mod checkpoint;
pub mod code_source;
pub mod contract;

pub use agent_executor::{Ack, AgentExecutor, AgentHandle, BidOutcome, UpdateFailed};
pub use code_source::CodeSource;
