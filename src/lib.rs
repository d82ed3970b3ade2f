//! bidbox: a process-isolated runner for untrusted sequential-auction bidders
//!
//! Third-party bidding agents are run one call at a time, each call in a
//! fresh single-use process context, while a game orchestrator drives T
//! rounds of second-price sealed-bid auctions over them.
//!
//! # Architecture
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::preexec`]: Pre-exec hardening plan (process group, namespaces, rlimits, credentials)
//! - [`kernel::signal`]: Process-group signal delivery and sweeping
//! - [`kernel::reaper`]: Subreaper teardown of descendants that left their group
//! - [`kernel::seccomp`]: Signal filter confining guests to their own group
//! - [`kernel::sealed`]: Sealed in-memory images of registered executables
//!
//! ## Context Core ([`core`])
//! - [`core::types`]: Host/guest wire protocol
//! - [`core::supervisor`]: Launch, wait and tear down one context
//! - [`core::escalation`]: SIGTERM -> grace window -> SIGKILL state machine
//! - [`core::verdict`]: Classification of finished contexts into typed failures
//!
//! ## Agent Execution ([`executor`])
//! - [`executor::agent_executor`]: Registration, `bid`, `update`, checkpoint ownership
//! - [`executor::code_source`]: Pluggable code sources with tamper detection
//! - [`executor::checkpoint`]: Data-only checkpoint filter
//! - [`executor::contract`]: Structural shape check run at registration
//!
//! ## Auction & Game ([`auction`], [`game`])
//! - [`auction::settlement`]: Pure second-price settlement
//! - [`game::manager`]: Type-state game orchestrator
//! - [`game::pool`]: Bounded per-round worker pool
//!
//! ## Guest SDK ([`guest`])
//! - [`guest::BiddingAgent`] and [`guest::serve`] for agents written in Rust
//!
//! ## Observability ([`observability`])
//! - [`observability::audit`]: Structured security audit events
//!
//! ## Configuration ([`config`]) and Utilities ([`utils`])
//!
//! # Design Principles
//!
//! 1. **No live object crosses the boundary** - only JSON data goes in and out
//! 2. **Failures are values** - every per-call failure is a typed outcome
//! 3. **The host never waits on a guest** - every wait is bounded
//! 4. **Types prevent errors** - a game cannot play before it is initialized

// Kernel Primitives
pub mod kernel;

// Context core
pub mod core;

// Agent execution
pub mod executor;

// Auction settlement
pub mod auction;

// Game orchestration
pub mod game;

// Guest-side protocol
pub mod guest;

// Observability
pub mod observability;

// Configuration
pub mod config;

// Utilities
pub mod utils;

// CLI entrypoint wiring for the bidbox binary.
pub mod cli;

// Re-export commonly used types for convenience
pub use config::types::*;
