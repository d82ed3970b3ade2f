//! Game orchestration
//!
//! Drives T sequential rounds over the executor and the settlement engine.

pub mod manager;
pub mod pool;
pub mod types;

pub use manager::{run_game, Completed, Game, Initialized, RoundStep, Running, Uninitialized};
pub use types::{GameManifest, GameResult, PublicAuctionState, RoundContext, TeamGameResult};
