//! Auction settlement

pub mod settlement;

pub use settlement::{clip_bid, settle, RoundResult};
