//! Reference agent: bids its own valuation, capped by the remaining budget.
//!
//! Tracks what it learns from each round's public outcome so checkpoints
//! carry real state across calls.

use bidbox::config::types::{ItemId, TeamId};
use bidbox::core::types::AgentInit;
use bidbox::guest::{serve, BiddingAgent};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::process::ExitCode;

#[derive(Serialize, Deserialize)]
struct TruthfulAgent {
    team_id: TeamId,
    valuation_vector: BTreeMap<ItemId, f64>,
    budget: f64,
    initial_budget: f64,
    opponent_teams: Vec<TeamId>,
    utility: f64,
    items_won: Vec<ItemId>,
    rounds_completed: u32,
    observed_prices: Vec<f64>,
    opponent_wins: BTreeMap<TeamId, u32>,
}

impl BiddingAgent for TruthfulAgent {
    fn new(init: AgentInit) -> Self {
        Self {
            team_id: init.team_id,
            valuation_vector: init.valuation_vector,
            budget: init.budget,
            initial_budget: init.budget,
            opponent_wins: init.opponent_ids.iter().map(|id| (id.clone(), 0)).collect(),
            opponent_teams: init.opponent_ids,
            utility: 0.0,
            items_won: Vec::new(),
            rounds_completed: 0,
            observed_prices: Vec::new(),
        }
    }

    fn bid(&mut self, item_id: &str) -> f64 {
        let value = self.valuation_vector.get(item_id).copied().unwrap_or(0.0);
        value.min(self.budget).max(0.0)
    }

    fn update(&mut self, item_id: &str, winner_id: Option<&str>, price_paid: f64) -> bool {
        self.rounds_completed += 1;
        self.observed_prices.push(price_paid);
        match winner_id {
            Some(winner) if winner == self.team_id => {
                self.budget -= price_paid;
                self.utility += self.valuation_vector.get(item_id).copied().unwrap_or(0.0) - price_paid;
                self.items_won.push(item_id.to_string());
            }
            Some(winner) => {
                *self.opponent_wins.entry(winner.to_string()).or_insert(0) += 1;
            }
            None => {}
        }
        true
    }
}

fn main() -> ExitCode {
    serve::<TruthfulAgent>()
}
