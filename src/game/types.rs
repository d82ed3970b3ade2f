use crate::auction::RoundResult;
use crate::config::types::{BidboxError, ItemId, Result, TeamId};
use crate::executor::CodeSource;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use uuid::Uuid;

/// Per-round context built by the orchestrator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoundContext {
    pub round_number: usize,
    pub item_id: ItemId,
}

/// Inputs of one game, as supplied by outside collaborators.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GameManifest {
    pub teams: BTreeMap<TeamId, CodeSource>,
    pub valuations: BTreeMap<TeamId, BTreeMap<ItemId, f64>>,
    pub auction_sequence: Vec<ItemId>,
}

impl GameManifest {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            BidboxError::Config(format!("Failed to read manifest {}: {}", path.display(), e))
        })?;
        let manifest: GameManifest = serde_json::from_str(&content).map_err(|e| {
            BidboxError::Config(format!("Failed to parse manifest {}: {}", path.display(), e))
        })?;
        Ok(manifest)
    }

    /// Opponents of a team: every other team, in team_id order.
    pub fn opponents_of(&self, team_id: &str) -> Vec<TeamId> {
        self.teams
            .keys()
            .filter(|id| id.as_str() != team_id)
            .cloned()
            .collect()
    }
}

/// Budgets and winnings. Only the orchestrator mutates this, and only
/// after settlement.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PublicAuctionState {
    pub budgets: BTreeMap<TeamId, f64>,
    pub items_won: BTreeMap<TeamId, Vec<ItemId>>,
}

impl PublicAuctionState {
    pub fn new<'a>(teams: impl IntoIterator<Item = &'a TeamId>, initial_budget: f64) -> Self {
        let mut budgets = BTreeMap::new();
        let mut items_won = BTreeMap::new();
        for team in teams {
            budgets.insert(team.clone(), initial_budget);
            items_won.insert(team.clone(), Vec::new());
        }
        Self { budgets, items_won }
    }

    /// Debit the winner and record the item. Budgets never go up.
    pub fn apply(&mut self, result: &RoundResult) {
        let Some(winner) = &result.winner_id else {
            return;
        };
        if let Some(budget) = self.budgets.get_mut(winner) {
            *budget = (*budget - result.price_paid.max(0.0)).max(0.0);
        }
        self.items_won
            .entry(winner.clone())
            .or_default()
            .push(result.item_id.clone());
    }
}

/// Final standing of one team.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TeamGameResult {
    pub team_id: TeamId,
    pub utility: f64,
    pub budget_spent: f64,
    pub budget_remaining: f64,
    pub items_won: Vec<ItemId>,
    pub valuation_vector: BTreeMap<ItemId, f64>,
    /// Highest valuation among the items won.
    pub max_single_item_utility: f64,
    pub total_valuation_won: f64,
    /// Rounds whose bid was forfeited by a failed call.
    pub bid_errors: usize,
}

impl TeamGameResult {
    pub fn compute(
        team_id: &str,
        initial_budget: f64,
        state: &PublicAuctionState,
        valuation_vector: &BTreeMap<ItemId, f64>,
        log: &[RoundResult],
    ) -> Self {
        let items_won = state.items_won.get(team_id).cloned().unwrap_or_default();
        let budget_remaining = state.budgets.get(team_id).copied().unwrap_or(0.0);
        let budget_spent = initial_budget - budget_remaining;

        let won_values: Vec<f64> = items_won
            .iter()
            .map(|item| valuation_vector.get(item).copied().unwrap_or(0.0))
            .collect();
        let total_valuation_won: f64 = won_values.iter().sum();
        let max_single_item_utility = won_values.iter().copied().fold(0.0, f64::max);

        Self {
            team_id: team_id.to_string(),
            utility: total_valuation_won - budget_spent,
            budget_spent,
            budget_remaining,
            items_won,
            valuation_vector: valuation_vector.clone(),
            max_single_item_utility,
            total_valuation_won,
            bid_errors: log
                .iter()
                .filter(|round| round.bid_errors.contains_key(team_id))
                .count(),
        }
    }
}

/// Everything a completed game produces for downstream reporting.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GameResult {
    pub game_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub team_results: BTreeMap<TeamId, TeamGameResult>,
    pub auction_log: Vec<RoundResult>,
    pub auction_sequence: Vec<ItemId>,
}

impl GameResult {
    /// Teams ordered by utility, best first; ties by team_id.
    pub fn ranking(&self) -> Vec<&TeamGameResult> {
        let mut ranked: Vec<&TeamGameResult> = self.team_results.values().collect();
        ranked.sort_by(|a, b| {
            b.utility
                .partial_cmp(&a.utility)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.team_id.cmp(&b.team_id))
        });
        ranked
    }
}
