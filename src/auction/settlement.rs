/// Second-price sealed-bid settlement
///
/// Pure function over one round's bids and the budgets at bid time:
/// - every bid is clipped to `[0, budget]` (inclusive); absent, negative or
///   non-finite bids count as 0
/// - the highest clipped bid wins; equal top bids go to the
///   lexicographically smallest team_id
/// - the winner pays the second-highest clipped bid, or 0 when fewer than
///   two bids are positive
/// - a top clipped bid of 0 means nobody wins
use crate::config::types::{ItemId, TeamId};
use crate::core::verdict::CallErrorKind;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Outcome of one auction round. Immutable once appended to the log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoundResult {
    pub round_number: usize,
    pub item_id: ItemId,
    pub winner_id: Option<TeamId>,
    pub price_paid: f64,
    /// Clipped bids, one per team with a budget.
    pub all_bids: BTreeMap<TeamId, f64>,
    /// Error kinds of forfeited bids; a forfeited bid is 0 in `all_bids`.
    #[serde(default)]
    pub bid_errors: BTreeMap<TeamId, CallErrorKind>,
    #[serde(default)]
    pub execution_times_ms: BTreeMap<TeamId, u64>,
}

impl RoundResult {
    pub fn winning_bid(&self) -> Option<f64> {
        self.winner_id
            .as_ref()
            .and_then(|winner| self.all_bids.get(winner).copied())
    }
}

/// Clip one raw bid against a budget.
pub fn clip_bid(raw: Option<f64>, budget: f64) -> f64 {
    let budget = if budget.is_finite() { budget.max(0.0) } else { 0.0 };
    match raw {
        Some(bid) if bid.is_finite() => bid.clamp(0.0, budget),
        _ => 0.0,
    }
}

/// Settle one round. Teams are taken from `budgets`; bids for teams
/// without a budget are ignored.
pub fn settle(
    round_number: usize,
    item_id: &str,
    bids: &BTreeMap<TeamId, f64>,
    budgets: &BTreeMap<TeamId, f64>,
) -> RoundResult {
    let all_bids: BTreeMap<TeamId, f64> = budgets
        .iter()
        .map(|(team, budget)| (team.clone(), clip_bid(bids.get(team).copied(), *budget)))
        .collect();

    // Highest first; equal bids in team_id order. BTreeMap iteration is
    // already sorted by team_id and the sort is stable.
    let mut ranked: Vec<(&TeamId, f64)> = all_bids.iter().map(|(t, b)| (t, *b)).collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));

    let (winner_id, price_paid) = match ranked.as_slice() {
        [(top_team, top_bid), rest @ ..] if *top_bid > 0.0 => {
            let second = rest.first().map(|(_, b)| *b).unwrap_or(0.0);
            (Some((*top_team).clone()), second)
        }
        _ => (None, 0.0),
    };

    RoundResult {
        round_number,
        item_id: item_id.to_string(),
        winner_id,
        price_paid,
        all_bids,
        bid_errors: BTreeMap::new(),
        execution_times_ms: BTreeMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn map(entries: &[(&str, f64)]) -> BTreeMap<TeamId, f64> {
        entries.iter().map(|(t, v)| (t.to_string(), *v)).collect()
    }

    #[test]
    fn highest_bid_pays_second_price() {
        let result = settle(
            1,
            "item_0",
            &map(&[("A", 20.0), ("B", 15.0)]),
            &map(&[("A", 60.0), ("B", 60.0)]),
        );
        assert_eq!(result.winner_id.as_deref(), Some("A"));
        assert_eq!(result.price_paid, 15.0);
        assert_eq!(result.winning_bid(), Some(20.0));
    }

    #[test]
    fn single_positive_bidder_pays_zero() {
        let result = settle(
            1,
            "item_0",
            &map(&[("A", 12.0), ("B", 0.0)]),
            &map(&[("A", 60.0), ("B", 60.0), ("C", 60.0)]),
        );
        assert_eq!(result.winner_id.as_deref(), Some("A"));
        assert_eq!(result.price_paid, 0.0);
        assert_eq!(result.all_bids["C"], 0.0);
    }

    #[test]
    fn all_zero_bids_have_no_winner() {
        let result = settle(
            2,
            "item_1",
            &map(&[("A", -5.0), ("B", 30.0)]),
            &map(&[("A", 60.0), ("B", 0.0)]),
        );
        assert_eq!(result.winner_id, None);
        assert_eq!(result.price_paid, 0.0);
    }

    #[test]
    fn bids_are_clipped_to_budget_inclusive() {
        let result = settle(
            1,
            "item_0",
            &map(&[("A", 100.0), ("B", 45.0)]),
            &map(&[("A", 40.0), ("B", 45.0)]),
        );
        assert_eq!(result.all_bids["A"], 40.0);
        assert_eq!(result.all_bids["B"], 45.0);
        assert_eq!(result.winner_id.as_deref(), Some("B"));
        assert_eq!(result.price_paid, 40.0);
    }

    #[test]
    fn ties_go_to_smallest_team_id() {
        let result = settle(
            1,
            "item_0",
            &map(&[("zeta", 10.0), ("alpha", 10.0), ("mid", 3.0)]),
            &map(&[("zeta", 60.0), ("alpha", 60.0), ("mid", 60.0)]),
        );
        assert_eq!(result.winner_id.as_deref(), Some("alpha"));
        assert_eq!(result.price_paid, 10.0);
    }

    #[test]
    fn non_finite_and_unknown_bids_are_ignored() {
        let result = settle(
            1,
            "item_0",
            &map(&[("A", f64::NAN), ("B", f64::INFINITY), ("ghost", 99.0)]),
            &map(&[("A", 60.0), ("B", 60.0)]),
        );
        assert_eq!(result.winner_id, None);
        assert!(!result.all_bids.contains_key("ghost"));
    }

    fn raw_bid() -> impl Strategy<Value = f64> {
        prop_oneof![
            -50.0f64..150.0,
            Just(0.0),
            Just(f64::NAN),
            Just(f64::INFINITY),
            Just(f64::NEG_INFINITY),
            (0u32..100).prop_map(f64::from),
        ]
    }

    fn raw_budget() -> impl Strategy<Value = f64> {
        prop_oneof![
            0.0f64..100.0,
            -20.0f64..0.0,
            Just(f64::NAN),
            Just(f64::INFINITY),
            (0u32..100).prop_map(f64::from),
        ]
    }

    proptest! {
        /// Bids name teams that may lack a budget and budgets name teams
        /// that may not have bid.
        #[test]
        fn prop_winner_pays_second_highest_clipped_bid(
            bids in prop::collection::btree_map("[a-h]", raw_bid(), 0..8),
            budgets in prop::collection::btree_map("[a-f]", raw_budget(), 0..6),
        ) {
            let result = settle(1, "item", &bids, &budgets);

            prop_assert!(result.all_bids.keys().eq(budgets.keys()));
            for (team, bid) in &result.all_bids {
                prop_assert!(bid.is_finite() && *bid >= 0.0);
                prop_assert_eq!(*bid, clip_bid(bids.get(team).copied(), budgets[team]));
                if budgets[team].is_finite() {
                    prop_assert!(*bid <= budgets[team].max(0.0));
                }
            }

            let mut clipped: Vec<f64> = result.all_bids.values().copied().collect();
            clipped.sort_by(|a, b| b.total_cmp(a));
            let top = clipped.first().copied().unwrap_or(0.0);
            let second = clipped.get(1).copied().unwrap_or(0.0);

            match &result.winner_id {
                Some(winner) => {
                    prop_assert!(top > 0.0);
                    prop_assert_eq!(result.all_bids[winner], top);
                    prop_assert_eq!(result.price_paid, second);
                    let first_at_top = result
                        .all_bids
                        .iter()
                        .find(|(_, bid)| **bid == top)
                        .map(|(team, _)| team);
                    prop_assert_eq!(Some(winner), first_at_top);
                }
                None => {
                    prop_assert_eq!(top, 0.0);
                    prop_assert_eq!(result.price_paid, 0.0);
                }
            }
            prop_assert!(result.price_paid >= 0.0 && result.price_paid <= top);
        }
    }
}
