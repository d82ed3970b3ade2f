/// Game orchestration
///
/// A game is a type-state chain:
///
/// Uninitialized -> Initialized -> Running -> Completed
///
/// Each transition consumes the previous state, so a game cannot be played
/// before every team registered, and a completed game cannot play another
/// round. Rounds are strictly sequential; within a round, bid calls fan out
/// over the worker pool and settlement waits for all of them.
use crate::auction::{settle, RoundResult};
use crate::config::types::{BidboxError, GameConfig, ItemId, Result, TeamId};
use crate::config::validator::validate_config;
use crate::executor::{AgentExecutor, AgentHandle, BidOutcome};
use crate::game::pool::run_bounded;
use crate::game::types::{
    GameManifest, GameResult, PublicAuctionState, RoundContext, TeamGameResult,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use uuid::Uuid;

/// Type-state marker: inputs accepted, no agent registered yet
pub struct Uninitialized;

/// Type-state marker: every team registered successfully
pub struct Initialized;

/// Type-state marker: rounds in progress
pub struct Running;

/// Type-state marker: all rounds played, results final
pub struct Completed;

struct GameInner {
    game_id: Uuid,
    started_at: DateTime<Utc>,
    config: GameConfig,
    manifest: GameManifest,
    auction_sequence: Vec<ItemId>,
    executor: AgentExecutor,
    handles: BTreeMap<TeamId, AgentHandle>,
    state: PublicAuctionState,
    auction_log: Vec<RoundResult>,
    result: Option<GameResult>,
}

/// One game of sequential second-price auctions.
pub struct Game<S> {
    inner: GameInner,
    _state: PhantomData<S>,
}

/// What `Game<Running>::play_round` leads to.
pub enum RoundStep {
    Continue(Game<Running>),
    Finished(Game<Completed>),
}

impl<S> Game<S> {
    fn transition<T>(self) -> Game<T> {
        Game {
            inner: self.inner,
            _state: PhantomData,
        }
    }

    pub fn game_id(&self) -> Uuid {
        self.inner.game_id
    }

    pub fn state(&self) -> &PublicAuctionState {
        &self.inner.state
    }

    pub fn auction_log(&self) -> &[RoundResult] {
        &self.inner.auction_log
    }

    pub fn executor(&self) -> &AgentExecutor {
        &self.inner.executor
    }
}

impl Game<Uninitialized> {
    /// Accept a game's inputs. Validates configuration and the manifest;
    /// nothing is spawned yet.
    pub fn new(config: GameConfig, manifest: GameManifest) -> Result<Self> {
        validate_config(&config)?;

        if manifest.teams.is_empty() {
            return Err(BidboxError::GameInitFailed("no teams in manifest".to_string()));
        }
        if manifest.auction_sequence.len() < config.rounds {
            return Err(BidboxError::GameInitFailed(format!(
                "auction sequence has {} items, {} rounds configured",
                manifest.auction_sequence.len(),
                config.rounds
            )));
        }
        let auction_sequence = manifest.auction_sequence[..config.rounds].to_vec();

        let state = PublicAuctionState::new(manifest.teams.keys(), config.initial_budget);
        let executor = AgentExecutor::new(config.executor.clone());

        Ok(Self {
            inner: GameInner {
                game_id: Uuid::new_v4(),
                started_at: Utc::now(),
                config,
                manifest,
                auction_sequence,
                executor,
                handles: BTreeMap::new(),
                state,
                auction_log: Vec::new(),
                result: None,
            },
            _state: PhantomData,
        })
    }

    /// Register every team. Any single failure aborts the whole game.
    pub fn initialize(mut self) -> Result<Game<Initialized>> {
        let inner = &mut self.inner;
        log::info!("Initializing game {}", inner.game_id);
        log::info!("Teams: {:?}", inner.manifest.teams.keys().collect::<Vec<_>>());
        log::info!("Auction sequence: {:?}", inner.auction_sequence);

        for (team_id, code) in &inner.manifest.teams {
            let valuations = inner.manifest.valuations.get(team_id).ok_or_else(|| {
                BidboxError::GameInitFailed(format!("no valuation vector for team {}", team_id))
            })?;
            let handle = inner
                .executor
                .register(
                    team_id,
                    code,
                    valuations.clone(),
                    inner.config.initial_budget,
                    inner.manifest.opponents_of(team_id),
                )
                .map_err(|e| {
                    log::error!("Failed to register team {}: {}", team_id, e);
                    BidboxError::GameInitFailed(e.to_string())
                })?;
            inner.handles.insert(team_id.clone(), handle);
        }

        log::info!("Successfully initialized {} agents", inner.handles.len());
        Ok(self.transition())
    }
}

impl Game<Initialized> {
    pub fn start(self) -> Game<Running> {
        log::info!("======== Starting Game {} ========", self.inner.game_id);
        self.transition()
    }
}

impl Game<Running> {
    /// Number of the round `play_round` will run next, starting at 1.
    pub fn next_round(&self) -> usize {
        self.inner.auction_log.len() + 1
    }

    /// Run one full round: bids, settlement, budget update, update calls.
    pub fn play_round(mut self) -> RoundStep {
        let round_number = self.next_round();
        let context = RoundContext {
            round_number,
            item_id: self.inner.auction_sequence[round_number - 1].clone(),
        };
        let result = self.inner.run_round(&context);
        self.inner.auction_log.push(result);

        if self.inner.auction_log.len() >= self.inner.auction_sequence.len() {
            RoundStep::Finished(self.finish())
        } else {
            RoundStep::Continue(self)
        }
    }

    /// Play every remaining round.
    pub fn run_to_completion(self) -> Game<Completed> {
        let mut game = self;
        loop {
            match game.play_round() {
                RoundStep::Continue(next) => game = next,
                RoundStep::Finished(done) => return done,
            }
        }
    }

    fn finish(mut self) -> Game<Completed> {
        let inner = &mut self.inner;
        let team_results: BTreeMap<TeamId, TeamGameResult> = inner
            .handles
            .keys()
            .map(|team_id| {
                let empty = BTreeMap::new();
                let valuations = inner.manifest.valuations.get(team_id).unwrap_or(&empty);
                (
                    team_id.clone(),
                    TeamGameResult::compute(
                        team_id,
                        inner.config.initial_budget,
                        &inner.state,
                        valuations,
                        &inner.auction_log,
                    ),
                )
            })
            .collect();

        let result = GameResult {
            game_id: inner.game_id,
            started_at: inner.started_at,
            team_results,
            auction_log: inner.auction_log.clone(),
            auction_sequence: inner.auction_sequence.clone(),
        };
        log::info!("======== Game {} Complete ========", inner.game_id);
        log_summary(&result);
        inner.result = Some(result);
        self.transition()
    }
}

impl Game<Completed> {
    pub fn result(&self) -> Option<&GameResult> {
        self.inner.result.as_ref()
    }

    pub fn into_result(self) -> Option<GameResult> {
        self.inner.result
    }
}

impl GameInner {
    fn run_round(&mut self, context: &RoundContext) -> RoundResult {
        let item_id = context.item_id.as_str();
        log::info!(
            "ROUND {}/{}: {}",
            context.round_number,
            self.auction_sequence.len(),
            item_id
        );
        for (team_id, budget) in &self.state.budgets {
            let value = self
                .manifest
                .valuations
                .get(team_id)
                .and_then(|v| v.get(item_id))
                .copied()
                .unwrap_or(0.0);
            log::info!("  {:20} value {:6.2} | budget {:6.2}", team_id, value, budget);
        }

        let timeout = self.config.executor.call_timeout();
        let workers = self.config.executor.max_workers;
        let executor = &self.executor;
        let teams: Vec<(&TeamId, &AgentHandle)> = self.handles.iter().collect();

        let bids: Vec<(TeamId, BidOutcome)> = run_bounded(teams.clone(), workers, |(team, handle)| {
            (team.clone(), executor.bid(handle, item_id, timeout))
        });

        let mut raw_bids = BTreeMap::new();
        let mut bid_errors = BTreeMap::new();
        let mut execution_times_ms = BTreeMap::new();
        for (team_id, outcome) in bids {
            if let Some(kind) = outcome.error {
                log::warn!("Team {} bid error: {}", team_id, kind);
                bid_errors.insert(team_id.clone(), kind);
            }
            execution_times_ms.insert(team_id.clone(), outcome.wall_time.as_millis() as u64);
            raw_bids.insert(team_id, outcome.bid_amount);
        }

        let mut result = settle(context.round_number, item_id, &raw_bids, &self.state.budgets);
        result.bid_errors = bid_errors;
        result.execution_times_ms = execution_times_ms;
        for (team_id, bid) in &result.all_bids {
            log::info!("  {:20} bid {:6.2}", team_id, bid);
        }

        self.state.apply(&result);
        match &result.winner_id {
            Some(winner) => log::info!(
                "Winner: {} paid {:.2}, remaining budget {:.2}",
                winner,
                result.price_paid,
                self.state.budgets.get(winner).copied().unwrap_or(0.0)
            ),
            None => log::info!("No winner this round (all bids were 0 or invalid)"),
        }

        // Every team hears the outcome, including teams whose bid failed.
        let winner_id = result.winner_id.as_deref();
        let price_paid = result.price_paid;
        let acks = run_bounded(teams, workers, |(team, handle)| {
            (
                team.clone(),
                executor.update(handle, item_id, winner_id, price_paid, timeout),
            )
        });
        for (team_id, ack) in acks {
            if let Err(e) = ack {
                log::warn!("Team {} update skipped: {}", team_id, e);
            }
        }

        result
    }
}

fn log_summary(result: &GameResult) {
    log::info!("=== Game Summary ===");
    for (rank, team) in result.ranking().into_iter().enumerate() {
        log::info!(
            "Rank {}: {} | Utility: {:.2} | Items Won: {} | Spent: {:.2} | Valuation: {:.2}",
            rank + 1,
            team.team_id,
            team.utility,
            team.items_won.len(),
            team.budget_spent,
            team.total_valuation_won
        );
    }
}

/// Initialize, play every round and return the final result.
pub fn run_game(config: GameConfig, manifest: GameManifest) -> Result<GameResult> {
    let game = Game::new(config, manifest)?.initialize()?.start();
    game.run_to_completion()
        .into_result()
        .ok_or_else(|| BidboxError::Protocol("completed game has no result".to_string()))
}
