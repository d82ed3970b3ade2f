//! Guest-side protocol for agents written in Rust
//!
//! An agent binary implements [`BiddingAgent`] and calls [`serve`] from
//! `main`. Each process handles exactly one request: it builds a fresh
//! agent from the constructor arguments, assigns checkpoint fields onto it,
//! runs the requested operation and prints the reply line.
//!
//! Checkpoints are applied as data only: the fresh object is serialized,
//! matching keys are overwritten with checkpoint values, and the result is
//! deserialized back. No agent-supplied restore hook ever runs.

use crate::core::types::{
    AgentInit, GuestCall, GuestOutcome, GuestReply, GuestRequest, REQUIRED_OPERATIONS,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::io::{Read, Write};
use std::process::ExitCode;

/// The guest-code contract.
///
/// Every serialized field of the implementing type is part of its state;
/// `#[serde(skip)]` fields are transient and are reset on every call.
pub trait BiddingAgent: Serialize + DeserializeOwned {
    fn new(init: AgentInit) -> Self;

    fn bid(&mut self, item_id: &str) -> f64;

    fn update(&mut self, item_id: &str, winner_id: Option<&str>, price_paid: f64) -> bool;

    /// Names of transient fields, reported back as dropped.
    fn transient_fields() -> &'static [&'static str] {
        &[]
    }
}

fn to_object<A: Serialize>(agent: &A) -> Result<Map<String, Value>, String> {
    match serde_json::to_value(agent) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(format!("agent state must be an object, got {}", other)),
        Err(e) => Err(format!("agent state is not serializable: {}", e)),
    }
}

/// Construct a fresh agent and assign checkpoint fields onto it.
pub fn restore<A: BiddingAgent>(
    init: AgentInit,
    checkpoint: Option<Map<String, Value>>,
) -> Result<A, String> {
    let fresh = A::new(init);
    let Some(checkpoint) = checkpoint else {
        return Ok(fresh);
    };

    let mut fields = to_object(&fresh)?;
    for (key, value) in checkpoint {
        if let Some(slot) = fields.get_mut(&key) {
            *slot = value;
        }
    }
    serde_json::from_value(Value::Object(fields))
        .map_err(|e| format!("checkpoint does not fit the agent: {}", e))
}

/// Handle one decoded request.
pub fn handle<A: BiddingAgent>(request: GuestRequest) -> GuestReply {
    let failure = |message: String| GuestReply {
        outcome: GuestOutcome::Error { message },
        state: Map::new(),
        dropped_fields: Vec::new(),
    };

    let mut agent: A = match restore(request.init, request.checkpoint) {
        Ok(agent) => agent,
        Err(e) => return failure(e),
    };

    let outcome = match &request.call {
        GuestCall::Describe => {
            let fields = match to_object(&agent) {
                Ok(map) => map.keys().cloned().collect(),
                Err(e) => return failure(e),
            };
            GuestOutcome::Shape {
                operations: REQUIRED_OPERATIONS.iter().map(|s| s.to_string()).collect(),
                fields,
            }
        }
        GuestCall::Bid { item_id } => GuestOutcome::Bid {
            amount: agent.bid(item_id),
        },
        GuestCall::Update {
            item_id,
            winner_id,
            price_paid,
        } => GuestOutcome::Update {
            acknowledged: agent.update(item_id, winner_id.as_deref(), *price_paid),
        },
    };

    let state = match request.call {
        GuestCall::Describe => Map::new(),
        _ => match to_object(&agent) {
            Ok(map) => map,
            Err(e) => return failure(e),
        },
    };

    GuestReply {
        outcome,
        state,
        dropped_fields: A::transient_fields().iter().map(|s| s.to_string()).collect(),
    }
}

/// Read one request from stdin, answer it on stdout.
pub fn serve<A: BiddingAgent>() -> ExitCode {
    let mut input = String::new();
    if let Err(e) = std::io::stdin().read_to_string(&mut input) {
        eprintln!("failed to read request: {}", e);
        return ExitCode::from(2);
    }
    let request: GuestRequest = match serde_json::from_str(&input) {
        Ok(request) => request,
        Err(e) => {
            eprintln!("failed to parse request: {}", e);
            return ExitCode::from(2);
        }
    };

    let reply = handle::<A>(request);
    let line = match reply.to_line() {
        Ok(line) => line,
        Err(e) => {
            eprintln!("failed to encode reply: {}", e);
            return ExitCode::from(2);
        }
    };

    let mut stdout = std::io::stdout().lock();
    if writeln!(stdout, "{}", line).and_then(|_| stdout.flush()).is_err() {
        return ExitCode::from(2);
    }
    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{ItemId, TeamId};
    use serde::Deserialize;
    use std::collections::BTreeMap;

    #[derive(Serialize, Deserialize)]
    struct Counter {
        team_id: TeamId,
        valuation_vector: BTreeMap<ItemId, f64>,
        budget: f64,
        bids_seen: u32,
        #[serde(skip)]
        scratch: Vec<u8>,
    }

    impl BiddingAgent for Counter {
        fn new(init: AgentInit) -> Self {
            Self {
                team_id: init.team_id,
                valuation_vector: init.valuation_vector,
                budget: init.budget,
                bids_seen: 0,
                scratch: vec![1, 2, 3],
            }
        }

        fn bid(&mut self, _item_id: &str) -> f64 {
            self.bids_seen += 1;
            self.bids_seen as f64
        }

        fn update(&mut self, _item_id: &str, _winner: Option<&str>, _price: f64) -> bool {
            true
        }

        fn transient_fields() -> &'static [&'static str] {
            &["scratch"]
        }
    }

    fn request(call: GuestCall, checkpoint: Option<Map<String, Value>>) -> GuestRequest {
        GuestRequest {
            init: AgentInit {
                team_id: "a".to_string(),
                valuation_vector: BTreeMap::new(),
                budget: 60.0,
                opponent_ids: vec![],
            },
            checkpoint,
            call,
        }
    }

    #[test]
    fn describe_lists_data_fields() {
        let reply = handle::<Counter>(request(GuestCall::Describe, None));
        match reply.outcome {
            GuestOutcome::Shape { operations, fields } => {
                assert_eq!(operations, vec!["bid", "update"]);
                assert!(fields.contains(&"budget".to_string()));
                assert!(!fields.contains(&"scratch".to_string()));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(reply.state.is_empty());
    }

    #[test]
    fn checkpoint_is_applied_before_the_call() {
        let first = handle::<Counter>(request(
            GuestCall::Bid {
                item_id: "item_0".to_string(),
            },
            None,
        ));
        assert_eq!(first.outcome, GuestOutcome::Bid { amount: 1.0 });
        assert_eq!(first.dropped_fields, vec!["scratch"]);

        let second = handle::<Counter>(request(
            GuestCall::Bid {
                item_id: "item_1".to_string(),
            },
            Some(first.state),
        ));
        assert_eq!(second.outcome, GuestOutcome::Bid { amount: 2.0 });
        assert_eq!(second.state["bids_seen"], 2);
    }

    #[test]
    fn unknown_checkpoint_keys_are_ignored() {
        let mut checkpoint = Map::new();
        checkpoint.insert("injected".to_string(), Value::from(1));
        let agent: Counter = restore(request(GuestCall::Describe, None).init, Some(checkpoint)).unwrap();
        assert_eq!(agent.bids_seen, 0);
    }

    #[test]
    fn ill_typed_checkpoint_is_an_error_reply() {
        let mut checkpoint = Map::new();
        checkpoint.insert("bids_seen".to_string(), Value::from("many"));
        let reply = handle::<Counter>(request(
            GuestCall::Bid {
                item_id: "item_0".to_string(),
            },
            Some(checkpoint),
        ));
        assert!(matches!(reply.outcome, GuestOutcome::Error { .. }));
    }
}
