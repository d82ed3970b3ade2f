use crate::config::types::{ItemId, TeamId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Prefix of the single stdout line a guest uses to answer the host.
pub const REPLY_MARKER: &str = "@@bidbox-reply ";

/// Operations every guest must expose.
pub const REQUIRED_OPERATIONS: [&str; 2] = ["bid", "update"];

/// Fields every guest object must carry.
pub const REQUIRED_FIELDS: [&str; 3] = ["team_id", "valuation_vector", "budget"];

/// Constructor arguments of a guest object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentInit {
    pub team_id: TeamId,
    pub valuation_vector: BTreeMap<ItemId, f64>,
    pub budget: f64,
    pub opponent_ids: Vec<TeamId>,
}

/// The operation a context is spawned to perform.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum GuestCall {
    /// Registration-time shape probe; never touches checkpoints.
    Describe,
    Bid {
        item_id: ItemId,
    },
    Update {
        item_id: ItemId,
        winner_id: Option<TeamId>,
        price_paid: f64,
    },
}

impl GuestCall {
    pub fn name(&self) -> &'static str {
        match self {
            GuestCall::Describe => "describe",
            GuestCall::Bid { .. } => "bid",
            GuestCall::Update { .. } => "update",
        }
    }
}

/// Host -> guest launch contract, written once to the guest's stdin.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GuestRequest {
    pub init: AgentInit,
    /// Field-by-field state to assign onto the fresh object.
    pub checkpoint: Option<Map<String, Value>>,
    pub call: GuestCall,
}

/// What the guest operation produced.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GuestOutcome {
    Shape {
        operations: Vec<String>,
        fields: Vec<String>,
    },
    Bid {
        amount: f64,
    },
    Update {
        acknowledged: bool,
    },
    Error {
        message: String,
    },
}

/// Guest -> host reply payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GuestReply {
    pub outcome: GuestOutcome,
    /// Public data fields of the guest object after the call.
    #[serde(default)]
    pub state: Map<String, Value>,
    /// Fields the guest could not express as data.
    #[serde(default)]
    pub dropped_fields: Vec<String>,
}

impl GuestReply {
    /// Render the reply line a guest prints on stdout.
    pub fn to_line(&self) -> serde_json::Result<String> {
        Ok(format!("{}{}", REPLY_MARKER, serde_json::to_string(self)?))
    }

    /// Find the reply in a guest's stdout. The last marker line wins; every
    /// other line is chatter.
    pub fn parse_from_stdout(stdout: &[u8]) -> std::result::Result<Self, String> {
        let text = String::from_utf8_lossy(stdout);
        let line = text
            .lines()
            .rev()
            .find_map(|line| line.strip_prefix(REPLY_MARKER))
            .ok_or_else(|| "no reply line on stdout".to_string())?;
        serde_json::from_str(line).map_err(|e| format!("unparseable reply: {}", e))
    }
}

/// Signal escalation report for timeout/forced termination paths.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct KillReport {
    pub term_sent: bool,
    pub kill_sent: bool,
    pub waited_ms: u64,
    pub notes: Vec<String>,
}
