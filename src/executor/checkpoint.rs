/// Host-side checkpoint filter
///
/// Whatever a guest reports as its state is untrusted data. Only public
/// fields whose value survives a serde_json round trip byte-for-byte are
/// kept; everything else is dropped and reported as serialization loss.
use serde_json::{Map, Value};

/// Values nested deeper than this are dropped.
pub const MAX_CHECKPOINT_DEPTH: usize = 32;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DropReason {
    Private,
    NotRoundTrippable,
    TooDeep,
    /// Reported by the guest itself.
    GuestDropped,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Private => "private field",
            DropReason::NotRoundTrippable => "value does not round-trip",
            DropReason::TooDeep => "value nested too deeply",
            DropReason::GuestDropped => "not expressible as data in the guest",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DroppedField {
    pub field: String,
    pub reason: DropReason,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FilteredCheckpoint {
    pub state: Map<String, Value>,
    pub dropped: Vec<DroppedField>,
}

fn depth(value: &Value) -> usize {
    match value {
        Value::Array(items) => 1 + items.iter().map(depth).max().unwrap_or(0),
        Value::Object(map) => 1 + map.values().map(depth).max().unwrap_or(0),
        _ => 0,
    }
}

fn round_trips(value: &Value) -> bool {
    match serde_json::to_vec(value) {
        Ok(bytes) => serde_json::from_slice::<Value>(&bytes)
            .map(|back| &back == value)
            .unwrap_or(false),
        Err(_) => false,
    }
}

/// Filter a reported state object into a checkpoint.
///
/// Fails only when the surviving checkpoint exceeds `max_bytes`; the caller
/// must then keep the previous checkpoint.
pub fn filter_state(
    state: Map<String, Value>,
    guest_dropped: &[String],
    max_bytes: usize,
) -> Result<FilteredCheckpoint, String> {
    let mut filtered = FilteredCheckpoint::default();

    for field in guest_dropped {
        filtered.dropped.push(DroppedField {
            field: field.clone(),
            reason: DropReason::GuestDropped,
        });
    }

    for (field, value) in state {
        let reason = if field.starts_with('_') {
            Some(DropReason::Private)
        } else if depth(&value) > MAX_CHECKPOINT_DEPTH {
            Some(DropReason::TooDeep)
        } else if !round_trips(&value) {
            Some(DropReason::NotRoundTrippable)
        } else {
            None
        };
        match reason {
            Some(reason) => filtered.dropped.push(DroppedField { field, reason }),
            None => {
                filtered.state.insert(field, value);
            }
        }
    }

    let size = serde_json::to_vec(&filtered.state)
        .map(|b| b.len())
        .map_err(|e| e.to_string())?;
    if size > max_bytes {
        return Err(format!(
            "checkpoint is {} bytes, limit is {}",
            size, max_bytes
        ));
    }

    Ok(filtered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn plain_data_survives_unchanged() {
        let state = object(json!({
            "bids_seen": 3,
            "history": [1.5, 2.25, {"item": "item_0", "won": true}],
            "notes": null,
            "name": "alpha"
        }));
        let filtered = filter_state(state.clone(), &[], 1 << 20).unwrap();
        assert_eq!(filtered.state, state);
        assert!(filtered.dropped.is_empty());
    }

    #[test]
    fn private_fields_are_dropped() {
        let state = object(json!({"_cache": 1, "kept": 2}));
        let filtered = filter_state(state, &[], 1 << 20).unwrap();
        assert_eq!(filtered.state.len(), 1);
        assert_eq!(
            filtered.dropped,
            vec![DroppedField {
                field: "_cache".to_string(),
                reason: DropReason::Private
            }]
        );
    }

    #[test]
    fn deep_nesting_is_dropped() {
        let mut deep = json!(0);
        for _ in 0..(MAX_CHECKPOINT_DEPTH + 1) {
            deep = json!([deep]);
        }
        let state = object(json!({"deep": deep, "shallow": [[1]]}));
        let filtered = filter_state(state, &[], 1 << 20).unwrap();
        assert!(filtered.state.contains_key("shallow"));
        assert_eq!(filtered.dropped[0].reason, DropReason::TooDeep);
    }

    #[test]
    fn guest_reported_drops_are_carried() {
        let filtered =
            filter_state(Map::new(), &["socket".to_string()], 1 << 20).unwrap();
        assert_eq!(filtered.dropped[0].reason, DropReason::GuestDropped);
    }

    #[test]
    fn oversize_checkpoint_is_rejected() {
        let state = object(json!({"blob": "x".repeat(200)}));
        assert!(filter_state(state, &[], 64).is_err());
    }

    /// Plain JSON data: no NaN or infinities, which JSON cannot carry.
    fn json_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::from),
            any::<u64>().prop_map(Value::from),
            (-1e12f64..1e12).prop_map(Value::from),
            "[a-z0-9 _]{0,12}".prop_map(Value::String),
        ];
        leaf.prop_recursive(4, 32, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-z_]{1,6}", inner, 0..4)
                    .prop_map(|fields| Value::Object(fields.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_public_data_round_trips_unchanged(
            fields in prop::collection::btree_map("[a-z][a-z0-9_]{0,8}", json_value(), 0..6),
        ) {
            let state: Map<String, Value> = fields.into_iter().collect();
            let filtered = filter_state(state.clone(), &[], usize::MAX).unwrap();
            prop_assert_eq!(&filtered.state, &state);
            prop_assert!(filtered.dropped.is_empty());

            let bytes = serde_json::to_vec(&filtered.state).unwrap();
            let restored: Map<String, Value> = serde_json::from_slice(&bytes).unwrap();
            prop_assert_eq!(restored, filtered.state);
        }

        #[test]
        fn prop_private_fields_never_survive(
            public in prop::collection::btree_map("[a-z]{1,6}", json_value(), 0..4),
            private in prop::collection::btree_map("_[a-z]{0,6}", json_value(), 1..4),
        ) {
            let state: Map<String, Value> = public
                .clone()
                .into_iter()
                .chain(private.clone())
                .collect();
            let filtered = filter_state(state, &[], usize::MAX).unwrap();

            prop_assert_eq!(filtered.dropped.len(), private.len());
            for field in private.keys() {
                prop_assert!(!filtered.state.contains_key(field));
                prop_assert!(filtered
                    .dropped
                    .iter()
                    .any(|d| &d.field == field && d.reason == DropReason::Private));
            }
            for (field, value) in &public {
                prop_assert_eq!(filtered.state.get(field), Some(value));
            }
        }
    }
}
