/// Structural contract checks run once at registration
use crate::core::types::{AgentInit, GuestOutcome, REQUIRED_FIELDS, REQUIRED_OPERATIONS};

/// Validate constructor arguments before anything is spawned.
pub fn check_init(init: &AgentInit) -> Result<(), String> {
    if init.team_id.trim().is_empty() {
        return Err("team_id must not be empty".to_string());
    }
    if !init.budget.is_finite() || init.budget < 0.0 {
        return Err(format!("budget {} is not a finite non-negative number", init.budget));
    }
    if let Some((item, value)) = init.valuation_vector.iter().find(|(_, v)| !v.is_finite()) {
        return Err(format!("valuation of {} is not finite: {}", item, value));
    }
    if init.opponent_ids.iter().any(|id| id == &init.team_id) {
        return Err("opponent_ids must not contain the team itself".to_string());
    }
    Ok(())
}

/// Check a `describe` reply exposes both operations and all required fields.
pub fn check_shape(outcome: &GuestOutcome) -> Result<(), String> {
    let GuestOutcome::Shape { operations, fields } = outcome else {
        return Err(format!("expected a shape description, got {:?}", outcome));
    };

    let missing_ops: Vec<&str> = REQUIRED_OPERATIONS
        .iter()
        .copied()
        .filter(|op| !operations.iter().any(|o| o == op))
        .collect();
    let missing_fields: Vec<&str> = REQUIRED_FIELDS
        .iter()
        .copied()
        .filter(|f| !fields.iter().any(|g| g == f))
        .collect();

    if missing_ops.is_empty() && missing_fields.is_empty() {
        return Ok(());
    }

    let mut reasons = Vec::new();
    if !missing_ops.is_empty() {
        reasons.push(format!("missing operations: {}", missing_ops.join(", ")));
    }
    if !missing_fields.is_empty() {
        reasons.push(format!("missing fields: {}", missing_fields.join(", ")));
    }
    Err(reasons.join("; "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn shape(ops: &[&str], fields: &[&str]) -> GuestOutcome {
        GuestOutcome::Shape {
            operations: ops.iter().map(|s| s.to_string()).collect(),
            fields: fields.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn complete_shape_passes() {
        let outcome = shape(
            &["bid", "update", "extra"],
            &["team_id", "valuation_vector", "budget", "history"],
        );
        assert!(check_shape(&outcome).is_ok());
    }

    #[test]
    fn missing_update_and_budget_are_reported() {
        let err = check_shape(&shape(&["bid"], &["team_id", "valuation_vector"])).unwrap_err();
        assert!(err.contains("update"));
        assert!(err.contains("budget"));
    }

    #[test]
    fn non_shape_outcome_fails() {
        assert!(check_shape(&GuestOutcome::Bid { amount: 1.0 }).is_err());
    }

    #[test]
    fn init_rejects_bad_values() {
        let mut init = AgentInit {
            team_id: "a".to_string(),
            valuation_vector: BTreeMap::from([("item_0".to_string(), 5.0)]),
            budget: 60.0,
            opponent_ids: vec!["b".to_string()],
        };
        assert!(check_init(&init).is_ok());

        init.budget = f64::NAN;
        assert!(check_init(&init).is_err());
        init.budget = 60.0;

        init.valuation_vector.insert("item_1".to_string(), f64::INFINITY);
        assert!(check_init(&init).is_err());
        init.valuation_vector.remove("item_1");

        init.opponent_ids.push("a".to_string());
        assert!(check_init(&init).is_err());
    }
}
