//! Audit trail integrity against a hostile guest.
//!
//! Kept in its own test binary: the audit logger is process-global.

mod common;

use bidbox::executor::AgentExecutor;
use bidbox::observability::audit::init_security_logger;
use common::{valuations, Stage};
use serde_json::Value;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(3);

#[test]
fn guest_cannot_silence_or_signal_the_host() {
    let stage = Stage::new();
    let audit_path = stage.dir.path().join("audit").join("events.jsonl");
    init_security_logger(&audit_path).unwrap();

    let mut executor = AgentExecutor::new(stage.executor_config());
    let handle = executor
        .register(
            "hijacker",
            &stage.probe(&["hijack", audit_path.to_str().unwrap()]),
            valuations(&[("item_0", 8.0)]),
            60.0,
            vec![],
        )
        .unwrap();

    // Reaching the asserts at all means the host survived both calls.
    for item in ["item_0", "item_1"] {
        let outcome = executor.bid(&handle, item, TIMEOUT);
        assert_eq!(outcome.error, None);
        assert_eq!(outcome.bid_amount, 0.0, "a signal reached the host");
    }

    let events: Vec<Value> = std::fs::read_to_string(&audit_path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();

    assert!(events.iter().all(|e| e["details"] != "forged"));
    let of = |kind: &str, operation: &str| {
        events
            .iter()
            .filter(|e| {
                e["event_type"] == kind
                    && e["correlation"]["team_id"] == "hijacker"
                    && e["correlation"]["operation"] == operation
            })
            .count()
    };
    assert_eq!(of("ContextStart", "describe"), 1);
    assert_eq!(of("ContextStart", "bid"), 2);
    assert_eq!(of("ContextEnd", "bid"), 2);

    let tampered = events
        .iter()
        .filter(|e| e["event_type"] == "AuditTampered")
        .count();
    if common::running_as_root() {
        // A dropped uid cannot open the 0600 trail at all.
        assert_eq!(tampered, 0);
    } else {
        assert_eq!(tampered, 2);
    }
}
