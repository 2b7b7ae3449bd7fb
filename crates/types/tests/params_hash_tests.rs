use feature_ledger_types::{
    canonical_json, params_hash, BillingResult, ExecutionStatus, OutputEnvelope, PricingMode,
    RemainingBalance,
};
use serde_json::{json, Value};

/// Pairs that must never share a cache entry
fn distinct_pairs() -> Vec<(Value, Value)> {
    vec![
        // type confusion
        (json!({"season": 2024}), json!({"season": "2024"})),
        (json!({"flag": true}), json!({"flag": "true"})),
        (json!({"v": null}), json!({})),
        (json!({}), json!([])),
        // separator injection through keys and values
        (json!({"a,b": 1}), json!({"a": 1, "b": 1})),
        (json!({"a": "1,\"b\":2"}), json!({"a": 1, "b": 2})),
        (json!({"a:": 1}), json!({"a": ":1"})),
        // nesting versus flattening
        (json!({"f": {"x": 1}}), json!({"f.x": 1})),
        (json!({"ids": [[1, 2], 3]}), json!({"ids": [1, [2, 3]]})),
        // number forms are kept as written
        (json!({"n": 1}), json!({"n": 1.0})),
    ]
}

#[test]
fn test_structurally_different_params_never_collide() {
    for (left, right) in distinct_pairs() {
        assert_ne!(
            canonical_json(&left),
            canonical_json(&right),
            "{left} vs {right}"
        );
        assert_ne!(params_hash(&left), params_hash(&right), "{left} vs {right}");
    }
}

#[test]
fn test_deep_key_reordering_matches() {
    let a: Value = serde_json::from_str(
        r#"{"filters": {"range": {"to": 10, "from": 1}, "tags": ["x", "y"]}, "season": 2026}"#,
    )
    .unwrap();
    let b: Value = serde_json::from_str(
        r#"{"season": 2026, "filters": {"tags": ["x", "y"], "range": {"from": 1, "to": 10}}}"#,
    )
    .unwrap();

    assert_eq!(params_hash(&a), params_hash(&b));
}

#[test]
fn test_whitespace_and_escapes_are_normalized() {
    let spaced: Value = serde_json::from_str("{ \"name\" :\n \"caf\\u00e9\" }").unwrap();
    let compact: Value = serde_json::from_str("{\"name\":\"café\"}").unwrap();

    assert_eq!(canonical_json(&spaced), canonical_json(&compact));
}

#[test]
fn test_envelope_wire_format() {
    let envelope = OutputEnvelope {
        execution_id: "exec-1".to_string(),
        billing_result: BillingResult {
            mode: PricingMode::Points,
            consumed_units: 0,
            consumed_points: 120,
        },
        remaining_balance: RemainingBalance {
            subscription_units: None,
            points: 880,
        },
        result_ref: "qualification_calc/team-7".to_string(),
        error_code: None,
    };

    let wire = serde_json::to_value(&envelope).unwrap();
    assert_eq!(
        wire,
        json!({
            "executionId": "exec-1",
            "billingResult": {"mode": "points", "consumedUnits": 0, "consumedPoints": 120},
            "remainingBalance": {"subscriptionUnits": null, "points": 880},
            "resultRef": "qualification_calc/team-7",
            "errorCode": null
        })
    );

    let back: OutputEnvelope = serde_json::from_value(wire).unwrap();
    assert_eq!(back, envelope);
}

#[test]
fn test_terminal_states_cannot_be_left() {
    let all = [
        ExecutionStatus::Pending,
        ExecutionStatus::Completed,
        ExecutionStatus::Failed,
        ExecutionStatus::Refunded,
    ];

    for from in [ExecutionStatus::Failed, ExecutionStatus::Refunded] {
        assert!(all.iter().all(|to| !from.can_transition_to(*to)), "{from}");
    }
    assert!(ExecutionStatus::Completed.can_transition_to(ExecutionStatus::Refunded));
    assert!(!ExecutionStatus::Completed.can_transition_to(ExecutionStatus::Failed));
    assert!(!ExecutionStatus::Pending.can_transition_to(ExecutionStatus::Pending));
}
