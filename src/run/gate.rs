use crate::agent::AgentOutcome;
use crate::variant::StepKind;

/// Verdict on a gated step's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Pass,
    Fail,
    NeedsManual,
}

/// Evaluate a gate. Pure function of the step kind and the collaborator's
/// structured outcome.
///
/// Criteria are fixed:
/// - RunUnitTests: zero failures and coverage of at least 80%.
/// - Review: the `approved` tag, with no manual-review escape hatch.
/// - RunIntegrationTests / FinalIntegration: zero failures.
/// - ResolveConflicts: `resolved`, `failed`, or `manual_review_needed`;
///   the only gate that can suspend the run.
pub fn evaluate(kind: StepKind, outcome: &AgentOutcome) -> GateDecision {
    let payload = match outcome {
        AgentOutcome::Success { payload } => payload,
        AgentOutcome::Failure { .. } => return GateDecision::Fail,
        AgentOutcome::ManualReviewRequired { .. } => {
            // Only conflict resolution may suspend; elsewhere this is a fail.
            return if kind == StepKind::ResolveConflicts {
                GateDecision::NeedsManual
            } else {
                GateDecision::Fail
            };
        }
    };

    match kind {
        StepKind::RunUnitTests => {
            let failures = payload["failures"].as_u64().unwrap_or(u64::MAX);
            let coverage = payload["coverage"].as_f64().unwrap_or(0.0);
            if failures == 0 && coverage >= 80.0 {
                GateDecision::Pass
            } else {
                GateDecision::Fail
            }
        }
        StepKind::Review => match payload["tag"].as_str() {
            Some("approved") => GateDecision::Pass,
            _ => GateDecision::Fail,
        },
        StepKind::RunIntegrationTests | StepKind::FinalIntegration => {
            if payload["failures"].as_u64() == Some(0) {
                GateDecision::Pass
            } else {
                GateDecision::Fail
            }
        }
        StepKind::ResolveConflicts => match payload["tag"].as_str() {
            Some("resolved") => GateDecision::Pass,
            Some("manual_review_needed") => GateDecision::NeedsManual,
            _ => GateDecision::Fail,
        },
        // Not a gate; callers check is_gate() first.
        other => {
            tracing::warn!(step = %other, "Gate evaluation requested for non-gate step");
            GateDecision::Pass
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn success(payload: serde_json::Value) -> AgentOutcome {
        AgentOutcome::Success { payload }
    }

    #[test]
    fn unit_tests_require_zero_failures_and_coverage() {
        let k = StepKind::RunUnitTests;
        assert_eq!(
            evaluate(k, &success(json!({"failures": 0, "coverage": 85}))),
            GateDecision::Pass
        );
        assert_eq!(
            evaluate(k, &success(json!({"failures": 0, "coverage": 60}))),
            GateDecision::Fail
        );
        assert_eq!(
            evaluate(k, &success(json!({"failures": 2, "coverage": 95}))),
            GateDecision::Fail
        );
        // Exactly 80% passes
        assert_eq!(
            evaluate(k, &success(json!({"failures": 0, "coverage": 80}))),
            GateDecision::Pass
        );
        // Missing fields never pass
        assert_eq!(evaluate(k, &success(json!({}))), GateDecision::Fail);
    }

    #[test]
    fn review_has_no_manual_state() {
        let k = StepKind::Review;
        assert_eq!(evaluate(k, &success(json!({"tag": "approved"}))), GateDecision::Pass);
        assert_eq!(
            evaluate(k, &success(json!({"tag": "changes_requested"}))),
            GateDecision::Fail
        );
        assert_eq!(
            evaluate(
                k,
                &AgentOutcome::ManualReviewRequired {
                    detail: "unsure".to_string()
                }
            ),
            GateDecision::Fail
        );
    }

    #[test]
    fn integration_gates_only_check_failures() {
        for k in [StepKind::RunIntegrationTests, StepKind::FinalIntegration] {
            assert_eq!(evaluate(k, &success(json!({"failures": 0}))), GateDecision::Pass);
            assert_eq!(evaluate(k, &success(json!({"failures": 1}))), GateDecision::Fail);
            assert_eq!(evaluate(k, &success(json!({}))), GateDecision::Fail);
        }
    }

    #[test]
    fn conflict_resolution_can_suspend() {
        let k = StepKind::ResolveConflicts;
        assert_eq!(evaluate(k, &success(json!({"tag": "resolved"}))), GateDecision::Pass);
        assert_eq!(evaluate(k, &success(json!({"tag": "failed"}))), GateDecision::Fail);
        assert_eq!(
            evaluate(k, &success(json!({"tag": "manual_review_needed"}))),
            GateDecision::NeedsManual
        );
        assert_eq!(
            evaluate(
                k,
                &AgentOutcome::ManualReviewRequired {
                    detail: "overlapping hunks".to_string()
                }
            ),
            GateDecision::NeedsManual
        );
    }

    #[test]
    fn reported_failure_outcome_always_fails() {
        assert_eq!(
            evaluate(
                StepKind::RunUnitTests,
                &AgentOutcome::failure("tests_failed", "suite crashed")
            ),
            GateDecision::Fail
        );
    }
}
