/// Bound on fix/retest/re-review loops within one run.
pub const MAX_FIX_CYCLES: u32 = 3;

pub const CYCLE_LIMIT_REASON: &str = "max fix cycles exceeded — requires reassessment";

/// What to do after a normal gate failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleDecision {
    /// Splice a FixIssues step and rewind for another loop.
    Continue,
    /// The loop budget is spent; abort the run.
    Abort { reason: String },
}

/// Per-run fix-loop counter. All normal gate failures in a run share this
/// one budget; environment-debug recoveries do not touch it.
#[derive(Debug, Default)]
pub struct CycleCounter {
    count: u32,
}

impl CycleCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Record a gate failure and decide whether another fix loop is allowed.
    /// The third failure in a run exhausts the budget.
    pub fn on_gate_failure(&mut self) -> CycleDecision {
        self.count += 1;
        if self.count >= MAX_FIX_CYCLES {
            return CycleDecision::Abort {
                reason: CYCLE_LIMIT_REASON.to_string(),
            };
        }
        CycleDecision::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn third_failure_exhausts_the_budget() {
        let mut counter = CycleCounter::new();
        assert_eq!(counter.on_gate_failure(), CycleDecision::Continue);
        assert_eq!(counter.on_gate_failure(), CycleDecision::Continue);
        match counter.on_gate_failure() {
            CycleDecision::Abort { reason } => assert_eq!(reason, CYCLE_LIMIT_REASON),
            other => panic!("expected abort, got {other:?}"),
        }
        // Counter never exceeds the cap
        assert_eq!(counter.count(), MAX_FIX_CYCLES);
    }
}
