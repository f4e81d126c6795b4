pub mod select;

use serde::{Deserialize, Serialize};

/// A named workflow shape appropriate to a class of task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    #[default]
    Standard,
    Full,
    Hotfix,
    Tests,
    Docs,
}

impl Variant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::Standard => "standard",
            Variant::Full => "full",
            Variant::Hotfix => "hotfix",
            Variant::Tests => "tests",
            Variant::Docs => "docs",
        }
    }

    /// Parse a reserved variant keyword. `standard` is never written
    /// explicitly; it is the absence of a keyword.
    pub fn from_keyword(word: &str) -> Option<Self> {
        match word {
            "full" => Some(Variant::Full),
            "hotfix" => Some(Variant::Hotfix),
            "tests" => Some(Variant::Tests),
            "docs" => Some(Variant::Docs),
            _ => None,
        }
    }
}

impl std::fmt::Display for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One kind of workflow step.
///
/// `FixIssues` and `DebugEnvironment` never appear in the primary schedule:
/// `FixIssues` is spliced in by the cycle controller after a gate failure,
/// and `DebugEnvironment` only runs as a recovery reaction to an
/// environment-class failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    CreateWorkspace,
    Implement,
    WriteTests,
    Commit,
    RunUnitTests,
    Review,
    FixIssues,
    RunIntegrationTests,
    Push,
    ResolveConflicts,
    FinalIntegration,
    Merge,
    Cleanup,
    DebugEnvironment,
}

impl StepKind {
    /// Gates block the run until their pass criterion is met.
    pub fn is_gate(&self) -> bool {
        matches!(
            self,
            StepKind::RunUnitTests
                | StepKind::Review
                | StepKind::RunIntegrationTests
                | StepKind::ResolveConflicts
                | StepKind::FinalIntegration
        )
    }

    /// Conditional-only steps are never part of the primary sequence.
    pub fn is_conditional_only(&self) -> bool {
        matches!(self, StepKind::FixIssues | StepKind::DebugEnvironment)
    }

    /// The collaborator role responsible for this step.
    pub fn agent_role(&self) -> &'static str {
        match self {
            StepKind::CreateWorkspace
            | StepKind::Commit
            | StepKind::Push
            | StepKind::Merge
            | StepKind::Cleanup => "workspace",
            StepKind::Implement | StepKind::FixIssues => "implementer",
            StepKind::WriteTests => "test-writer",
            StepKind::RunUnitTests | StepKind::RunIntegrationTests | StepKind::FinalIntegration => {
                "tester"
            }
            StepKind::Review => "reviewer",
            StepKind::ResolveConflicts => "resolver",
            StepKind::DebugEnvironment => "env-debugger",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::CreateWorkspace => "create_workspace",
            StepKind::Implement => "implement",
            StepKind::WriteTests => "write_tests",
            StepKind::Commit => "commit",
            StepKind::RunUnitTests => "run_unit_tests",
            StepKind::Review => "review",
            StepKind::FixIssues => "fix_issues",
            StepKind::RunIntegrationTests => "run_integration_tests",
            StepKind::Push => "push",
            StepKind::ResolveConflicts => "resolve_conflicts",
            StepKind::FinalIntegration => "final_integration",
            StepKind::Merge => "merge",
            StepKind::Cleanup => "cleanup",
            StepKind::DebugEnvironment => "debug_environment",
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every schedulable step, in execution order. Variants subtract from this
/// list via their skip set; nothing is ever added to it at runtime.
const PRIMARY_SEQUENCE: &[StepKind] = &[
    StepKind::CreateWorkspace,
    StepKind::Implement,
    StepKind::WriteTests,
    StepKind::Commit,
    StepKind::RunUnitTests,
    StepKind::Review,
    StepKind::RunIntegrationTests,
    StepKind::Push,
    StepKind::ResolveConflicts,
    StepKind::FinalIntegration,
    StepKind::Merge,
    StepKind::Cleanup,
];

const STANDARD_SKIPS: &[StepKind] = &[StepKind::FinalIntegration];
const FULL_SKIPS: &[StepKind] = &[];
const HOTFIX_SKIPS: &[StepKind] = &[
    StepKind::WriteTests,
    StepKind::RunIntegrationTests,
    StepKind::FinalIntegration,
];
const TESTS_SKIPS: &[StepKind] = &[StepKind::Implement, StepKind::FinalIntegration];
const DOCS_SKIPS: &[StepKind] = &[
    StepKind::WriteTests,
    StepKind::RunUnitTests,
    StepKind::RunIntegrationTests,
    StepKind::FinalIntegration,
];

/// The ordered step list shared by every variant.
pub fn primary_sequence() -> &'static [StepKind] {
    PRIMARY_SEQUENCE
}

fn skips(variant: Variant) -> &'static [StepKind] {
    match variant {
        Variant::Standard => STANDARD_SKIPS,
        Variant::Full => FULL_SKIPS,
        Variant::Hotfix => HOTFIX_SKIPS,
        Variant::Tests => TESTS_SKIPS,
        Variant::Docs => DOCS_SKIPS,
    }
}

/// Whether a step kind is omitted under the given variant.
pub fn is_skipped(variant: Variant, kind: StepKind) -> bool {
    skips(variant).contains(&kind)
}

/// The realized sequence for a variant: the primary sequence minus skips.
pub fn realized_sequence(variant: Variant) -> Vec<StepKind> {
    PRIMARY_SEQUENCE
        .iter()
        .copied()
        .filter(|k| !is_skipped(variant, *k))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_sequence_has_no_conditional_steps() {
        assert!(!PRIMARY_SEQUENCE.iter().any(|k| k.is_conditional_only()));
    }

    #[test]
    fn full_variant_runs_everything() {
        assert_eq!(realized_sequence(Variant::Full), PRIMARY_SEQUENCE.to_vec());
    }

    #[test]
    fn hotfix_excludes_tests_and_integration() {
        let seq = realized_sequence(Variant::Hotfix);
        assert!(!seq.contains(&StepKind::WriteTests));
        assert!(!seq.contains(&StepKind::RunIntegrationTests));
        assert!(!seq.contains(&StepKind::FinalIntegration));
        assert!(seq.contains(&StepKind::RunUnitTests));
        assert!(seq.contains(&StepKind::Review));
    }

    #[test]
    fn docs_never_contains_write_tests() {
        let seq = realized_sequence(Variant::Docs);
        assert!(!seq.contains(&StepKind::WriteTests));
        assert!(!seq.contains(&StepKind::RunUnitTests));
        assert!(seq.contains(&StepKind::Review));
    }

    #[test]
    fn skipped_steps_preserve_order() {
        // Whatever survives the skip filter must keep the primary order.
        for variant in [
            Variant::Standard,
            Variant::Full,
            Variant::Hotfix,
            Variant::Tests,
            Variant::Docs,
        ] {
            let seq = realized_sequence(variant);
            let positions: Vec<usize> = seq
                .iter()
                .map(|k| PRIMARY_SEQUENCE.iter().position(|p| p == k).unwrap())
                .collect();
            let mut sorted = positions.clone();
            sorted.sort_unstable();
            assert_eq!(positions, sorted, "order broken for {variant}");
        }
    }
}
