pub mod cycle;
pub mod gate;
pub mod machine;
pub mod registry;

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::agent::AgentOutcome;
use crate::variant::{self, StepKind, Variant};

/// Overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Blocked,
    Completed,
    Aborted,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Aborted)
    }
}

/// Status of a single step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    NotStarted,
    Running,
    Passed,
    Failed,
    Skipped,
}

/// One step of one run.
///
/// Retries reuse the instance and bump `attempts`; a new instance is only
/// ever created when the cycle controller splices a FixIssues step in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepInstance {
    pub kind: StepKind,
    pub status: StepStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_outcome: Option<AgentOutcome>,
    /// Whether the one allowed environment-debug recovery has been spent.
    #[serde(default)]
    pub recovery_attempted: bool,
}

impl StepInstance {
    fn new(kind: StepKind) -> Self {
        Self {
            kind,
            status: StepStatus::NotStarted,
            attempts: 0,
            last_outcome: None,
            recovery_attempted: false,
        }
    }

    fn skipped(kind: StepKind) -> Self {
        Self {
            status: StepStatus::Skipped,
            ..Self::new(kind)
        }
    }

    /// A conditional step spliced into the list by the cycle controller.
    pub fn spliced(kind: StepKind) -> Self {
        Self::new(kind)
    }

    /// Start (or restart after a failure) an attempt.
    pub fn begin(&mut self) {
        debug_assert!(
            matches!(self.status, StepStatus::NotStarted | StepStatus::Failed),
            "step {} restarted from {:?}",
            self.kind,
            self.status
        );
        self.status = StepStatus::Running;
        self.attempts += 1;
    }

    pub fn pass(&mut self, outcome: AgentOutcome) {
        debug_assert_eq!(self.status, StepStatus::Running);
        self.status = StepStatus::Passed;
        self.last_outcome = Some(outcome);
    }

    pub fn fail(&mut self, outcome: AgentOutcome) {
        debug_assert_eq!(self.status, StepStatus::Running);
        self.status = StepStatus::Failed;
        self.last_outcome = Some(outcome);
    }

    /// Re-schedule a passed gate for another pass through a fix loop.
    /// Attempt count and last outcome carry over.
    pub fn reopen(&mut self) {
        debug_assert_eq!(self.status, StepStatus::Passed);
        self.status = StepStatus::NotStarted;
    }
}

/// The full state of one workflow run. Mutated only by its own state
/// machine task; everyone else sees read-only snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: String,
    pub variant: Variant,
    /// Task text with any reserved variant keyword already stripped.
    pub task_text: String,
    pub status: RunStatus,
    pub steps: Vec<StepInstance>,
    pub current: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    /// Conditional recovery steps that ran (never part of the primary list).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recovery_steps: Vec<StepInstance>,
}

impl WorkflowRun {
    /// Build a run from the variant catalog, marking non-applicable steps
    /// SKIPPED immediately.
    pub fn new(id: String, variant: Variant, task_text: String) -> Self {
        let steps = variant::primary_sequence()
            .iter()
            .map(|&kind| {
                if variant::is_skipped(variant, kind) {
                    StepInstance::skipped(kind)
                } else {
                    StepInstance::new(kind)
                }
            })
            .collect();

        Self {
            id,
            variant,
            task_text,
            status: RunStatus::Pending,
            steps,
            current: 0,
            abort_reason: None,
            recovery_steps: Vec::new(),
        }
    }

    /// Index of the step instance for a kind, if present.
    pub fn position_of(&self, kind: StepKind) -> Option<usize> {
        self.steps.iter().position(|s| s.kind == kind)
    }

    /// The realized sequence: kinds that actually execute.
    pub fn realized_kinds(&self) -> Vec<StepKind> {
        self.steps
            .iter()
            .filter(|s| s.status != StepStatus::Skipped)
            .map(|s| s.kind)
            .collect()
    }
}

static RUN_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Run ids stay unique across restarts by combining a UTC timestamp with a
/// process-local counter.
pub fn next_run_id() -> String {
    let n = RUN_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("run-{}-{n:04}", Utc::now().format("%Y%m%d%H%M%S"))
}
