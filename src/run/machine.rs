use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, RwLock};

use crate::agent::{AgentContext, AgentOutcome, Dispatcher, PriorOutcome};
use crate::error::Result;
use crate::ledger::{Ledger, LedgerEntry};
use crate::run::cycle::{CycleCounter, CycleDecision};
use crate::run::gate::{self, GateDecision};
use crate::run::{RunStatus, StepInstance, StepStatus, WorkflowRun};
use crate::variant::StepKind;
use crate::workspace::{self, WorkspaceHandle};

/// External input that unblocks a run parked in NEEDS_MANUAL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    pub resolved: bool,
    #[serde(default)]
    pub detail: Option<String>,
}

/// Drives one workflow run from PENDING to a terminal status, one step at
/// a time. Owns the run state exclusively; the rest of the process reads
/// snapshots published after every transition.
pub struct RunMachine {
    run: WorkflowRun,
    shared: Arc<RwLock<WorkflowRun>>,
    dispatcher: Arc<Dispatcher>,
    ledger: Arc<Ledger>,
    cycles: CycleCounter,
    resume_rx: mpsc::UnboundedReceiver<Resolution>,
    cancel_rx: watch::Receiver<bool>,
    cancel_grace: Duration,
    prior: Vec<PriorOutcome>,
    workspace: Option<WorkspaceHandle>,
}

enum StepVerdict {
    Advance,
    /// Retry the current step without advancing.
    Stay,
    /// Move the pointer to an earlier index for a fix loop.
    Rewind(usize),
    Abort(String),
}

impl RunMachine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run: WorkflowRun,
        shared: Arc<RwLock<WorkflowRun>>,
        dispatcher: Arc<Dispatcher>,
        ledger: Arc<Ledger>,
        resume_rx: mpsc::UnboundedReceiver<Resolution>,
        cancel_rx: watch::Receiver<bool>,
        cancel_grace: Duration,
    ) -> Self {
        Self {
            run,
            shared,
            dispatcher,
            ledger,
            cycles: CycleCounter::new(),
            resume_rx,
            cancel_rx,
            cancel_grace,
            prior: Vec::new(),
            workspace: None,
        }
    }

    /// Run to completion. Every exit path leaves the published snapshot in
    /// a terminal status.
    pub async fn drive(mut self) {
        self.run.status = RunStatus::Running;
        self.publish().await;

        tracing::info!(
            run = %self.run.id,
            variant = %self.run.variant,
            "Run started"
        );

        loop {
            if self.run.current >= self.run.steps.len() {
                self.run.status = RunStatus::Completed;
                break;
            }

            // Cancellation is honored at every step boundary.
            if *self.cancel_rx.borrow() {
                self.abort("cancelled".to_string());
                break;
            }

            let idx = self.run.current;
            match self.run.steps[idx].status {
                StepStatus::Skipped | StepStatus::Passed => {
                    self.run.current += 1;
                    continue;
                }
                _ => {}
            }

            let verdict = self.execute_step(idx).await;
            match verdict {
                StepVerdict::Advance => {
                    self.run.current += 1;
                }
                StepVerdict::Stay => {}
                StepVerdict::Rewind(target) => {
                    self.run.current = target;
                }
                StepVerdict::Abort(reason) => {
                    self.abort(reason);
                    break;
                }
            }
            self.publish().await;
        }

        self.publish().await;
        tracing::info!(
            run = %self.run.id,
            status = ?self.run.status,
            reason = ?self.run.abort_reason,
            "Run finished"
        );
    }

    async fn execute_step(&mut self, idx: usize) -> StepVerdict {
        let kind = self.run.steps[idx].kind;
        self.run.steps[idx].begin();
        self.publish().await;

        let attempt = self.run.steps[idx].attempts;
        tracing::info!(run = %self.run.id, step = %kind, attempt, "Executing step");

        let outcome = match self.dispatch(kind).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // An unhandled dispatcher error becomes a structured
                // failure, gets its ledger record, and aborts the run.
                let failure = AgentOutcome::failure("dispatch-error", e.to_string());
                self.record(kind, attempt, failure.clone()).await;
                self.run.steps[idx].fail(failure);
                return StepVerdict::Abort(format!("dispatch error on {kind}: {e}"));
            }
        };

        self.record(kind, attempt, outcome.clone()).await;

        if let AgentOutcome::Failure { kind: fk, .. } = &outcome {
            if fk == "cancelled" {
                self.run.steps[idx].fail(outcome);
                return StepVerdict::Abort("cancelled".to_string());
            }
        }

        if kind.is_gate() {
            self.handle_gate(idx, kind, outcome).await
        } else {
            self.handle_plain(idx, kind, outcome)
        }
    }

    /// Non-gate steps pass on any non-error outcome; a reported failure
    /// breaks the run outright, with no retry policy.
    fn handle_plain(&mut self, idx: usize, kind: StepKind, outcome: AgentOutcome) -> StepVerdict {
        match outcome {
            AgentOutcome::Success { .. } => {
                if kind == StepKind::CreateWorkspace {
                    self.workspace = Some(self.workspace_handle(&outcome));
                }
                self.remember(kind, &outcome);
                self.run.steps[idx].pass(outcome);
                StepVerdict::Advance
            }
            AgentOutcome::Failure { ref detail, .. } => {
                let reason = format!("{kind} failed: {detail}");
                self.remember(kind, &outcome);
                self.run.steps[idx].fail(outcome);
                StepVerdict::Abort(reason)
            }
            AgentOutcome::ManualReviewRequired { ref detail } => {
                let reason = format!("{kind} requested manual review: {detail}");
                self.run.steps[idx].fail(outcome);
                StepVerdict::Abort(reason)
            }
        }
    }

    async fn handle_gate(
        &mut self,
        idx: usize,
        kind: StepKind,
        outcome: AgentOutcome,
    ) -> StepVerdict {
        match gate::evaluate(kind, &outcome) {
            GateDecision::Pass => {
                tracing::info!(run = %self.run.id, step = %kind, "Gate passed");
                self.remember(kind, &outcome);
                self.run.steps[idx].pass(outcome);
                StepVerdict::Advance
            }
            GateDecision::NeedsManual => self.suspend(idx, kind, outcome).await,
            GateDecision::Fail => {
                if outcome.is_environment_failure() {
                    return self.recover_environment(idx, kind, outcome).await;
                }

                tracing::warn!(run = %self.run.id, step = %kind, "Gate failed");
                self.remember(kind, &outcome);
                self.run.steps[idx].fail(outcome);

                // A failed gate blocks the run until the cycle controller
                // decides what happens next.
                self.run.status = RunStatus::Blocked;
                self.publish().await;

                match self.cycles.on_gate_failure() {
                    CycleDecision::Abort { reason } => StepVerdict::Abort(reason),
                    CycleDecision::Continue => self.fix_loop(idx, kind).await,
                }
            }
        }
    }

    /// Park in BLOCKED until an explicit resolution arrives. Not a
    /// failure; the only unbounded wait in the machine.
    async fn suspend(&mut self, idx: usize, kind: StepKind, outcome: AgentOutcome) -> StepVerdict {
        tracing::info!(run = %self.run.id, step = %kind, "Gate needs manual review; run blocked");
        self.run.steps[idx].last_outcome = Some(outcome);
        self.run.status = RunStatus::Blocked;
        self.publish().await;

        let resolution = loop {
            tokio::select! {
                resolution = self.resume_rx.recv() => {
                    match resolution {
                        Some(r) => break r,
                        None => return StepVerdict::Abort("resume channel closed".to_string()),
                    }
                }
                changed = self.cancel_rx.changed() => {
                    if changed.is_err() || *self.cancel_rx.borrow() {
                        return StepVerdict::Abort("cancelled".to_string());
                    }
                }
            }
        };

        let detail = resolution.detail.unwrap_or_default();
        let attempt = self.run.steps[idx].attempts;
        if resolution.resolved {
            let outcome = AgentOutcome::success(
                serde_json::json!({"tag": "resolved", "via": "manual", "detail": detail}),
            );
            self.record(kind, attempt, outcome.clone()).await;
            self.remember(kind, &outcome);
            self.run.steps[idx].pass(outcome);
            self.run.status = RunStatus::Running;
            StepVerdict::Advance
        } else {
            let outcome = AgentOutcome::failure("manual_resolution_rejected", detail);
            self.record(kind, attempt, outcome.clone()).await;
            self.run.steps[idx].fail(outcome);
            StepVerdict::Abort("manual resolution rejected".to_string())
        }
    }

    /// Environment-class failures get one DebugEnvironment recovery per
    /// step, independent of the fix-cycle budget, then a retry of the same
    /// step. A second environment failure on that step aborts.
    async fn recover_environment(
        &mut self,
        idx: usize,
        kind: StepKind,
        outcome: AgentOutcome,
    ) -> StepVerdict {
        self.remember(kind, &outcome);
        self.run.steps[idx].fail(outcome);

        if self.run.steps[idx].recovery_attempted {
            return StepVerdict::Abort(format!(
                "environment failure on {kind} persisted after recovery"
            ));
        }
        self.run.steps[idx].recovery_attempted = true;

        tracing::warn!(
            run = %self.run.id,
            step = %kind,
            "Environment failure; invoking debug sub-step"
        );

        let mut recovery = StepInstance {
            kind: StepKind::DebugEnvironment,
            status: StepStatus::Running,
            attempts: 1,
            last_outcome: None,
            recovery_attempted: false,
        };
        self.publish().await;

        let result = self.dispatch(StepKind::DebugEnvironment).await;
        let verdict = match result {
            Ok(outcome @ AgentOutcome::Success { .. }) => {
                self.record(StepKind::DebugEnvironment, 1, outcome.clone()).await;
                recovery.status = StepStatus::Passed;
                recovery.last_outcome = Some(outcome);
                StepVerdict::Stay
            }
            Ok(outcome) => {
                self.record(StepKind::DebugEnvironment, 1, outcome.clone()).await;
                recovery.status = StepStatus::Failed;
                recovery.last_outcome = Some(outcome);
                StepVerdict::Abort("environment recovery failed".to_string())
            }
            Err(e) => {
                let failure = AgentOutcome::failure("dispatch-error", e.to_string());
                self.record(StepKind::DebugEnvironment, 1, failure.clone()).await;
                recovery.status = StepStatus::Failed;
                recovery.last_outcome = Some(failure);
                StepVerdict::Abort(format!("dispatch error on debug_environment: {e}"))
            }
        };

        self.run.recovery_steps.push(recovery);
        verdict
    }

    /// One fix/retest/re-review loop: splice (or reuse) the FixIssues
    /// step right after the failed gate, run it, then rewind.
    async fn fix_loop(&mut self, failed_idx: usize, failed_kind: StepKind) -> StepVerdict {
        tracing::info!(
            run = %self.run.id,
            step = %failed_kind,
            cycle = self.cycles.count(),
            "Entering fix cycle"
        );

        let fix_idx = match self.run.position_of(StepKind::FixIssues) {
            Some(i) => i,
            None => {
                let i = failed_idx + 1;
                self.run.steps.insert(i, StepInstance::spliced(StepKind::FixIssues));
                i
            }
        };

        // Run the fix step in place. It is a non-gate step: it either
        // works or the run is broken.
        if self.run.steps[fix_idx].status == StepStatus::NotStarted {
            self.run.steps[fix_idx].begin();
        } else {
            // Later cycles reuse the instance; PASSED stays put and only
            // the attempt count and ledger grow.
            self.run.steps[fix_idx].attempts += 1;
        }
        self.publish().await;

        let attempt = self.run.steps[fix_idx].attempts;
        let outcome = match self.dispatch(StepKind::FixIssues).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let failure = AgentOutcome::failure("dispatch-error", e.to_string());
                self.record(StepKind::FixIssues, attempt, failure.clone()).await;
                if self.run.steps[fix_idx].status == StepStatus::Running {
                    self.run.steps[fix_idx].fail(failure);
                }
                return StepVerdict::Abort(format!("dispatch error on fix_issues: {e}"));
            }
        };
        self.record(StepKind::FixIssues, attempt, outcome.clone()).await;

        if !outcome.is_success() {
            if self.run.steps[fix_idx].status == StepStatus::Running {
                self.run.steps[fix_idx].fail(outcome);
            }
            return StepVerdict::Abort("fix step failed".to_string());
        }

        self.remember(StepKind::FixIssues, &outcome);
        if self.run.steps[fix_idx].status == StepStatus::Running {
            self.run.steps[fix_idx].pass(outcome);
        } else {
            self.run.steps[fix_idx].last_outcome = Some(outcome);
        }

        let target = self.rewind_target(failed_idx, failed_kind);
        // Gates between the rewind target and the failure re-run; their
        // instances are reopened, keeping attempt counts.
        for i in target..failed_idx {
            if self.run.steps[i].kind.is_gate() && self.run.steps[i].status == StepStatus::Passed {
                self.run.steps[i].reopen();
            }
        }

        self.run.status = RunStatus::Running;
        StepVerdict::Rewind(target)
    }

    /// Unit-test and review failures rewind to RunUnitTests for the full
    /// retest and re-review loop; other gates retest in place.
    fn rewind_target(&self, failed_idx: usize, failed_kind: StepKind) -> usize {
        if matches!(failed_kind, StepKind::RunUnitTests | StepKind::Review) {
            if let Some(i) = self.run.position_of(StepKind::RunUnitTests) {
                if self.run.steps[i].status != StepStatus::Skipped {
                    return i;
                }
            }
        }
        failed_idx
    }

    async fn dispatch(&mut self, kind: StepKind) -> Result<AgentOutcome> {
        let context = AgentContext {
            step: kind.as_str().to_string(),
            variant: self.run.variant,
            task_text: self.run.task_text.clone(),
            prior_outcomes: self.prior.clone(),
            workspace: self.workspace.clone(),
        };
        invoke_with_cancel(
            &self.dispatcher,
            &mut self.cancel_rx,
            self.cancel_grace,
            kind.agent_role(),
            &context,
        )
        .await
    }

    /// Derive the workspace handle from a CreateWorkspace payload, filling
    /// in the naming contract where the collaborator left fields out.
    fn workspace_handle(&self, outcome: &AgentOutcome) -> WorkspaceHandle {
        let null = serde_json::Value::Null;
        let payload = match outcome {
            AgentOutcome::Success { payload } => payload,
            _ => &null,
        };
        let slug = payload["slug"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| workspace::task_slug(&self.run.task_text));
        let branch = payload["branch"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| workspace::branch_name(self.run.variant, &self.run.task_text));
        let path = payload["path"].as_str().unwrap_or_default().into();
        WorkspaceHandle { slug, path, branch }
    }

    async fn record(&self, kind: StepKind, attempt: u32, outcome: AgentOutcome) {
        let entry = LedgerEntry::new(&self.run.id, kind, attempt, outcome);
        if let Err(e) = self.ledger.append(entry).await {
            tracing::warn!(run = %self.run.id, step = %kind, error = %e, "Ledger append failed");
        }
    }

    fn remember(&mut self, kind: StepKind, outcome: &AgentOutcome) {
        self.prior.push(PriorOutcome {
            step: kind.as_str().to_string(),
            outcome: outcome.clone(),
        });
    }

    fn abort(&mut self, reason: String) {
        tracing::warn!(run = %self.run.id, reason = %reason, "Run aborted");
        self.run.status = RunStatus::Aborted;
        self.run.abort_reason = Some(reason);
    }

    async fn publish(&self) {
        let mut shared = self.shared.write().await;
        *shared = self.run.clone();
    }
}

/// Await a dispatch while honoring cooperative cancellation: once cancel
/// is signalled the collaborator gets a grace period to finish, after
/// which the step is force-failed with kind "cancelled".
async fn invoke_with_cancel(
    dispatcher: &Dispatcher,
    cancel_rx: &mut watch::Receiver<bool>,
    grace: Duration,
    role: &str,
    context: &AgentContext,
) -> Result<AgentOutcome> {
    if *cancel_rx.borrow() {
        return Ok(AgentOutcome::failure("cancelled", "run cancelled"));
    }

    let fut = dispatcher.invoke(role, context);
    tokio::pin!(fut);
    loop {
        tokio::select! {
            result = &mut fut => return result,
            changed = cancel_rx.changed() => {
                if changed.is_err() {
                    return (&mut fut).await;
                }
                if *cancel_rx.borrow() {
                    return match tokio::time::timeout(grace, &mut fut).await {
                        Ok(result) => result,
                        Err(_) => Ok(AgentOutcome::failure(
                            "cancelled",
                            "collaborator did not stop within the grace period",
                        )),
                    };
                }
            }
        }
    }
}
