use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, RwLock};

use crate::agent::Dispatcher;
use crate::error::{AppError, Result};
use crate::ledger::Ledger;
use crate::run::machine::{Resolution, RunMachine};
use crate::run::{self, RunStatus, WorkflowRun};
use crate::variant;

/// Control handles for one active (or archived) run.
struct RunHandle {
    snapshot: Arc<RwLock<WorkflowRun>>,
    resume_tx: mpsc::UnboundedSender<Resolution>,
    cancel_tx: watch::Sender<bool>,
}

/// Table of runs owned by this process. Terminal runs stay queryable;
/// their machines are gone.
pub struct RunRegistry {
    runs: RwLock<HashMap<String, RunHandle>>,
    cancel_grace: Duration,
}

impl RunRegistry {
    pub fn new(cancel_grace: Duration) -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            cancel_grace,
        }
    }

    /// Select a variant for the task, build the run, and spawn its state
    /// machine. Returns the new run id immediately.
    pub async fn start(
        &self,
        task_text: &str,
        dispatcher: Arc<Dispatcher>,
        ledger: Arc<Ledger>,
    ) -> String {
        let (selected, stripped_text) = variant::select::select(task_text);
        let run_id = run::next_run_id();
        let run = WorkflowRun::new(run_id.clone(), selected, stripped_text);

        tracing::info!(
            run = %run_id,
            variant = %selected,
            task = %run.task_text,
            "Starting workflow run"
        );

        let shared = Arc::new(RwLock::new(run.clone()));
        let (resume_tx, resume_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);

        {
            let mut runs = self.runs.write().await;
            runs.insert(
                run_id.clone(),
                RunHandle {
                    snapshot: Arc::clone(&shared),
                    resume_tx,
                    cancel_tx,
                },
            );
        }

        let machine = RunMachine::new(
            run,
            shared,
            dispatcher,
            ledger,
            resume_rx,
            cancel_rx,
            self.cancel_grace,
        );
        tokio::spawn(machine.drive());

        run_id
    }

    pub async fn snapshot(&self, run_id: &str) -> Result<WorkflowRun> {
        let runs = self.runs.read().await;
        let handle = runs
            .get(run_id)
            .ok_or_else(|| AppError::RunNotFound(run_id.to_string()))?;
        let snapshot = handle.snapshot.read().await.clone();
        Ok(snapshot)
    }

    /// Deliver a manual resolution to a BLOCKED run.
    pub async fn resume(&self, run_id: &str, resolution: Resolution) -> Result<()> {
        let runs = self.runs.read().await;
        let handle = runs
            .get(run_id)
            .ok_or_else(|| AppError::RunNotFound(run_id.to_string()))?;

        let status = handle.snapshot.read().await.status;
        if status != RunStatus::Blocked {
            return Err(AppError::NotBlocked(run_id.to_string()));
        }

        handle
            .resume_tx
            .send(resolution)
            .map_err(|_| AppError::Internal(format!("run {run_id} machine is gone")))?;
        Ok(())
    }

    /// Request cancellation of a run.
    pub async fn abort(&self, run_id: &str) -> Result<()> {
        let runs = self.runs.read().await;
        let handle = runs
            .get(run_id)
            .ok_or_else(|| AppError::RunNotFound(run_id.to_string()))?;
        let _ = handle.cancel_tx.send(true);
        Ok(())
    }

    /// Ids of runs that have not reached a terminal status.
    pub async fn active_ids(&self) -> Vec<String> {
        let runs = self.runs.read().await;
        let mut ids = Vec::new();
        for (id, handle) in runs.iter() {
            if !handle.snapshot.read().await.status.is_terminal() {
                ids.push(id.clone());
            }
        }
        ids
    }

    /// Signal cancel to every active run (shutdown path).
    pub async fn cancel_all(&self) {
        let runs = self.runs.read().await;
        for (id, handle) in runs.iter() {
            if !handle.snapshot.read().await.status.is_terminal() {
                tracing::info!(run = %id, "Cancelling in-flight run");
                let _ = handle.cancel_tx.send(true);
            }
        }
    }
}
