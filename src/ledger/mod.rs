use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::agent::AgentOutcome;
use crate::config::LedgerConfig;
use crate::error::{AppError, Result};
use crate::variant::StepKind;

/// One immutable record of a step attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub run_id: String,
    pub step: StepKind,
    pub attempt: u32,
    pub outcome: AgentOutcome,
    pub timestamp: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(run_id: &str, step: StepKind, attempt: u32, outcome: AgentOutcome) -> Self {
        Self {
            run_id: run_id.to_string(),
            step,
            attempt,
            outcome,
            timestamp: Utc::now(),
        }
    }
}

/// Append-only audit trail, one ordered entry list per run.
///
/// Entries live in memory for reads and, when a directory is configured,
/// are mirrored to one JSONL file per run so history survives restarts.
/// Appends from parallel runs contend only on the map lock; nothing is
/// ever mutated or deleted while a run is active.
pub struct Ledger {
    entries: Mutex<HashMap<String, Vec<LedgerEntry>>>,
    dir: Option<PathBuf>,
}

impl Ledger {
    pub fn new(config: &LedgerConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            dir: config.dir.clone(),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            dir: None,
        }
    }

    pub async fn append(&self, entry: LedgerEntry) -> Result<()> {
        if let Some(dir) = &self.dir {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| AppError::Ledger(format!("Failed to create ledger dir: {e}")))?;
            let path = dir.join(format!("{}.jsonl", entry.run_id));
            let mut line = serde_json::to_vec(&entry)?;
            line.push(b'\n');
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .map_err(|e| AppError::Ledger(format!("Failed to open ledger file: {e}")))?;
            file.write_all(&line)
                .await
                .map_err(|e| AppError::Ledger(format!("Failed to append ledger entry: {e}")))?;
        }

        let mut entries = self.entries.lock().await;
        entries.entry(entry.run_id.clone()).or_default().push(entry);
        Ok(())
    }

    /// All entries for a run, in append order. Falls back to the on-disk
    /// file for runs from a previous process.
    pub async fn read_all(&self, run_id: &str) -> Result<Vec<LedgerEntry>> {
        {
            let entries = self.entries.lock().await;
            if let Some(run_entries) = entries.get(run_id) {
                return Ok(run_entries.clone());
            }
        }
        if let Some(dir) = &self.dir {
            let path = dir.join(format!("{run_id}.jsonl"));
            if path.exists() {
                return read_jsonl(&path).await;
            }
        }
        Ok(Vec::new())
    }

    /// Run ids with a ledger file on disk.
    pub async fn persisted_run_ids(&self) -> Result<Vec<String>> {
        let Some(dir) = &self.dir else {
            return Ok(Vec::new());
        };
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        let mut read_dir = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| AppError::Ledger(format!("Failed to read ledger dir: {e}")))?;
        while let Some(dirent) = read_dir
            .next_entry()
            .await
            .map_err(|e| AppError::Ledger(format!("Failed to read ledger dir: {e}")))?
        {
            let name = dirent.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = name.strip_suffix(".jsonl") {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

async fn read_jsonl(path: &std::path::Path) -> Result<Vec<LedgerEntry>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| AppError::Ledger(format!("Failed to read ledger file: {e}")))?;
    let mut entries = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        entries.push(serde_json::from_str(line)?);
    }
    Ok(entries)
}

/// Progress recovered by replaying a run's ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayedProgress {
    /// The furthest step with a successful attempt.
    pub last_passed: Option<StepKind>,
    /// Whether the run reached its final step successfully.
    pub completed: bool,
    pub total_attempts: usize,
}

/// Replay a ledger to the last passed step. The audit surface for crash
/// resumption and for diagnosing aborted runs.
pub fn replay(entries: &[LedgerEntry]) -> ReplayedProgress {
    let mut last_passed = None;
    for entry in entries {
        if entry.outcome.is_success() && !entry.step.is_conditional_only() {
            last_passed = Some(entry.step);
        }
    }
    ReplayedProgress {
        last_passed,
        completed: last_passed == Some(StepKind::Cleanup),
        total_attempts: entries.len(),
    }
}

/// Log runs from previous processes that never reached a terminal step.
/// Runs after a restart are not re-driven automatically; the ledger tells
/// an operator exactly where each one stopped.
pub async fn scan_unfinished(ledger: &Ledger) {
    let ids = match ledger.persisted_run_ids().await {
        Ok(ids) => ids,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to scan ledger directory on startup");
            return;
        }
    };

    for id in ids {
        let entries = match ledger.read_all(&id).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(run = %id, error = %e, "Failed to replay ledger");
                continue;
            }
        };
        let progress = replay(&entries);
        if !progress.completed {
            tracing::info!(
                run = %id,
                last_passed = ?progress.last_passed,
                attempts = progress.total_attempts,
                "Found unfinished run in ledger"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(run: &str, step: StepKind, attempt: u32, ok: bool) -> LedgerEntry {
        let outcome = if ok {
            AgentOutcome::success(json!({}))
        } else {
            AgentOutcome::failure("tests_failed", "boom")
        };
        LedgerEntry::new(run, step, attempt, outcome)
    }

    #[tokio::test]
    async fn append_and_read_preserve_order() {
        let ledger = Ledger::in_memory();
        ledger
            .append(entry("run-1", StepKind::CreateWorkspace, 1, true))
            .await
            .unwrap();
        ledger
            .append(entry("run-1", StepKind::Implement, 1, true))
            .await
            .unwrap();
        ledger
            .append(entry("run-1", StepKind::RunUnitTests, 1, false))
            .await
            .unwrap();

        let entries = ledger.read_all("run-1").await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].step, StepKind::CreateWorkspace);
        assert_eq!(entries[2].step, StepKind::RunUnitTests);
        assert!(ledger.read_all("run-2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn disk_ledger_survives_a_new_ledger_instance() {
        let tmp = tempfile::tempdir().unwrap();
        let config = LedgerConfig {
            dir: Some(tmp.path().to_path_buf()),
        };

        let ledger = Ledger::new(&config);
        ledger
            .append(entry("run-9", StepKind::CreateWorkspace, 1, true))
            .await
            .unwrap();
        ledger
            .append(entry("run-9", StepKind::Implement, 1, true))
            .await
            .unwrap();

        // Fresh instance, as after a restart
        let recovered = Ledger::new(&config);
        let entries = recovered.read_all("run-9").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(recovered.persisted_run_ids().await.unwrap(), vec!["run-9"]);
    }

    #[test]
    fn replay_finds_last_passed_step() {
        let entries = vec![
            entry("r", StepKind::CreateWorkspace, 1, true),
            entry("r", StepKind::Implement, 1, true),
            entry("r", StepKind::RunUnitTests, 1, false),
            entry("r", StepKind::FixIssues, 1, true),
            entry("r", StepKind::RunUnitTests, 2, false),
        ];
        let progress = replay(&entries);
        // FixIssues is conditional and does not mark primary progress
        assert_eq!(progress.last_passed, Some(StepKind::Implement));
        assert!(!progress.completed);
        assert_eq!(progress.total_attempts, 5);
    }

    #[test]
    fn replay_detects_completion() {
        let entries = vec![
            entry("r", StepKind::Merge, 1, true),
            entry("r", StepKind::Cleanup, 1, true),
        ];
        assert!(replay(&entries).completed);
    }
}
