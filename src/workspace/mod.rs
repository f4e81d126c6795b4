use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::WorkspaceConfig;
use crate::error::{AppError, Result};
use crate::variant::Variant;

/// An isolated workspace allocated for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceHandle {
    pub slug: String,
    pub path: PathBuf,
    pub branch: String,
}

/// Outcome of a merge attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeResult {
    Ok,
    Conflict,
}

/// Workspace lifecycle contract. The real side effects (worktrees, ports,
/// databases) belong to the implementation; the orchestrator only tracks
/// the handle.
#[async_trait]
pub trait WorkspaceProvider: Send + Sync {
    async fn create(&self, task_slug: &str, branch: &str) -> Result<WorkspaceHandle>;
    async fn merge(&self, handle: &WorkspaceHandle) -> Result<MergeResult>;
    async fn cleanup(&self, handle: &WorkspaceHandle) -> Result<()>;
}

/// Kebab-case slug of a task description, suitable for branch and
/// directory names.
pub fn task_slug(task_text: &str) -> String {
    let mut slug = String::new();
    let mut last_dash = true;
    for c in task_text.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
        if slug.len() >= 60 {
            break;
        }
    }
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "task".to_string()
    } else {
        slug
    }
}

fn branch_prefix(variant: Variant) -> &'static str {
    match variant {
        Variant::Hotfix => "fix/",
        Variant::Docs => "docs/",
        _ => "feature/",
    }
}

/// Branch name for a task under a variant: the kebab-case slug behind a
/// type prefix. A leading slug token that duplicates the prefix type is
/// dropped, so "Fix login crash" under hotfix becomes `fix/login-crash`.
pub fn branch_name(variant: Variant, task_text: &str) -> String {
    let prefix = branch_prefix(variant);
    let mut slug = task_slug(task_text);
    // Drop a leading token that duplicates the prefix type
    let type_word = prefix.trim_end_matches('/');
    if let Some(rest) = slug.strip_prefix(&format!("{type_word}-")) {
        slug = rest.to_string();
    }
    format!("{prefix}{slug}")
}

/// Conventional commit message for a finished run:
/// `<type>: <short description>` followed by bullet details and the
/// reported test coverage.
pub fn commit_message(
    variant: Variant,
    short_description: &str,
    details: &[String],
    coverage_percent: Option<f64>,
) -> String {
    let commit_type = match variant {
        Variant::Hotfix => "fix",
        Variant::Docs => "docs",
        Variant::Tests => "test",
        _ => "feat",
    };
    let mut message = format!("{commit_type}: {short_description}\n");
    for detail in details {
        message.push_str(&format!("\n- {detail}"));
    }
    if let Some(coverage) = coverage_percent {
        message.push_str(&format!("\n- Test coverage: {coverage:.0}%"));
    }
    message
}

/// Allocates plain per-run directories under a base dir. Stands in for a
/// real worktree manager when no external workspace collaborator is
/// configured.
pub struct LocalWorkspaceProvider {
    base_dir: PathBuf,
}

impl LocalWorkspaceProvider {
    pub fn new(config: &WorkspaceConfig) -> Self {
        Self {
            base_dir: config.base_dir.clone(),
        }
    }

    fn workspace_path(&self, slug: &str) -> PathBuf {
        self.base_dir.join(slug.replace('/', "__"))
    }
}

#[async_trait]
impl WorkspaceProvider for LocalWorkspaceProvider {
    async fn create(&self, task_slug: &str, branch: &str) -> Result<WorkspaceHandle> {
        let path = self.workspace_path(task_slug);
        if path.exists() {
            tokio::fs::remove_dir_all(&path)
                .await
                .map_err(|e| AppError::Workspace(format!("Failed to clean workspace: {e}")))?;
        }
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| AppError::Workspace(format!("Failed to create workspace dir: {e}")))?;

        Ok(WorkspaceHandle {
            slug: task_slug.to_string(),
            path,
            branch: branch.to_string(),
        })
    }

    async fn merge(&self, _handle: &WorkspaceHandle) -> Result<MergeResult> {
        // Nothing to merge in a bare directory workspace.
        Ok(MergeResult::Ok)
    }

    async fn cleanup(&self, handle: &WorkspaceHandle) -> Result<()> {
        if handle.path.exists() {
            tokio::fs::remove_dir_all(&handle.path)
                .await
                .map_err(|e| AppError::Workspace(format!("Failed to cleanup workspace: {e}")))?;
        }
        Ok(())
    }
}

/// The built-in workspace collaborator: serves the "workspace" role for
/// deployments without an external workspace agent, backed by the local
/// directory provider.
pub struct WorkspaceCollaborator {
    provider: LocalWorkspaceProvider,
}

impl WorkspaceCollaborator {
    pub fn new(config: &WorkspaceConfig) -> Self {
        Self {
            provider: LocalWorkspaceProvider::new(config),
        }
    }

    fn require_handle(context: &crate::agent::AgentContext) -> Result<&WorkspaceHandle> {
        context
            .workspace
            .as_ref()
            .ok_or_else(|| AppError::Workspace("no workspace handle in context".to_string()))
    }
}

#[async_trait]
impl crate::agent::AgentDispatcher for WorkspaceCollaborator {
    async fn invoke(
        &self,
        _role: &str,
        context: &crate::agent::AgentContext,
    ) -> Result<crate::agent::AgentOutcome> {
        use crate::agent::AgentOutcome;

        match context.step.as_str() {
            "create_workspace" => {
                let slug = task_slug(&context.task_text);
                let branch = branch_name(context.variant, &context.task_text);
                let handle = self.provider.create(&slug, &branch).await?;
                Ok(AgentOutcome::success(serde_json::json!({
                    "slug": handle.slug,
                    "path": handle.path,
                    "branch": handle.branch,
                })))
            }
            "commit" => {
                let details: Vec<String> = context
                    .prior_outcomes
                    .iter()
                    .rev()
                    .find_map(|prior| match &prior.outcome {
                        AgentOutcome::Success { payload } => payload.get("details"),
                        _ => None,
                    })
                    .and_then(|v| v.as_array())
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|d| d.as_str().map(String::from))
                            .collect()
                    })
                    .unwrap_or_default();
                let coverage = context
                    .prior_outcomes
                    .iter()
                    .rev()
                    .find_map(|prior| match &prior.outcome {
                        AgentOutcome::Success { payload } => {
                            payload.get("coverage").and_then(|v| v.as_f64())
                        }
                        _ => None,
                    });
                let message =
                    commit_message(context.variant, &context.task_text, &details, coverage);
                Ok(AgentOutcome::success(serde_json::json!({ "message": message })))
            }
            // Nothing to record in a bare directory workspace.
            "push" => Ok(AgentOutcome::success(serde_json::json!({}))),
            "merge" => {
                let handle = Self::require_handle(context)?;
                match self.provider.merge(handle).await? {
                    MergeResult::Ok => Ok(AgentOutcome::success(serde_json::json!({"tag": "ok"}))),
                    MergeResult::Conflict => Ok(AgentOutcome::failure(
                        "merge_conflict",
                        format!("conflict merging {}", handle.branch),
                    )),
                }
            }
            "cleanup" => {
                let handle = Self::require_handle(context)?;
                self.provider.cleanup(handle).await?;
                Ok(AgentOutcome::success(serde_json::json!({})))
            }
            other => Err(AppError::Workspace(format!(
                "workspace role cannot handle step '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugs_are_kebab_case() {
        assert_eq!(task_slug("Fix login crash"), "fix-login-crash");
        assert_eq!(task_slug("  add   OAuth2 (Google) support! "), "add-oauth2-google-support");
        assert_eq!(task_slug("!!!"), "task");
    }

    #[test]
    fn hotfix_branch_uses_fix_prefix_without_duplication() {
        assert_eq!(branch_name(Variant::Hotfix, "Fix login crash"), "fix/login-crash");
        assert_eq!(branch_name(Variant::Hotfix, "login crash"), "fix/login-crash");
    }

    #[test]
    fn feature_branch_for_standard_tasks() {
        assert_eq!(
            branch_name(Variant::Standard, "Add pagination to user list"),
            "feature/add-pagination-to-user-list"
        );
        assert_eq!(branch_name(Variant::Docs, "update readme"), "docs/update-readme");
    }

    #[test]
    fn commit_message_format() {
        let message = commit_message(
            Variant::Hotfix,
            "resolve login redirect loop",
            &["Guard against empty session cookie".to_string()],
            Some(87.0),
        );
        assert_eq!(
            message,
            "fix: resolve login redirect loop\n\n- Guard against empty session cookie\n- Test coverage: 87%"
        );
    }

    #[tokio::test]
    async fn collaborator_walks_the_workspace_lifecycle() {
        use crate::agent::{AgentContext, AgentDispatcher, AgentOutcome};

        let tmp = tempfile::tempdir().unwrap();
        let collaborator = WorkspaceCollaborator::new(&WorkspaceConfig {
            base_dir: tmp.path().to_path_buf(),
        });

        let mut context = AgentContext {
            step: "create_workspace".to_string(),
            variant: Variant::Hotfix,
            task_text: "Fix login crash".to_string(),
            prior_outcomes: vec![],
            workspace: None,
        };

        let outcome = collaborator.invoke("workspace", &context).await.unwrap();
        let payload = match &outcome {
            AgentOutcome::Success { payload } => payload.clone(),
            other => panic!("expected success, got {other:?}"),
        };
        assert_eq!(payload["branch"], "fix/login-crash");
        let path: std::path::PathBuf = payload["path"].as_str().unwrap().into();
        assert!(path.exists());

        context.workspace = Some(WorkspaceHandle {
            slug: "fix-login-crash".to_string(),
            path: path.clone(),
            branch: "fix/login-crash".to_string(),
        });

        for step in ["commit", "push", "merge", "cleanup"] {
            context.step = step.to_string();
            let outcome = collaborator.invoke("workspace", &context).await.unwrap();
            assert!(outcome.is_success(), "{step} failed: {outcome:?}");
        }
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn collaborator_commit_step_reports_the_commit_message() {
        use crate::agent::{AgentContext, AgentDispatcher, AgentOutcome, PriorOutcome};

        let tmp = tempfile::tempdir().unwrap();
        let collaborator = WorkspaceCollaborator::new(&WorkspaceConfig {
            base_dir: tmp.path().to_path_buf(),
        });

        let context = AgentContext {
            step: "commit".to_string(),
            variant: Variant::Hotfix,
            task_text: "resolve login redirect loop".to_string(),
            prior_outcomes: vec![PriorOutcome {
                step: "implement".to_string(),
                outcome: AgentOutcome::success(serde_json::json!({
                    "details": ["Guard against empty session cookie"],
                    "coverage": 87.0,
                })),
            }],
            workspace: None,
        };

        let outcome = collaborator.invoke("workspace", &context).await.unwrap();
        let payload = match &outcome {
            AgentOutcome::Success { payload } => payload.clone(),
            other => panic!("expected success, got {other:?}"),
        };
        assert_eq!(
            payload["message"],
            "fix: resolve login redirect loop\n\n- Guard against empty session cookie\n- Test coverage: 87%"
        );
    }

    #[tokio::test]
    async fn local_provider_creates_and_cleans_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = LocalWorkspaceProvider::new(&WorkspaceConfig {
            base_dir: tmp.path().to_path_buf(),
        });

        let handle = provider.create("fix-login-crash", "fix/login-crash").await.unwrap();
        assert!(handle.path.exists());
        assert_eq!(provider.merge(&handle).await.unwrap(), MergeResult::Ok);

        provider.cleanup(&handle).await.unwrap();
        assert!(!handle.path.exists());
    }
}
