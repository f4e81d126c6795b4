pub mod http;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::variant::Variant;
use crate::workspace::{WorkspaceCollaborator, WorkspaceHandle};

/// Structured result of one collaborator invocation.
///
/// This is the whole contract: the orchestrator never inspects a
/// collaborator beyond this union.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AgentOutcome {
    Success {
        #[serde(default)]
        payload: serde_json::Value,
    },
    Failure {
        kind: String,
        detail: String,
    },
    #[serde(rename = "manual_review")]
    ManualReviewRequired {
        detail: String,
    },
}

impl AgentOutcome {
    pub fn success(payload: serde_json::Value) -> Self {
        AgentOutcome::Success { payload }
    }

    pub fn failure(kind: impl Into<String>, detail: impl Into<String>) -> Self {
        AgentOutcome::Failure {
            kind: kind.into(),
            detail: detail.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, AgentOutcome::Success { .. })
    }

    /// Failure class recognized as recoverable by the environment-debug
    /// sub-step (container or environment breakage, not bad code).
    pub fn is_environment_failure(&self) -> bool {
        match self {
            AgentOutcome::Failure { kind, .. } => {
                let k = kind.to_lowercase();
                k.contains("environment") || k.contains("container") || k.contains("docker")
            }
            _ => false,
        }
    }
}

/// A prior step's outcome, carried forward so later collaborators can see
/// what already happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorOutcome {
    pub step: String,
    pub outcome: AgentOutcome,
}

/// Context payload handed to every collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentContext {
    /// The step being executed, so multi-step roles (the workspace
    /// manager in particular) know which operation is wanted.
    pub step: String,
    pub variant: Variant,
    pub task_text: String,
    pub prior_outcomes: Vec<PriorOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace: Option<WorkspaceHandle>,
}

/// Boundary to every external collaborator. Implementations own all side
/// effects (workspace creation, commits, pushes, merges).
#[async_trait]
pub trait AgentDispatcher: Send + Sync {
    async fn invoke(&self, role: &str, context: &AgentContext) -> Result<AgentOutcome>;
}

/// Dispatch policy wrapper: a hard timeout per invocation and a single
/// automatic retry on transport-level failure. Business failures come back
/// as `AgentOutcome::Failure` and are never retried here.
pub struct Dispatcher {
    inner: Arc<dyn AgentDispatcher>,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(inner: Arc<dyn AgentDispatcher>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub async fn invoke(&self, role: &str, context: &AgentContext) -> Result<AgentOutcome> {
        match self.attempt(role, context).await {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_transport() => {
                tracing::warn!(role = role, error = %e, "Transport failure, retrying dispatch once");
                self.attempt(role, context).await
            }
            Err(e) => Err(e),
        }
    }

    async fn attempt(&self, role: &str, context: &AgentContext) -> Result<AgentOutcome> {
        match tokio::time::timeout(self.timeout, self.inner.invoke(role, context)).await {
            Ok(result) => result,
            Err(_) => Err(AppError::DispatchTimeout(role.to_string())),
        }
    }
}

/// Routes each role to its configured HTTP endpoint, with the built-in
/// local workspace collaborator standing in for an unconfigured
/// "workspace" role so the service works out of the box.
pub struct RoutingDispatcher {
    http: http::HttpAgentDispatcher,
    workspace: WorkspaceCollaborator,
}

impl RoutingDispatcher {
    pub fn new(http: http::HttpAgentDispatcher, workspace: WorkspaceCollaborator) -> Self {
        Self { http, workspace }
    }
}

#[async_trait]
impl AgentDispatcher for RoutingDispatcher {
    async fn invoke(&self, role: &str, context: &AgentContext) -> Result<AgentOutcome> {
        if self.http.has_endpoint(role) {
            return self.http.invoke(role, context).await;
        }
        if role == "workspace" {
            return self.workspace.invoke(role, context).await;
        }
        Err(AppError::Dispatch {
            role: role.to_string(),
            detail: "no endpoint configured for role".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyDispatcher {
        calls: AtomicU32,
        fail_first: bool,
    }

    #[async_trait]
    impl AgentDispatcher for FlakyDispatcher {
        async fn invoke(&self, role: &str, _context: &AgentContext) -> Result<AgentOutcome> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && n == 0 {
                return Err(AppError::Dispatch {
                    role: role.to_string(),
                    detail: "connection reset".to_string(),
                });
            }
            Ok(AgentOutcome::success(serde_json::json!({"ok": true})))
        }
    }

    fn context() -> AgentContext {
        AgentContext {
            step: "run_unit_tests".to_string(),
            variant: Variant::Standard,
            task_text: "task".to_string(),
            prior_outcomes: vec![],
            workspace: None,
        }
    }

    #[tokio::test]
    async fn retries_once_on_transport_failure() {
        let inner = Arc::new(FlakyDispatcher {
            calls: AtomicU32::new(0),
            fail_first: true,
        });
        let dispatcher = Dispatcher::new(inner.clone(), Duration::from_secs(5));

        let outcome = dispatcher.invoke("tester", &context()).await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    struct BusinessFailDispatcher {
        calls: AtomicU32,
    }

    #[async_trait]
    impl AgentDispatcher for BusinessFailDispatcher {
        async fn invoke(&self, _role: &str, _context: &AgentContext) -> Result<AgentOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(AgentOutcome::failure("tests_failed", "3 failures"))
        }
    }

    #[tokio::test]
    async fn business_failure_is_not_retried() {
        let inner = Arc::new(BusinessFailDispatcher {
            calls: AtomicU32::new(0),
        });
        let dispatcher = Dispatcher::new(inner.clone(), Duration::from_secs(5));

        let outcome = dispatcher.invoke("tester", &context()).await.unwrap();
        assert!(matches!(outcome, AgentOutcome::Failure { .. }));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    struct HangingDispatcher;

    #[async_trait]
    impl AgentDispatcher for HangingDispatcher {
        async fn invoke(&self, _role: &str, _context: &AgentContext) -> Result<AgentOutcome> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn timeout_surfaces_after_one_retry() {
        let dispatcher = Dispatcher::new(Arc::new(HangingDispatcher), Duration::from_millis(20));
        let err = dispatcher.invoke("reviewer", &context()).await.unwrap_err();
        assert!(matches!(err, AppError::DispatchTimeout(_)));
    }

    #[test]
    fn outcome_wire_format_round_trips() {
        let json = r#"{"status":"manual_review","detail":"overlapping hunks"}"#;
        let outcome: AgentOutcome = serde_json::from_str(json).unwrap();
        assert!(matches!(outcome, AgentOutcome::ManualReviewRequired { .. }));

        let json = r#"{"status":"success","payload":{"failures":0,"coverage":91}}"#;
        let outcome: AgentOutcome = serde_json::from_str(json).unwrap();
        assert!(outcome.is_success());
    }

    #[test]
    fn environment_failures_are_recognized() {
        assert!(AgentOutcome::failure("container_error", "compose up failed")
            .is_environment_failure());
        assert!(AgentOutcome::failure("environment", "port in use").is_environment_failure());
        assert!(!AgentOutcome::failure("tests_failed", "2 failures").is_environment_failure());
    }
}
