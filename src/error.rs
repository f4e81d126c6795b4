use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run {0} is not blocked; nothing to resume")]
    NotBlocked(String),

    #[error("Agent dispatch error for role '{role}': {detail}")]
    Dispatch { role: String, detail: String },

    #[error("Agent dispatch timed out for role '{0}'")]
    DispatchTimeout(String),

    #[error("Workspace error: {0}")]
    Workspace(String),

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Transport-level dispatch failures are eligible for the single
    /// automatic retry; business failures reported by the agent are not.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            AppError::Dispatch { .. } | AppError::DispatchTimeout(_) | AppError::Http(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
