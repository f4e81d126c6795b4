use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::{AppError, Result};

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Deserialize, Clone)]
pub struct AgentsConfig {
    /// Agent role name -> HTTP endpoint URL.
    #[serde(default)]
    pub endpoints: HashMap<String, String>,
    /// Bearer token sent to agent endpoints, if any.
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Hard timeout for a single agent invocation, in seconds.
    #[serde(default = "default_invoke_timeout")]
    pub invoke_timeout_secs: u64,
    /// Grace period a collaborator gets to finish after a cancel request.
    #[serde(default = "default_cancel_grace")]
    pub cancel_grace_secs: u64,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            endpoints: HashMap::new(),
            auth_token: None,
            invoke_timeout_secs: default_invoke_timeout(),
            cancel_grace_secs: default_cancel_grace(),
        }
    }
}

// Manual Debug impl to avoid leaking the auth token
impl std::fmt::Debug for AgentsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentsConfig")
            .field("endpoints", &self.endpoints)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "[REDACTED]"))
            .field("invoke_timeout_secs", &self.invoke_timeout_secs)
            .field("cancel_grace_secs", &self.cancel_grace_secs)
            .finish()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkspaceConfig {
    #[serde(default = "default_workspace_dir")]
    pub base_dir: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            base_dir: default_workspace_dir(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LedgerConfig {
    /// Directory for per-run JSONL ledger files. None keeps the ledger
    /// in memory only.
    #[serde(default = "default_ledger_dir")]
    pub dir: Option<PathBuf>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            dir: default_ledger_dir(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_invoke_timeout() -> u64 {
    600
}

fn default_cancel_grace() -> u64 {
    5
}

fn default_workspace_dir() -> PathBuf {
    PathBuf::from("/tmp/foreman-workspaces")
}

fn default_ledger_dir() -> Option<PathBuf> {
    Some(PathBuf::from("/tmp/foreman-ledger"))
}

impl AppConfig {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        // Load from file if specified
        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path));
        } else {
            // Try default paths
            builder = builder.add_source(config::File::with_name("foreman").required(false));
        }

        // Environment variable overrides with FOREMAN_ prefix
        builder = builder.add_source(
            config::Environment::with_prefix("FOREMAN")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| AppError::Config(e.to_string()))?;

        config
            .try_deserialize()
            .map_err(|e| AppError::Config(e.to_string()))
    }
}
