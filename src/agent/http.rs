use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use crate::agent::{AgentContext, AgentDispatcher, AgentOutcome};
use crate::config::AgentsConfig;
use crate::error::{AppError, Result};

/// Dispatches collaborator invocations over HTTP.
///
/// Each role maps to one endpoint URL; the request body carries the role
/// and the run context, the response body is the structured outcome.
pub struct HttpAgentDispatcher {
    client: Client,
    endpoints: HashMap<String, String>,
    auth_token: Option<String>,
}

#[derive(Serialize)]
struct InvokeRequest<'a> {
    role: &'a str,
    context: &'a AgentContext,
}

impl HttpAgentDispatcher {
    pub fn new(config: &AgentsConfig) -> Self {
        Self {
            client: Client::new(),
            endpoints: config.endpoints.clone(),
            auth_token: config.auth_token.clone(),
        }
    }

    pub fn has_endpoint(&self, role: &str) -> bool {
        self.endpoints.contains_key(role)
    }

    fn endpoint(&self, role: &str) -> Result<&str> {
        self.endpoints
            .get(role)
            .map(String::as_str)
            .ok_or_else(|| AppError::Dispatch {
                role: role.to_string(),
                detail: "no endpoint configured for role".to_string(),
            })
    }
}

#[async_trait]
impl AgentDispatcher for HttpAgentDispatcher {
    async fn invoke(&self, role: &str, context: &AgentContext) -> Result<AgentOutcome> {
        let url = self.endpoint(role)?;

        let mut request = self
            .client
            .post(url)
            .header("content-type", "application/json")
            .json(&InvokeRequest { role, context });

        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Dispatch {
                role: role.to_string(),
                detail: format!("agent endpoint returned {status}: {body}"),
            });
        }

        let outcome = response.json::<AgentOutcome>().await?;
        Ok(outcome)
    }
}
