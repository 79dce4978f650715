//! Edge function invocation
//!
//! Edge functions are opaque: a name, a JSON body in, a JSON body out.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::{check_status, BackendClient, BackendError, BackendResult, CallTimer};

/// Known edge functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeFunction {
    /// Converts an uploaded Langflow export into an agent config
    ProcessLangflow,
    /// Starts a deployment for a published agent version
    DeployAgent,
    /// Registers an agent hosted outside the platform
    DeployExternalAgent,
}

impl EdgeFunction {
    pub fn name(&self) -> &'static str {
        match self {
            EdgeFunction::ProcessLangflow => "process-langflow",
            EdgeFunction::DeployAgent => "deploy-agent",
            EdgeFunction::DeployExternalAgent => "deploy-external-agent",
        }
    }
}

impl std::fmt::Display for EdgeFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Body for `deploy-agent`
#[derive(Debug, Clone, Serialize)]
pub struct DeployAgentRequest {
    #[serde(rename = "agentId")]
    pub agent_id: Uuid,
    #[serde(rename = "versionId", skip_serializing_if = "Option::is_none")]
    pub version_id: Option<Uuid>,
    pub environment: String,
}

/// Body for `deploy-external-agent`
#[derive(Debug, Clone, Serialize)]
pub struct DeployExternalAgentRequest {
    #[serde(rename = "agentId")]
    pub agent_id: Uuid,
    #[serde(rename = "endpointUrl")]
    pub endpoint_url: String,
    #[serde(rename = "authHeader", skip_serializing_if = "Option::is_none")]
    pub auth_header: Option<String>,
}

/// Body for `process-langflow`
#[derive(Debug, Clone, Serialize)]
pub struct ProcessLangflowRequest {
    #[serde(rename = "agentId")]
    pub agent_id: Uuid,
    pub flow: Value,
}

/// Reply from either deploy function
#[derive(Debug, Clone, Deserialize)]
pub struct DeployResponse {
    #[serde(rename = "deploymentId")]
    pub deployment_id: Uuid,
    #[serde(default)]
    pub status: Option<String>,
}

impl BackendClient {
    /// Invoke `function` with `body`
    pub async fn invoke<B, R>(&self, function: EdgeFunction, body: &B) -> BackendResult<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let timer = CallTimer::start("invoke", function.name());
        let result = self.do_invoke(function, body).await;
        timer.finish(result)
    }

    async fn do_invoke<B, R>(&self, function: EdgeFunction, body: &B) -> BackendResult<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = self.endpoint(&format!("functions/v1/{}", function.name()))?;
        let response = self.authorize(self.http.post(url)).json(body).send().await?;
        let value: Value = check_status(response).await?.json().await?;

        // Functions report handled failures as 200 with an `error` field.
        if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .or_else(|| error.as_str())
                .unwrap_or("Unknown error")
                .to_string();
            return Err(BackendError::Api { status: 200, message });
        }

        serde_json::from_value(value).map_err(|e| BackendError::InvalidResponse(e.to_string()))
    }

    /// Start a deployment and return the id to track
    pub async fn deploy_agent(&self, request: &DeployAgentRequest) -> BackendResult<DeployResponse> {
        info!("Requesting deployment of agent {}", request.agent_id);
        self.invoke(EdgeFunction::DeployAgent, request).await
    }

    pub async fn deploy_external_agent(
        &self,
        request: &DeployExternalAgentRequest,
    ) -> BackendResult<DeployResponse> {
        info!("Registering external agent {} at {}", request.agent_id, request.endpoint_url);
        self.invoke(EdgeFunction::DeployExternalAgent, request).await
    }

    /// Hand a Langflow export to the backend; the processed config comes back as-is
    pub async fn process_langflow(&self, request: &ProcessLangflowRequest) -> BackendResult<Value> {
        self.invoke(EdgeFunction::ProcessLangflow, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_names() {
        assert_eq!(EdgeFunction::ProcessLangflow.name(), "process-langflow");
        assert_eq!(EdgeFunction::DeployAgent.name(), "deploy-agent");
        assert_eq!(EdgeFunction::DeployExternalAgent.to_string(), "deploy-external-agent");
    }

    #[test]
    fn test_deploy_request_shape() {
        let request = DeployAgentRequest {
            agent_id: Uuid::nil(),
            version_id: None,
            environment: "production".to_string(),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert!(value.get("agentId").is_some());
        assert!(value.get("versionId").is_none());
        assert_eq!(value["environment"], "production");
    }
}
