//! Agent deployment wizard
//!
//! ```text
//! Configure ──▶ Integrate ──▶ Test ──▶ Deploy
//! ```
//!
//! Moving forward requires the current step to validate. Moving back is
//! always allowed except from the first step. Submitting from the last step
//! creates the listing, hands the integration to the matching edge function
//! and starts tracking the resulting deployment.

use backend::functions::{DeployAgentRequest, ProcessLangflowRequest};
use bazaar_types::Agent;
use serde_json::Value;
use tracing::info;
use tracker::TrackingHandle;
use uuid::Uuid;

use crate::context::DashboardContext;
use crate::forms::{AgentForm, ExternalAgentForm, Validate, ValidationErrors};
use crate::routes::{authorize, Route};
use crate::{DashboardError, DashboardResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum WizardStep {
    #[default]
    Configure,
    Integrate,
    Test,
    Deploy,
}

impl WizardStep {
    pub const ALL: [WizardStep; 4] = [
        WizardStep::Configure,
        WizardStep::Integrate,
        WizardStep::Test,
        WizardStep::Deploy,
    ];

    pub fn next(self) -> Option<WizardStep> {
        match self {
            WizardStep::Configure => Some(WizardStep::Integrate),
            WizardStep::Integrate => Some(WizardStep::Test),
            WizardStep::Test => Some(WizardStep::Deploy),
            WizardStep::Deploy => None,
        }
    }

    pub fn previous(self) -> Option<WizardStep> {
        match self {
            WizardStep::Configure => None,
            WizardStep::Integrate => Some(WizardStep::Configure),
            WizardStep::Test => Some(WizardStep::Integrate),
            WizardStep::Deploy => Some(WizardStep::Test),
        }
    }

    /// 1-based position for the step indicator
    pub fn number(self) -> usize {
        self as usize + 1
    }

    pub fn title(self) -> &'static str {
        match self {
            WizardStep::Configure => "Configure",
            WizardStep::Integrate => "Integrate",
            WizardStep::Test => "Test",
            WizardStep::Deploy => "Deploy",
        }
    }
}

/// Where the agent's logic comes from
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Integration {
    /// Run on the platform from the agent's published config
    #[default]
    Hosted,
    /// Langflow export, converted by the backend
    Langflow(Value),
    /// Already running somewhere else
    External(ExternalAgentForm),
}

impl Validate for Integration {
    fn collect_errors(&self, errors: &mut ValidationErrors) {
        match self {
            Integration::Hosted => {}
            Integration::Langflow(flow) => {
                let nodes = flow
                    .pointer("/data/nodes")
                    .or_else(|| flow.get("nodes"))
                    .and_then(Value::as_array);
                match nodes {
                    Some(nodes) if !nodes.is_empty() => {}
                    Some(_) => errors.add("flow", "The flow has no nodes"),
                    None => errors.add("flow", "Not a Langflow export"),
                }
            }
            Integration::External(form) => form.collect_errors(errors),
        }
    }
}

/// Result of a submitted wizard
pub struct LaunchedDeployment {
    pub agent: Agent,
    pub deployment_id: Uuid,
    pub tracking: TrackingHandle,
}

#[derive(Debug, Clone, Default)]
pub struct DeploymentWizard {
    step: WizardStep,
    pub agent: AgentForm,
    pub integration: Integration,
    test_passed: Option<bool>,
}

impl DeploymentWizard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step(&self) -> WizardStep {
        self.step
    }

    /// Outcome of the last test run
    pub fn record_test(&mut self, passed: bool) {
        self.test_passed = Some(passed);
    }

    pub fn test_passed(&self) -> Option<bool> {
        self.test_passed
    }

    /// Check one step without moving
    pub fn validate_step(&self, step: WizardStep) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        match step {
            WizardStep::Configure => self.agent.collect_errors(&mut errors),
            WizardStep::Integrate => self.integration.collect_errors(&mut errors),
            WizardStep::Test => match self.test_passed {
                Some(true) => {}
                Some(false) => errors.add("test", "The last test run failed"),
                None => errors.add("test", "Run a test before deploying"),
            },
            WizardStep::Deploy => {
                for step in [WizardStep::Configure, WizardStep::Integrate, WizardStep::Test] {
                    if let Err(step_errors) = self.validate_step(step) {
                        for (field, messages) in step_errors.fields() {
                            for message in messages {
                                errors.add(field, message.clone());
                            }
                        }
                    }
                }
            }
        }
        errors.into_result()
    }

    /// Advance when the current step validates
    pub fn next(&mut self) -> Result<WizardStep, ValidationErrors> {
        let current = self.step();
        self.validate_step(current)?;

        let Some(next) = current.next() else {
            let mut errors = ValidationErrors::new();
            errors.add("step", "Already at the last step");
            return Err(errors);
        };

        self.step = next;
        Ok(next)
    }

    /// Go back one step; `None` on the first step
    pub fn back(&mut self) -> Option<WizardStep> {
        let previous = self.step().previous()?;
        self.step = previous;
        Some(previous)
    }

    /// Create the agent, start its deployment and begin tracking it
    pub async fn submit(&self, ctx: &DashboardContext) -> DashboardResult<LaunchedDeployment> {
        authorize(Route::CreateAgent, ctx)?;
        if self.step() != WizardStep::Deploy {
            return Err(DashboardError::Wizard(format!(
                "cannot deploy from the {} step",
                self.step().title()
            )));
        }
        self.validate_step(WizardStep::Deploy)?;

        let backend = ctx.backend();
        let new_agent = self.agent.clone().into_new_agent(ctx.user_id()?)?;
        let agent = backend.create_agent(&new_agent).await?;
        info!("DASHBOARD: Created agent {} ({})", agent.name, agent.id);

        let response = match &self.integration {
            Integration::External(form) => {
                let request = form.clone().into_request(agent.id)?;
                backend.deploy_external_agent(&request).await?
            }
            Integration::Langflow(flow) => {
                backend
                    .process_langflow(&ProcessLangflowRequest {
                        agent_id: agent.id,
                        flow: flow.clone(),
                    })
                    .await?;
                backend.deploy_agent(&self.deploy_request(ctx, agent.id)).await?
            }
            Integration::Hosted => backend.deploy_agent(&self.deploy_request(ctx, agent.id)).await?,
        };

        let tracking = ctx.deployment_tracker().start_tracking(response.deployment_id);
        Ok(LaunchedDeployment {
            agent,
            deployment_id: response.deployment_id,
            tracking,
        })
    }

    fn deploy_request(&self, ctx: &DashboardContext, agent_id: Uuid) -> DeployAgentRequest {
        DeployAgentRequest {
            agent_id,
            version_id: None,
            environment: ctx.config().environment.clone(),
        }
    }
}
