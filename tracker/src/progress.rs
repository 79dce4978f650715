//! Deployment progress state machine
//!
//! ```text
//! idle ──start──▶ processing ──running──▶ success
//!                  │    ▲
//!                  │    └── deploying (percent only grows, capped below 100)
//!                  └──────── failed ────▶ error
//! ```
//!
//! `success` and `error` are terminal; nothing moves them again.

use backend::{ChangeEvent, ChangeKind};
use bazaar_types::{Deployment, DeploymentState};

/// Text shown when the backend fails a deployment without saying why
pub const DEFAULT_FAILURE_MESSAGE: &str = "Deployment failed";

/// Highest percent a deployment still in progress can show
pub const PENDING_CEILING: u8 = 99;

/// Local view state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressStatus {
    Idle,
    Processing,
    Success,
    Error,
}

/// What a single remote status reading did to the local state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    Progressed,
    Completed,
    Failed,
}

impl Transition {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Transition::Completed | Transition::Failed)
    }
}

/// Remote fields the tracker reads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDeploymentStatus {
    pub state: DeploymentState,
    pub progress: Option<u8>,
    pub error_message: Option<String>,
}

impl RemoteDeploymentStatus {
    pub fn deploying(progress: Option<u8>) -> Self {
        Self {
            state: DeploymentState::Deploying,
            progress,
            error_message: None,
        }
    }

    pub fn running() -> Self {
        Self {
            state: DeploymentState::Running,
            progress: Some(100),
            error_message: None,
        }
    }

    pub fn failed(message: Option<&str>) -> Self {
        Self {
            state: DeploymentState::Failed,
            progress: None,
            error_message: message.map(str::to_string),
        }
    }

    /// Status carried by a realtime update of a `deployments` row
    pub fn from_change(event: &ChangeEvent) -> Option<Self> {
        if event.kind == ChangeKind::Delete {
            return None;
        }
        event.record_as::<Deployment>().map(|d| Self::from(&d))
    }
}

impl From<&Deployment> for RemoteDeploymentStatus {
    fn from(deployment: &Deployment) -> Self {
        Self {
            state: deployment.status,
            progress: deployment.progress,
            error_message: deployment.error_message.clone(),
        }
    }
}

/// Progress of one deployment as the dashboard shows it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentProgress {
    pub status: ProgressStatus,
    /// 0-100
    pub percent: u8,
    pub error_message: Option<String>,
}

impl Default for DeploymentProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl DeploymentProgress {
    pub fn new() -> Self {
        Self {
            status: ProgressStatus::Idle,
            percent: 0,
            error_message: None,
        }
    }

    /// Deployment action triggered; waiting on the remote job
    pub fn begin(&mut self) {
        if self.status == ProgressStatus::Idle {
            self.status = ProgressStatus::Processing;
            self.percent = 0;
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, ProgressStatus::Success | ProgressStatus::Error)
    }

    /// Fold one remote reading into the local state.
    ///
    /// `max_pending` caps the percent shown while the job is still deploying;
    /// it is itself held to [`PENDING_CEILING`].
    pub fn apply(&mut self, remote: &RemoteDeploymentStatus, max_pending: u8) -> Transition {
        if self.is_terminal() {
            return Transition::Unchanged;
        }

        match remote.state {
            DeploymentState::Running => {
                self.status = ProgressStatus::Success;
                self.percent = 100;
                self.error_message = None;
                Transition::Completed
            }
            DeploymentState::Failed => {
                self.status = ProgressStatus::Error;
                self.error_message = Some(
                    remote
                        .error_message
                        .clone()
                        .filter(|m| !m.trim().is_empty())
                        .unwrap_or_else(|| DEFAULT_FAILURE_MESSAGE.to_string()),
                );
                Transition::Failed
            }
            DeploymentState::Deploying => {
                let cap = max_pending.min(PENDING_CEILING);
                let reported = remote.progress.unwrap_or(self.percent).min(cap);
                let percent = self.percent.max(reported);
                let changed = self.status != ProgressStatus::Processing || percent != self.percent;

                self.status = ProgressStatus::Processing;
                self.percent = percent;

                if changed {
                    Transition::Progressed
                } else {
                    Transition::Unchanged
                }
            }
            DeploymentState::Pending | DeploymentState::Stopped | DeploymentState::Unknown => {
                Transition::Unchanged
            }
        }
    }
}
