//! DASHBOARD - Marketplace Dashboard Core
//!
//! Everything the dashboard does short of drawing pixels. Screens receive a
//! [`DashboardContext`] explicitly; there is no global session or client.
//!
//! # Responsibilities
//! - Hold the signed-in session, role and backend client
//! - Gate routes by role
//! - Validate forms and drive the agent deployment wizard
//! - Load and shape data for the overview and analytics screens
//! - Format money, counts and percentages for display
//! - Filter stored and live agent logs

pub mod context;
pub mod format;
pub mod forms;
pub mod logs;
pub mod routes;
pub mod screens;
pub mod wizard;

use abtest::AllocationError;
use backend::BackendError;
use bazaar_config::ConfigError;
use bazaar_types::Role;
use thiserror::Error;

pub use context::DashboardContext;
pub use forms::{Validate, ValidationErrors};
pub use logs::{LiveLogBuffer, LiveLogs, LogFilter};
pub use routes::{authorize, Access, Route};
pub use wizard::{DeploymentWizard, Integration, WizardStep};

/// Dashboard errors, surfaced to the user as notices
#[derive(Error, Debug)]
pub enum DashboardError {
    #[error("Please sign in to continue")]
    Unauthenticated,

    #[error("{route} is not available to {} accounts", .role.as_str())]
    Forbidden { route: String, role: Role },

    #[error("Page not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Validation(#[from] ValidationErrors),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error("Wizard error: {0}")]
    Wizard(String),

    #[error("{0}")]
    Rejected(String),
}

pub type DashboardResult<T> = Result<T, DashboardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forbidden_notice() {
        let e = DashboardError::Forbidden {
            route: "/developer/agents".to_string(),
            role: Role::User,
        };
        assert_eq!(e.to_string(), "/developer/agents is not available to user accounts");
    }
}
