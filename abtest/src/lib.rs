//! ABTEST - Traffic Allocator
//!
//! Holds the versions of an A/B test and the share of simulated traffic
//! routed to each one. Versions live only for the lifetime of the panel;
//! nothing here is persisted.
//!
//! # Responsibilities
//! - Keep shares summing to exactly 100
//! - Keep between 2 and 5 versions
//! - Protect the control version from removal and deactivation
//! - Rebalance proportionally when a share changes or a version comes or goes

pub mod allocator;
pub mod version;

use thiserror::Error;
use uuid::Uuid;

pub use allocator::TrafficAllocator;
pub use version::{TestVersion, VersionMetrics, VersionStatus};

/// Rejected allocator operations. The message is shown to the user as is.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocationError {
    #[error("Version {0} not found")]
    UnknownVersion(Uuid),

    #[error("You can test at most {max} versions at once")]
    TooManyVersions { max: usize },

    #[error("An A/B test needs at least {min} versions")]
    TooFewVersions { min: usize },

    #[error("The control version cannot be removed or deactivated")]
    ControlProtected,

    #[error("Invalid test setup: {0}")]
    InvalidSetup(String),
}

impl AllocationError {
    /// Short label for metrics
    pub fn reason(&self) -> &'static str {
        match self {
            AllocationError::UnknownVersion(_) => "unknown_version",
            AllocationError::TooManyVersions { .. } => "too_many_versions",
            AllocationError::TooFewVersions { .. } => "too_few_versions",
            AllocationError::ControlProtected => "control_protected",
            AllocationError::InvalidSetup(_) => "invalid_setup",
        }
    }
}
