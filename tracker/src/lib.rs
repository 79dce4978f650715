//! TRACKER - Deployment Progress
//!
//! Gives the dashboard feedback while a remote, asynchronous deployment job
//! runs. The deployment itself happens on the backend; this crate only
//! polls its status row and folds each reading into a small state machine.
//!
//! # Responsibilities
//! - Poll a deployment's remote status on a fixed interval
//! - Map remote status strings to local progress
//! - Stop on success or error, fire the completion callback once
//! - Release the polling task when its handle is cancelled or dropped

pub mod poller;
pub mod progress;

use backend::BackendError;
use thiserror::Error;

pub use poller::{DeploymentTracker, StatusSource, TrackingHandle};
pub use progress::{
    DeploymentProgress, ProgressStatus, RemoteDeploymentStatus, Transition, DEFAULT_FAILURE_MESSAGE,
    PENDING_CEILING,
};

/// Tracker errors
#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("Deployment not found: {0}")]
    NotFound(String),

    #[error("Status read failed: {0}")]
    Source(String),
}

impl TrackerError {
    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            TrackerError::NotFound(_) => "not_found",
            TrackerError::Source(_) => "source",
        }
    }
}

impl From<BackendError> for TrackerError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::NotFound(what) => TrackerError::NotFound(what),
            other => TrackerError::Source(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_mapping() {
        let e: TrackerError = BackendError::NotFound("deployment 1".to_string()).into();
        assert!(matches!(e, TrackerError::NotFound(_)));
        assert_eq!(e.kind(), "not_found");

        let e: TrackerError = BackendError::Unauthenticated.into();
        assert_eq!(e.kind(), "source");
        assert_eq!(e.to_string(), "Status read failed: Not signed in");
    }
}
