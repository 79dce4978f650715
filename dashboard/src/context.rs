//! Explicit dependencies for every screen

use std::sync::Arc;

use backend::{BackendClient, RealtimeClient};
use bazaar_config::BazaarConfig;
use bazaar_types::{Role, Session, User};
use tracing::{info, warn};
use tracker::DeploymentTracker;
use uuid::Uuid;

use crate::{DashboardError, DashboardResult};

/// Session, role and clients shared by the screens of one signed-in user.
///
/// Cheap to clone; clones share the underlying HTTP client and token.
#[derive(Clone)]
pub struct DashboardContext {
    session: Option<Session>,
    backend: BackendClient,
    config: Arc<BazaarConfig>,
}

impl DashboardContext {
    /// Context with nobody signed in
    pub fn anonymous(backend: BackendClient, config: Arc<BazaarConfig>) -> Self {
        Self {
            session: None,
            backend,
            config,
        }
    }

    pub fn new(backend: BackendClient, config: BazaarConfig) -> Self {
        Self::anonymous(backend, Arc::new(config))
    }

    /// Validate `config` and build the backend client from it
    pub fn from_config(config: BazaarConfig) -> DashboardResult<Self> {
        config.validate()?;
        let backend = BackendClient::new(&config.backend)?;
        Ok(Self::new(backend, config))
    }

    pub async fn sign_in(&mut self, email: &str, password: &str) -> DashboardResult<&Session> {
        let session = self.backend.sign_in_with_password(email, password).await?;
        info!("DASHBOARD: Signed in as {} ({})", session.user.id, session.user.role().as_str());
        Ok(self.session.insert(session))
    }

    /// Attach a session obtained elsewhere, e.g. restored from storage
    pub fn with_session(mut self, session: Session) -> Self {
        self.backend.set_access_token(Some(session.access_token.clone()));
        self.session = Some(session);
        self
    }

    /// Confirm the stored token is still accepted and refresh the user record
    pub async fn refresh_user(&mut self) -> DashboardResult<&User> {
        if self.session.is_none() {
            return Err(DashboardError::Unauthenticated);
        }

        match self.backend.get_user().await {
            Ok(user) => {
                let session = self.session.as_mut().ok_or(DashboardError::Unauthenticated)?;
                session.user = user;
                Ok(&session.user)
            }
            Err(backend::BackendError::Unauthenticated) => {
                warn!("Session expired, signing out locally");
                self.session = None;
                self.backend.set_access_token(None);
                Err(DashboardError::Unauthenticated)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn sign_out(&mut self) -> DashboardResult<()> {
        self.backend.sign_out().await?;
        self.session = None;
        Ok(())
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn user(&self) -> DashboardResult<&User> {
        self.session
            .as_ref()
            .map(|s| &s.user)
            .ok_or(DashboardError::Unauthenticated)
    }

    pub fn user_id(&self) -> DashboardResult<Uuid> {
        self.user().map(|u| u.id)
    }

    /// Role of the signed-in user, `None` when signed out
    pub fn role(&self) -> Option<Role> {
        self.session.as_ref().map(|s| s.user.role())
    }

    pub fn backend(&self) -> &BackendClient {
        &self.backend
    }

    pub fn config(&self) -> &BazaarConfig {
        &self.config
    }

    /// Tracker polling this context's backend
    pub fn deployment_tracker(&self) -> DeploymentTracker<BackendClient> {
        DeploymentTracker::new(Arc::new(self.backend.clone()), self.config.tracker.clone())
    }

    /// Open the realtime channel with the current token
    pub fn realtime(&self) -> DashboardResult<RealtimeClient> {
        Ok(RealtimeClient::connect(&self.backend, &self.config.realtime)?)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::context;
    use super::*;
    use bazaar_config::BackendConfig;

    #[test]
    fn test_role_follows_session() {
        assert_eq!(context(None).role(), None);
        assert!(matches!(context(None).user_id(), Err(DashboardError::Unauthenticated)));

        let ctx = context(Some(Role::Developer));
        assert_eq!(ctx.role(), Some(Role::Developer));
        assert_eq!(ctx.backend().access_token().as_deref(), Some("token"));
    }

    #[test]
    fn test_from_config_rejects_invalid_config() {
        let mut config = BazaarConfig::default();
        config.backend = BackendConfig {
            url: "https://project.example.co".to_string(),
            anon_key: "anon".to_string(),
            request_timeout_ms: 1000,
        };
        assert!(DashboardContext::from_config(config.clone()).is_ok());

        config.realtime.heartbeat_interval_ms = 0;
        assert!(matches!(
            DashboardContext::from_config(config.clone()),
            Err(DashboardError::Config(_))
        ));

        config.realtime.heartbeat_interval_ms = 30_000;
        config.tracker.max_pending_percent = 200;
        assert!(matches!(
            DashboardContext::from_config(config),
            Err(DashboardError::Config(_))
        ));
    }
}
