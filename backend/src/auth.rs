//! Session and user retrieval
//!
//! Credentials are never stored here; the backend issues the session and
//! this client only keeps the access token for bearer auth.

use bazaar_types::{Session, User};
use serde_json::json;
use tracing::info;

use crate::{check_status, BackendClient, BackendError, BackendResult, CallTimer};

impl BackendClient {
    /// Exchange email and password for a session
    pub async fn sign_in_with_password(&self, email: &str, password: &str) -> BackendResult<Session> {
        let timer = CallTimer::start("sign_in", "auth");
        let result = self.do_sign_in(email, password).await;
        timer.finish(result)
    }

    async fn do_sign_in(&self, email: &str, password: &str) -> BackendResult<Session> {
        let mut url = self.endpoint("auth/v1/token")?;
        url.query_pairs_mut().append_pair("grant_type", "password");

        let response = self
            .http
            .post(url)
            .header("apikey", self.anon_key())
            .json(&json!({ "email": email, "password": password }))
            .send()
            .await?;

        let session: Session = check_status(response).await?.json().await?;
        self.set_access_token(Some(session.access_token.clone()));

        info!("Signed in as {}", session.user.id);
        Ok(session)
    }

    /// User behind the current access token
    pub async fn get_user(&self) -> BackendResult<User> {
        if self.access_token().is_none() {
            return Err(BackendError::Unauthenticated);
        }

        let timer = CallTimer::start("get_user", "auth");
        let result = self.do_get_user().await;
        timer.finish(result)
    }

    async fn do_get_user(&self) -> BackendResult<User> {
        let url = self.endpoint("auth/v1/user")?;
        let response = self.authorize(self.http.get(url)).send().await?;
        let response = match check_status(response).await {
            Err(BackendError::Api { status: 401, .. }) => return Err(BackendError::Unauthenticated),
            other => other?,
        };
        Ok(response.json::<User>().await?)
    }

    /// Drop the session locally and revoke it remotely
    pub async fn sign_out(&self) -> BackendResult<()> {
        if self.access_token().is_none() {
            return Ok(());
        }

        let url = self.endpoint("auth/v1/logout")?;
        let response = self.authorize(self.http.post(url)).send().await;
        self.set_access_token(None);

        // The local session is gone either way; a failed revoke is only logged.
        match response {
            Ok(r) => {
                if let Err(e) = check_status(r).await {
                    tracing::warn!("Remote sign-out failed: {}", e);
                }
            }
            Err(e) => tracing::warn!("Remote sign-out failed: {}", e),
        }

        info!("Signed out");
        Ok(())
    }
}
