//! BACKEND - Typed client for the marketplace backend-as-a-service
//!
//! Every piece of business logic lives on the remote platform. This crate
//! is the single boundary to it:
//! - Structured data store (PostgREST-style filtered queries)
//! - Authentication (session and user retrieval)
//! - Edge functions invoked by name with a JSON body
//! - Realtime row-change subscriptions over a managed websocket

pub mod auth;
pub mod functions;
pub mod query;
pub mod realtime;
pub mod rest;
pub mod tables;

use std::sync::Arc;
use std::time::Duration;

use bazaar_config::BackendConfig;
use parking_lot::RwLock;
use reqwest::{Client, RequestBuilder};
use thiserror::Error;
use url::Url;

pub use functions::EdgeFunction;
pub use query::{Order, Query};
pub use realtime::{ChangeEvent, ChangeKind, RealtimeClient, Subscription};

/// Backend errors
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Backend returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not signed in")]
    Unauthenticated,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Realtime error: {0}")]
    Realtime(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Client for the remote backend.
///
/// Cheap to clone; clones share the HTTP connection pool and the session
/// token.
#[derive(Clone)]
pub struct BackendClient {
    http: Client,
    base_url: Url,
    anon_key: String,
    access_token: Arc<RwLock<Option<String>>>,
}

impl BackendClient {
    pub fn new(config: &BackendConfig) -> BackendResult<Self> {
        let base_url = Url::parse(&config.url)
            .map_err(|e| BackendError::Config(format!("backend url: {}", e)))?;

        let http = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;

        tracing::info!("BACKEND: Client ready for {}", base_url);

        Ok(Self {
            http,
            base_url,
            anon_key: config.anon_key.clone(),
            access_token: Arc::new(RwLock::new(None)),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn anon_key(&self) -> &str {
        &self.anon_key
    }

    /// Use `token` as the bearer for subsequent calls
    pub fn set_access_token(&self, token: Option<String>) {
        *self.access_token.write() = token;
    }

    pub fn access_token(&self) -> Option<String> {
        self.access_token.read().clone()
    }

    /// Join `path` onto the project base URL
    pub(crate) fn endpoint(&self, path: &str) -> BackendResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| BackendError::Config(format!("bad endpoint {}: {}", path, e)))
    }

    /// Attach project key and bearer token
    pub(crate) fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        let bearer = self
            .access_token()
            .unwrap_or_else(|| self.anon_key.clone());
        builder
            .header("apikey", &self.anon_key)
            .header("Authorization", format!("Bearer {}", bearer))
    }
}

/// Turn a non-success response into [`BackendError::Api`]
pub(crate) async fn check_status(response: reqwest::Response) -> BackendResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(BackendError::Api {
        status: status.as_u16(),
        message: error_message(&body),
    })
}

/// Pull a human-readable message out of an error body
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            ["message", "msg", "error_description", "error"]
                .iter()
                .find_map(|k| v.get(*k).and_then(|m| m.as_str()).map(str::to_string))
        })
        .unwrap_or_else(|| {
            if body.is_empty() {
                "Unknown error".to_string()
            } else {
                body.to_string()
            }
        })
}

/// Records request count and latency for one backend call
pub(crate) struct CallTimer {
    operation: &'static str,
    target: String,
    timer: prometheus::HistogramTimer,
}

impl CallTimer {
    pub(crate) fn start(operation: &'static str, target: &str) -> Self {
        let m = &bazaar_metrics::metrics().backend;
        m.requests.with_label_values(&[operation, target]).inc();
        Self {
            operation,
            target: target.to_string(),
            timer: m.latency.with_label_values(&[operation]).start_timer(),
        }
    }

    pub(crate) fn finish<T>(self, result: BackendResult<T>) -> BackendResult<T> {
        self.timer.observe_duration();
        if let Err(e) = &result {
            tracing::warn!("BACKEND: {} {} failed: {}", self.operation, self.target, e);
            bazaar_metrics::metrics()
                .backend
                .failures
                .with_label_values(&[self.operation, &self.target])
                .inc();
        }
        result
    }
}
