//! Bazaar Types - Shared row types for the agent marketplace
//!
//! Every struct here mirrors a table owned by the remote backend. Field
//! names are the remote column names; optional or unexpected columns fall
//! back to defaults instead of failing the whole read.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Dashboard role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Developer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Developer => "developer",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "developer" => Ok(Role::Developer),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Marketplace listing status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Draft,
    Published,
    Archived,
}

/// Marketplace listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub developer_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub status: AgentStatus,
    #[serde(default)]
    pub rating: f64,
    #[serde(default)]
    pub downloads: u64,
    #[serde(default)]
    pub api_endpoint: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Published version of an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentVersion {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub version: String,
    #[serde(default)]
    pub changelog: Option<String>,
    #[serde(default)]
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Remote deployment lifecycle string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentState {
    #[default]
    Pending,
    Deploying,
    Running,
    Failed,
    Stopped,
    /// Any status string this client does not know about
    #[serde(other)]
    Unknown,
}

impl DeploymentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentState::Pending => "pending",
            DeploymentState::Deploying => "deploying",
            DeploymentState::Running => "running",
            DeploymentState::Failed => "failed",
            DeploymentState::Stopped => "stopped",
            DeploymentState::Unknown => "unknown",
        }
    }
}

/// Deployment record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: Uuid,
    pub agent_id: Uuid,
    #[serde(default)]
    pub version_id: Option<Uuid>,
    #[serde(default)]
    pub status: DeploymentState,
    /// Remote-reported progress, 0-100
    #[serde(default)]
    pub progress: Option<u8>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub endpoint_url: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Buyer review of an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub user_id: Uuid,
    pub rating: u8,
    #[serde(default)]
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    #[default]
    Pending,
    Completed,
    Refunded,
    Failed,
}

/// Purchase of an agent by a buyer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub agent_id: Uuid,
    pub amount: f64,
    #[serde(default)]
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
}

/// Daily aggregate computed server-side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMetric {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub date: NaiveDate,
    #[serde(default)]
    pub requests: u64,
    #[serde(default)]
    pub errors: u64,
    #[serde(default)]
    pub avg_latency_ms: f64,
    #[serde(default)]
    pub revenue: f64,
}

/// Developer API key. Only the prefix is ever readable after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: Uuid,
    pub developer_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub key_prefix: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub revoked: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Webhook {
    pub id: Uuid,
    pub developer_id: Uuid,
    pub url: String,
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default)]
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Down,
    #[default]
    #[serde(other)]
    Unknown,
}

/// Live health probe result, pushed over the realtime channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub id: Uuid,
    pub agent_id: Uuid,
    #[serde(default)]
    pub status: HealthState,
    pub checked_at: DateTime<Utc>,
    #[serde(default)]
    pub latency_ms: Option<u64>,
}

/// Log severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentLog {
    pub id: Uuid,
    pub agent_id: Uuid,
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default)]
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Authenticated user as returned by the auth endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub user_metadata: serde_json::Value,
}

impl User {
    /// Role stored in user metadata; buyers are the default
    pub fn role(&self) -> Role {
        self.user_metadata
            .get("role")
            .and_then(|r| r.as_str())
            .and_then(|r| r.parse().ok())
            .unwrap_or(Role::User)
    }
}

/// Auth session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    pub user: User,
}
