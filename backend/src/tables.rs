//! Typed queries for the marketplace tables

use bazaar_types::{
    Agent, AgentLog, AgentMetric, AgentVersion, ApiKey, Deployment, HealthStatus, Review,
    Transaction, Webhook,
};
use chrono::NaiveDate;
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::query::{Order, Query};
use crate::{BackendClient, BackendError, BackendResult};

pub const AGENTS: &str = "agents";
pub const AGENT_VERSIONS: &str = "agent_versions";
pub const DEPLOYMENTS: &str = "deployments";
pub const REVIEWS: &str = "reviews";
pub const TRANSACTIONS: &str = "transactions";
pub const AGENT_METRICS: &str = "agent_metrics";
pub const API_KEYS: &str = "api_keys";
pub const WEBHOOKS: &str = "webhooks";
pub const HEALTH_STATUS: &str = "agent_health";
pub const AGENT_LOGS: &str = "agent_logs";

/// Fields a developer submits for a new listing
#[derive(Debug, Clone, Serialize)]
pub struct NewAgent {
    pub developer_id: Uuid,
    pub name: String,
    pub description: String,
    pub category: String,
    pub price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewReview {
    pub agent_id: Uuid,
    pub user_id: Uuid,
    pub rating: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Key generation happens server-side; only the label is sent
#[derive(Debug, Clone, Serialize)]
pub struct NewApiKey {
    pub developer_id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewWebhook {
    pub developer_id: Uuid,
    pub url: String,
    pub events: Vec<String>,
    pub active: bool,
}

impl BackendClient {
    pub async fn agent(&self, id: Uuid) -> BackendResult<Agent> {
        self.maybe_single(&Query::table(AGENTS).eq("id", id))
            .await?
            .ok_or_else(|| BackendError::NotFound(format!("agent {}", id)))
    }

    pub async fn agents_for_developer(&self, developer_id: Uuid) -> BackendResult<Vec<Agent>> {
        let query = Query::table(AGENTS)
            .eq("developer_id", developer_id)
            .order("created_at", Order::Desc);
        self.select(&query).await
    }

    /// Published listings, optionally narrowed by category and a name search
    pub async fn browse_agents(
        &self,
        category: Option<&str>,
        search: Option<&str>,
        page: usize,
        page_size: usize,
    ) -> BackendResult<(Vec<Agent>, Option<u64>)> {
        let mut query = Query::table(AGENTS).eq("status", "published");
        if let Some(category) = category {
            query = query.eq("category", category);
        }
        if let Some(search) = search.filter(|s| !s.trim().is_empty()) {
            query = query.ilike("name", &format!("*{}*", search.trim()));
        }
        let query = query
            .order("downloads", Order::Desc)
            .page(page, page_size)
            .with_count();
        self.select_with_count(&query).await
    }

    pub async fn create_agent(&self, agent: &NewAgent) -> BackendResult<Agent> {
        self.insert(AGENTS, agent).await
    }

    pub async fn agent_versions(&self, agent_id: Uuid) -> BackendResult<Vec<AgentVersion>> {
        let query = Query::table(AGENT_VERSIONS)
            .eq("agent_id", agent_id)
            .order("created_at", Order::Desc);
        self.select(&query).await
    }

    pub async fn deployment(&self, id: Uuid) -> BackendResult<Deployment> {
        self.maybe_single(&Query::table(DEPLOYMENTS).eq("id", id))
            .await?
            .ok_or_else(|| BackendError::NotFound(format!("deployment {}", id)))
    }

    pub async fn deployments_for_agent(&self, agent_id: Uuid) -> BackendResult<Vec<Deployment>> {
        let query = Query::table(DEPLOYMENTS)
            .eq("agent_id", agent_id)
            .order("created_at", Order::Desc);
        self.select(&query).await
    }

    pub async fn reviews_for_agent(&self, agent_id: Uuid, limit: usize) -> BackendResult<Vec<Review>> {
        let query = Query::table(REVIEWS)
            .eq("agent_id", agent_id)
            .order("created_at", Order::Desc)
            .limit(limit);
        self.select(&query).await
    }

    pub async fn reviews_by_user(&self, user_id: Uuid) -> BackendResult<Vec<Review>> {
        let query = Query::table(REVIEWS)
            .eq("user_id", user_id)
            .order("created_at", Order::Desc);
        self.select(&query).await
    }

    pub async fn submit_review(&self, review: &NewReview) -> BackendResult<Review> {
        self.insert(REVIEWS, review).await
    }

    pub async fn transactions_for_user(&self, user_id: Uuid) -> BackendResult<Vec<Transaction>> {
        let query = Query::table(TRANSACTIONS)
            .eq("user_id", user_id)
            .order("created_at", Order::Desc);
        self.select(&query).await
    }

    pub async fn transactions_for_agents(&self, agent_ids: &[Uuid]) -> BackendResult<Vec<Transaction>> {
        if agent_ids.is_empty() {
            return Ok(Vec::new());
        }
        let query = Query::table(TRANSACTIONS)
            .in_list("agent_id", agent_ids)
            .order("created_at", Order::Desc);
        self.select(&query).await
    }

    /// Daily aggregates for `agent_id` between `from` and `to`, inclusive
    pub async fn agent_metrics(
        &self,
        agent_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> BackendResult<Vec<AgentMetric>> {
        let query = Query::table(AGENT_METRICS)
            .eq("agent_id", agent_id)
            .gte("date", from)
            .lte("date", to)
            .order("date", Order::Asc);
        self.select(&query).await
    }

    pub async fn api_keys(&self, developer_id: Uuid) -> BackendResult<Vec<ApiKey>> {
        let query = Query::table(API_KEYS)
            .eq("developer_id", developer_id)
            .eq("revoked", false)
            .order("created_at", Order::Desc);
        self.select(&query).await
    }

    pub async fn create_api_key(&self, key: &NewApiKey) -> BackendResult<ApiKey> {
        self.insert(API_KEYS, key).await
    }

    pub async fn revoke_api_key(&self, id: Uuid) -> BackendResult<()> {
        let _: Vec<ApiKey> = self
            .update(&Query::table(API_KEYS).eq("id", id), &json!({ "revoked": true }))
            .await?;
        Ok(())
    }

    pub async fn webhooks(&self, developer_id: Uuid) -> BackendResult<Vec<Webhook>> {
        let query = Query::table(WEBHOOKS)
            .eq("developer_id", developer_id)
            .order("created_at", Order::Desc);
        self.select(&query).await
    }

    pub async fn create_webhook(&self, webhook: &NewWebhook) -> BackendResult<Webhook> {
        self.insert(WEBHOOKS, webhook).await
    }

    pub async fn delete_webhook(&self, id: Uuid) -> BackendResult<()> {
        self.delete(&Query::table(WEBHOOKS).eq("id", id)).await
    }

    pub async fn latest_health(&self, agent_id: Uuid) -> BackendResult<Option<HealthStatus>> {
        let query = Query::table(HEALTH_STATUS)
            .eq("agent_id", agent_id)
            .order("checked_at", Order::Desc);
        self.maybe_single(&query).await
    }

    pub async fn recent_logs(&self, agent_id: Uuid, limit: usize) -> BackendResult<Vec<AgentLog>> {
        let query = Query::table(AGENT_LOGS)
            .eq("agent_id", agent_id)
            .order("created_at", Order::Desc)
            .limit(limit);
        self.select(&query).await
    }
}
