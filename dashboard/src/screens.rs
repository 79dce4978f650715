//! Data loaders for the dashboard screens
//!
//! Each loader checks the route first, then reads what the screen shows and
//! folds it into a view model. Aggregation here is display-level only; the
//! backend owns the real numbers.

use std::collections::HashMap;

use abtest::TrafficAllocator;
use bazaar_types::{
    Agent, AgentMetric, AgentStatus, ApiKey, Deployment, DeploymentState, HealthStatus, Review,
    Transaction, TransactionStatus, Webhook,
};
use chrono::{Duration, NaiveDate, Utc};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::context::DashboardContext;
use crate::format::{self, ChartPoint, MetricSeries};
use crate::forms::{ApiKeyForm, ReviewForm, WebhookForm};
use crate::routes::{authorize, Route};
use crate::{DashboardError, DashboardResult};

/// Headline numbers on the developer overview
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeveloperStats {
    pub total_agents: usize,
    pub published_agents: usize,
    pub running_deployments: usize,
    pub total_downloads: u64,
    pub total_revenue: f64,
    pub average_rating: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeveloperOverview {
    pub agents: Vec<Agent>,
    /// Latest deployment per agent
    pub deployments: HashMap<Uuid, Deployment>,
    pub recent_sales: Vec<Transaction>,
    pub stats: DeveloperStats,
}

impl DeveloperOverview {
    pub fn revenue_label(&self) -> String {
        format::currency(self.stats.total_revenue)
    }

    pub fn downloads_label(&self) -> String {
        format::compact(self.stats.total_downloads)
    }
}

pub async fn developer_overview(ctx: &DashboardContext) -> DashboardResult<DeveloperOverview> {
    authorize(Route::DeveloperOverview, ctx)?;
    let backend = ctx.backend();
    let developer_id = ctx.user_id()?;

    let agents = backend.agents_for_developer(developer_id).await?;
    let agent_ids: Vec<Uuid> = agents.iter().map(|a| a.id).collect();

    let mut deployments = HashMap::new();
    for agent in &agents {
        // Rows come newest first
        if let Some(latest) = backend.deployments_for_agent(agent.id).await?.into_iter().next() {
            deployments.insert(agent.id, latest);
        }
    }

    let sales = backend.transactions_for_agents(&agent_ids).await?;
    let stats = developer_stats(&agents, &deployments, &sales);
    debug!("Developer overview: {} agents, {} sales", stats.total_agents, sales.len());

    Ok(DeveloperOverview {
        agents,
        deployments,
        recent_sales: sales.into_iter().take(10).collect(),
        stats,
    })
}

fn developer_stats(
    agents: &[Agent],
    deployments: &HashMap<Uuid, Deployment>,
    sales: &[Transaction],
) -> DeveloperStats {
    let rated: Vec<f64> = agents.iter().map(|a| a.rating).filter(|r| *r > 0.0).collect();

    DeveloperStats {
        total_agents: agents.len(),
        published_agents: agents.iter().filter(|a| a.status == AgentStatus::Published).count(),
        running_deployments: deployments
            .values()
            .filter(|d| d.status == DeploymentState::Running)
            .count(),
        total_downloads: agents.iter().map(|a| a.downloads).sum(),
        total_revenue: completed_total(sales),
        average_rating: if rated.is_empty() {
            0.0
        } else {
            rated.iter().sum::<f64>() / rated.len() as f64
        },
    }
}

fn completed_total(transactions: &[Transaction]) -> f64 {
    transactions
        .iter()
        .filter(|t| t.status == TransactionStatus::Completed)
        .map(|t| t.amount)
        .sum()
}

#[derive(Debug, Clone, Serialize)]
pub struct UserOverview {
    pub purchases: Vec<Transaction>,
    pub reviews: Vec<Review>,
    pub total_spent: f64,
}

impl UserOverview {
    pub fn spent_label(&self) -> String {
        format::currency(self.total_spent)
    }

    /// Purchased agents the user has not reviewed yet
    pub fn unreviewed_agents(&self) -> Vec<Uuid> {
        let mut pending: Vec<Uuid> = self
            .purchases
            .iter()
            .filter(|p| p.status == TransactionStatus::Completed)
            .map(|p| p.agent_id)
            .filter(|id| !self.reviews.iter().any(|r| r.agent_id == *id))
            .collect();
        pending.sort();
        pending.dedup();
        pending
    }
}

pub async fn user_overview(ctx: &DashboardContext) -> DashboardResult<UserOverview> {
    authorize(Route::UserOverview, ctx)?;
    let backend = ctx.backend();
    let user_id = ctx.user_id()?;

    let purchases = backend.transactions_for_user(user_id).await?;
    let reviews = backend.reviews_by_user(user_id).await?;

    Ok(UserOverview {
        total_spent: completed_total(&purchases),
        purchases,
        reviews,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentAnalytics {
    pub agent: Agent,
    pub metrics: Vec<AgentMetric>,
    pub health: Option<HealthStatus>,
    pub requests: Vec<ChartPoint>,
    pub error_rate: Vec<ChartPoint>,
    pub latency: Vec<ChartPoint>,
    pub revenue: Vec<ChartPoint>,
    pub total_requests: u64,
    pub overall_error_rate: f64,
}

/// Longest analytics window a screen may ask for
pub const MAX_ANALYTICS_DAYS: u32 = 365;

/// First and last day of a `days`-long window ending on `to`.
///
/// `days` is held to `1..=MAX_ANALYTICS_DAYS`.
pub fn analytics_window(to: NaiveDate, days: u32) -> (NaiveDate, NaiveDate) {
    let span = i64::from(days.clamp(1, MAX_ANALYTICS_DAYS)) - 1;
    let from = to.checked_sub_signed(Duration::days(span)).unwrap_or(NaiveDate::MIN);
    (from, to)
}

/// Metrics for the last `days` days, including today
pub async fn agent_analytics(
    ctx: &DashboardContext,
    agent_id: Uuid,
    days: u32,
) -> DashboardResult<AgentAnalytics> {
    authorize(Route::AgentAnalytics(agent_id), ctx)?;
    let backend = ctx.backend();

    let agent = owned_agent(ctx, agent_id).await?;
    let (from, to) = analytics_window(Utc::now().date_naive(), days);
    let metrics = backend.agent_metrics(agent_id, from, to).await?;
    let health = backend.latest_health(agent_id).await?;

    let total_requests: u64 = metrics.iter().map(|m| m.requests).sum();
    let total_errors: u64 = metrics.iter().map(|m| m.errors).sum();

    Ok(AgentAnalytics {
        requests: format::series(&metrics, MetricSeries::Requests),
        error_rate: format::series(&metrics, MetricSeries::ErrorRate),
        latency: format::series(&metrics, MetricSeries::Latency),
        revenue: format::series(&metrics, MetricSeries::Revenue),
        overall_error_rate: format::ratio_percent(total_errors, total_requests),
        total_requests,
        agent,
        metrics,
        health,
    })
}

/// A/B panel for one of the developer's agents, seeded with sample versions
pub async fn ab_test_panel(ctx: &DashboardContext, agent_id: Uuid) -> DashboardResult<TrafficAllocator> {
    authorize(Route::AbTesting(agent_id), ctx)?;
    owned_agent(ctx, agent_id).await?;
    Ok(TrafficAllocator::with_sample_data(ctx.config().allocator.clone())?)
}

pub async fn agent_deployments(ctx: &DashboardContext, agent_id: Uuid) -> DashboardResult<Vec<Deployment>> {
    authorize(Route::AgentDeployments(agent_id), ctx)?;
    owned_agent(ctx, agent_id).await?;
    Ok(ctx.backend().deployments_for_agent(agent_id).await?)
}

pub async fn api_keys(ctx: &DashboardContext) -> DashboardResult<Vec<ApiKey>> {
    authorize(Route::ApiKeys, ctx)?;
    Ok(ctx.backend().api_keys(ctx.user_id()?).await?)
}

pub async fn create_api_key(ctx: &DashboardContext, form: ApiKeyForm) -> DashboardResult<ApiKey> {
    authorize(Route::ApiKeys, ctx)?;
    let key = form.into_new_api_key(ctx.user_id()?)?;
    Ok(ctx.backend().create_api_key(&key).await?)
}

pub async fn webhooks(ctx: &DashboardContext) -> DashboardResult<Vec<Webhook>> {
    authorize(Route::Webhooks, ctx)?;
    Ok(ctx.backend().webhooks(ctx.user_id()?).await?)
}

pub async fn create_webhook(ctx: &DashboardContext, form: WebhookForm) -> DashboardResult<Webhook> {
    authorize(Route::Webhooks, ctx)?;
    let webhook = form.into_new_webhook(ctx.user_id()?)?;
    Ok(ctx.backend().create_webhook(&webhook).await?)
}

/// Review an agent the user has bought
pub async fn submit_review(ctx: &DashboardContext, agent_id: Uuid, form: ReviewForm) -> DashboardResult<Review> {
    authorize(Route::MyReviews, ctx)?;
    let user_id = ctx.user_id()?;
    let review = form.into_new_review(agent_id, user_id)?;

    let purchased = ctx
        .backend()
        .transactions_for_user(user_id)
        .await?
        .iter()
        .any(|t| t.agent_id == agent_id && t.status == TransactionStatus::Completed);
    if !purchased {
        return Err(DashboardError::Rejected("Only buyers of this agent can review it".to_string()));
    }

    Ok(ctx.backend().submit_review(&review).await?)
}

/// Agent by id, refused unless it belongs to the signed-in developer
async fn owned_agent(ctx: &DashboardContext, agent_id: Uuid) -> DashboardResult<Agent> {
    let agent = ctx.backend().agent(agent_id).await?;
    if agent.developer_id != ctx.user_id()? {
        return Err(DashboardError::NotFound(format!("agent {}", agent_id)));
    }
    Ok(agent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::context;
    use bazaar_types::Role;

    fn agent(status: AgentStatus, downloads: u64, rating: f64) -> Agent {
        Agent {
            id: Uuid::new_v4(),
            developer_id: Uuid::nil(),
            name: "Agent".to_string(),
            description: String::new(),
            category: "other".to_string(),
            price: 0.0,
            status,
            rating,
            downloads,
            api_endpoint: None,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    fn sale(agent_id: Uuid, amount: f64, status: TransactionStatus) -> Transaction {
        Transaction {
            id: Uuid::new_v4(),
            user_id: Uuid::nil(),
            agent_id,
            amount,
            status,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_developer_stats() {
        let agents = vec![
            agent(AgentStatus::Published, 1200, 4.0),
            agent(AgentStatus::Draft, 0, 0.0),
            agent(AgentStatus::Published, 300, 5.0),
        ];
        let sales = vec![
            sale(agents[0].id, 10.0, TransactionStatus::Completed),
            sale(agents[0].id, 10.0, TransactionStatus::Refunded),
            sale(agents[2].id, 5.5, TransactionStatus::Completed),
        ];

        let stats = developer_stats(&agents, &HashMap::new(), &sales);
        assert_eq!(stats.total_agents, 3);
        assert_eq!(stats.published_agents, 2);
        assert_eq!(stats.total_downloads, 1500);
        assert_eq!(format::currency(stats.total_revenue), "$15.50");
        assert_eq!(stats.average_rating, 4.5);
    }

    #[test]
    fn test_analytics_window_is_bounded() {
        let today = NaiveDate::from_ymd_opt(2024, 5, 31).unwrap();

        assert_eq!(analytics_window(today, 7).0, NaiveDate::from_ymd_opt(2024, 5, 25).unwrap());
        assert_eq!(analytics_window(today, 0), (today, today));

        let (from, to) = analytics_window(today, u32::MAX);
        assert_eq!(to, today);
        assert_eq!((to - from).num_days(), i64::from(MAX_ANALYTICS_DAYS) - 1);
    }

    #[test]
    fn test_unreviewed_agents() {
        let bought = Uuid::new_v4();
        let reviewed = Uuid::new_v4();
        let overview = UserOverview {
            purchases: vec![
                sale(bought, 5.0, TransactionStatus::Completed),
                sale(bought, 5.0, TransactionStatus::Completed),
                sale(reviewed, 5.0, TransactionStatus::Completed),
            ],
            reviews: vec![Review {
                id: Uuid::new_v4(),
                agent_id: reviewed,
                user_id: Uuid::nil(),
                rating: 4,
                comment: None,
                created_at: Utc::now(),
            }],
            total_spent: 15.0,
        };
        assert_eq!(overview.unreviewed_agents(), vec![bought]);
        assert_eq!(overview.spent_label(), "$15.00");
    }

    #[tokio::test]
    async fn test_loaders_check_role_first() {
        let buyer = context(Some(Role::User));
        assert!(matches!(
            developer_overview(&buyer).await,
            Err(DashboardError::Forbidden { .. })
        ));
        assert!(matches!(
            ab_test_panel(&buyer, Uuid::new_v4()).await,
            Err(DashboardError::Forbidden { .. })
        ));
        assert!(matches!(
            user_overview(&context(None)).await,
            Err(DashboardError::Unauthenticated)
        ));
    }
}
