//! Dashboard routes and who may open them

use std::fmt;

use bazaar_types::Role;
use tracing::debug;
use uuid::Uuid;

use crate::context::DashboardContext;
use crate::{DashboardError, DashboardResult};

/// Who may open a route
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Public,
    SignedIn,
    Only(Role),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Home,
    SignIn,
    Marketplace,
    AgentDetail(Uuid),

    // Buyer screens
    UserOverview,
    Purchases,
    MyReviews,

    // Developer screens
    DeveloperOverview,
    DeveloperAgents,
    CreateAgent,
    AgentAnalytics(Uuid),
    AgentDeployments(Uuid),
    AbTesting(Uuid),
    AgentLogs(Uuid),
    ApiKeys,
    Webhooks,
}

impl Route {
    /// Match a URL path. Trailing slashes and a query string are ignored.
    pub fn parse(path: &str) -> Option<Route> {
        let path = path.split(['?', '#']).next().unwrap_or_default();
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let id = |s: &str| Uuid::parse_str(s).ok();

        let route = match segments.as_slice() {
            [] => Route::Home,
            ["signin"] => Route::SignIn,
            ["marketplace"] => Route::Marketplace,
            ["marketplace", agent] => Route::AgentDetail(id(agent)?),
            ["dashboard"] => Route::UserOverview,
            ["dashboard", "purchases"] => Route::Purchases,
            ["dashboard", "reviews"] => Route::MyReviews,
            ["developer"] => Route::DeveloperOverview,
            ["developer", "agents"] => Route::DeveloperAgents,
            ["developer", "agents", "new"] => Route::CreateAgent,
            ["developer", "agents", agent, "analytics"] => Route::AgentAnalytics(id(agent)?),
            ["developer", "agents", agent, "deployments"] => Route::AgentDeployments(id(agent)?),
            ["developer", "agents", agent, "ab-testing"] => Route::AbTesting(id(agent)?),
            ["developer", "agents", agent, "logs"] => Route::AgentLogs(id(agent)?),
            ["developer", "api-keys"] => Route::ApiKeys,
            ["developer", "webhooks"] => Route::Webhooks,
            _ => return None,
        };
        Some(route)
    }

    pub fn path(&self) -> String {
        match self {
            Route::Home => "/".to_string(),
            Route::SignIn => "/signin".to_string(),
            Route::Marketplace => "/marketplace".to_string(),
            Route::AgentDetail(id) => format!("/marketplace/{}", id),
            Route::UserOverview => "/dashboard".to_string(),
            Route::Purchases => "/dashboard/purchases".to_string(),
            Route::MyReviews => "/dashboard/reviews".to_string(),
            Route::DeveloperOverview => "/developer".to_string(),
            Route::DeveloperAgents => "/developer/agents".to_string(),
            Route::CreateAgent => "/developer/agents/new".to_string(),
            Route::AgentAnalytics(id) => format!("/developer/agents/{}/analytics", id),
            Route::AgentDeployments(id) => format!("/developer/agents/{}/deployments", id),
            Route::AbTesting(id) => format!("/developer/agents/{}/ab-testing", id),
            Route::AgentLogs(id) => format!("/developer/agents/{}/logs", id),
            Route::ApiKeys => "/developer/api-keys".to_string(),
            Route::Webhooks => "/developer/webhooks".to_string(),
        }
    }

    pub fn access(&self) -> Access {
        match self {
            Route::Home | Route::SignIn | Route::Marketplace | Route::AgentDetail(_) => Access::Public,
            Route::UserOverview | Route::Purchases | Route::MyReviews => Access::SignedIn,
            Route::DeveloperOverview
            | Route::DeveloperAgents
            | Route::CreateAgent
            | Route::AgentAnalytics(_)
            | Route::AgentDeployments(_)
            | Route::AbTesting(_)
            | Route::AgentLogs(_)
            | Route::ApiKeys
            | Route::Webhooks => Access::Only(Role::Developer),
        }
    }

    /// Landing page after sign-in
    pub fn home_for(role: Role) -> Route {
        match role {
            Role::User => Route::UserOverview,
            Role::Developer => Route::DeveloperOverview,
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

/// Let `ctx` open `route`, or say why not
pub fn authorize(route: Route, ctx: &DashboardContext) -> DashboardResult<Route> {
    let required = route.access();
    if required == Access::Public {
        return Ok(route);
    }

    let role = ctx.role().ok_or(DashboardError::Unauthenticated)?;
    match required {
        Access::Only(needed) if needed != role => {
            debug!("Refusing {} to {} account", route, role.as_str());
            Err(DashboardError::Forbidden {
                route: route.path(),
                role,
            })
        }
        _ => Ok(route),
    }
}

/// Parse and authorize in one step
pub fn resolve(path: &str, ctx: &DashboardContext) -> DashboardResult<Route> {
    let route = Route::parse(path).ok_or_else(|| DashboardError::NotFound(path.to_string()))?;
    authorize(route, ctx)
}
