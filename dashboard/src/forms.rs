//! Form validation
//!
//! Every rule runs on every field; the caller gets the full list of
//! problems, keyed by field name, in one go.

use std::collections::BTreeMap;
use std::fmt;

use backend::functions::DeployExternalAgentRequest;
use backend::tables::{NewAgent, NewApiKey, NewReview, NewWebhook};
use url::Url;
use uuid::Uuid;

/// Field name to messages, in field order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors {
    fields: BTreeMap<&'static str, Vec<String>>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, field: &'static str, message: impl Into<String>) {
        self.fields.entry(field).or_default().push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.values().map(Vec::len).sum()
    }

    pub fn field(&self, field: &str) -> &[String] {
        self.fields.get(field).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&'static str, &[String])> + '_ {
        self.fields.iter().map(|(k, v)| (*k, v.as_slice()))
    }

    pub fn into_result(self) -> Result<(), ValidationErrors> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }

    /// Non-blank after trimming. Returns whether the value was present.
    pub fn required(&mut self, field: &'static str, value: &str) -> bool {
        if value.trim().is_empty() {
            self.add(field, "This field is required");
            false
        } else {
            true
        }
    }

    /// Character count of the trimmed value within `[min, max]`
    pub fn length(&mut self, field: &'static str, value: &str, min: usize, max: usize) {
        let len = value.trim().chars().count();
        if len < min {
            self.add(field, format!("Must be at least {} characters", min));
        } else if len > max {
            self.add(field, format!("Must be at most {} characters", max));
        }
    }

    pub fn range(&mut self, field: &'static str, value: f64, min: f64, max: f64) {
        if !value.is_finite() || value < min || value > max {
            self.add(field, format!("Must be between {} and {}", min, max));
        }
    }

    /// Absolute http or https URL with a host
    pub fn url(&mut self, field: &'static str, value: &str) {
        if !is_web_url(value.trim()) {
            self.add(field, "Must be a valid http or https URL");
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (field, messages) in &self.fields {
            for message in messages {
                if !first {
                    f.write_str("; ")?;
                }
                write!(f, "{}: {}", field, message)?;
                first = false;
            }
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

pub fn is_web_url(value: &str) -> bool {
    Url::parse(value)
        .map(|u| matches!(u.scheme(), "http" | "https") && u.host_str().is_some_and(|h| !h.is_empty()))
        .unwrap_or(false)
}

/// Anything that checks its own fields
pub trait Validate {
    fn collect_errors(&self, errors: &mut ValidationErrors);

    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        self.collect_errors(&mut errors);
        errors.into_result()
    }
}

pub const AGENT_CATEGORIES: &[&str] = &[
    "customer-support",
    "data-analysis",
    "content",
    "development",
    "productivity",
    "research",
    "sales",
    "other",
];

/// New marketplace listing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentForm {
    pub name: String,
    pub description: String,
    pub category: String,
    pub price: f64,
    pub api_endpoint: Option<String>,
}

impl Validate for AgentForm {
    fn collect_errors(&self, errors: &mut ValidationErrors) {
        if errors.required("name", &self.name) {
            errors.length("name", &self.name, 3, 100);
        }
        if errors.required("description", &self.description) {
            errors.length("description", &self.description, 10, 2000);
        }
        if errors.required("category", &self.category) && !AGENT_CATEGORIES.contains(&self.category.as_str()) {
            errors.add("category", "Unknown category");
        }
        errors.range("price", self.price, 0.0, 10_000.0);
        if let Some(endpoint) = self.api_endpoint.as_deref().filter(|e| !e.trim().is_empty()) {
            errors.url("api_endpoint", endpoint);
        }
    }
}

impl AgentForm {
    pub fn into_new_agent(self, developer_id: Uuid) -> Result<NewAgent, ValidationErrors> {
        self.validate()?;
        Ok(NewAgent {
            developer_id,
            name: self.name.trim().to_string(),
            description: self.description.trim().to_string(),
            category: self.category,
            price: self.price,
            api_endpoint: self
                .api_endpoint
                .map(|e| e.trim().to_string())
                .filter(|e| !e.is_empty()),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReviewForm {
    pub rating: u8,
    pub comment: String,
}

impl Validate for ReviewForm {
    fn collect_errors(&self, errors: &mut ValidationErrors) {
        if !(1..=5).contains(&self.rating) {
            errors.add("rating", "Pick a rating from 1 to 5 stars");
        }
        if self.comment.trim().chars().count() > 1000 {
            errors.add("comment", "Must be at most 1000 characters");
        }
    }
}

impl ReviewForm {
    pub fn into_new_review(self, agent_id: Uuid, user_id: Uuid) -> Result<NewReview, ValidationErrors> {
        self.validate()?;
        let comment = self.comment.trim();
        Ok(NewReview {
            agent_id,
            user_id,
            rating: self.rating,
            comment: (!comment.is_empty()).then(|| comment.to_string()),
        })
    }
}

pub const WEBHOOK_EVENTS: &[&str] = &[
    "deployment.succeeded",
    "deployment.failed",
    "purchase.completed",
    "review.created",
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebhookForm {
    pub url: String,
    pub events: Vec<String>,
}

impl Validate for WebhookForm {
    fn collect_errors(&self, errors: &mut ValidationErrors) {
        if errors.required("url", &self.url) {
            errors.url("url", &self.url);
        }
        if self.events.is_empty() {
            errors.add("events", "Select at least one event");
        }
        for event in &self.events {
            if !WEBHOOK_EVENTS.contains(&event.as_str()) {
                errors.add("events", format!("Unknown event: {}", event));
            }
        }
    }
}

impl WebhookForm {
    pub fn into_new_webhook(self, developer_id: Uuid) -> Result<NewWebhook, ValidationErrors> {
        self.validate()?;
        Ok(NewWebhook {
            developer_id,
            url: self.url.trim().to_string(),
            events: self.events,
            active: true,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiKeyForm {
    pub name: String,
}

impl Validate for ApiKeyForm {
    fn collect_errors(&self, errors: &mut ValidationErrors) {
        if errors.required("name", &self.name) {
            errors.length("name", &self.name, 3, 50);
        }
    }
}

impl ApiKeyForm {
    pub fn into_new_api_key(self, developer_id: Uuid) -> Result<NewApiKey, ValidationErrors> {
        self.validate()?;
        Ok(NewApiKey {
            developer_id,
            name: self.name.trim().to_string(),
        })
    }
}

/// Agent hosted outside the platform
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExternalAgentForm {
    pub endpoint_url: String,
    pub auth_header: Option<String>,
}

impl Validate for ExternalAgentForm {
    fn collect_errors(&self, errors: &mut ValidationErrors) {
        if errors.required("endpoint_url", &self.endpoint_url) {
            errors.url("endpoint_url", &self.endpoint_url);
        }
        if let Some(header) = &self.auth_header {
            if header.contains(['\r', '\n']) {
                errors.add("auth_header", "Must be a single line");
            }
        }
    }
}

impl ExternalAgentForm {
    pub fn into_request(self, agent_id: Uuid) -> Result<DeployExternalAgentRequest, ValidationErrors> {
        self.validate()?;
        Ok(DeployExternalAgentRequest {
            agent_id,
            endpoint_url: self.endpoint_url.trim().to_string(),
            auth_header: self
                .auth_header
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty()),
        })
    }
}
