//! Test versions and their simulated metrics

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionStatus {
    Active,
    Inactive,
}

/// Per-version results shown next to the allocation sliders
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionMetrics {
    pub requests: u64,
    pub conversions: u64,
    pub avg_response_ms: f64,
    /// 0.0 - 5.0
    pub satisfaction: f64,
}

impl VersionMetrics {
    /// Conversions per request, as a percentage
    pub fn conversion_rate(&self) -> f64 {
        if self.requests == 0 {
            return 0.0;
        }
        self.conversions as f64 * 100.0 / self.requests as f64
    }
}

/// One variant of the agent under test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestVersion {
    pub id: Uuid,
    pub name: String,
    /// Percent of traffic, 0-100
    pub traffic_allocation: u32,
    pub status: VersionStatus,
    pub is_control: bool,
    pub metrics: VersionMetrics,
}

impl TestVersion {
    pub fn new(name: impl Into<String>, traffic_allocation: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            traffic_allocation,
            status: VersionStatus::Inactive,
            is_control: false,
            metrics: VersionMetrics::default(),
        }
    }

    pub fn control(name: impl Into<String>, traffic_allocation: u32) -> Self {
        Self {
            status: VersionStatus::Active,
            is_control: true,
            ..Self::new(name, traffic_allocation)
        }
    }

    pub fn with_metrics(mut self, metrics: VersionMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn activated(mut self) -> Self {
        self.status = VersionStatus::Active;
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == VersionStatus::Active
    }
}

/// Versions the panel opens with
pub fn sample_versions() -> Vec<TestVersion> {
    vec![
        TestVersion::control("Control", 50).with_metrics(VersionMetrics {
            requests: 1240,
            conversions: 186,
            avg_response_ms: 820.0,
            satisfaction: 4.2,
        }),
        TestVersion::new("Variant A", 50)
            .activated()
            .with_metrics(VersionMetrics {
                requests: 1198,
                conversions: 211,
                avg_response_ms: 760.0,
                satisfaction: 4.4,
            }),
    ]
}
