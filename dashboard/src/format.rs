//! Display formatting for money, counts, percentages and chart series

use bazaar_types::AgentMetric;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// `$1,234.50`; negative amounts as `-$12.00`
pub fn currency(amount: f64) -> String {
    if !amount.is_finite() {
        return "$0.00".to_string();
    }

    let cents = (amount.abs() * 100.0).round() as u64;
    let sign = if amount < 0.0 && cents > 0 { "-" } else { "" };
    format!("{}${}.{:02}", sign, group_thousands(cents / 100), cents % 100)
}

fn group_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// `999`, `1.2K`, `3.4M`, `1.0B`
pub fn compact(n: u64) -> String {
    const UNITS: [(u64, &str); 3] = [(1_000_000_000, "B"), (1_000_000, "M"), (1_000, "K")];

    for (size, suffix) in UNITS {
        if n >= size {
            let scaled = (n as f64 / size as f64 * 10.0).floor() / 10.0;
            return format!("{:.1}{}", scaled, suffix);
        }
    }
    n.to_string()
}

/// One decimal place, `12.5%`
pub fn percent(value: f64) -> String {
    if !value.is_finite() {
        return "0.0%".to_string();
    }
    format!("{:.1}%", value)
}

/// `part` as a share of `whole`, 0 when `whole` is 0
pub fn ratio_percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

/// `2m ago`, `3h ago`, `5d ago` relative to `now`
pub fn time_ago(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - at).num_seconds().max(0);
    match secs {
        0..=59 => "just now".to_string(),
        60..=3599 => format!("{}m ago", secs / 60),
        3600..=86_399 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86_400),
    }
}

/// Point on a time-series chart
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartPoint {
    pub label: String,
    pub value: f64,
}

/// Which column of a metric row to chart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricSeries {
    Requests,
    Errors,
    ErrorRate,
    Latency,
    Revenue,
}

impl MetricSeries {
    fn value(self, m: &AgentMetric) -> f64 {
        match self {
            MetricSeries::Requests => m.requests as f64,
            MetricSeries::Errors => m.errors as f64,
            MetricSeries::ErrorRate => ratio_percent(m.errors, m.requests),
            MetricSeries::Latency => m.avg_latency_ms,
            MetricSeries::Revenue => m.revenue,
        }
    }
}

/// Chart points in date order, labelled like `May 01`
pub fn series(metrics: &[AgentMetric], column: MetricSeries) -> Vec<ChartPoint> {
    let mut rows: Vec<&AgentMetric> = metrics.iter().collect();
    rows.sort_by_key(|m| m.date);
    rows.into_iter()
        .map(|m| ChartPoint {
            label: m.date.format("%b %d").to_string(),
            value: column.value(m),
        })
        .collect()
}
