//! Response bodies returned by the analytics API.

use crate::time::Period;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

pub type Row = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryMetadata {
    pub total_rows: usize,
    pub query_time_ms: f64,
    pub cached: bool,
    pub timestamp: DateTime<Utc>,
}

impl QueryMetadata {
    pub fn new(total_rows: usize, elapsed: Duration, cached: bool) -> Self {
        Self {
            total_rows,
            query_time_ms: round_to(elapsed.as_secs_f64() * 1000.0, 2),
            cached,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub data: Vec<Row>,
    pub metadata: QueryMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KpiFormat {
    Number,
    Currency,
    Percentage,
    Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiCard {
    pub label: String,
    pub value: Value,
    pub format: KpiFormat,
    #[serde(default)]
    pub change: Option<f64>,
    #[serde(default)]
    pub change_label: Option<String>,
}

impl KpiCard {
    pub fn new(label: &str, value: impl Into<Value>, format: KpiFormat) -> Self {
        Self {
            label: label.to_string(),
            value: value.into(),
            format,
            change: None,
            change_label: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiDashboard {
    pub kpis: Vec<KpiCard>,
    pub period: String,
    pub metadata: QueryMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Up,
    Down,
    Neutral,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricComparison {
    pub metric_name: String,
    pub base_value: f64,
    pub compare_value: f64,
    pub absolute_change: f64,
    pub percentage_change: f64,
    pub trend: Trend,
}

impl MetricComparison {
    /// Percentage change is relative to the comparison period and is 0 when that value is 0.
    pub fn new(metric_name: &str, base_value: f64, compare_value: f64) -> Self {
        let percentage = if compare_value != 0.0 {
            (base_value - compare_value) / compare_value * 100.0
        } else {
            0.0
        };

        let trend = if percentage.abs() < 1.0 {
            Trend::Neutral
        } else if percentage > 0.0 {
            Trend::Up
        } else {
            Trend::Down
        };

        Self {
            metric_name: metric_name.to_string(),
            base_value,
            compare_value,
            absolute_change: base_value - compare_value,
            percentage_change: round_to(percentage, 2),
            trend,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodComparisonResponse {
    pub base_period: Period,
    pub compare_period: Period,
    pub comparisons: Vec<MetricComparison>,
    pub metadata: QueryMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionValue {
    pub id: Value,
    pub label: String,
    #[serde(default)]
    pub count: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionValuesResponse {
    pub dimension: String,
    pub values: Vec<DimensionValue>,
    pub total: usize,
}

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
