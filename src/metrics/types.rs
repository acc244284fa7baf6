use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::grouping::{Level, Scope};
use crate::query::MetricQuery;
use crate::window::TimeWindow;

/// One computed value for a (scope, bucket, metric), as written to the sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricRecord {
    /// Stable key: the same scope, window and metric always map to the same id.
    pub uuid: String,
    pub model_name: String,
    pub scope_identifier: String,
    pub scope_level: Level,
    #[serde(flatten)]
    pub window: TimeWindow,
    pub metric_name: String,
    pub value: Option<f64>,
    pub computed_at: DateTime<Utc>,
}

impl MetricRecord {
    pub fn new(
        model_name: &str,
        scope_identifier: &str,
        scope_level: Level,
        window: TimeWindow,
        metric_name: &str,
        value: Option<f64>,
        computed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            uuid: record_key(model_name, scope_level, scope_identifier, &window, metric_name),
            model_name: model_name.to_string(),
            scope_identifier: scope_identifier.to_string(),
            scope_level,
            window,
            metric_name: metric_name.to_string(),
            value,
            computed_at,
        }
    }
}

pub fn record_key(
    model_name: &str,
    level: Level,
    scope_identifier: &str,
    window: &TimeWindow,
    metric_name: &str,
) -> String {
    format!("{model_name}:{level}:{scope_identifier}:{}:{metric_name}", window.to_key())
}

/// How one metric is obtained from the backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetricSpec {
    /// The aggregation value of a single query.
    Aggregate { name: String, query: MetricQuery },
    /// numerator / denominator; no value when the denominator is zero.
    Ratio {
        name: String,
        numerator: MetricQuery,
        denominator: MetricQuery,
    },
    /// Months from the first hit's timestamp field to the end of the query window.
    Age {
        name: String,
        query: MetricQuery,
        timestamp_field: String,
    },
}

impl MetricSpec {
    pub fn name(&self) -> &str {
        match self {
            MetricSpec::Aggregate { name, .. }
            | MetricSpec::Ratio { name, .. }
            | MetricSpec::Age { name, .. } => name,
        }
    }

    pub fn queries(&self) -> Vec<&MetricQuery> {
        match self {
            MetricSpec::Aggregate { query, .. } | MetricSpec::Age { query, .. } => vec![query],
            MetricSpec::Ratio {
                numerator,
                denominator,
                ..
            } => vec![numerator, denominator],
        }
    }
}

/// One independent piece of work: a metric for one scope and one bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedUnit {
    pub scope_identifier: String,
    pub scope_level: Level,
    pub window: TimeWindow,
    pub spec: MetricSpec,
}

impl PlannedUnit {
    pub fn new(scope: &Scope, window: TimeWindow, spec: MetricSpec) -> Self {
        Self {
            scope_identifier: scope.identifier.clone(),
            scope_level: scope.level,
            window,
            spec,
        }
    }
}
