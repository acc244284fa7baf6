use serde::Serialize;
use serde_json::Value;

use crate::query::builder;
use crate::window::TimeWindow;

/// Aggregation operator applied to the query's field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Count,
    Cardinality,
    Avg,
    Sum,
    Min,
    Max,
}

impl Aggregation {
    /// Name of the aggregation in the backend's query language.
    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregation::Count => "value_count",
            Aggregation::Cardinality => "cardinality",
            Aggregation::Avg => "avg",
            Aggregation::Sum => "sum",
            Aggregation::Min => "min",
            Aggregation::Max => "max",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }
}

/// Which query document shape a [`MetricQuery`] renders to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    UuidCount,
    ContributorCount,
    CreatedSince,
    UpdatedSince,
    IssueClosedCount,
    IssueOpenCount,
}

/// Constraints beyond repository scope and window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExtraFilters {
    /// Author-domain prefixes for company attribution.
    pub companies: Vec<String>,
    /// Hit ordering for the raw-hit shapes.
    pub order: SortOrder,
}

/// An immutable description of one backend request.
///
/// For [`MetricKind::ContributorCount`] the scope holds project names, for
/// every other kind repository identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricQuery {
    pub kind: MetricKind,
    pub index: String,
    pub repo_scope: Vec<String>,
    pub field: String,
    pub operator: Aggregation,
    pub window: TimeWindow,
    pub date_field: Option<String>,
    pub extra: ExtraFilters,
}

impl MetricQuery {
    pub fn new(
        kind: MetricKind,
        index: &str,
        repo_scope: &[String],
        field: &str,
        operator: Aggregation,
        window: TimeWindow,
    ) -> Self {
        Self {
            kind,
            index: index.to_string(),
            repo_scope: repo_scope.to_vec(),
            field: field.to_string(),
            operator,
            window,
            date_field: None,
            extra: ExtraFilters::default(),
        }
    }

    pub fn date_field(mut self, field: &str) -> Self {
        self.date_field = Some(field.to_string());
        self
    }

    pub fn companies(mut self, companies: &[String]) -> Self {
        self.extra.companies = companies.to_vec();
        self
    }

    pub fn order(mut self, order: SortOrder) -> Self {
        self.extra.order = order;
        self
    }

    /// Name of the aggregation carrying the result, for aggregating shapes.
    pub fn aggregation_name(&self) -> Option<&'static str> {
        match self.kind {
            MetricKind::UuidCount | MetricKind::IssueClosedCount | MetricKind::IssueOpenCount => {
                Some(builder::UUID_AGG)
            }
            MetricKind::ContributorCount => Some(builder::CONTRIBUTORS_AGG),
            MetricKind::CreatedSince | MetricKind::UpdatedSince => None,
        }
    }

    /// Render the backend query document.
    pub fn to_document(&self) -> Value {
        let date_field = self.date_field.as_deref();
        match self.kind {
            MetricKind::UuidCount => builder::uuid_count_query(
                self.operator,
                &self.repo_scope,
                &self.field,
                date_field,
                &self.window,
            ),
            MetricKind::ContributorCount => builder::contributor_count_query(
                &self.repo_scope,
                &self.extra.companies,
                date_field,
                &self.window,
            ),
            MetricKind::CreatedSince => {
                builder::created_since_query(&self.repo_scope, self.extra.order)
            }
            MetricKind::UpdatedSince => {
                builder::updated_since_query(&self.repo_scope, &self.window.to_date())
            }
            MetricKind::IssueClosedCount => builder::issue_closed_count_query(
                self.operator,
                &self.repo_scope,
                &self.field,
                &self.window,
            ),
            MetricKind::IssueOpenCount => builder::issue_open_count_query(
                self.operator,
                &self.repo_scope,
                &self.field,
                date_field,
                &self.window,
            ),
        }
    }
}
