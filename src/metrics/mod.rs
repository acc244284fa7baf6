pub mod types;

pub use types::*;

use crate::error::{Error, Result};
use crate::grouping::{Level, Scope};
use crate::query::builder::{DEFAULT_DATE_FIELD, UPDATED_ON_FIELD};
use crate::query::{Aggregation, MetricKind, MetricQuery, SortOrder};
use crate::window::TimeWindow;

/// Where a model's queries go and which companies it attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSources {
    pub issue_index: String,
    pub git_index: String,
    pub companies: Vec<String>,
}

impl Default for ModelSources {
    fn default() -> Self {
        Self {
            issue_index: "issues".to_string(),
            git_index: "git".to_string(),
            companies: Vec::new(),
        }
    }
}

/// A metric model: which metrics are computed for a scope at each level.
///
/// Models only describe queries. Executing them is the engine's job, so a
/// model can be planned and inspected without a backend.
pub trait MetricsModel: Send + Sync {
    fn name(&self) -> &str;

    fn repo_metrics(&self, scope: &Scope, window: &TimeWindow) -> Vec<MetricSpec>;

    fn project_metrics(&self, scope: &Scope, window: &TimeWindow) -> Vec<MetricSpec>;

    fn community_metrics(&self, scope: &Scope, window: &TimeWindow) -> Vec<MetricSpec>;

    fn metrics_for(&self, scope: &Scope, window: &TimeWindow) -> Vec<MetricSpec> {
        match scope.level {
            Level::Repo => self.repo_metrics(scope, window),
            Level::Project => self.project_metrics(scope, window),
            Level::Community => self.community_metrics(scope, window),
        }
    }
}

/// Look up a model by its configured name.
pub fn model_by_name(name: &str, sources: ModelSources) -> Result<Box<dyn MetricsModel>> {
    match name {
        ActivityModel::NAME => Ok(Box::new(ActivityModel::new(sources))),
        ConversionRateModel::NAME => Ok(Box::new(ConversionRateModel::new(sources))),
        other => Err(Error::Config(format!(
            "Unknown model '{other}'. Use {} or {}",
            ActivityModel::NAME,
            ConversionRateModel::NAME
        ))),
    }
}

fn commit_count(sources: &ModelSources, scope: &Scope, window: &TimeWindow) -> MetricQuery {
    MetricQuery::new(
        MetricKind::UuidCount,
        &sources.git_index,
        &scope.repos,
        "hash",
        Aggregation::Cardinality,
        *window,
    )
}

fn issue_count(sources: &ModelSources, scope: &Scope, window: &TimeWindow) -> MetricQuery {
    MetricQuery::new(
        MetricKind::UuidCount,
        &sources.issue_index,
        &scope.repos,
        "uuid",
        Aggregation::Cardinality,
        *window,
    )
}

fn closed_issue_count(sources: &ModelSources, scope: &Scope, window: &TimeWindow) -> MetricQuery {
    MetricQuery::new(
        MetricKind::IssueClosedCount,
        &sources.issue_index,
        &scope.repos,
        "uuid",
        Aggregation::Cardinality,
        *window,
    )
}

fn open_issue_count(sources: &ModelSources, scope: &Scope, window: &TimeWindow) -> MetricQuery {
    MetricQuery::new(
        MetricKind::IssueOpenCount,
        &sources.issue_index,
        &scope.repos,
        "uuid",
        Aggregation::Cardinality,
        *window,
    )
}

fn aggregate(name: &str, query: MetricQuery) -> MetricSpec {
    MetricSpec::Aggregate {
        name: name.to_string(),
        query,
    }
}

/// Development activity: commits, contributors and issue flow.
#[derive(Debug, Clone)]
pub struct ActivityModel {
    sources: ModelSources,
}

impl ActivityModel {
    pub const NAME: &'static str = "activity";

    pub fn new(sources: ModelSources) -> Self {
        Self { sources }
    }

    fn shared_metrics(&self, scope: &Scope, window: &TimeWindow) -> Vec<MetricSpec> {
        let s = &self.sources;
        vec![
            aggregate("commit_count", commit_count(s, scope, window)),
            aggregate("issue_count", issue_count(s, scope, window)),
            aggregate("closed_issue_count", closed_issue_count(s, scope, window)),
            aggregate("open_issue_count", open_issue_count(s, scope, window)),
        ]
    }

    /// Contributor counts keyed by project membership.
    fn contributor_metrics(&self, projects: &[String], window: &TimeWindow) -> Vec<MetricSpec> {
        let query = |companies: &[String]| {
            MetricQuery::new(
                MetricKind::ContributorCount,
                &self.sources.git_index,
                projects,
                "",
                Aggregation::Cardinality,
                *window,
            )
            .companies(companies)
        };
        let mut specs = vec![aggregate("contributor_count", query(&[]))];
        if !self.sources.companies.is_empty() {
            specs.push(aggregate(
                "org_contributor_count",
                query(&self.sources.companies),
            ));
        }
        specs
    }
}

impl MetricsModel for ActivityModel {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn repo_metrics(&self, scope: &Scope, window: &TimeWindow) -> Vec<MetricSpec> {
        let mut specs = self.shared_metrics(scope, window);
        specs.push(aggregate(
            "contributor_count",
            MetricQuery::new(
                MetricKind::UuidCount,
                &self.sources.git_index,
                &scope.repos,
                "author_uuid",
                Aggregation::Cardinality,
                *window,
            ),
        ));
        specs.push(MetricSpec::Age {
            name: "created_since".to_string(),
            query: MetricQuery::new(
                MetricKind::CreatedSince,
                &self.sources.git_index,
                &scope.repos,
                DEFAULT_DATE_FIELD,
                Aggregation::Min,
                *window,
            )
            .order(SortOrder::Asc),
            timestamp_field: DEFAULT_DATE_FIELD.to_string(),
        });
        specs.push(MetricSpec::Age {
            name: "updated_since".to_string(),
            query: MetricQuery::new(
                MetricKind::UpdatedSince,
                &self.sources.git_index,
                &scope.repos,
                UPDATED_ON_FIELD,
                Aggregation::Max,
                *window,
            ),
            timestamp_field: UPDATED_ON_FIELD.to_string(),
        });
        specs
    }

    fn project_metrics(&self, scope: &Scope, window: &TimeWindow) -> Vec<MetricSpec> {
        let mut specs = self.shared_metrics(scope, window);
        specs.extend(self.contributor_metrics(&[scope.identifier.clone()], window));
        specs
    }

    fn community_metrics(&self, scope: &Scope, window: &TimeWindow) -> Vec<MetricSpec> {
        let mut specs = self.shared_metrics(scope, window);
        specs.extend(self.contributor_metrics(&scope.projects, window));
        specs
    }
}

/// Conversion rates: how much of what comes in gets resolved.
#[derive(Debug, Clone)]
pub struct ConversionRateModel {
    sources: ModelSources,
}

impl ConversionRateModel {
    pub const NAME: &'static str = "conversion_rate";

    pub fn new(sources: ModelSources) -> Self {
        Self { sources }
    }

    fn closure_rate(&self, scope: &Scope, window: &TimeWindow) -> MetricSpec {
        MetricSpec::Ratio {
            name: "issue_closure_rate".to_string(),
            numerator: closed_issue_count(&self.sources, scope, window),
            denominator: issue_count(&self.sources, scope, window),
        }
    }
}

impl MetricsModel for ConversionRateModel {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn repo_metrics(&self, scope: &Scope, window: &TimeWindow) -> Vec<MetricSpec> {
        vec![self.closure_rate(scope, window)]
    }

    fn project_metrics(&self, scope: &Scope, window: &TimeWindow) -> Vec<MetricSpec> {
        vec![self.closure_rate(scope, window)]
    }

    fn community_metrics(&self, scope: &Scope, window: &TimeWindow) -> Vec<MetricSpec> {
        vec![self.closure_rate(scope, window)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(level: Level) -> Scope {
        Scope {
            identifier: match level {
                Level::Repo => "repoA".to_string(),
                Level::Project => "acme".to_string(),
                Level::Community => "oss".to_string(),
            },
            level,
            projects: vec!["acme".to_string(), "widgets".to_string()],
            repos: vec!["repoA".to_string(), "repoB".to_string()],
        }
    }

    fn window() -> TimeWindow {
        TimeWindow::parse("2022-01-03", "2022-01-10").unwrap()
    }

    fn names(specs: &[MetricSpec]) -> Vec<&str> {
        specs.iter().map(MetricSpec::name).collect()
    }

    #[test]
    fn test_activity_repo_metrics() {
        let model = ActivityModel::new(ModelSources::default());
        let specs = model.metrics_for(&scope(Level::Repo), &window());
        assert_eq!(
            names(&specs),
            vec![
                "commit_count",
                "issue_count",
                "closed_issue_count",
                "open_issue_count",
                "contributor_count",
                "created_since",
                "updated_since",
            ]
        );
        match &specs[5] {
            MetricSpec::Age { query, timestamp_field, .. } => {
                assert_eq!(query.kind, MetricKind::CreatedSince);
                assert_eq!(timestamp_field, DEFAULT_DATE_FIELD);
            }
            other => panic!("unexpected spec {other:?}"),
        }
    }

    #[test]
    fn test_activity_project_contributors_use_project_name() {
        let model = ActivityModel::new(ModelSources::default());
        let specs = model.metrics_for(&scope(Level::Project), &window());
        let contributors = specs
            .iter()
            .find(|s| s.name() == "contributor_count")
            .unwrap();
        let query = contributors.queries()[0];
        assert_eq!(query.kind, MetricKind::ContributorCount);
        assert_eq!(query.repo_scope, vec!["acme"]);
        assert!(!names(&specs).contains(&"org_contributor_count"));
    }

    #[test]
    fn test_activity_community_with_companies() {
        let sources = ModelSources {
            companies: vec!["huawei".to_string()],
            ..ModelSources::default()
        };
        let model = ActivityModel::new(sources);
        let specs = model.metrics_for(&scope(Level::Community), &window());
        let org = specs
            .iter()
            .find(|s| s.name() == "org_contributor_count")
            .unwrap();
        let query = org.queries()[0];
        assert_eq!(query.repo_scope, vec!["acme", "widgets"]);
        assert_eq!(query.extra.companies, vec!["huawei"]);
    }

    #[test]
    fn test_queries_use_configured_indices() {
        let sources = ModelSources {
            issue_index: "gitee_issues".to_string(),
            git_index: "gitee_git".to_string(),
            companies: Vec::new(),
        };
        let model = ActivityModel::new(sources);
        for spec in model.metrics_for(&scope(Level::Project), &window()) {
            for query in spec.queries() {
                let expected = if spec.name().contains("issue") {
                    "gitee_issues"
                } else {
                    "gitee_git"
                };
                assert_eq!(query.index, expected, "metric {}", spec.name());
            }
        }
    }

    #[test]
    fn test_conversion_rate_is_ratio() {
        let model = ConversionRateModel::new(ModelSources::default());
        for level in [Level::Repo, Level::Project, Level::Community] {
            let specs = model.metrics_for(&scope(level), &window());
            assert_eq!(names(&specs), vec!["issue_closure_rate"]);
            assert_eq!(specs[0].queries().len(), 2);
        }
    }

    #[test]
    fn test_model_by_name() {
        assert_eq!(
            model_by_name("activity", ModelSources::default()).unwrap().name(),
            "activity"
        );
        assert_eq!(
            model_by_name("conversion_rate", ModelSources::default())
                .unwrap()
                .name(),
            "conversion_rate"
        );
        assert!(matches!(
            model_by_name("nope", ModelSources::default()),
            Err(Error::Config(_))
        ));
    }
}
