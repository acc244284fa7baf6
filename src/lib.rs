pub mod backend;
pub mod config;
pub mod date_util;
pub mod engine;
pub mod error;
pub mod grouping;
pub mod metrics;
pub mod query;
pub mod storage;
pub mod window;

use std::path::Path;
use std::sync::Arc;

pub use backend::{HttpBackend, HttpOptions, MemoryBackend, MetricSink, RetryPolicy, SearchBackend};
pub use config::RunConfig;
pub use engine::{
    EngineOptions, MetricsEngine, NoopProgress, Plan, RunProgress, RunReport, RunRequest,
    RunState, RunStatus,
};
pub use error::{Error, Result};
pub use grouping::{GroupingDocument, Level, Scope, ScopeFilter};
pub use metrics::{
    model_by_name, ActivityModel, ConversionRateModel, MetricRecord, MetricSpec, MetricsModel,
    ModelSources,
};
pub use query::{Aggregation, MetricKind, MetricQuery, SortOrder};
pub use storage::Database;
pub use window::{bucketize, Frequency, TimeWindow};

/// Main entry point: a validated configuration with its grouping document
/// and model loaded, ready to plan or execute against any backend and sink.
pub struct MetricsRun {
    config: RunConfig,
    grouping: GroupingDocument,
    model: Box<dyn MetricsModel>,
}

impl MetricsRun {
    /// Load the config file; the grouping document path resolves relative to it.
    pub fn load(config_path: impl AsRef<Path>) -> Result<Self> {
        let config_path = config_path.as_ref();
        let config = RunConfig::load(config_path)?;
        let grouping = config.load_grouping(config_path.parent())?;
        Self::new(config, grouping)
    }

    pub fn new(config: RunConfig, grouping: GroupingDocument) -> Result<Self> {
        let model = model_by_name(&config.params.model, config.model_sources())?;
        Ok(Self {
            config,
            grouping,
            model,
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn grouping(&self) -> &GroupingDocument {
        &self.grouping
    }

    pub fn model(&self) -> &dyn MetricsModel {
        self.model.as_ref()
    }

    pub fn scopes(&self) -> Result<Vec<Scope>> {
        let request = self.config.request()?;
        grouping::resolve(request.level, &self.grouping, &request.filter)
    }

    pub fn plan(&self) -> Result<Plan> {
        engine::plan(self.model(), &self.grouping, &self.config.request()?)
    }

    pub async fn execute<B: SearchBackend, S: MetricSink>(
        &self,
        backend: Arc<B>,
        sink: Arc<S>,
        progress: &dyn RunProgress,
    ) -> Result<RunReport> {
        let request = self.config.request()?;
        let engine = MetricsEngine::new(backend, sink, self.config.engine_options());
        engine
            .run(self.model(), &self.grouping, &request, progress)
            .await
    }
}
