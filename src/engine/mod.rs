//! Runs a metric model over every (scope, bucket) pair and streams the
//! resulting records into a sink.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinSet;

use crate::backend::{with_retry, MetricSink, RetryPolicy, SearchBackend};
use crate::date_util::elapsed_months;
use crate::error::{Error, Result};
use crate::grouping::{resolve, GroupingDocument, Level, Scope, ScopeFilter};
use crate::metrics::{MetricRecord, MetricSpec, MetricsModel, PlannedUnit};
use crate::query::response::{aggregation_value, first_hit_field};
use crate::query::MetricQuery;
use crate::window::{bucketize, Frequency, TimeWindow};

/// Knobs for a run.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    /// Units evaluated concurrently.
    pub concurrency: usize,
    pub retry: RetryPolicy,
    /// Records per sink write.
    pub batch_size: usize,
    /// Abort once (failed + skipped) / completed exceeds this fraction.
    pub max_error_rate: f64,
    /// Completed units required before the error rate is enforced.
    pub min_units_for_error_rate: u64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            concurrency: 8,
            retry: RetryPolicy::default(),
            batch_size: 100,
            max_error_rate: 0.5,
            min_units_for_error_rate: 10,
        }
    }
}

/// What to compute.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRequest {
    pub level: Level,
    pub window: TimeWindow,
    pub frequency: Frequency,
    pub out_index: String,
    pub filter: ScopeFilter,
}

/// Phases of a run, reported through [`RunProgress::on_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Init,
    Resolving,
    Querying,
    Emitting,
    Done,
}

/// Callback for progress reporting during a run.
pub trait RunProgress: Send + Sync {
    fn on_state(&self, _state: RunState) {}
    fn on_unit_complete(&self, _completed: u64, _total: u64) {}
    fn on_batch_written(&self, _records: usize) {}
}

/// No-op progress reporter.
pub struct NoopProgress;

impl RunProgress for NoopProgress {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStatus {
    Success,
    PartialFailure,
    Failed,
    /// Stopped early because the error rate passed the threshold.
    Aborted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::PartialFailure => "partial_failure",
            RunStatus::Failed => "failed",
            RunStatus::Aborted => "aborted",
        }
    }
}

/// Report returned after a run completes.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub model_name: String,
    pub level: Level,
    pub out_index: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub scopes: usize,
    pub buckets: usize,
    pub units_total: u64,
    pub units_succeeded: u64,
    /// Units whose backend request failed after retries.
    pub units_failed: u64,
    /// Units whose response could not be interpreted.
    pub units_skipped: u64,
    pub records_written: u64,
    pub records_dropped: u64,
    pub errors: Vec<String>,
}

impl RunReport {
    fn new(model_name: &str, request: &RunRequest) -> Self {
        let now = Utc::now();
        Self {
            model_name: model_name.to_string(),
            level: request.level,
            out_index: request.out_index.clone(),
            started_at: now,
            finished_at: now,
            status: RunStatus::Success,
            scopes: 0,
            buckets: 0,
            units_total: 0,
            units_succeeded: 0,
            units_failed: 0,
            units_skipped: 0,
            records_written: 0,
            records_dropped: 0,
            errors: Vec::new(),
        }
    }

    pub fn units_completed(&self) -> u64 {
        self.units_succeeded + self.units_failed + self.units_skipped
    }

    /// Fraction of completed units that failed or were skipped.
    pub fn error_rate(&self) -> f64 {
        let completed = self.units_completed();
        if completed == 0 {
            return 0.0;
        }
        (self.units_failed + self.units_skipped) as f64 / completed as f64
    }

    /// Derive the status from the counts, the way a finished run is judged.
    fn finish(&mut self) {
        let problems = self.units_failed + self.units_skipped + self.records_dropped;
        self.status = if problems == 0 {
            RunStatus::Success
        } else if self.records_written > 0 || self.units_succeeded > 0 {
            RunStatus::PartialFailure
        } else {
            RunStatus::Failed
        };
        self.finished_at = Utc::now();
    }
}

/// Scopes, buckets and the units they expand to.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub scopes: Vec<Scope>,
    pub buckets: Vec<TimeWindow>,
    pub units: Vec<PlannedUnit>,
}

/// Expand a request into its work units: every metric of `model` for every
/// resolved scope and every bucket, scopes outermost.
pub fn plan(
    model: &dyn MetricsModel,
    grouping: &GroupingDocument,
    request: &RunRequest,
) -> Result<Plan> {
    let scopes = resolve(request.level, grouping, &request.filter)?;
    let buckets = bucketize(&request.window, request.frequency);
    if buckets.is_empty() {
        log::warn!(
            "Window {} yields no {} buckets",
            request.window,
            request.frequency
        );
    }
    let mut units = Vec::new();
    for scope in &scopes {
        for bucket in &buckets {
            for spec in model.metrics_for(scope, bucket) {
                units.push(PlannedUnit::new(scope, *bucket, spec));
            }
        }
    }
    Ok(Plan {
        scopes,
        buckets,
        units,
    })
}

async fn fetch<B: SearchBackend>(
    backend: &B,
    query: &MetricQuery,
    retry: &RetryPolicy,
) -> Result<Value> {
    let body = query.to_document();
    let label = format!("search {}", query.index);
    with_retry(retry, &label, || backend.search(&query.index, &body)).await
}

async fn aggregate<B: SearchBackend>(
    backend: &B,
    query: &MetricQuery,
    retry: &RetryPolicy,
) -> Result<Option<f64>> {
    let name = query
        .aggregation_name()
        .ok_or_else(|| Error::Config(format!("{:?} queries carry no aggregation", query.kind)))?;
    let response = fetch(backend, query, retry).await?;
    aggregation_value(&response, name)
}

/// Compute one metric value. `Ok(None)` is a legitimate "no value" (null
/// aggregation, zero denominator, no hits).
pub async fn evaluate<B: SearchBackend>(
    backend: &B,
    spec: &MetricSpec,
    retry: &RetryPolicy,
) -> Result<Option<f64>> {
    match spec {
        MetricSpec::Aggregate { query, .. } => aggregate(backend, query, retry).await,
        MetricSpec::Ratio {
            numerator,
            denominator,
            ..
        } => {
            let n = aggregate(backend, numerator, retry).await?;
            let d = aggregate(backend, denominator, retry).await?;
            Ok(match (n, d) {
                (Some(n), Some(d)) if d > 0.0 => Some(n / d),
                _ => None,
            })
        }
        MetricSpec::Age {
            query,
            timestamp_field,
            ..
        } => {
            let response = fetch(backend, query, retry).await?;
            let Some(timestamp) = first_hit_field(&response, timestamp_field)? else {
                return Ok(None);
            };
            let months = elapsed_months(Some(timestamp.as_str()), Some(query.window.to_date()))?;
            // activity after the window end has no age within it
            Ok(months.filter(|m| *m >= 0.0))
        }
    }
}

/// Drives a model over a backend and sink.
pub struct MetricsEngine<B, S> {
    backend: Arc<B>,
    sink: Arc<S>,
    options: EngineOptions,
}

impl<B: SearchBackend, S: MetricSink> MetricsEngine<B, S> {
    pub fn new(backend: Arc<B>, sink: Arc<S>, options: EngineOptions) -> Self {
        Self {
            backend,
            sink,
            options,
        }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    fn enter(&self, state: RunState, progress: &dyn RunProgress) {
        log::debug!("Run state: {state:?}");
        progress.on_state(state);
    }

    /// Execute `model` for `request`.
    ///
    /// Individual unit failures are counted, not fatal. The run aborts only on
    /// configuration errors or once the error rate passes the configured
    /// threshold. Records computed before an abort are still flushed, and the
    /// error carries the aborted run's report.
    pub async fn run(
        &self,
        model: &dyn MetricsModel,
        grouping: &GroupingDocument,
        request: &RunRequest,
        progress: &dyn RunProgress,
    ) -> Result<RunReport> {
        let mut report = RunReport::new(model.name(), request);
        self.enter(RunState::Init, progress);

        self.enter(RunState::Resolving, progress);
        let plan = plan(model, grouping, request)?;
        report.scopes = plan.scopes.len();
        report.buckets = plan.buckets.len();
        report.units_total = plan.units.len() as u64;
        log::info!(
            "Computing {} metrics at {} level: {} scopes x {} buckets = {} units",
            model.name(),
            request.level,
            report.scopes,
            report.buckets,
            report.units_total
        );

        self.enter(RunState::Querying, progress);
        let concurrency = self.options.concurrency.max(1);
        let batch_size = self.options.batch_size.max(1);
        let mut pending: JoinSet<(PlannedUnit, Result<Option<f64>>)> = JoinSet::new();
        let mut units = plan.units.into_iter();
        let mut batch: Vec<MetricRecord> = Vec::with_capacity(batch_size);

        loop {
            while pending.len() < concurrency {
                let Some(unit) = units.next() else { break };
                let backend = Arc::clone(&self.backend);
                let retry = self.options.retry;
                pending.spawn(async move {
                    let outcome = evaluate(backend.as_ref(), &unit.spec, &retry).await;
                    (unit, outcome)
                });
            }

            let Some(joined) = pending.join_next().await else {
                break;
            };
            match joined {
                Ok((unit, outcome)) => self.record_outcome(model, unit, outcome, &mut report, &mut batch),
                Err(e) => {
                    log::error!("Metric task did not complete: {e}");
                    report.units_failed += 1;
                    report.errors.push(e.to_string());
                }
            }
            progress.on_unit_complete(report.units_completed(), report.units_total);

            if batch.len() >= batch_size {
                self.flush(&request.out_index, &mut batch, &mut report, progress)
                    .await;
            }

            if self.error_rate_exceeded(&report) {
                pending.abort_all();
                self.flush(&request.out_index, &mut batch, &mut report, progress)
                    .await;
                report.finish();
                report.status = RunStatus::Aborted;
                let failed = report.units_failed + report.units_skipped;
                let completed = report.units_completed();
                log::error!(
                    "Aborting run: {failed} of {completed} units failed, {} records written, {} dropped",
                    report.records_written,
                    report.records_dropped
                );
                return Err(Error::ErrorRateExceeded {
                    failed,
                    completed,
                    threshold: self.options.max_error_rate,
                    report: Box::new(report),
                });
            }
        }

        self.enter(RunState::Emitting, progress);
        self.flush(&request.out_index, &mut batch, &mut report, progress)
            .await;

        report.finish();
        self.enter(RunState::Done, progress);
        log::info!(
            "Run finished ({}): {} succeeded, {} failed, {} skipped, {} records written, {} dropped",
            report.status.as_str(),
            report.units_succeeded,
            report.units_failed,
            report.units_skipped,
            report.records_written,
            report.records_dropped
        );
        Ok(report)
    }

    fn record_outcome(
        &self,
        model: &dyn MetricsModel,
        unit: PlannedUnit,
        outcome: Result<Option<f64>>,
        report: &mut RunReport,
        batch: &mut Vec<MetricRecord>,
    ) {
        let metric = unit.spec.name();
        match outcome {
            Ok(value) => {
                report.units_succeeded += 1;
                batch.push(MetricRecord::new(
                    model.name(),
                    &unit.scope_identifier,
                    unit.scope_level,
                    unit.window,
                    metric,
                    value,
                    Utc::now(),
                ));
            }
            Err(e @ (Error::MalformedResponse(_) | Error::DateParse(_))) => {
                log::warn!(
                    "Skipping {metric} for {} {}: {e}",
                    unit.scope_identifier,
                    unit.window
                );
                report.units_skipped += 1;
                report.errors.push(e.to_string());
            }
            Err(e) => {
                log::warn!(
                    "Failed {metric} for {} {}: {e}",
                    unit.scope_identifier,
                    unit.window
                );
                report.units_failed += 1;
                report.errors.push(e.to_string());
            }
        }
    }

    /// Write the pending batch, retrying once. A batch that fails twice is
    /// dropped and reported; the run goes on.
    async fn flush(
        &self,
        out_index: &str,
        batch: &mut Vec<MetricRecord>,
        report: &mut RunReport,
        progress: &dyn RunProgress,
    ) {
        if batch.is_empty() {
            return;
        }
        let records = std::mem::take(batch);
        let count = records.len();
        let mut retried = false;
        loop {
            match self.sink.write_batch(out_index, &records).await {
                Ok(()) => {
                    log::debug!("Wrote {count} records to {out_index}");
                    report.records_written += count as u64;
                    progress.on_batch_written(count);
                    return;
                }
                Err(e) if !retried => {
                    log::warn!("Sink write of {count} records failed, retrying once: {e}");
                    retried = true;
                }
                Err(e) => {
                    log::error!("Dropping {count} records after sink failure: {e}");
                    report.records_dropped += count as u64;
                    report.errors.push(e.to_string());
                    return;
                }
            }
        }
    }

    fn error_rate_exceeded(&self, report: &RunReport) -> bool {
        report.units_completed() >= self.options.min_units_for_error_rate
            && report.error_rate() > self.options.max_error_rate
    }
}
