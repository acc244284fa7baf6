//! Seams to the outside world: the search backend queried for raw activity
//! and the sink that receives computed metric records.

pub mod http;
pub mod memory;
pub mod retry;

pub use http::{HttpBackend, HttpOptions};
pub use memory::MemoryBackend;
pub use retry::{with_retry, RetryPolicy};

use std::future::Future;

use serde_json::Value;

use crate::error::Result;
use crate::metrics::MetricRecord;

/// Executes one query document against one index and returns the raw response.
pub trait SearchBackend: Send + Sync + 'static {
    fn search(&self, index: &str, query: &Value) -> impl Future<Output = Result<Value>> + Send;
}

/// Persists a batch of metric records into the named output index.
///
/// Writes are keyed by [`MetricRecord::uuid`], so rewriting a record replaces it.
pub trait MetricSink: Send + Sync + 'static {
    fn write_batch(
        &self,
        index: &str,
        records: &[MetricRecord],
    ) -> impl Future<Output = Result<()>> + Send;
}
