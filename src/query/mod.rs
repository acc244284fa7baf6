pub mod builder;
pub mod metric;
pub mod response;

pub use metric::{Aggregation, ExtraFilters, MetricKind, MetricQuery, SortOrder};
