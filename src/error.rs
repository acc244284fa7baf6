use std::fmt;
use thiserror::Error;

use crate::engine::RunReport;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Backend rejected request ({status}): {message}")]
    BackendRejected { status: u16, message: String },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Sink write failure: {0}")]
    SinkWrite(String),

    #[error("Invalid date: {0}")]
    DateParse(String),

    #[error("Invalid time window: {0}")]
    InvalidWindow(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Error rate exceeded: {failed} of {completed} units failed (threshold {threshold})")]
    ErrorRateExceeded {
        failed: u64,
        completed: u64,
        threshold: f64,
        /// Summary of the aborted run, flushed records included.
        report: Box<RunReport>,
    },

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the failed operation may succeed if attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::BackendUnavailable(_))
    }

    /// The run summary an aborted run carries.
    pub fn run_report(&self) -> Option<&RunReport> {
        match self {
            Error::ErrorRateExceeded { report, .. } => Some(report.as_ref()),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            return Error::MalformedResponse(e.to_string());
        }
        match e.status() {
            Some(status) if status.is_client_error() && status.as_u16() != 429 => {
                Error::BackendRejected {
                    status: status.as_u16(),
                    message: e.to_string(),
                }
            }
            // timeouts, refused connections, 5xx and 429 all land here
            _ => Error::BackendUnavailable(e.to_string()),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Database(e.to_string())
    }
}

impl From<rusqlite_migration::Error> for Error {
    fn from(e: rusqlite_migration::Error) -> Self {
        Error::Migration(e.to_string())
    }
}

impl<E: fmt::Display> From<tokio_rusqlite::Error<E>> for Error {
    fn from(e: tokio_rusqlite::Error<E>) -> Self {
        Error::Database(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_backend_unavailable_is_retryable() {
        assert!(Error::BackendUnavailable("timeout".into()).is_retryable());
        assert!(!Error::Config("bad level".into()).is_retryable());
        assert!(!Error::MalformedResponse("no aggregations".into()).is_retryable());
        assert!(!Error::SinkWrite("rejected".into()).is_retryable());
        assert!(!Error::BackendRejected {
            status: 400,
            message: "parse error".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_error_rate_message() {
        let e = Error::ErrorRateExceeded {
            failed: 3,
            completed: 4,
            threshold: 0.5,
            report: Box::new(RunReport {
                model_name: "test".into(),
                level: crate::grouping::Level::Project,
                out_index: "out".into(),
                started_at: chrono::Utc::now(),
                finished_at: chrono::Utc::now(),
                status: crate::engine::RunStatus::Aborted,
                scopes: 0,
                buckets: 0,
                units_total: 4,
                units_succeeded: 1,
                units_failed: 3,
                units_skipped: 0,
                records_written: 0,
                records_dropped: 0,
                errors: Vec::new(),
            }),
        };
        assert_eq!(
            e.to_string(),
            "Error rate exceeded: 3 of 4 units failed (threshold 0.5)"
        );
    }
}
