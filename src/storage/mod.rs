pub mod repository;

use std::path::Path;

use rusqlite_migration::{Migrations, M};

use crate::backend::MetricSink;
use crate::engine::RunReport;
use crate::error::{Error, Result};
use crate::metrics::MetricRecord;

pub use repository::{RunLogEntry, StoredMetric};

/// Database wraps two `tokio_rusqlite::Connection` instances (writer + reader)
/// using WAL mode. Writes are serialized through the writer's channel; reads
/// go through the reader without blocking them.
#[derive(Clone)]
pub struct Database {
    writer: tokio_rusqlite::Connection,
    reader: tokio_rusqlite::Connection,
}

impl Database {
    /// Open the database at the default path (`~/.chaoss-metrics/metrics.db`).
    pub async fn open() -> Result<Self> {
        let dir = dirs::home_dir()
            .ok_or_else(|| Error::Config("cannot determine home directory".into()))?
            .join(".chaoss-metrics");
        std::fs::create_dir_all(&dir).map_err(|e| Error::Config(e.to_string()))?;
        Self::open_at(dir.join("metrics.db")).await
    }

    pub async fn open_at(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let writer = tokio_rusqlite::Connection::open(&path).await?;
        Self::init_writer(&writer).await?;

        let reader = tokio_rusqlite::Connection::open(&path).await?;
        Self::init_reader(&reader).await?;

        Ok(Self { writer, reader })
    }

    /// Open an in-memory database (for testing).
    pub async fn open_memory() -> Result<Self> {
        let writer = tokio_rusqlite::Connection::open_in_memory().await?;
        Self::init_writer(&writer).await?;

        // in-memory databases are per-connection, so reads share the writer
        Ok(Self {
            reader: writer.clone(),
            writer,
        })
    }

    async fn init_writer(conn: &tokio_rusqlite::Connection) -> Result<()> {
        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode=WAL;\
                 PRAGMA busy_timeout=5000;",
            )
            .map_err(|e| e.to_string())?;
            let migrations = Migrations::new(vec![M::up(include_str!(
                "migrations/001_initial.sql"
            ))]);
            migrations.to_latest(conn).map_err(|e| e.to_string())?;
            Ok::<(), String>(())
        })
        .await
        .map_err(|e| Error::Migration(e.to_string()))
    }

    async fn init_reader(conn: &tokio_rusqlite::Connection) -> Result<()> {
        conn.call(|conn| {
            conn.execute_batch("PRAGMA busy_timeout=5000;")?;
            Ok::<(), rusqlite::Error>(())
        })
        .await?;
        Ok(())
    }

    pub fn writer(&self) -> &tokio_rusqlite::Connection {
        &self.writer
    }

    pub fn reader(&self) -> &tokio_rusqlite::Connection {
        &self.reader
    }

    /// Records stored for `out_index`, optionally for one scope only.
    pub async fn metric_records(
        &self,
        out_index: &str,
        scope_identifier: Option<&str>,
    ) -> Result<Vec<StoredMetric>> {
        let out_index = out_index.to_string();
        let scope = scope_identifier.map(str::to_string);
        let rows = self
            .reader
            .call(move |conn| repository::list_metric_records(conn, &out_index, scope.as_deref()))
            .await?;
        Ok(rows)
    }

    /// Append a finished run to the run log. Returns the log entry id.
    pub async fn record_run(&self, report: &RunReport) -> Result<i64> {
        let report = report.clone();
        let id = self
            .writer
            .call(move |conn| repository::insert_run(conn, &report))
            .await?;
        Ok(id)
    }

    /// Most recent runs first.
    pub async fn runs(&self, limit: usize) -> Result<Vec<RunLogEntry>> {
        let rows = self
            .reader
            .call(move |conn| repository::list_runs(conn, limit))
            .await?;
        Ok(rows)
    }
}

impl MetricSink for Database {
    async fn write_batch(&self, index: &str, records: &[MetricRecord]) -> Result<()> {
        let index = index.to_string();
        let records = records.to_vec();
        self.writer
            .call(move |conn| {
                let tx = conn.transaction()?;
                for record in &records {
                    repository::upsert_metric_record(&tx, &index, record)?;
                }
                tx.commit()?;
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .map_err(|e| Error::SinkWrite(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grouping::Level;
    use crate::window::TimeWindow;
    use chrono::Utc;

    async fn table_names(db: &Database) -> Vec<String> {
        db.reader()
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT name FROM sqlite_master WHERE type='table' ORDER BY name",
                )?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                Ok::<Vec<String>, rusqlite::Error>(rows.filter_map(|r| r.ok()).collect())
            })
            .await
            .unwrap()
    }

    fn record(scope: &str, metric: &str, value: Option<f64>) -> MetricRecord {
        MetricRecord::new(
            "activity",
            scope,
            Level::Project,
            TimeWindow::parse("2022-01-03", "2022-01-10").unwrap(),
            metric,
            value,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_open_memory() {
        let db = Database::open_memory().await.unwrap();
        let tables = table_names(&db).await;
        assert!(tables.contains(&"metric_records".to_string()));
        assert!(tables.contains(&"run_log".to_string()));
    }

    #[tokio::test]
    async fn test_open_at_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.db");
        {
            let db = Database::open_at(&path).await.unwrap();
            db.write_batch("out", &[record("acme", "issue_count", Some(3.0))])
                .await
                .unwrap();
        }
        // reopening runs migrations again without losing data
        let db = Database::open_at(&path).await.unwrap();
        let rows = db.metric_records("out", None).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, Some(3.0));
    }

    #[tokio::test]
    async fn test_write_batch_upserts_by_uuid() {
        let db = Database::open_memory().await.unwrap();
        db.write_batch(
            "out",
            &[
                record("acme", "issue_count", Some(3.0)),
                record("acme", "commit_count", None),
                record("widgets", "issue_count", Some(1.0)),
            ],
        )
        .await
        .unwrap();
        db.write_batch("out", &[record("acme", "issue_count", Some(5.0))])
            .await
            .unwrap();

        let acme = db.metric_records("out", Some("acme")).await.unwrap();
        assert_eq!(acme.len(), 2);
        let issues = acme.iter().find(|r| r.metric_name == "issue_count").unwrap();
        assert_eq!(issues.value, Some(5.0));
        let commits = acme.iter().find(|r| r.metric_name == "commit_count").unwrap();
        assert_eq!(commits.value, None);

        assert_eq!(db.metric_records("out", None).await.unwrap().len(), 3);
        assert!(db.metric_records("other", None).await.unwrap().is_empty());
    }
}
