use rusqlite::{params, Connection};
use serde::Serialize;

use crate::date_util::format_day;
use crate::engine::RunReport;
use crate::metrics::MetricRecord;

// ── Metric records ─────────────────────────────────────────────────

pub fn upsert_metric_record(
    conn: &Connection,
    out_index: &str,
    record: &MetricRecord,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO metric_records (
            out_index, uuid, model_name, scope_identifier, scope_level,
            from_date, to_date, metric_name, value, computed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(out_index, uuid) DO UPDATE SET
           value = excluded.value,
           computed_at = excluded.computed_at",
        params![
            out_index,
            record.uuid,
            record.model_name,
            record.scope_identifier,
            record.scope_level.as_str(),
            format_day(&record.window.from_date()),
            format_day(&record.window.to_date()),
            record.metric_name,
            record.value,
            record.computed_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredMetric {
    pub uuid: String,
    pub model_name: String,
    pub scope_identifier: String,
    pub scope_level: String,
    pub from_date: String,
    pub to_date: String,
    pub metric_name: String,
    pub value: Option<f64>,
    pub computed_at: String,
}

pub fn list_metric_records(
    conn: &Connection,
    out_index: &str,
    scope_identifier: Option<&str>,
) -> Result<Vec<StoredMetric>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT uuid, model_name, scope_identifier, scope_level, from_date, to_date,
                metric_name, value, computed_at
         FROM metric_records
         WHERE out_index = ?1 AND (?2 IS NULL OR scope_identifier = ?2)
         ORDER BY scope_level, scope_identifier, from_date, metric_name",
    )?;
    let rows = stmt.query_map(params![out_index, scope_identifier], |row| {
        Ok(StoredMetric {
            uuid: row.get(0)?,
            model_name: row.get(1)?,
            scope_identifier: row.get(2)?,
            scope_level: row.get(3)?,
            from_date: row.get(4)?,
            to_date: row.get(5)?,
            metric_name: row.get(6)?,
            value: row.get(7)?,
            computed_at: row.get(8)?,
        })
    })?;
    rows.collect()
}

// ── Run log ────────────────────────────────────────────────────────

pub fn insert_run(conn: &Connection, report: &RunReport) -> Result<i64, rusqlite::Error> {
    let errors = (!report.errors.is_empty()).then(|| report.errors.join("\n"));
    conn.execute(
        "INSERT INTO run_log (
            model_name, level, out_index, started_at, finished_at, status,
            scopes, buckets, units_total, units_succeeded, units_failed, units_skipped,
            records_written, records_dropped, errors)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            report.model_name,
            report.level.as_str(),
            report.out_index,
            report.started_at.to_rfc3339(),
            report.finished_at.to_rfc3339(),
            report.status.as_str(),
            report.scopes as i64,
            report.buckets as i64,
            report.units_total as i64,
            report.units_succeeded as i64,
            report.units_failed as i64,
            report.units_skipped as i64,
            report.records_written as i64,
            report.records_dropped as i64,
            errors,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunLogEntry {
    pub id: i64,
    pub model_name: String,
    pub level: String,
    pub out_index: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: String,
    pub units_total: i64,
    pub units_succeeded: i64,
    pub units_failed: i64,
    pub units_skipped: i64,
    pub records_written: i64,
    pub records_dropped: i64,
    pub errors: Option<String>,
}

pub fn list_runs(conn: &Connection, limit: usize) -> Result<Vec<RunLogEntry>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT id, model_name, level, out_index, started_at, finished_at, status,
                units_total, units_succeeded, units_failed, units_skipped,
                records_written, records_dropped, errors
         FROM run_log ORDER BY id DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit as i64], |row| {
        Ok(RunLogEntry {
            id: row.get(0)?,
            model_name: row.get(1)?,
            level: row.get(2)?,
            out_index: row.get(3)?,
            started_at: row.get(4)?,
            finished_at: row.get(5)?,
            status: row.get(6)?,
            units_total: row.get(7)?,
            units_succeeded: row.get(8)?,
            units_failed: row.get(9)?,
            units_skipped: row.get(10)?,
            records_written: row.get(11)?,
            records_dropped: row.get(12)?,
            errors: row.get(13)?,
        })
    })?;
    rows.collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::RunStatus;
    use crate::grouping::Level;
    use crate::storage::Database;
    use chrono::Utc;

    fn report(status: RunStatus, errors: Vec<String>) -> RunReport {
        RunReport {
            model_name: "activity".to_string(),
            level: Level::Project,
            out_index: "metrics_out".to_string(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            status,
            scopes: 1,
            buckets: 2,
            units_total: 2,
            units_succeeded: 1,
            units_failed: 1,
            units_skipped: 0,
            records_written: 1,
            records_dropped: 0,
            errors,
        }
    }

    #[tokio::test]
    async fn test_run_log_round_trip() {
        let db = Database::open_memory().await.unwrap();

        let first = db
            .record_run(&report(RunStatus::Success, Vec::new()))
            .await
            .unwrap();
        let second = db
            .record_run(&report(
                RunStatus::PartialFailure,
                vec!["Backend unavailable: 503".to_string(), "timeout".to_string()],
            ))
            .await
            .unwrap();
        assert!(second > first);

        let runs = db.runs(10).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].id, second);
        assert_eq!(runs[0].status, "partial_failure");
        assert_eq!(
            runs[0].errors.as_deref(),
            Some("Backend unavailable: 503\ntimeout")
        );
        assert_eq!(runs[1].status, "success");
        assert_eq!(runs[1].errors, None);
        assert_eq!(runs[1].level, "project");

        assert_eq!(db.runs(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stored_dates_are_days() {
        let db = Database::open_memory().await.unwrap();
        let record = MetricRecord::new(
            "activity",
            "repoA",
            Level::Repo,
            crate::window::TimeWindow::parse("2022-01-03", "2022-01-10").unwrap(),
            "commit_count",
            Some(4.0),
            Utc::now(),
        );

        db.writer()
            .call(move |conn| {
                upsert_metric_record(conn, "out", &record)?;
                let stored = list_metric_records(conn, "out", Some("repoA"))?;
                assert_eq!(stored.len(), 1);
                assert_eq!(stored[0].from_date, "2022-01-03");
                assert_eq!(stored[0].to_date, "2022-01-10");
                assert_eq!(stored[0].scope_level, "repo");
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }
}
