use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use chrono::{Duration, Utc};
use clap::ValueEnum;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info};

use crate::alert::AlertDecision;
use crate::error::IngestError;
use crate::models::{
    AlertRecord, CanonicalRow, HistoryEntry, HistorySummary, KpiSnapshot, ThresholdRecord,
};

pub type DbPool = SqlitePool;

/// Open (creating if missing) the SQLite database and ensure the schema.
pub async fn connect(database_url: &str) -> Result<DbPool, IngestError> {
    if let Some(path) = database_url.strip_prefix("sqlite://") {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
    }

    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    init_schema(&pool).await?;
    info!(database_url, "database ready");
    Ok(pool)
}

pub async fn init_schema(pool: &DbPool) -> Result<(), IngestError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS kpi_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            recorded_at TEXT NOT NULL,
            date TEXT,
            revenue REAL NOT NULL,
            cogs REAL NOT NULL,
            profit REAL NOT NULL,
            profit_margin REAL NOT NULL,
            growth_rate REAL NOT NULL,
            raw_row TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS thresholds (
            kpi_name TEXT PRIMARY KEY,
            threshold_value REAL NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS alerts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kpi_name TEXT NOT NULL,
            current_value REAL NOT NULL,
            threshold_value REAL NOT NULL,
            kind TEXT NOT NULL,
            message TEXT NOT NULL,
            sent_at TEXT NOT NULL,
            status TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_history_recorded ON kpi_history(recorded_at)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_alerts_sent ON alerts(sent_at)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Durable per-KPI threshold floors. Upsert only; last write wins.
#[derive(Clone)]
pub struct ThresholdStore {
    pool: DbPool,
}

impl ThresholdStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn get_all(&self) -> Result<BTreeMap<String, f64>, IngestError> {
        let rows: Vec<(String, f64)> =
            sqlx::query_as("SELECT kpi_name, threshold_value FROM thresholds")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().collect())
    }

    pub async fn list(&self) -> Result<Vec<ThresholdRecord>, IngestError> {
        let records = sqlx::query_as::<_, ThresholdRecord>(
            "SELECT kpi_name, threshold_value, created_at, updated_at \
             FROM thresholds ORDER BY kpi_name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    pub async fn upsert(&self, kpi_name: &str, value: f64) -> Result<(), IngestError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO thresholds (kpi_name, threshold_value, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?3)
            ON CONFLICT (kpi_name) DO UPDATE
            SET threshold_value = excluded.threshold_value, updated_at = excluded.updated_at
            "#,
        )
        .bind(kpi_name)
        .bind(value)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Append-only KPI history with retention cleanup.
#[derive(Clone)]
pub struct TimeSeriesStore {
    pool: DbPool,
}

impl TimeSeriesStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Write one entry per canonical row, tagging each with the snapshot's
    /// aggregate profit/margin/growth. The whole batch is one transaction:
    /// all rows of an ingestion commit or none do.
    pub async fn append(
        &self,
        rows: &[CanonicalRow],
        snapshot: &KpiSnapshot,
    ) -> Result<u64, IngestError> {
        let recorded_at = Utc::now();
        let profit = numeric(snapshot, "profit");
        let profit_margin = numeric(snapshot, "profit_margin");
        let growth_rate = numeric(snapshot, "growth_rate");

        let mut tx = self.pool.begin().await?;
        for row in rows {
            let raw_row = serde_json::to_string(row)?;
            sqlx::query(
                r#"
                INSERT INTO kpi_history
                (recorded_at, date, revenue, cogs, profit, profit_margin, growth_rate, raw_row)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
            )
            .bind(recorded_at)
            .bind(row.date)
            .bind(row.revenue)
            .bind(row.cogs)
            .bind(profit)
            .bind(profit_margin)
            .bind(growth_rate)
            .bind(raw_row)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        debug!(rows = rows.len(), "appended history batch");
        Ok(rows.len() as u64)
    }

    /// Entries recorded within `since`, newest first, cutoff inclusive.
    pub async fn recent(&self, since: Duration) -> Result<Vec<HistoryEntry>, IngestError> {
        let cutoff = Utc::now() - since;
        let entries = sqlx::query_as::<_, HistoryEntry>(
            "SELECT id, recorded_at, date, revenue, cogs, profit, profit_margin, \
             growth_rate, raw_row \
             FROM kpi_history WHERE recorded_at >= ?1 \
             ORDER BY recorded_at DESC, id DESC",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    pub async fn summary(&self, window: Duration) -> Result<HistorySummary, IngestError> {
        let cutoff = Utc::now() - window;
        let row: (Option<f64>, Option<f64>, Option<f64>, Option<f64>, i64) = sqlx::query_as(
            "SELECT AVG(revenue), AVG(profit), AVG(profit_margin), AVG(growth_rate), COUNT(*) \
             FROM kpi_history WHERE recorded_at >= ?1",
        )
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;

        Ok(HistorySummary {
            avg_revenue: row.0.unwrap_or(0.0),
            avg_profit: row.1.unwrap_or(0.0),
            avg_profit_margin: row.2.unwrap_or(0.0),
            avg_growth_rate: row.3.unwrap_or(0.0),
            count: row.4,
        })
    }

    /// Delete history and alerts strictly before the retention horizon;
    /// entries exactly at the boundary are kept.
    pub async fn cleanup(&self, older_than: Duration) -> Result<u64, IngestError> {
        let cutoff = Utc::now() - older_than;
        let history = sqlx::query("DELETE FROM kpi_history WHERE recorded_at < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();
        let alerts = sqlx::query("DELETE FROM alerts WHERE sent_at < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if history + alerts > 0 {
            info!(history, alerts, "retention cleanup removed rows");
        }
        Ok(history + alerts)
    }
}

/// Dispatch log used for rate-limiting repeat notifications.
#[derive(Clone)]
pub struct AlertLog {
    pool: DbPool,
}

impl AlertLog {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn log(&self, decision: &AlertDecision, status: &str) -> Result<(), IngestError> {
        sqlx::query(
            r#"
            INSERT INTO alerts
            (kpi_name, current_value, threshold_value, kind, message, sent_at, status)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&decision.kpi_name)
        .bind(decision.current_value)
        .bind(decision.threshold_value)
        .bind(decision.band.as_str())
        .bind(&decision.message)
        .bind(Utc::now())
        .bind(status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn recent(&self, within: Duration) -> Result<Vec<AlertRecord>, IngestError> {
        let cutoff = Utc::now() - within;
        let records = sqlx::query_as::<_, AlertRecord>(
            "SELECT id, kpi_name, current_value, threshold_value, kind, message, sent_at, status \
             FROM alerts WHERE sent_at >= ?1 ORDER BY sent_at DESC, id DESC",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExportTable {
    History,
    Thresholds,
    Alerts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExportFormat {
    Csv,
    Json,
}

/// Export one table as delimited or structured-record text, field order
/// matching the storage schema verbatim.
pub async fn export(
    pool: &DbPool,
    table: ExportTable,
    format: ExportFormat,
) -> Result<String, IngestError> {
    match table {
        ExportTable::History => {
            let rows = sqlx::query_as::<_, HistoryEntry>(
                "SELECT id, recorded_at, date, revenue, cogs, profit, profit_margin, \
                 growth_rate, raw_row FROM kpi_history ORDER BY recorded_at DESC, id DESC",
            )
            .fetch_all(pool)
            .await?;
            render(&rows, format)
        }
        ExportTable::Thresholds => {
            let rows = sqlx::query_as::<_, ThresholdRecord>(
                "SELECT kpi_name, threshold_value, created_at, updated_at \
                 FROM thresholds ORDER BY kpi_name",
            )
            .fetch_all(pool)
            .await?;
            render(&rows, format)
        }
        ExportTable::Alerts => {
            let rows = sqlx::query_as::<_, AlertRecord>(
                "SELECT id, kpi_name, current_value, threshold_value, kind, message, \
                 sent_at, status FROM alerts ORDER BY sent_at DESC, id DESC",
            )
            .fetch_all(pool)
            .await?;
            render(&rows, format)
        }
    }
}

fn render<T: Serialize>(rows: &[T], format: ExportFormat) -> Result<String, IngestError> {
    match format {
        ExportFormat::Json => Ok(serde_json::to_string_pretty(rows)?),
        ExportFormat::Csv => {
            let mut writer = csv::Writer::from_writer(Vec::new());
            for row in rows {
                writer.serialize(row)?;
            }
            let bytes = writer
                .into_inner()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }
    }
}

fn numeric(snapshot: &KpiSnapshot, name: &str) -> f64 {
    snapshot
        .get(name)
        .and_then(|v| v.as_numeric())
        .unwrap_or(0.0)
}
