use std::path::Path;
use std::time::SystemTime;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::advisor::Advisor;
use crate::alert::{self, AlertDecision};
use crate::db::{AlertLog, ThresholdStore, TimeSeriesStore};
use crate::error::IngestError;
use crate::kpi;
use crate::models::{KpiSnapshot, RawTable};
use crate::normalize;
use crate::notify::Notifier;
use crate::schema;

/// Retention cleanup cadence in watch ticks (hourly at the default 30s
/// poll interval).
const CLEANUP_EVERY_TICKS: u64 = 120;

pub fn load_csv(path: &Path) -> Result<RawTable, IngestError> {
    let mut reader = csv::Reader::from_path(path)?;
    let columns: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(record.iter().map(str::to_string).collect());
    }
    Ok(RawTable { columns, rows })
}

#[derive(Debug, Default)]
pub struct CycleOutcome {
    pub rows_ingested: usize,
    pub mapping_confidence: f64,
    pub snapshot: KpiSnapshot,
    pub decisions: Vec<AlertDecision>,
    pub notifications: usize,
}

/// The ingestion pipeline with its injected collaborators.
pub struct Pipeline {
    pub history: TimeSeriesStore,
    pub thresholds: ThresholdStore,
    pub alert_log: AlertLog,
    pub advisor: Option<Box<dyn Advisor>>,
    pub notifiers: Vec<Box<dyn Notifier>>,
    pub cooldown: chrono::Duration,
}

impl Pipeline {
    /// One full cycle: load → resolve → normalize → compute → persist →
    /// evaluate → dispatch. Schema and storage failures abort the cycle;
    /// advisor failures fall back; an empty cleaned dataset is a no-op.
    pub async fn run_cycle(&self, csv_path: &Path) -> Result<CycleOutcome, IngestError> {
        let table = load_csv(csv_path)?;
        info!(
            rows = table.rows.len(),
            columns = table.columns.len(),
            source = %csv_path.display(),
            "loaded raw table"
        );

        let hints = match &self.advisor {
            Some(advisor) => match advisor
                .analyze_columns(&table.columns, &table.sample_rows(10))
                .await
            {
                Ok(analysis) => Some(analysis),
                Err(err) => {
                    warn!(%err, "advisor column analysis failed, using keyword heuristic");
                    None
                }
            },
            None => None,
        };

        let mapping = schema::resolve(&table, hints.as_ref())?;
        let rows = normalize::normalize(&table, &mapping);
        if rows.is_empty() {
            info!("no usable rows after cleaning, nothing persisted");
            return Ok(CycleOutcome {
                mapping_confidence: mapping.confidence,
                ..CycleOutcome::default()
            });
        }

        let snapshot = kpi::compute(&rows);
        self.history.append(&rows, &snapshot).await?;

        let thresholds = self.thresholds.get_all().await?;
        let recent = self.alert_log.recent(self.cooldown).await?;
        let decisions = alert::evaluate(&snapshot, &thresholds, &recent, self.cooldown, Utc::now());

        let mut notifications = 0usize;
        for decision in decisions.iter().filter(|d| d.notify) {
            let delivered = self.dispatch(&decision.message).await;
            let status = if delivered { "sent" } else { "failed" };
            self.alert_log.log(decision, status).await?;
            notifications += 1;
            info!(
                kpi = %decision.kpi_name,
                current = decision.current_value,
                threshold = decision.threshold_value,
                status,
                "threshold breach notification"
            );
        }

        Ok(CycleOutcome {
            rows_ingested: rows.len(),
            mapping_confidence: mapping.confidence,
            snapshot,
            decisions,
            notifications,
        })
    }

    /// Try every channel; one channel's failure never suppresses another's
    /// attempt. True when at least one delivery succeeded.
    async fn dispatch(&self, message: &str) -> bool {
        let mut delivered = false;
        for notifier in &self.notifiers {
            match notifier.send(message).await {
                Ok(()) => {
                    info!(channel = notifier.channel(), "notification delivered");
                    delivered = true;
                }
                Err(err) => {
                    warn!(channel = notifier.channel(), %err, "notification delivery failed");
                }
            }
        }
        delivered
    }

    /// Periodic re-check loop: re-ingest when the source file's mtime
    /// changes, run retention cleanup on a coarse cadence, stop on ctrl-c.
    /// Cycles run inline, so the stop signal lands between cycles, never
    /// mid-write.
    pub async fn watch(
        &self,
        csv_path: &Path,
        interval: std::time::Duration,
        retain: chrono::Duration,
    ) -> Result<(), IngestError> {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_modified: Option<SystemTime> = None;
        let mut ticks = 0u64;

        info!(source = %csv_path.display(), interval_secs = interval.as_secs(), "watching source");

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("stop signal received, shutting down watcher");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    let modified = std::fs::metadata(csv_path)
                        .and_then(|m| m.modified())
                        .ok();

                    if modified.is_some() && modified != last_modified {
                        last_modified = modified;
                        match self.run_cycle(csv_path).await {
                            Ok(outcome) => info!(
                                rows = outcome.rows_ingested,
                                notifications = outcome.notifications,
                                "ingestion cycle complete"
                            ),
                            // cycle failures are surfaced but do not kill the watcher
                            Err(err) => error!(%err, "ingestion cycle failed"),
                        }
                    }

                    ticks += 1;
                    if ticks % CLEANUP_EVERY_TICKS == 0 {
                        if let Err(err) = self.history.cleanup(retain).await {
                            error!(%err, "retention cleanup failed");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::notify::NotifyError;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use std::io::Write;
    use std::str::FromStr;
    use std::sync::{Arc, Mutex};

    struct FailingNotifier;

    #[async_trait::async_trait]
    impl Notifier for FailingNotifier {
        fn channel(&self) -> &str {
            "failing"
        }

        async fn send(&self, _message: &str) -> Result<(), NotifyError> {
            Err(NotifyError::Rejected("boom".to_string()))
        }
    }

    struct RecordingNotifier {
        sent: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl Notifier for RecordingNotifier {
        fn channel(&self) -> &str {
            "recording"
        }

        async fn send(&self, message: &str) -> Result<(), NotifyError> {
            self.sent.lock().unwrap().push(message.to_string());
            Ok(())
        }
    }

    async fn pipeline() -> Pipeline {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").unwrap();
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();
        db::init_schema(&pool).await.unwrap();
        Pipeline {
            history: TimeSeriesStore::new(pool.clone()),
            thresholds: ThresholdStore::new(pool.clone()),
            alert_log: AlertLog::new(pool),
            advisor: None,
            notifiers: Vec::new(),
            cooldown: alert::default_cooldown(),
        }
    }

    fn write_csv(name: &str, content: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!(
            "kpi_sentinel_{}_{}.csv",
            name,
            std::process::id()
        ));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[tokio::test]
    async fn full_cycle_persists_history_and_computes_kpis() {
        let pipeline = pipeline().await;
        let csv = write_csv(
            "cycle",
            "Total Sales,Cost of Sales\n100,60\n200,90\n",
        );

        let outcome = pipeline.run_cycle(&csv).await.unwrap();
        std::fs::remove_file(&csv).ok();

        assert_eq!(outcome.rows_ingested, 2);
        assert!((outcome.mapping_confidence - 0.5).abs() < 1e-9);
        assert_eq!(
            outcome.snapshot.get("revenue").and_then(|v| v.as_numeric()),
            Some(300.0)
        );

        let entries = pipeline
            .history
            .recent(chrono::Duration::days(1))
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn breach_alerts_once_within_cooldown() {
        let pipeline = pipeline().await;
        pipeline.thresholds.upsert("revenue", 1000.0).await.unwrap();
        let csv = write_csv("cooldown", "Revenue,COGS\n400,100\n500,200\n");

        let first = pipeline.run_cycle(&csv).await.unwrap();
        assert_eq!(first.notifications, 1);
        assert!(first.decisions.iter().any(|d| d.notify));

        // identical cycle inside the cool-down: classification recomputed,
        // dispatch suppressed, no duplicate record
        let second = pipeline.run_cycle(&csv).await.unwrap();
        std::fs::remove_file(&csv).ok();
        assert_eq!(second.notifications, 0);
        assert_eq!(second.decisions.len(), 1);
        assert_eq!(second.decisions[0].band, crate::alert::Band::Critical);

        let records = pipeline
            .alert_log
            .recent(chrono::Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        // no channels configured, so the attempt is on record as failed
        assert_eq!(records[0].status, "failed");
    }

    #[tokio::test]
    async fn channel_failure_does_not_suppress_other_channels() {
        let mut pipeline = pipeline().await;
        let sent = Arc::new(Mutex::new(Vec::new()));
        pipeline.notifiers = vec![
            Box::new(FailingNotifier),
            Box::new(RecordingNotifier { sent: Arc::clone(&sent) }),
        ];
        pipeline.thresholds.upsert("revenue", 10_000.0).await.unwrap();
        let csv = write_csv("channels", "Revenue,COGS\n400,100\n500,200\n");

        let outcome = pipeline.run_cycle(&csv).await.unwrap();
        std::fs::remove_file(&csv).ok();
        assert_eq!(outcome.notifications, 1);

        // the failing channel came first and the second was still attempted
        {
            let delivered = sent.lock().unwrap();
            assert_eq!(delivered.len(), 1);
            assert!(delivered[0].contains("Metric: Revenue"));
        }

        // one delivery succeeded, so the record is logged as sent
        let records = pipeline
            .alert_log
            .recent(chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, "sent");
    }

    #[tokio::test]
    async fn unresolvable_schema_aborts_cycle_without_persisting() {
        let pipeline = pipeline().await;
        let csv = write_csv("schema", "Foo,Bar\n1,2\n");

        let err = pipeline.run_cycle(&csv).await.unwrap_err();
        std::fs::remove_file(&csv).ok();
        assert!(matches!(err, IngestError::InsufficientSchema { .. }));

        let entries = pipeline
            .history
            .recent(chrono::Duration::days(1))
            .await
            .unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn all_rows_dropped_is_a_no_op_not_an_error() {
        let pipeline = pipeline().await;
        let csv = write_csv("empty", "Revenue,COGS\nx,y\n,\n");

        let outcome = pipeline.run_cycle(&csv).await.unwrap();
        std::fs::remove_file(&csv).ok();
        assert_eq!(outcome.rows_ingested, 0);
        assert!(outcome.snapshot.is_empty());
    }
}
