use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod advisor;
mod alert;
mod db;
mod error;
mod ingest;
mod kpi;
mod models;
mod normalize;
mod notify;
mod report;
mod schema;

use advisor::Advisor;
use db::{DbPool, ExportFormat, ExportTable};
use ingest::Pipeline;
use notify::Notifier;

const DEFAULT_DATABASE_URL: &str = "sqlite://kpi_sentinel.db";

#[derive(Parser)]
#[command(name = "kpi-sentinel")]
#[command(about = "Business KPI normalization, threshold and alerting engine", long_about = None)]
struct Cli {
    /// SQLite database URL; falls back to KPI_DATABASE_URL
    #[arg(long)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Ingest a CSV export once
    Ingest {
        #[arg(long)]
        csv: PathBuf,
        #[arg(long, default_value_t = 24)]
        cooldown_hours: i64,
    },
    /// Watch a CSV export and re-ingest whenever it changes
    Watch {
        #[arg(long)]
        csv: PathBuf,
        #[arg(long, default_value_t = 30)]
        interval_secs: u64,
        #[arg(long, default_value_t = 24)]
        cooldown_hours: i64,
        #[arg(long, default_value_t = 90)]
        retain_days: i64,
    },
    /// Manage per-KPI threshold floors
    Threshold {
        #[command(subcommand)]
        action: ThresholdAction,
    },
    /// Show recent KPI history
    History {
        #[arg(long, default_value_t = 30)]
        since_days: i64,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Summarize stored KPIs over a window
    Summary {
        #[arg(long, default_value_t = 7)]
        days: i64,
    },
    /// Export a stored table to stdout
    Export {
        #[arg(long, value_enum)]
        table: ExportTable,
        #[arg(long, value_enum, default_value = "csv")]
        format: ExportFormat,
    },
    /// Generate a markdown report for a CSV export
    Report {
        #[arg(long)]
        csv: PathBuf,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
        #[arg(long, default_value_t = 7)]
        summary_days: i64,
    },
    /// Delete history and alerts past the retention horizon
    Cleanup {
        #[arg(long, default_value_t = 90)]
        retain_days: i64,
    },
}

#[derive(Subcommand)]
enum ThresholdAction {
    /// Set one threshold floor (last write wins)
    Set { kpi: String, value: f64 },
    /// List configured thresholds
    List,
    /// Suggest thresholds from a CSV export, optionally applying them
    Suggest {
        #[arg(long)]
        csv: PathBuf,
        #[arg(long, default_value_t = false)]
        apply: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let database_url = cli
        .database_url
        .clone()
        .or_else(|| std::env::var("KPI_DATABASE_URL").ok())
        .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());

    let pool = db::connect(&database_url)
        .await
        .context("failed to open database")?;

    match cli.command {
        Commands::InitDb => {
            println!("Schema ready.");
        }
        Commands::Ingest { csv, cooldown_hours } => {
            let pipeline = build_pipeline(&pool, cooldown_hours);
            let outcome = pipeline.run_cycle(&csv).await?;
            println!(
                "Ingested {} rows (mapping confidence {:.2}).",
                outcome.rows_ingested, outcome.mapping_confidence
            );
            for name in ["revenue", "cogs", "profit", "profit_margin", "growth_rate"] {
                if let Some(value) = outcome.snapshot.get(name) {
                    println!("- {name}: {value}");
                }
            }
            for decision in &outcome.decisions {
                println!(
                    "- {} is {} ({:.2} vs threshold {:.2})",
                    decision.kpi_name, decision.band, decision.current_value, decision.threshold_value
                );
            }
            if outcome.notifications > 0 {
                println!("{} notification(s) dispatched.", outcome.notifications);
            }
        }
        Commands::Watch {
            csv,
            interval_secs,
            cooldown_hours,
            retain_days,
        } => {
            let pipeline = build_pipeline(&pool, cooldown_hours);
            pipeline
                .watch(
                    &csv,
                    std::time::Duration::from_secs(interval_secs.max(1)),
                    chrono::Duration::days(retain_days.max(1)),
                )
                .await?;
        }
        Commands::Threshold { action } => match action {
            ThresholdAction::Set { kpi, value } => {
                let store = db::ThresholdStore::new(pool.clone());
                store.upsert(&kpi, value).await?;
                println!("Threshold {kpi} set to {value:.2}.");
            }
            ThresholdAction::List => {
                let store = db::ThresholdStore::new(pool.clone());
                let records = store.list().await?;
                if records.is_empty() {
                    println!("No thresholds configured.");
                }
                for record in records {
                    println!(
                        "- {} = {:.2} (updated {})",
                        record.kpi_name,
                        record.threshold_value,
                        record.updated_at.format("%Y-%m-%d %H:%M")
                    );
                }
            }
            ThresholdAction::Suggest { csv, apply } => {
                let table = ingest::load_csv(&csv)?;
                let advisor = build_advisor();
                let hints = match &advisor {
                    Some(advisor) => advisor
                        .analyze_columns(&table.columns, &table.sample_rows(10))
                        .await
                        .ok(),
                    None => None,
                };
                let mapping = schema::resolve(&table, hints.as_ref())?;
                let rows = normalize::normalize(&table, &mapping);
                let snapshot = kpi::compute(&rows);
                let stats = advisor::RevenueStats::from_rows(&rows);
                let suggestion = advisor::suggest_thresholds_or_fallback(
                    advisor.as_deref(),
                    &stats,
                    &snapshot,
                )
                .await;

                println!("Suggested thresholds:");
                println!("- revenue = {:.2}", suggestion.revenue_threshold);
                println!("- profit_margin = {:.2}", suggestion.profit_margin_threshold);
                println!("- growth_rate = {:.2}", suggestion.growth_rate_threshold);

                if apply {
                    let store = db::ThresholdStore::new(pool.clone());
                    store.upsert("revenue", suggestion.revenue_threshold).await?;
                    store
                        .upsert("profit_margin", suggestion.profit_margin_threshold)
                        .await?;
                    store
                        .upsert("growth_rate", suggestion.growth_rate_threshold)
                        .await?;
                    println!("Thresholds applied.");
                }
            }
        },
        Commands::History { since_days, limit } => {
            let store = db::TimeSeriesStore::new(pool.clone());
            let entries = store.recent(chrono::Duration::days(since_days.max(1))).await?;
            if entries.is_empty() {
                println!("No history in this window.");
            }
            for entry in entries.iter().take(limit) {
                println!(
                    "- {} date {} revenue {:.2} cogs {:.2} profit {:.2} margin {:.1}%",
                    entry.recorded_at.format("%Y-%m-%d %H:%M"),
                    entry
                        .date
                        .map(|d| d.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    entry.revenue,
                    entry.cogs,
                    entry.profit,
                    entry.profit_margin
                );
            }
        }
        Commands::Summary { days } => {
            let store = db::TimeSeriesStore::new(pool.clone());
            let summary = store.summary(chrono::Duration::days(days.max(1))).await?;
            println!("Last {days} day(s): {} entries", summary.count);
            println!("- avg revenue: {:.2}", summary.avg_revenue);
            println!("- avg profit: {:.2}", summary.avg_profit);
            println!("- avg profit margin: {:.2}%", summary.avg_profit_margin);
            println!("- avg growth rate: {:.2}%", summary.avg_growth_rate);
        }
        Commands::Export { table, format } => {
            let text = db::export(&pool, table, format).await?;
            println!("{text}");
        }
        Commands::Report {
            csv,
            out,
            summary_days,
        } => {
            let table = ingest::load_csv(&csv)?;
            let advisor = build_advisor();
            let hints = match &advisor {
                Some(advisor) => advisor
                    .analyze_columns(&table.columns, &table.sample_rows(10))
                    .await
                    .ok(),
                None => None,
            };
            let mapping = schema::resolve(&table, hints.as_ref())?;
            let rows = normalize::normalize(&table, &mapping);
            let snapshot = kpi::compute(&rows);
            let store = db::TimeSeriesStore::new(pool.clone());
            let summary = store
                .summary(chrono::Duration::days(summary_days.max(1)))
                .await?;

            let mut report = report::build_report(&snapshot, &summary, &rows);
            if let Some(advisor) = &advisor {
                if let Ok(insights) = advisor.generate_insights(&summary, &snapshot).await {
                    report.push_str("\n## AI Insights\n");
                    report.push_str(&insights);
                    report.push('\n');
                }
            }

            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
        Commands::Cleanup { retain_days } => {
            let store = db::TimeSeriesStore::new(pool.clone());
            let deleted = store
                .cleanup(chrono::Duration::days(retain_days.max(1)))
                .await?;
            println!("Deleted {deleted} expired row(s).");
        }
    }

    Ok(())
}

fn build_pipeline(pool: &DbPool, cooldown_hours: i64) -> Pipeline {
    Pipeline {
        history: db::TimeSeriesStore::new(pool.clone()),
        thresholds: db::ThresholdStore::new(pool.clone()),
        alert_log: db::AlertLog::new(pool.clone()),
        advisor: build_advisor(),
        notifiers: build_notifiers(),
        cooldown: chrono::Duration::hours(cooldown_hours.max(1)),
    }
}

fn build_advisor() -> Option<Box<dyn Advisor>> {
    advisor::OpenRouterAdvisor::from_env().map(|a| Box::new(a) as Box<dyn Advisor>)
}

fn build_notifiers() -> Vec<Box<dyn Notifier>> {
    let mut notifiers: Vec<Box<dyn Notifier>> = Vec::new();
    if let Some(slack) = notify::SlackNotifier::from_env() {
        notifiers.push(Box::new(slack));
    }
    if let Some(whatsapp) = notify::WhatsAppNotifier::from_env() {
        notifiers.push(Box::new(whatsapp));
    }
    notifiers
}
