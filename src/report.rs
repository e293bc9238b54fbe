use std::fmt::Write;

use chrono::Utc;

use crate::kpi::{self, SeasonalMetrics};
use crate::models::{CanonicalRow, HistorySummary, KpiSnapshot, KpiValue};
use crate::normalize;

const KEY_METRICS: [&str; 7] = [
    "revenue",
    "cogs",
    "profit",
    "profit_margin",
    "growth_rate",
    "revenue_per_day",
    "efficiency_ratio",
];

/// Markdown business report from one snapshot plus stored history.
pub fn build_report(
    snapshot: &KpiSnapshot,
    summary: &HistorySummary,
    rows: &[CanonicalRow],
) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Business KPI Report");
    let _ = writeln!(
        output,
        "Generated {} from {} data rows",
        Utc::now().format("%Y-%m-%d %H:%M UTC"),
        rows.len()
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Key Metrics");

    if snapshot.is_empty() {
        let _ = writeln!(output, "No usable rows in this dataset.");
    } else {
        for name in KEY_METRICS {
            if let Some(value) = snapshot.get(name) {
                let _ = writeln!(output, "- {}: {}", label(name), value);
            }
        }
    }

    let trend_entries: Vec<(&String, &KpiValue)> = snapshot
        .iter()
        .filter(|(name, _)| name.ends_with("_trend") || name.ends_with("_change"))
        .collect();
    if !trend_entries.is_empty() {
        let _ = writeln!(output);
        let _ = writeln!(output, "## Trends");
        for (name, value) in trend_entries {
            let _ = writeln!(output, "- {}: {}", label(name), value);
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Recent History");
    if summary.count == 0 {
        let _ = writeln!(output, "No stored history for this window.");
    } else {
        let _ = writeln!(
            output,
            "- {} entries, avg revenue {:.2}, avg profit {:.2}, avg margin {:.1}%, avg growth {:.1}%",
            summary.count,
            summary.avg_revenue,
            summary.avg_profit,
            summary.avg_profit_margin,
            summary.avg_growth_rate
        );
    }

    let anomalies = normalize::revenue_anomalies(rows, 2.0);
    if !anomalies.is_empty() {
        let _ = writeln!(output);
        let _ = writeln!(output, "## Anomalies");
        let _ = writeln!(
            output,
            "{} row(s) deviate from mean revenue by more than 2 standard deviations.",
            anomalies.len()
        );
    }

    let seasonal = kpi::seasonal_metrics(rows);
    if seasonal != SeasonalMetrics::default() {
        let _ = writeln!(output);
        let _ = writeln!(output, "## Seasonality");
        if let Some(month) = seasonal.best_month {
            let _ = writeln!(output, "- Best month: {}", month_name(month));
        }
        if let Some(month) = seasonal.worst_month {
            let _ = writeln!(output, "- Worst month: {}", month_name(month));
        }
        if let Some(quarter) = seasonal.best_quarter {
            let _ = writeln!(output, "- Best quarter: Q{quarter}");
        }
        if let Some(weekday) = seasonal.best_weekday {
            let _ = writeln!(output, "- Best weekday: {weekday}");
        }
    }

    let forecast = kpi::forecast_revenue(rows, 7);
    if !forecast.is_empty() {
        let _ = writeln!(output);
        let _ = writeln!(output, "## 7-Period Revenue Outlook");
        let values: Vec<String> = forecast.iter().map(|v| format!("{v:.0}")).collect();
        let _ = writeln!(output, "{}", values.join(", "));
    }

    output
}

fn label(name: &str) -> String {
    name.split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn month_name(month: u32) -> &'static str {
    match month {
        1 => "January",
        2 => "February",
        3 => "March",
        4 => "April",
        5 => "May",
        6 => "June",
        7 => "July",
        8 => "August",
        9 => "September",
        10 => "October",
        11 => "November",
        12 => "December",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kpi;
    use crate::models::CanonicalRow;

    fn row(revenue: f64, cogs: f64) -> CanonicalRow {
        CanonicalRow {
            date: None,
            revenue,
            cogs,
            profit: revenue - cogs,
            units_sold: None,
            customers: None,
        }
    }

    #[test]
    fn report_covers_key_sections() {
        let rows = vec![row(100.0, 60.0), row(200.0, 90.0), row(300.0, 120.0)];
        let snapshot = kpi::compute(&rows);
        let summary = HistorySummary {
            avg_revenue: 200.0,
            avg_profit: 110.0,
            avg_profit_margin: 55.0,
            avg_growth_rate: 10.0,
            count: 3,
        };

        let report = build_report(&snapshot, &summary, &rows);
        assert!(report.contains("# Business KPI Report"));
        assert!(report.contains("- Revenue: 600.00"));
        assert!(report.contains("- Profit Margin: 55.00"));
        assert!(report.contains("## Trends"));
        assert!(report.contains("- Revenue Trend: increasing"));
        assert!(report.contains("3 entries"));
        assert!(report.contains("## 7-Period Revenue Outlook"));
    }

    #[test]
    fn empty_snapshot_produces_a_minimal_report() {
        let report = build_report(&KpiSnapshot::new(), &HistorySummary::default(), &[]);
        assert!(report.contains("No usable rows"));
        assert!(report.contains("No stored history"));
    }
}
