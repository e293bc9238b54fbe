use std::collections::BTreeMap;

use chrono::{Datelike, Weekday};

use crate::models::{CanonicalRow, KpiSnapshot, KpiValue, Trend};

pub const MOVING_AVERAGE_WINDOWS: [usize; 3] = [7, 14, 30];
const TREND_MIN_ROWS: usize = 3;

/// Compute the full KPI set from a cleaned dataset. Pure: no I/O, identical
/// snapshots for identical datasets; degenerate divisions yield 0, not NaN.
pub fn compute(rows: &[CanonicalRow]) -> KpiSnapshot {
    let mut kpis = KpiSnapshot::new();
    if rows.is_empty() {
        return kpis;
    }

    let revenue: f64 = rows.iter().map(|r| r.revenue).sum();
    let cogs: f64 = rows.iter().map(|r| r.cogs).sum();
    let profit = revenue - cogs;

    put(&mut kpis, "revenue", revenue);
    put(&mut kpis, "cogs", cogs);
    put(&mut kpis, "profit", profit);
    put(
        &mut kpis,
        "profit_margin",
        if revenue > 0.0 { 100.0 * profit / revenue } else { 0.0 },
    );
    put(&mut kpis, "growth_rate", growth_rate(rows));
    put(&mut kpis, "revenue_per_day", revenue_per_day(rows));
    put(
        &mut kpis,
        "efficiency_ratio",
        if cogs > 0.0 { revenue / cogs } else { 0.0 },
    );

    let revenues: Vec<f64> = rows.iter().map(|r| r.revenue).collect();
    let cogs_values: Vec<f64> = rows.iter().map(|r| r.cogs).collect();
    let profits: Vec<f64> = rows.iter().map(|r| r.profit).collect();

    if rows.len() >= TREND_MIN_ROWS {
        let revenue_slope = slope(&revenues);
        let profit_slope = slope(&profits);
        kpis.insert("revenue_trend".to_string(), KpiValue::Label(trend_label(revenue_slope)));
        kpis.insert("profit_trend".to_string(), KpiValue::Label(trend_label(profit_slope)));
        put(&mut kpis, "revenue_change", revenue_slope);
        put(&mut kpis, "profit_change", profit_slope);
    }

    put(&mut kpis, "revenue_volatility", sample_std(&revenues));
    put(&mut kpis, "revenue_max", revenues.iter().copied().fold(f64::MIN, f64::max));
    put(&mut kpis, "revenue_min", revenues.iter().copied().fold(f64::MAX, f64::min));
    put(&mut kpis, "revenue_median", median(&revenues));
    put(&mut kpis, "cogs_volatility", sample_std(&cogs_values));
    put(&mut kpis, "avg_cogs", mean(&cogs_values));

    for window in MOVING_AVERAGE_WINDOWS {
        if rows.len() >= window {
            let revenue_tail = &revenues[revenues.len() - window..];
            let profit_tail = &profits[profits.len() - window..];
            put(&mut kpis, &format!("revenue_ma_{window}"), mean(revenue_tail));
            put(&mut kpis, &format!("profit_ma_{window}"), mean(profit_tail));
        }
    }

    kpis
}

/// NaN never leaves the engine; degenerate values land as 0.
fn put(kpis: &mut KpiSnapshot, name: &str, value: f64) {
    let value = if value.is_finite() { value } else { 0.0 };
    kpis.insert(name.to_string(), KpiValue::Numeric(value));
}

/// Period-over-period growth: first half `[0, n/2)` against second half
/// `[n/2, n)` by row count; 0 for fewer than two rows or a non-positive
/// first-half sum.
pub fn growth_rate(rows: &[CanonicalRow]) -> f64 {
    let n = rows.len();
    if n < 2 {
        return 0.0;
    }
    let mid = n / 2;
    let previous: f64 = rows[..mid].iter().map(|r| r.revenue).sum();
    let current: f64 = rows[mid..].iter().map(|r| r.revenue).sum();
    if previous > 0.0 {
        100.0 * (current - previous) / previous
    } else {
        0.0
    }
}

/// Average of per-date revenue sums when every row is dated, else the
/// per-row mean.
pub fn revenue_per_day(rows: &[CanonicalRow]) -> f64 {
    if rows.is_empty() {
        return 0.0;
    }
    if rows.iter().all(|r| r.date.is_some()) {
        let mut per_day: BTreeMap<chrono::NaiveDate, f64> = BTreeMap::new();
        for row in rows {
            if let Some(date) = row.date {
                *per_day.entry(date).or_insert(0.0) += row.revenue;
            }
        }
        let sums: Vec<f64> = per_day.into_values().collect();
        mean(&sums)
    } else {
        let revenues: Vec<f64> = rows.iter().map(|r| r.revenue).collect();
        mean(&revenues)
    }
}

/// Next `periods` points on the fitted revenue line, clamped at zero.
pub fn forecast_revenue(rows: &[CanonicalRow], periods: usize) -> Vec<f64> {
    if rows.len() < TREND_MIN_ROWS {
        return Vec::new();
    }
    let revenues: Vec<f64> = rows.iter().map(|r| r.revenue).collect();
    let (slope, intercept) = fit_line(&revenues);
    (0..periods)
        .map(|i| (slope * (rows.len() + i) as f64 + intercept).max(0.0))
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeasonalMetrics {
    pub best_month: Option<u32>,
    pub worst_month: Option<u32>,
    pub best_quarter: Option<u32>,
    pub best_weekday: Option<Weekday>,
}

/// Mean revenue by month, quarter and weekday; empty when nothing is dated.
pub fn seasonal_metrics(rows: &[CanonicalRow]) -> SeasonalMetrics {
    let mut by_month: BTreeMap<u32, Vec<f64>> = BTreeMap::new();
    let mut by_quarter: BTreeMap<u32, Vec<f64>> = BTreeMap::new();
    let mut by_weekday: BTreeMap<u32, Vec<f64>> = BTreeMap::new();

    for row in rows {
        let Some(date) = row.date else { continue };
        by_month.entry(date.month()).or_default().push(row.revenue);
        by_quarter
            .entry((date.month0() / 3) + 1)
            .or_default()
            .push(row.revenue);
        by_weekday
            .entry(date.weekday().num_days_from_monday())
            .or_default()
            .push(row.revenue);
    }

    let argbest = |groups: &BTreeMap<u32, Vec<f64>>, invert: bool| -> Option<u32> {
        groups
            .iter()
            .map(|(k, v)| (*k, mean(v)))
            .reduce(|best, cand| {
                let better = if invert { cand.1 < best.1 } else { cand.1 > best.1 };
                if better { cand } else { best }
            })
            .map(|(k, _)| k)
    };

    SeasonalMetrics {
        best_month: argbest(&by_month, false),
        worst_month: argbest(&by_month, true),
        best_quarter: argbest(&by_quarter, false),
        best_weekday: argbest(&by_weekday, false).and_then(weekday_from_monday_offset),
    }
}

fn weekday_from_monday_offset(offset: u32) -> Option<Weekday> {
    match offset {
        0 => Some(Weekday::Mon),
        1 => Some(Weekday::Tue),
        2 => Some(Weekday::Wed),
        3 => Some(Weekday::Thu),
        4 => Some(Weekday::Fri),
        5 => Some(Weekday::Sat),
        6 => Some(Weekday::Sun),
        _ => None,
    }
}

fn trend_label(slope: f64) -> Trend {
    if slope > 0.0 {
        Trend::Increasing
    } else {
        Trend::Decreasing
    }
}

pub fn slope(values: &[f64]) -> f64 {
    fit_line(values).0
}

fn fit_line(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    if values.len() < 2 {
        return (0.0, values.first().copied().unwrap_or(0.0));
    }
    let sum_x: f64 = (0..values.len()).map(|i| i as f64).sum();
    let sum_y: f64 = values.iter().sum();
    let sum_xy: f64 = values.iter().enumerate().map(|(i, y)| i as f64 * y).sum();
    let sum_xx: f64 = (0..values.len()).map(|i| (i as f64).powi(2)).sum();
    let denom = n * sum_xx - sum_x * sum_x;
    if denom == 0.0 {
        return (0.0, sum_y / n);
    }
    let slope = (n * sum_xy - sum_x * sum_y) / denom;
    let intercept = (sum_y - slope * sum_x) / n;
    (slope, intercept)
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (ddof = 1); 0 for fewer than two values.
pub fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

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

    fn dated_row(date: &str, revenue: f64, cogs: f64) -> CanonicalRow {
        CanonicalRow {
            date: Some(NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap()),
            ..row(revenue, cogs)
        }
    }

    fn numeric(kpis: &KpiSnapshot, name: &str) -> f64 {
        kpis.get(name)
            .and_then(|v| v.as_numeric())
            .unwrap_or_else(|| panic!("missing numeric kpi {name}"))
    }

    #[test]
    fn empty_dataset_yields_empty_snapshot() {
        assert!(compute(&[]).is_empty());
    }

    #[test]
    fn two_row_dataset_without_dates() {
        let kpis = compute(&[row(100.0, 60.0), row(200.0, 90.0)]);
        assert_eq!(numeric(&kpis, "revenue"), 300.0);
        assert_eq!(numeric(&kpis, "cogs"), 150.0);
        assert_eq!(numeric(&kpis, "profit"), 150.0);
        assert_eq!(numeric(&kpis, "profit_margin"), 50.0);
        assert_eq!(numeric(&kpis, "revenue_per_day"), 150.0);
        assert_eq!(numeric(&kpis, "efficiency_ratio"), 2.0);
        assert_eq!(numeric(&kpis, "growth_rate"), 100.0);
    }

    #[test]
    fn single_zero_row_degrades_to_zero() {
        let kpis = compute(&[row(0.0, 0.0)]);
        assert_eq!(numeric(&kpis, "profit_margin"), 0.0);
        assert_eq!(numeric(&kpis, "efficiency_ratio"), 0.0);
        assert_eq!(numeric(&kpis, "growth_rate"), 0.0);
        // single-row std would be NaN; must surface as 0
        assert_eq!(numeric(&kpis, "revenue_volatility"), 0.0);
    }

    #[test]
    fn revenue_equal_to_cogs_means_zero_profit() {
        let kpis = compute(&[row(50.0, 50.0), row(70.0, 70.0)]);
        assert_eq!(numeric(&kpis, "profit"), 0.0);
        assert_eq!(numeric(&kpis, "profit_margin"), 0.0);
    }

    #[test]
    fn compute_is_deterministic() {
        let rows = vec![row(10.0, 4.0), row(20.0, 8.0), row(30.0, 12.0)];
        assert_eq!(compute(&rows), compute(&rows));
    }

    #[test]
    fn growth_rate_splits_odd_counts_with_integer_division() {
        // n = 5: first half rows [0,2), second half rows [2,5)
        let rows = vec![row(10.0, 0.0), row(10.0, 0.0), row(10.0, 0.0), row(10.0, 0.0), row(10.0, 0.0)];
        assert_eq!(growth_rate(&rows), 50.0);
    }

    #[test]
    fn trend_labels_follow_slope_sign() {
        let rising = vec![row(10.0, 20.0), row(20.0, 20.0), row(30.0, 20.0)];
        let kpis = compute(&rising);
        assert_eq!(kpis.get("revenue_trend"), Some(&KpiValue::Label(Trend::Increasing)));
        assert_eq!(kpis.get("profit_trend"), Some(&KpiValue::Label(Trend::Increasing)));
        assert_eq!(numeric(&kpis, "revenue_change"), 10.0);

        let falling = vec![row(30.0, 5.0), row(20.0, 5.0), row(10.0, 5.0)];
        let kpis = compute(&falling);
        assert_eq!(kpis.get("revenue_trend"), Some(&KpiValue::Label(Trend::Decreasing)));
    }

    #[test]
    fn no_trend_below_three_rows() {
        let kpis = compute(&[row(10.0, 5.0), row(20.0, 5.0)]);
        assert!(!kpis.contains_key("revenue_trend"));
        assert!(!kpis.contains_key("revenue_change"));
    }

    #[test]
    fn revenue_per_day_groups_by_date() {
        let rows = vec![
            dated_row("2026-01-01", 100.0, 10.0),
            dated_row("2026-01-01", 50.0, 10.0),
            dated_row("2026-01-02", 150.0, 10.0),
        ];
        // day sums 150 and 150, average 150
        assert_eq!(revenue_per_day(&rows), 150.0);
    }

    #[test]
    fn dispersion_metrics_match_sample_convention() {
        let rows = vec![row(10.0, 2.0), row(20.0, 4.0), row(30.0, 6.0)];
        let kpis = compute(&rows);
        assert!((numeric(&kpis, "revenue_volatility") - 10.0).abs() < 1e-9);
        assert_eq!(numeric(&kpis, "revenue_max"), 30.0);
        assert_eq!(numeric(&kpis, "revenue_min"), 10.0);
        assert_eq!(numeric(&kpis, "revenue_median"), 20.0);
        assert_eq!(numeric(&kpis, "avg_cogs"), 4.0);
    }

    #[test]
    fn moving_averages_gated_per_window() {
        let rows: Vec<CanonicalRow> = (1..=10).map(|i| row(i as f64 * 10.0, 5.0)).collect();
        let kpis = compute(&rows);
        // mean of the last 7 revenues: 40..=100 step 10 -> 70
        assert_eq!(numeric(&kpis, "revenue_ma_7"), 70.0);
        assert!(!kpis.contains_key("revenue_ma_14"));
        assert!(!kpis.contains_key("revenue_ma_30"));
    }

    #[test]
    fn forecast_is_linear_and_non_negative() {
        let rows = vec![row(30.0, 0.0), row(20.0, 0.0), row(10.0, 0.0)];
        let forecast = forecast_revenue(&rows, 4);
        assert_eq!(forecast, vec![0.0, 0.0, 0.0, 0.0]);

        let rows = vec![row(10.0, 0.0), row(20.0, 0.0), row(30.0, 0.0)];
        let forecast = forecast_revenue(&rows, 2);
        assert!((forecast[0] - 40.0).abs() < 1e-9);
        assert!((forecast[1] - 50.0).abs() < 1e-9);
    }

    #[test]
    fn seasonal_metrics_pick_best_groups() {
        let rows = vec![
            dated_row("2026-01-05", 10.0, 1.0), // Monday, January, Q1
            dated_row("2026-02-07", 100.0, 1.0), // Saturday, February, Q1
            dated_row("2026-07-01", 50.0, 1.0),  // Wednesday, July, Q3
        ];
        let seasonal = seasonal_metrics(&rows);
        assert_eq!(seasonal.best_month, Some(2));
        assert_eq!(seasonal.worst_month, Some(1));
        assert_eq!(seasonal.best_quarter, Some(1));
        assert_eq!(seasonal.best_weekday, Some(Weekday::Sat));
    }
}
