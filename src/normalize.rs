use chrono::NaiveDate;
use tracing::debug;

use crate::models::{CanonicalRow, ColumnMapping, RawTable};

const DATE_FORMATS: [&str; 5] = ["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d-%m-%Y", "%d.%m.%Y"];
const DATETIME_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%m/%d/%Y %H:%M"];

/// Clean a raw table into canonical rows. Bad rows are dropped rather than
/// zero-filled: unparseable dates (when mapped), missing revenue or cogs,
/// and all-empty rows are excluded. An empty result is not an error.
pub fn normalize(table: &RawTable, mapping: &ColumnMapping) -> Vec<CanonicalRow> {
    let date_mapped = mapping.get("date").is_some();
    let mut rows = Vec::with_capacity(table.rows.len());
    let mut dropped = 0usize;

    for raw in &table.rows {
        let field = |name: &str| mapping.get(name).and_then(|col| table.cell(raw, col));

        let date = field("date").and_then(parse_date_lenient);
        let revenue = field("revenue").and_then(parse_number).filter(valid_amount);
        let cogs = field("cogs").and_then(parse_number).filter(valid_amount);
        let units_sold = field("units_sold").and_then(parse_number);
        let customers = field("customers").and_then(parse_number);

        let all_missing = date.is_none()
            && revenue.is_none()
            && cogs.is_none()
            && units_sold.is_none()
            && customers.is_none();
        if all_missing {
            dropped += 1;
            continue;
        }

        if date_mapped && date.is_none() {
            dropped += 1;
            continue;
        }

        let (Some(revenue), Some(cogs)) = (revenue, cogs) else {
            dropped += 1;
            continue;
        };

        rows.push(CanonicalRow {
            date,
            revenue,
            cogs,
            profit: revenue - cogs,
            units_sold,
            customers,
        });
    }

    if date_mapped {
        rows.sort_by_key(|r| r.date);
    }

    if dropped > 0 {
        debug!(dropped, kept = rows.len(), "dropped rows during normalization");
    }
    rows
}

pub fn parse_date_lenient(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(raw, fmt) {
            return Some(date);
        }
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(dt.date());
        }
    }
    None
}

/// Coerce a cell to f64, tolerating currency symbols, thousands separators
/// and percent signs. Failures are missing, never zero.
pub fn parse_number(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, '$' | '€' | '£' | ',' | '%' | ' '))
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn valid_amount(v: &f64) -> bool {
    *v >= 0.0
}

/// Indices of rows whose revenue z-score exceeds `threshold`.
pub fn revenue_anomalies(rows: &[CanonicalRow], threshold: f64) -> Vec<usize> {
    if rows.len() < 2 {
        return Vec::new();
    }
    let n = rows.len() as f64;
    let mean = rows.iter().map(|r| r.revenue).sum::<f64>() / n;
    let var = rows
        .iter()
        .map(|r| (r.revenue - mean).powi(2))
        .sum::<f64>()
        / (n - 1.0);
    let std = var.sqrt();
    if std == 0.0 {
        return Vec::new();
    }
    rows.iter()
        .enumerate()
        .filter(|(_, r)| ((r.revenue - mean) / std).abs() > threshold)
        .map(|(i, _)| i)
        .collect()
}
