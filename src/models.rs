use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

/// Canonical fields downstream computation depends on. `revenue` and `cogs`
/// are required; the rest are optional.
pub const CANONICAL_FIELDS: [&str; 6] =
    ["date", "revenue", "cogs", "profit", "units_sold", "customers"];

pub const REQUIRED_FIELDS: [&str; 2] = ["revenue", "cogs"];

/// Raw tabular input exactly as loaded: ordered columns, untyped cells.
#[derive(Debug, Clone)]
pub struct RawTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RawTable {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn cell<'a>(&'a self, row: &'a [String], column: &str) -> Option<&'a str> {
        self.column_index(column)
            .and_then(|idx| row.get(idx))
            .map(String::as_str)
    }

    /// First `limit` rows as name → value maps, for advisor prompts.
    pub fn sample_rows(&self, limit: usize) -> Vec<BTreeMap<String, String>> {
        self.rows
            .iter()
            .take(limit)
            .map(|row| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect()
            })
            .collect()
    }
}

/// Resolved mapping from canonical field name to an actual column name.
#[derive(Debug, Clone, Default)]
pub struct ColumnMapping {
    fields: BTreeMap<String, String>,
    pub confidence: f64,
}

impl ColumnMapping {
    pub fn set(&mut self, field: &str, column: String) {
        self.fields.insert(field.to_string(), column);
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    pub fn missing_required(&self) -> Vec<String> {
        REQUIRED_FIELDS
            .iter()
            .filter(|f| self.get(f).is_none())
            .map(|f| f.to_string())
            .collect()
    }
}

/// One cleaned row. `profit` is derived from revenue and cogs so sums and
/// trends never mix a source profit column with the computed one.
#[derive(Debug, Clone, Serialize)]
pub struct CanonicalRow {
    pub date: Option<NaiveDate>,
    pub revenue: f64,
    pub cogs: f64,
    pub profit: f64,
    pub units_sold: Option<f64>,
    pub customers: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Increasing,
    Decreasing,
    Stable,
}

impl Trend {
    pub fn as_str(self) -> &'static str {
        match self {
            Trend::Increasing => "increasing",
            Trend::Decreasing => "decreasing",
            Trend::Stable => "stable",
        }
    }
}

impl fmt::Display for Trend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A KPI is either a number or a trend label.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum KpiValue {
    Numeric(f64),
    Label(Trend),
}

impl KpiValue {
    pub fn as_numeric(self) -> Option<f64> {
        match self {
            KpiValue::Numeric(v) => Some(v),
            KpiValue::Label(_) => None,
        }
    }
}

impl fmt::Display for KpiValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KpiValue::Numeric(v) => write!(f, "{v:.2}"),
            KpiValue::Label(t) => f.write_str(t.as_str()),
        }
    }
}

pub type KpiSnapshot = BTreeMap<String, KpiValue>;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct HistoryEntry {
    pub id: i64,
    pub recorded_at: DateTime<Utc>,
    pub date: Option<NaiveDate>,
    pub revenue: f64,
    pub cogs: f64,
    pub profit: f64,
    pub profit_margin: f64,
    pub growth_rate: f64,
    pub raw_row: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ThresholdRecord {
    pub kpi_name: String,
    pub threshold_value: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AlertRecord {
    pub id: i64,
    pub kpi_name: String,
    pub current_value: f64,
    pub threshold_value: f64,
    pub kind: String,
    pub message: String,
    pub sent_at: DateTime<Utc>,
    pub status: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HistorySummary {
    pub avg_revenue: f64,
    pub avg_profit: f64,
    pub avg_profit_margin: f64,
    pub avg_growth_rate: f64,
    pub count: i64,
}
