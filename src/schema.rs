use std::collections::HashSet;

use tracing::debug;

use crate::advisor::AdvisorAnalysis;
use crate::error::IngestError;
use crate::models::{ColumnMapping, RawTable, CANONICAL_FIELDS};

/// Confidence assigned when the keyword heuristic resolves the mapping
/// without advisor input.
pub const HEURISTIC_CONFIDENCE: f64 = 0.5;

fn synonyms(field: &str) -> &'static [&'static str] {
    match field {
        "date" => &["date", "datetime", "timestamp", "time", "period"],
        "revenue" => &["revenue", "sales", "total_sales", "income"],
        "cogs" => &["cogs", "cost_of_goods_sold", "cost_of_sales", "costs"],
        "profit" => &["profit", "net_profit", "earnings"],
        "units_sold" => &["units_sold", "units", "quantity", "items_sold"],
        "customers" => &["customers", "clients", "customer_count"],
        _ => &[],
    }
}

/// Lowercase, trim, collapse whitespace runs to single underscores.
pub fn normalize_header(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

/// Map canonical fields to actual columns. Advisor hints win per field when
/// they name a real column; the heuristic fills everything else. Fails with
/// `InsufficientSchema` unless both revenue and cogs resolve.
pub fn resolve(
    table: &RawTable,
    hints: Option<&AdvisorAnalysis>,
) -> Result<ColumnMapping, IngestError> {
    let normalized: Vec<String> = table.columns.iter().map(|c| normalize_header(c)).collect();
    let mut mapping = ColumnMapping::default();
    let mut claimed: HashSet<usize> = HashSet::new();
    let mut advisor_used = false;

    for field in CANONICAL_FIELDS {
        if let Some(analysis) = hints {
            if let Some(column) = analysis.mapped_column(field) {
                if let Some(idx) = table.column_index(column) {
                    if !claimed.contains(&idx) {
                        claimed.insert(idx);
                        mapping.set(field, column.to_string());
                        advisor_used = true;
                        continue;
                    }
                }
                debug!(field, column, "advisor suggestion did not match a free column");
            }
        }

        if let Some(idx) = heuristic_match(field, &normalized, &claimed) {
            claimed.insert(idx);
            mapping.set(field, table.columns[idx].clone());
        }
    }

    let missing = mapping.missing_required();
    if !missing.is_empty() {
        return Err(IngestError::InsufficientSchema { missing });
    }

    mapping.confidence = if advisor_used {
        hints.map_or(HEURISTIC_CONFIDENCE, |a| a.confidence_score)
    } else {
        HEURISTIC_CONFIDENCE
    };

    Ok(mapping)
}

/// Exact synonym membership first, then substring containment, each in
/// column declaration order so ties break deterministically.
fn heuristic_match(field: &str, normalized: &[String], claimed: &HashSet<usize>) -> Option<usize> {
    let words = synonyms(field);

    for (idx, name) in normalized.iter().enumerate() {
        if !claimed.contains(&idx) && words.contains(&name.as_str()) {
            return Some(idx);
        }
    }

    for (idx, name) in normalized.iter().enumerate() {
        if !claimed.contains(&idx) && words.iter().any(|w| name.contains(w)) {
            return Some(idx);
        }
    }

    None
}
