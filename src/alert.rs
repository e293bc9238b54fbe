use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};

use crate::models::{AlertRecord, KpiSnapshot, KpiValue, Trend};

/// Status band for one KPI against its threshold floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    Critical,
    Warning,
    Good,
}

impl Band {
    pub fn as_str(self) -> &'static str {
        match self {
            Band::Critical => "critical",
            Band::Warning => "warning",
            Band::Good => "good",
        }
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Below the floor is critical; within 10% above it is a warning.
pub fn classify(current: f64, threshold: f64) -> Band {
    if current < threshold {
        Band::Critical
    } else if current < threshold * 1.1 {
        Band::Warning
    } else {
        Band::Good
    }
}

#[derive(Debug, Clone)]
pub struct AlertDecision {
    pub kpi_name: String,
    pub current_value: f64,
    pub threshold_value: f64,
    pub band: Band,
    /// True only for a critical breach outside the cool-down window.
    pub notify: bool,
    pub message: String,
}

pub fn default_cooldown() -> Duration {
    Duration::hours(24)
}

/// Classify every numeric KPI that has a configured threshold. A prior
/// dispatch for the same KPI inside `cooldown` suppresses the notification
/// while the classification is still recomputed.
pub fn evaluate(
    snapshot: &KpiSnapshot,
    thresholds: &BTreeMap<String, f64>,
    recent: &[AlertRecord],
    cooldown: Duration,
    now: DateTime<Utc>,
) -> Vec<AlertDecision> {
    let mut decisions = Vec::new();

    for (kpi_name, threshold) in thresholds {
        let Some(current) = snapshot.get(kpi_name).and_then(|v| v.as_numeric()) else {
            continue;
        };

        let band = classify(current, *threshold);
        let in_cooldown = recent
            .iter()
            .any(|a| a.kpi_name == *kpi_name && a.sent_at + cooldown > now);
        let notify = band == Band::Critical && !in_cooldown;

        let trend = snapshot
            .get(&format!("{kpi_name}_trend"))
            .and_then(|v| match v {
                KpiValue::Label(t) => Some(*t),
                KpiValue::Numeric(_) => None,
            })
            .unwrap_or(Trend::Stable);

        decisions.push(AlertDecision {
            kpi_name: kpi_name.clone(),
            current_value: current,
            threshold_value: *threshold,
            band,
            notify,
            message: format_alert_message(kpi_name, current, *threshold, trend, now),
        });
    }

    decisions
}

/// Plain-text notification body; the transport adds its own decoration.
pub fn format_alert_message(
    kpi_name: &str,
    current: f64,
    threshold: f64,
    trend: Trend,
    now: DateTime<Utc>,
) -> String {
    format!(
        "KPI ALERT\n\n\
         Metric: {}\n\
         Current Value: {current:.2}\n\
         Threshold: {threshold:.2}\n\
         Trend: {trend}\n\
         Time: {}\n\n\
         Please review and take necessary action.",
        title_case(kpi_name),
        now.format("%Y-%m-%d %H:%M:%S UTC"),
    )
}

fn title_case(name: &str) -> String {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::KpiValue;

    fn snapshot(pairs: &[(&str, f64)]) -> KpiSnapshot {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), KpiValue::Numeric(*v)))
            .collect()
    }

    fn thresholds(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn sent_alert(kpi: &str, sent_at: DateTime<Utc>) -> AlertRecord {
        AlertRecord {
            id: 1,
            kpi_name: kpi.to_string(),
            current_value: 900.0,
            threshold_value: 1000.0,
            kind: "critical".to_string(),
            message: String::new(),
            sent_at,
            status: "sent".to_string(),
        }
    }

    #[test]
    fn bands_partition_the_value_range() {
        assert_eq!(classify(999.9, 1000.0), Band::Critical);
        assert_eq!(classify(1000.0, 1000.0), Band::Warning);
        assert_eq!(classify(1099.9, 1000.0), Band::Warning);
        assert_eq!(classify(1100.0, 1000.0), Band::Good);
    }

    #[test]
    fn critical_breach_triggers_notification() {
        let now = Utc::now();
        let decisions = evaluate(
            &snapshot(&[("revenue", 900.0)]),
            &thresholds(&[("revenue", 1000.0)]),
            &[],
            default_cooldown(),
            now,
        );
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].band, Band::Critical);
        assert!(decisions[0].notify);
        assert!(decisions[0].message.contains("Metric: Revenue"));
    }

    #[test]
    fn warning_and_good_are_informational_only() {
        let decisions = evaluate(
            &snapshot(&[("revenue", 1050.0), ("profit_margin", 40.0)]),
            &thresholds(&[("revenue", 1000.0), ("profit_margin", 20.0)]),
            &[],
            default_cooldown(),
            Utc::now(),
        );
        assert!(decisions.iter().all(|d| !d.notify));
        assert_eq!(decisions[0].band, Band::Good); // profit_margin sorts first
        assert_eq!(decisions[1].band, Band::Warning);
    }

    #[test]
    fn cooldown_suppresses_repeat_notification_but_still_classifies() {
        let now = Utc::now();
        let recent = vec![sent_alert("revenue", now - Duration::hours(2))];
        let decisions = evaluate(
            &snapshot(&[("revenue", 900.0)]),
            &thresholds(&[("revenue", 1000.0)]),
            &recent,
            default_cooldown(),
            now,
        );
        assert_eq!(decisions[0].band, Band::Critical);
        assert!(!decisions[0].notify);
    }

    #[test]
    fn expired_cooldown_allows_re_alerting() {
        let now = Utc::now();
        let recent = vec![sent_alert("revenue", now - Duration::hours(25))];
        let decisions = evaluate(
            &snapshot(&[("revenue", 900.0)]),
            &thresholds(&[("revenue", 1000.0)]),
            &recent,
            default_cooldown(),
            now,
        );
        assert!(decisions[0].notify);
    }

    #[test]
    fn cooldown_is_per_kpi() {
        let now = Utc::now();
        let recent = vec![sent_alert("revenue", now - Duration::hours(1))];
        let decisions = evaluate(
            &snapshot(&[("revenue", 900.0), ("profit_margin", 5.0)]),
            &thresholds(&[("revenue", 1000.0), ("profit_margin", 20.0)]),
            &recent,
            default_cooldown(),
            now,
        );
        let by_name: BTreeMap<_, _> = decisions.iter().map(|d| (d.kpi_name.clone(), d)).collect();
        assert!(!by_name["revenue"].notify);
        assert!(by_name["profit_margin"].notify);
    }

    #[test]
    fn trend_labels_are_excluded_from_evaluation() {
        let mut snap = snapshot(&[("revenue", 900.0)]);
        snap.insert("revenue_trend".to_string(), KpiValue::Label(Trend::Decreasing));
        let decisions = evaluate(
            &snap,
            &thresholds(&[("revenue", 1000.0), ("revenue_trend", 1.0)]),
            &[],
            default_cooldown(),
            Utc::now(),
        );
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].kpi_name, "revenue");
        assert!(decisions[0].message.contains("Trend: decreasing"));
    }
}
