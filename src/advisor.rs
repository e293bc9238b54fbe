use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::kpi;
use crate::models::{CanonicalRow, HistorySummary, KpiSnapshot};

const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";
const DEFAULT_MODEL: &str = "qwen/qwen-2.5-3b-instruct";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Failures of the optional advisor. Always absorbed at the call site by
/// falling back to the deterministic path; never surfaced to the operator
/// as a pipeline error.
#[derive(Debug, Error)]
pub enum AdvisorError {
    #[error("advisor request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("advisor returned malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("advisor returned an empty completion")]
    Empty,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DataQuality {
    #[serde(default)]
    pub has_date_column: bool,
    #[serde(default)]
    pub has_revenue_data: bool,
    #[serde(default)]
    pub data_completeness: String,
    #[serde(default)]
    pub suggested_processing: String,
}

/// Column-mapping suggestion produced by the advisor. Unmapped fields carry
/// `None` and are filled by the keyword heuristic.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdvisorAnalysis {
    #[serde(default)]
    pub column_mappings: BTreeMap<String, Option<String>>,
    #[serde(default)]
    pub data_quality: DataQuality,
    #[serde(default)]
    pub confidence_score: f64,
}

impl AdvisorAnalysis {
    pub fn mapped_column(&self, field: &str) -> Option<&str> {
        self.column_mappings.get(field).and_then(|c| c.as_deref())
    }

    #[cfg(test)]
    pub fn with_mappings(pairs: &[(&str, Option<&str>)], confidence: f64) -> Self {
        Self {
            column_mappings: pairs
                .iter()
                .map(|(field, col)| (field.to_string(), col.map(str::to_string)))
                .collect(),
            data_quality: DataQuality::default(),
            confidence_score: confidence,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThresholdSuggestion {
    pub revenue_threshold: f64,
    pub profit_margin_threshold: f64,
    pub growth_rate_threshold: f64,
}

/// Revenue statistics handed to the advisor alongside the snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RevenueStats {
    pub mean: f64,
    pub std: f64,
}

impl RevenueStats {
    pub fn from_rows(rows: &[CanonicalRow]) -> Self {
        let revenues: Vec<f64> = rows.iter().map(|r| r.revenue).collect();
        Self {
            mean: kpi::mean(&revenues),
            std: kpi::sample_std(&revenues),
        }
    }
}

/// Best-effort AI oracle for column mapping, threshold suggestions and
/// narrative insights. Every method has a deterministic fallback at the
/// call site.
#[async_trait]
pub trait Advisor: Send + Sync {
    async fn analyze_columns(
        &self,
        columns: &[String],
        sample_rows: &[BTreeMap<String, String>],
    ) -> Result<AdvisorAnalysis, AdvisorError>;

    async fn suggest_thresholds(
        &self,
        stats: &RevenueStats,
        snapshot: &KpiSnapshot,
    ) -> Result<ThresholdSuggestion, AdvisorError>;

    async fn generate_insights(
        &self,
        summary: &HistorySummary,
        snapshot: &KpiSnapshot,
    ) -> Result<String, AdvisorError>;
}

/// Deterministic floors: 80% of current revenue, 90% of current margin,
/// fixed growth target.
pub fn fallback_thresholds(snapshot: &KpiSnapshot) -> ThresholdSuggestion {
    let numeric = |name: &str| {
        snapshot
            .get(name)
            .and_then(|v| v.as_numeric())
            .unwrap_or(0.0)
    };
    let revenue = numeric("revenue");
    let margin = numeric("profit_margin");

    ThresholdSuggestion {
        revenue_threshold: if revenue > 0.0 {
            (revenue * 0.8).max(10_000.0)
        } else {
            50_000.0
        },
        profit_margin_threshold: if margin > 0.0 { (margin * 0.9).max(15.0) } else { 20.0 },
        growth_rate_threshold: 2.0,
    }
}

/// Suggest thresholds through the advisor when one is configured, falling
/// back deterministically on absence or any failure.
pub async fn suggest_thresholds_or_fallback(
    advisor: Option<&dyn Advisor>,
    stats: &RevenueStats,
    snapshot: &KpiSnapshot,
) -> ThresholdSuggestion {
    match advisor {
        Some(advisor) => match advisor.suggest_thresholds(stats, snapshot).await {
            Ok(suggestion) => suggestion,
            Err(err) => {
                warn!(%err, "advisor threshold suggestion failed, using fallback");
                fallback_thresholds(snapshot)
            }
        },
        None => fallback_thresholds(snapshot),
    }
}

/// Chat-completion advisor against an OpenAI-compatible endpoint.
pub struct OpenRouterAdvisor {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenRouterAdvisor {
    /// Enabled only when `OPENROUTER_API_KEY` is set, mirroring the optional
    /// nature of the collaborator.
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("OPENROUTER_API_KEY").ok()?;
        let model =
            std::env::var("OPENROUTER_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .ok()?;
        Some(Self {
            client,
            api_key,
            model,
            base_url: OPENROUTER_BASE_URL.to_string(),
        })
    }

    async fn chat(&self, system: &str, user: &str) -> Result<String, AdvisorError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage { role: "system", content: system.to_string() },
                ChatMessage { role: "user", content: user.to_string() },
            ],
            temperature: 0.1,
            max_tokens: 1000,
        };

        let response: ChatResponse = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(AdvisorError::Empty)
    }
}

#[async_trait]
impl Advisor for OpenRouterAdvisor {
    async fn analyze_columns(
        &self,
        columns: &[String],
        sample_rows: &[BTreeMap<String, String>],
    ) -> Result<AdvisorAnalysis, AdvisorError> {
        let prompt = format!(
            "Analyze this tabular business data and identify metric columns.\n\n\
             Column names: {columns:?}\n\
             Sample rows:\n{}\n\n\
             Map these fields to actual column names (null when absent):\n\
             date, revenue, cogs, profit, units_sold, customers.\n\n\
             Return JSON only, in this exact shape:\n\
             {{\"column_mappings\": {{\"date\": \"col_or_null\", \"revenue\": \"col_or_null\", \
             \"cogs\": \"col_or_null\", \"profit\": \"col_or_null\", \
             \"units_sold\": \"col_or_null\", \"customers\": \"col_or_null\"}}, \
             \"data_quality\": {{\"has_date_column\": true, \"has_revenue_data\": true, \
             \"data_completeness\": \"...\", \"suggested_processing\": \"...\"}}, \
             \"confidence_score\": 0.95}}",
            serde_json::to_string_pretty(sample_rows)?,
        );
        let content = self
            .chat(
                "You are an expert data analyst. Identify business metric columns. \
                 Always respond with valid JSON only.",
                &prompt,
            )
            .await?;
        Ok(serde_json::from_str(strip_code_fences(&content))?)
    }

    async fn suggest_thresholds(
        &self,
        stats: &RevenueStats,
        snapshot: &KpiSnapshot,
    ) -> Result<ThresholdSuggestion, AdvisorError> {
        let prompt = format!(
            "Based on this business data, suggest alert threshold floors.\n\n\
             Revenue stats: {}\n\
             Current KPIs: {}\n\n\
             Return JSON only:\n\
             {{\"revenue_threshold\": number, \"profit_margin_threshold\": number, \
             \"growth_rate_threshold\": number}}",
            serde_json::to_string(stats)?,
            serde_json::to_string(&numeric_view(snapshot))?,
        );
        let content = self
            .chat(
                "You are a business analyst. Suggest realistic KPI thresholds from \
                 historical data. Return valid JSON only.",
                &prompt,
            )
            .await?;
        Ok(serde_json::from_str(strip_code_fences(&content))?)
    }

    async fn generate_insights(
        &self,
        summary: &HistorySummary,
        snapshot: &KpiSnapshot,
    ) -> Result<String, AdvisorError> {
        let prompt = format!(
            "Based on this business data analysis, provide actionable insights.\n\n\
             History summary: {}\n\
             Key Performance Indicators: {}\n\n\
             Provide key insights, performance trends, recommendations and areas of \
             concern. Keep the response concise and business-focused.",
            serde_json::to_string(summary)?,
            serde_json::to_string(snapshot)?,
        );
        self.chat(
            "You are a business analyst providing insights based on KPI data. \
             Be concise and actionable.",
            &prompt,
        )
        .await
    }
}

fn numeric_view(snapshot: &KpiSnapshot) -> BTreeMap<&str, f64> {
    snapshot
        .iter()
        .filter_map(|(k, v)| v.as_numeric().map(|n| (k.as_str(), n)))
        .collect()
}

/// Models occasionally wrap the JSON reply in a markdown fence.
fn strip_code_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    trimmed.strip_suffix("```").unwrap_or(trimmed).trim()
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    content: String,
}
