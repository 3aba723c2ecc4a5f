//! Consolidated plan: the JSON document the consolidator must return

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{OrchestratorError, Result};
use crate::router::adapters::strip_code_fences;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagingArea {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub reasoning: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Venue {
    pub name: String,
    pub address: String,
    pub category: String,
    pub distance_miles: f64,
    pub drive_time_minutes: f64,
    pub reasoning: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyPlan {
    pub summary: String,
    pub staging_area: StagingArea,
    pub venues: Vec<Venue>,
}

fn missing(at: &str, field: &str) -> OrchestratorError {
    OrchestratorError::invalid_output(format!("{} missing '{}'", at, field))
}

fn non_empty_str<'a>(value: &'a Value, field: &str, at: &str) -> Result<&'a str> {
    match value.get(field).and_then(Value::as_str).map(str::trim) {
        Some(s) if !s.is_empty() => Ok(s),
        _ => Err(missing(at, field)),
    }
}

fn non_negative_number(value: &Value, field: &str, at: &str) -> Result<f64> {
    match value.get(field).and_then(Value::as_f64) {
        Some(n) if n >= 0.0 => Ok(n),
        _ => Err(missing(at, field)),
    }
}

impl StrategyPlan {
    /// Parse consolidator output and enforce the plan invariants
    ///
    /// # Errors
    ///
    /// `InvalidOutput` when the text is not JSON, the summary or staging area
    /// is missing, there are fewer than `min_venues` venues, a venue lacks
    /// one of its six fields, or a venue's reasoning is shorter than
    /// `min_reasoning_words` (0 turns the word check off).
    pub fn parse(text: &str, min_venues: usize, min_reasoning_words: usize) -> Result<Self> {
        let doc: Value = serde_json::from_str(strip_code_fences(text))
            .map_err(|e| OrchestratorError::invalid_output(format!("not JSON: {}", e)))?;

        non_empty_str(&doc, "summary", "plan")?;

        let staging = doc
            .get("staging_area")
            .filter(|v| v.is_object())
            .ok_or_else(|| OrchestratorError::invalid_output("staging area required"))?;
        non_empty_str(staging, "name", "staging_area")?;
        non_empty_str(staging, "address", "staging_area")?;

        let venues = doc
            .get("venues")
            .and_then(Value::as_array)
            .ok_or_else(|| OrchestratorError::invalid_output("plan missing 'venues'"))?;
        if venues.len() < min_venues {
            return Err(OrchestratorError::invalid_output(format!(
                "need at least {} venues, got {}",
                min_venues,
                venues.len()
            )));
        }
        for (i, venue) in venues.iter().enumerate() {
            let at = format!("venue {}", i);
            for field in ["name", "address", "category"] {
                non_empty_str(venue, field, &at)?;
            }
            for field in ["distance_miles", "drive_time_minutes"] {
                non_negative_number(venue, field, &at)?;
            }
            let words = non_empty_str(venue, "reasoning", &at)?.split_whitespace().count();
            if words < min_reasoning_words {
                return Err(OrchestratorError::invalid_output(format!(
                    "{} reasoning too short ({} words, need {})",
                    at, words, min_reasoning_words
                )));
            }
        }

        serde_json::from_value(doc).map_err(OrchestratorError::invalid_output)
    }
}
