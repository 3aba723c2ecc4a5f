//! Prompt builders for the fan-out and consolidation calls

use chrono::{DateTime, Utc};

use crate::config::FanoutRole;
use crate::job::Trigger;
use crate::router::PipelineRequest;

const SYSTEM: &str = "You advise rideshare drivers on where to wait for their next ride. \
Be specific to the driver's position and the current time. Never invent venues you cannot place.";

fn driver_context(trigger: &Trigger, now: DateTime<Utc>) -> String {
    format!(
        "DRIVER CONTEXT:\n- Location: {}\n- GPS: {:.6}, {:.6}\n- Time (UTC): {}",
        trigger.address,
        trigger.coordinates.lat,
        trigger.coordinates.lng,
        now.format("%Y-%m-%d %H:%M (%A)")
    )
}

pub fn fanout_request(role: &FanoutRole, trigger: &Trigger, now: DateTime<Utc>) -> PipelineRequest {
    let prompt = format!(
        "{}\n\nTASK:\n{}\n\nAnswer in 150-250 words of concrete, actionable analysis.",
        driver_context(trigger, now),
        role.instruction
    );
    PipelineRequest::new(role.name.clone(), prompt).system(SYSTEM)
}

/// Combine the successful fan-out answers into one JSON plan request
pub fn consolidation_request(
    consolidator_role: &str,
    trigger: &Trigger,
    now: DateTime<Utc>,
    analyses: &[(String, String)],
    min_venues: usize,
    min_reasoning_words: usize,
) -> PipelineRequest {
    let mut sections = String::new();
    for (role, text) in analyses {
        sections.push_str(&format!("\n### {}\n{}\n", role.to_uppercase(), text.trim()));
    }

    let prompt = format!(
        r#"{context}

ANALYSES:{sections}
TASK:
Merge the analyses into one plan with at least {min_venues} specific venues.
The staging area must be central to the venues (1-2 minutes' drive).
Every venue needs a real street address, a category, its distance and drive
time from the staging area, and at least {min_words} words of reasoning.

Respond with JSON:
{{
  "summary": "string",
  "staging_area": {{"name": "string", "address": "string", "reasoning": "string"}},
  "venues": [
    {{"name": "string", "address": "string", "category": "string",
      "distance_miles": number, "drive_time_minutes": number, "reasoning": "string"}}
  ]
}}"#,
        context = driver_context(trigger, now),
        sections = sections,
        min_venues = min_venues,
        min_words = min_reasoning_words,
    );

    PipelineRequest::new(consolidator_role, prompt)
        .system(SYSTEM)
        .json()
}
