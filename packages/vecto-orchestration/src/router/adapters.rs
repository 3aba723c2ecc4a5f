//! Vendor adapters
//!
//! Each provider kind is one variant of [`ProviderAdapter`]. The orchestrator
//! only ever builds a vendor-neutral [`PipelineRequest`]; everything a vendor
//! accepts or rejects (temperature vs reasoning effort, JSON mode flags, the
//! shape of the response) is decided here, by an exhaustive match.

use serde_json::{json, Map, Value};

use super::{PipelineRequest, ProviderError, ProviderOutput, WireRequest, WireResponse};
use crate::config::{ProviderKind, ProviderSpec};

const ANTHROPIC_URL: &str = "https://api.anthropic.com/v1/messages";
const OPENAI_URL: &str = "https://api.openai.com/v1/chat/completions";
const GEMINI_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const LOCAL_URL: &str = "http://localhost:8000";

const ANTHROPIC_JSON_INSTRUCTION: &str =
    "You must respond with valid JSON only. Do not include any text before or after the JSON object.";
const JSON_ONLY_INSTRUCTION: &str = "Respond with valid JSON only.";

/// Model name prefixes that take `reasoning_effort` instead of `temperature`
const OPENAI_REASONING_PREFIXES: &[&str] = &["o3", "o4", "gpt-5"];

/// Settings shared by every vendor
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterSettings {
    pub model: String,
    pub endpoint: Option<String>,
    /// Overrides the request's temperature
    pub temperature: Option<f32>,
    pub reasoning_effort: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderAdapter {
    Anthropic(AdapterSettings),
    OpenAi(AdapterSettings),
    Gemini(AdapterSettings),
    Local(AdapterSettings),
}

impl ProviderAdapter {
    pub fn from_spec(spec: &ProviderSpec) -> Self {
        let settings = AdapterSettings {
            model: spec.model.clone(),
            endpoint: spec.endpoint.clone(),
            temperature: spec.temperature,
            reasoning_effort: spec.reasoning_effort.clone(),
        };
        match spec.kind {
            ProviderKind::Anthropic => ProviderAdapter::Anthropic(settings),
            ProviderKind::OpenAi => ProviderAdapter::OpenAi(settings),
            ProviderKind::Gemini => ProviderAdapter::Gemini(settings),
            ProviderKind::Local => ProviderAdapter::Local(settings),
        }
    }

    pub fn kind(&self) -> ProviderKind {
        match self {
            ProviderAdapter::Anthropic(_) => ProviderKind::Anthropic,
            ProviderAdapter::OpenAi(_) => ProviderKind::OpenAi,
            ProviderAdapter::Gemini(_) => ProviderKind::Gemini,
            ProviderAdapter::Local(_) => ProviderKind::Local,
        }
    }

    fn settings(&self) -> &AdapterSettings {
        match self {
            ProviderAdapter::Anthropic(s)
            | ProviderAdapter::OpenAi(s)
            | ProviderAdapter::Gemini(s)
            | ProviderAdapter::Local(s) => s,
        }
    }

    /// `kind/model`
    pub fn id(&self) -> String {
        format!("{}/{}", self.kind(), self.settings().model)
    }

    pub fn encode(&self, request: &PipelineRequest) -> WireRequest {
        let (url, body) = match self {
            ProviderAdapter::Anthropic(s) => encode_anthropic(s, request),
            ProviderAdapter::OpenAi(s) => encode_openai(s, request),
            ProviderAdapter::Gemini(s) => encode_gemini(s, request),
            ProviderAdapter::Local(s) => encode_local(s, request),
        };
        WireRequest {
            provider: self.id(),
            url,
            body,
        }
    }

    pub fn decode(
        &self,
        request: &PipelineRequest,
        response: WireResponse,
    ) -> Result<ProviderOutput, ProviderError> {
        if !(200..300).contains(&response.status) {
            return Err(ProviderError::Status {
                code: response.status,
                message: error_message(&response.body),
            });
        }

        let body = &response.body;
        let output = match self {
            ProviderAdapter::Anthropic(_) => {
                let text = str_at(body, &["content", "0", "text"])?;
                let text = if request.json_mode {
                    strip_code_fences(text)
                } else {
                    text
                };
                ProviderOutput {
                    text: text.to_string(),
                    tokens_in: u64_at(body, &["usage", "input_tokens"]),
                    tokens_out: u64_at(body, &["usage", "output_tokens"]),
                }
            }
            ProviderAdapter::OpenAi(_) => ProviderOutput {
                text: str_at(body, &["choices", "0", "message", "content"])?.to_string(),
                tokens_in: u64_at(body, &["usage", "prompt_tokens"]),
                tokens_out: u64_at(body, &["usage", "completion_tokens"]),
            },
            ProviderAdapter::Gemini(_) => ProviderOutput {
                text: str_at(body, &["candidates", "0", "content", "parts", "0", "text"])?
                    .to_string(),
                tokens_in: u64_at(body, &["usageMetadata", "promptTokenCount"]),
                tokens_out: u64_at(body, &["usageMetadata", "candidatesTokenCount"]),
            },
            ProviderAdapter::Local(_) => ProviderOutput {
                text: str_at(body, &["choices", "0", "text"])?.to_string(),
                tokens_in: u64_at(body, &["usage", "prompt_tokens"]),
                tokens_out: u64_at(body, &["usage", "completion_tokens"]),
            },
        };

        if output.text.trim().is_empty() {
            return Err(ProviderError::Decode(format!("{} returned empty text", self.id())));
        }
        Ok(output)
    }
}

fn temperature(settings: &AdapterSettings, request: &PipelineRequest) -> f32 {
    settings.temperature.unwrap_or(request.temperature)
}

fn with_json_instruction(prompt: &str, instruction: &str) -> String {
    format!("{}\n\n{}", prompt, instruction)
}

fn encode_anthropic(s: &AdapterSettings, request: &PipelineRequest) -> (String, Value) {
    let prompt = if request.json_mode {
        with_json_instruction(&request.prompt, ANTHROPIC_JSON_INSTRUCTION)
    } else {
        request.prompt.clone()
    };

    let mut body = json!({
        "model": s.model,
        "max_tokens": request.max_tokens,
        "temperature": temperature(s, request),
        "messages": [{"role": "user", "content": prompt}],
    });
    if let Some(system) = &request.system {
        body["system"] = json!(system);
    }
    (s.endpoint.clone().unwrap_or_else(|| ANTHROPIC_URL.to_string()), body)
}

pub fn is_openai_reasoning_model(model: &str) -> bool {
    OPENAI_REASONING_PREFIXES.iter().any(|p| model.starts_with(p))
}

fn encode_openai(s: &AdapterSettings, request: &PipelineRequest) -> (String, Value) {
    let mut messages = Vec::new();
    if let Some(system) = &request.system {
        messages.push(json!({"role": "system", "content": system}));
    }
    messages.push(json!({"role": "user", "content": request.prompt}));

    let mut body = Map::new();
    body.insert("model".into(), json!(s.model));
    body.insert("messages".into(), Value::Array(messages));

    let reasoning = is_openai_reasoning_model(&s.model);
    if reasoning {
        let default_effort = if request.json_mode { "low" } else { "medium" };
        let effort = s.reasoning_effort.as_deref().unwrap_or(default_effort);
        body.insert("reasoning_effort".into(), json!(effort));
    } else {
        body.insert("temperature".into(), json!(temperature(s, request)));
    }
    // o3/o4 reject max_completion_tokens; gpt-5 accepts it
    if !reasoning || s.model.starts_with("gpt-5") {
        body.insert("max_completion_tokens".into(), json!(request.max_tokens));
    }
    if request.json_mode {
        body.insert("response_format".into(), json!({"type": "json_object"}));
    }

    (
        s.endpoint.clone().unwrap_or_else(|| OPENAI_URL.to_string()),
        Value::Object(body),
    )
}

fn encode_gemini(s: &AdapterSettings, request: &PipelineRequest) -> (String, Value) {
    let prompt = if request.json_mode {
        with_json_instruction(&request.prompt, JSON_ONLY_INSTRUCTION)
    } else {
        request.prompt.clone()
    };

    let mut generation_config = json!({
        "temperature": temperature(s, request),
        "maxOutputTokens": request.max_tokens,
    });
    if request.json_mode {
        generation_config["responseMimeType"] = json!("application/json");
    }

    let mut body = json!({
        "contents": [{"role": "user", "parts": [{"text": prompt}]}],
        "generationConfig": generation_config,
    });
    if let Some(system) = &request.system {
        body["systemInstruction"] = json!({"parts": [{"text": system}]});
    }

    let base = s.endpoint.as_deref().unwrap_or(GEMINI_URL);
    (format!("{}/{}:generateContent", base, s.model), body)
}

fn encode_local(s: &AdapterSettings, request: &PipelineRequest) -> (String, Value) {
    let mut prompt = match &request.system {
        Some(system) => format!("{}\n\n{}", system, request.prompt),
        None => request.prompt.clone(),
    };
    if request.json_mode {
        prompt = with_json_instruction(&prompt, JSON_ONLY_INSTRUCTION);
    }

    let mut body = json!({
        "model": s.model,
        "prompt": prompt,
        "temperature": temperature(s, request),
        "max_tokens": request.max_tokens,
    });
    if request.json_mode {
        body["response_format"] = json!({"type": "json_object"});
    }

    let base = s.endpoint.as_deref().unwrap_or(LOCAL_URL);
    (format!("{}/v1/completions", base.trim_end_matches('/')), body)
}

/// Unwrap a JSON document from a markdown code fence, if there is one
pub fn strip_code_fences(text: &str) -> &str {
    let inner = if let Some((_, rest)) = text.split_once("```json") {
        rest
    } else if let Some((_, rest)) = text.split_once("```") {
        rest
    } else {
        return text.trim();
    };
    inner.split("```").next().unwrap_or(inner).trim()
}

fn value_at<'a>(body: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(body, |v, key| match key.parse::<usize>() {
        Ok(index) => v.get(index),
        Err(_) => v.get(*key),
    })
}

fn str_at<'a>(body: &'a Value, path: &[&str]) -> Result<&'a str, ProviderError> {
    value_at(body, path)
        .and_then(Value::as_str)
        .ok_or_else(|| ProviderError::Decode(format!("missing {}", path.join("."))))
}

fn u64_at(body: &Value, path: &[&str]) -> Option<u64> {
    value_at(body, path).and_then(Value::as_u64)
}

fn error_message(body: &Value) -> String {
    value_at(body, &["error", "message"])
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| body.to_string())
}
