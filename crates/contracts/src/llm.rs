//! Request/response shapes shared by every LLM provider and the router.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::TokenUsage;

pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmRequest {
    pub model: String,
    pub system_prompt: String,
    pub user_prompt: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub correlation_id: String,
}

impl LlmRequest {
    pub fn new(
        model: impl Into<String>,
        system_prompt: impl Into<String>,
        user_prompt: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            model: model.into(),
            system_prompt: system_prompt.into(),
            user_prompt: user_prompt.into(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            correlation_id: correlation_id.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmResponse {
    pub text: String,
    pub structured: Option<Value>,
    pub usage: TokenUsage,
    pub provider_id: String,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderHealth {
    pub healthy: bool,
    #[serde(default)]
    pub message: String,
}

impl ProviderHealth {
    pub fn ok() -> Self {
        Self {
            healthy: true,
            message: "OK".to_string(),
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            message: message.into(),
        }
    }
}

/// The fixed structured-output shapes the kernel ever requests.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSchema {
    Intent,
    Decision,
    Health,
}

impl ResponseSchema {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Intent => "intent",
            Self::Decision => "decision",
            Self::Health => "health",
        }
    }

    /// Prompt-embeddable JSON schema description, kept small on purpose.
    pub fn prompt_schema(self) -> Value {
        match self {
            Self::Intent => serde_json::json!({
                "type": "object",
                "required": ["action", "parameters", "flavor_text"],
                "properties": {
                    "action": {"type": "string"},
                    "parameters": {"type": "object"},
                    "flavor_text": {"type": "string"}
                }
            }),
            Self::Decision => serde_json::json!({
                "type": "object",
                "required": ["verdict", "reason", "outcome"],
                "properties": {
                    "verdict": {"type": "string", "enum": ["ACCEPT", "REJECT"]},
                    "reason": {"type": "string"},
                    "outcome": {"type": "object"}
                }
            }),
            Self::Health => serde_json::json!({
                "type": "object",
                "required": ["healthy"],
                "properties": {
                    "healthy": {"type": "boolean"},
                    "message": {"type": "string"}
                }
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct IntentResponse {
    pub action: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    pub flavor_text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DecisionResponse {
    pub verdict: String,
    pub reason: String,
    #[serde(default)]
    pub outcome: BTreeMap<String, Value>,
}

impl DecisionResponse {
    pub fn accepted(&self) -> bool {
        self.verdict.eq_ignore_ascii_case("accept")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intent_response_rejects_extra_fields() {
        let raw = serde_json::json!({
            "action": "move",
            "parameters": {"to": "loc:ford"},
            "flavor_text": "She crosses the ford.",
            "mood": "wistful"
        });
        let parsed: Result<IntentResponse, _> = serde_json::from_value(raw);
        assert!(parsed.is_err());
    }

    #[test]
    fn decision_verdict_parses_case_insensitively() {
        let decision: DecisionResponse = serde_json::from_value(serde_json::json!({
            "verdict": "Accept",
            "reason": "plausible",
            "outcome": {"moved": true}
        }))
        .expect("decision");
        assert!(decision.accepted());
    }

    #[test]
    fn request_defaults_match_contract() {
        let request = LlmRequest::new("llama3", "system", "user", "tick:1:char:char:a:attempt:0");
        assert_eq!(request.temperature, DEFAULT_TEMPERATURE);
        assert_eq!(request.max_tokens, DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn prompt_schema_names_required_fields() {
        let schema = ResponseSchema::Decision.prompt_schema();
        let required = schema["required"].as_array().expect("required array");
        assert!(required.iter().any(|field| field == "verdict"));
    }
}
