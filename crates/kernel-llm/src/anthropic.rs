//! Anthropic messages provider.

use std::time::Instant;

use async_trait::async_trait;
use contracts::{LlmRequest, LlmResponse, ProviderHealth, ResponseSchema, TokenUsage};
use serde_json::{json, Value};

use crate::openai::status_error;
use crate::provider::{build_http_client, elapsed_ms, map_transport_error, Provider, ProviderError};
use crate::schemas::{parse_json_body, schema_instruction, validate_structured};

const DEFAULT_ENDPOINT: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
// Smallest model the health probe can bill a single token against.
const HEALTH_PROBE_MODEL: &str = "claude-3-5-haiku-latest";

#[derive(Debug, Clone)]
pub struct AnthropicProvider {
    id: String,
    api_key: String,
    endpoint: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(
        id: impl Into<String>,
        api_key: impl Into<String>,
        endpoint: Option<String>,
        timeout_ms: u64,
    ) -> Result<Self, ProviderError> {
        let id = id.into();
        let client = build_http_client(&id, timeout_ms)?;
        Ok(Self {
            id,
            api_key: api_key.into(),
            endpoint: endpoint
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string())
                .trim_end_matches('/')
                .to_string(),
            client,
        })
    }

    fn messages_payload(&self, request: &LlmRequest, system_prompt: &str) -> Value {
        json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "messages": [{"role": "user", "content": request.user_prompt}],
            "system": system_prompt,
            "temperature": request.temperature,
        })
    }

    async fn send_messages(&self, payload: &Value) -> Result<Value, ProviderError> {
        let response = self
            .client
            .post(format!("{}/v1/messages", self.endpoint))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(payload)
            .send()
            .await
            .map_err(|err| map_transport_error(&self.id, err))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(&self.id, status, &body));
        }
        response
            .json::<Value>()
            .await
            .map_err(|err| ProviderError::failed(&self.id, format!("decode response: {err}")))
    }

    fn extract_content(&self, data: &Value) -> Result<String, ProviderError> {
        data["content"][0]["text"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ProviderError::failed(&self.id, "empty message content"))
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn health_check(&self) -> ProviderHealth {
        // No dedicated health endpoint; a minimal message probe is used and a
        // rate-limit answer still proves the API is reachable.
        let probe = self
            .client
            .post(format!("{}/v1/messages", self.endpoint))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&json!({
                "model": HEALTH_PROBE_MODEL,
                "max_tokens": 1,
                "messages": [{"role": "user", "content": "."}],
            }))
            .send()
            .await;
        match probe {
            Ok(response) if response.status().is_success() || response.status().as_u16() == 429 => {
                ProviderHealth::ok()
            }
            Ok(response) => {
                ProviderHealth::unhealthy(format!("status code: {}", response.status().as_u16()))
            }
            Err(err) => ProviderHealth::unhealthy(format!("connection failed: {err}")),
        }
    }

    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, ProviderError> {
        let started = Instant::now();
        let payload = self.messages_payload(request, &request.system_prompt);
        let data = self.send_messages(&payload).await?;
        let text = self.extract_content(&data)?;
        Ok(LlmResponse {
            text,
            structured: None,
            usage: usage_from(&data),
            provider_id: self.id.clone(),
            latency_ms: elapsed_ms(started),
        })
    }

    async fn complete_structured(
        &self,
        request: &LlmRequest,
        schema: ResponseSchema,
    ) -> Result<LlmResponse, ProviderError> {
        let started = Instant::now();
        let system_prompt = format!("{}{}", request.system_prompt, schema_instruction(schema));
        let payload = self.messages_payload(request, &system_prompt);
        let data = self.send_messages(&payload).await?;
        let text = self.extract_content(&data)?;
        let raw = parse_json_body(&text).map_err(|err| ProviderError::validation(&self.id, err))?;
        let structured = validate_structured(schema, &raw)
            .map_err(|err| ProviderError::validation(&self.id, err))?;
        Ok(LlmResponse {
            text,
            structured: Some(structured),
            usage: usage_from(&data),
            provider_id: self.id.clone(),
            latency_ms: elapsed_ms(started),
        })
    }
}

fn usage_from(data: &Value) -> TokenUsage {
    let prompt_tokens = data["usage"]["input_tokens"].as_u64().unwrap_or(0);
    let completion_tokens = data["usage"]["output_tokens"].as_u64().unwrap_or(0);
    TokenUsage {
        prompt_tokens,
        completion_tokens,
        total_tokens: prompt_tokens.saturating_add(completion_tokens),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_totals_input_and_output() {
        let usage = usage_from(&json!({"usage": {"input_tokens": 12, "output_tokens": 30}}));
        assert_eq!(usage.prompt_tokens, 12);
        assert_eq!(usage.completion_tokens, 30);
        assert_eq!(usage.total_tokens, 42);
    }

    #[test]
    fn structured_schema_rides_in_system_prompt() {
        let provider = AnthropicProvider::new("claude", "key", None, 5_000).expect("provider");
        let request = LlmRequest::new("claude-sonnet", "base system", "user", "corr-2");
        let payload = provider.messages_payload(&request, "base system with schema");
        assert_eq!(payload["system"], "base system with schema");
        assert!(payload.get("response_format").is_none());
    }
}
