//! OpenAI chat-completions provider.

use std::time::Instant;

use async_trait::async_trait;
use contracts::{LlmRequest, LlmResponse, ProviderHealth, ResponseSchema, TokenUsage};
use serde_json::{json, Value};

use crate::provider::{build_http_client, elapsed_ms, map_transport_error, Provider, ProviderError};
use crate::schemas::{parse_json_body, schema_instruction, validate_structured};

const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    id: String,
    api_key: String,
    endpoint: String,
    client: reqwest::Client,
}

impl OpenAiProvider {
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

    fn chat_payload(&self, request: &LlmRequest, user_prompt: &str, json_mode: bool) -> Value {
        let mut payload = json!({
            "model": request.model,
            "messages": [
                {"role": "system", "content": request.system_prompt},
                {"role": "user", "content": user_prompt},
            ],
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });
        if json_mode {
            payload["response_format"] = json!({"type": "json_object"});
        }
        payload
    }

    async fn send_chat(&self, payload: &Value) -> Result<Value, ProviderError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.endpoint))
            .bearer_auth(&self.api_key)
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
        data["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ProviderError::failed(&self.id, "empty completion choice"))
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn health_check(&self) -> ProviderHealth {
        let probe = self
            .client
            .get(format!("{}/models", self.endpoint))
            .bearer_auth(&self.api_key)
            .send()
            .await;
        match probe {
            Ok(response) if response.status().is_success() => ProviderHealth::ok(),
            Ok(response) => {
                ProviderHealth::unhealthy(format!("status code: {}", response.status().as_u16()))
            }
            Err(err) => ProviderHealth::unhealthy(format!("connection failed: {err}")),
        }
    }

    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, ProviderError> {
        let started = Instant::now();
        let payload = self.chat_payload(request, &request.user_prompt, false);
        let data = self.send_chat(&payload).await?;
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
        let user_prompt = format!("{}{}", request.user_prompt, schema_instruction(schema));
        let payload = self.chat_payload(request, &user_prompt, true);
        let data = self.send_chat(&payload).await?;
        let text = self.extract_content(&data)?;
        let raw = parse_json_body(&text).map_err(|err| ProviderError::validation(&self.id, err))?;
        let structured =
            validate_structured(schema, &raw).map_err(|err| ProviderError::validation(&self.id, err))?;
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
    TokenUsage {
        prompt_tokens: data["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
        completion_tokens: data["usage"]["completion_tokens"].as_u64().unwrap_or(0),
        total_tokens: data["usage"]["total_tokens"].as_u64().unwrap_or(0),
    }
}

pub(crate) fn status_error(
    provider_id: &str,
    status: reqwest::StatusCode,
    body: &str,
) -> ProviderError {
    let message = format!("API error: {} - {}", status.as_u16(), body);
    if status.as_u16() == 401 || status.as_u16() == 403 || status.as_u16() == 429 {
        ProviderError::unavailable(provider_id, message)
    } else {
        ProviderError::failed(provider_id, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_trailing_slash_is_trimmed() {
        let provider = OpenAiProvider::new(
            "oai",
            "sk-test",
            Some("https://proxy.example/v1/".to_string()),
            5_000,
        )
        .expect("provider");
        assert_eq!(provider.endpoint, "https://proxy.example/v1");
    }

    #[test]
    fn auth_failures_map_to_unavailable() {
        let err = status_error("oai", reqwest::StatusCode::UNAUTHORIZED, "no key");
        assert!(matches!(err, ProviderError::Unavailable { .. }));
        let err = status_error("oai", reqwest::StatusCode::INTERNAL_SERVER_ERROR, "boom");
        assert!(matches!(err, ProviderError::Failed { .. }));
    }

    #[test]
    fn json_mode_sets_response_format() {
        let provider = OpenAiProvider::new("oai", "sk-test", None, 5_000).expect("provider");
        let request = LlmRequest::new("gpt-4o", "system", "user", "corr-1");
        let payload = provider.chat_payload(&request, "user", true);
        assert_eq!(payload["response_format"]["type"], "json_object");
    }
}
